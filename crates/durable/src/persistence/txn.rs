//! Transactional scopes

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use super::store::StoreError;

/// Runs units of work inside transactions
///
/// # Example
///
/// ```ignore
/// let promoted = txn
///     .run(move |tx| Box::pin(async move { dialect.update_queue_state(tx, 5000).await }))
///     .await?;
/// ```
#[async_trait]
pub trait TransactionController: Send + Sync + 'static {
    /// Active transaction handle
    type Tx: Send + 'static;

    /// Begin a transaction
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Commit a transaction
    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Roll a transaction back
    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Run `work` in a new transaction
    ///
    /// Commits when `work` succeeds and rolls back when it fails. The error
    /// from `work` is returned; a failing rollback is only logged.
    async fn run<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Self::Tx) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        let mut tx = self.begin().await?;
        match work(&mut tx).await {
            Ok(value) => {
                self.commit(tx).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = self.rollback(tx).await {
                    warn!(error = %rollback_error, "rollback failed");
                }
                Err(e)
            }
        }
    }
}
