//! WorkflowStorage trait definition

use async_trait::async_trait;
use uuid::Uuid;

use crate::workflow::{PersistentWorkflow, Response};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Instance is not in a state that can be restarted
    #[error("workflow instance {0} is not in error state")]
    NotRestartable(Uuid),

    /// Caller passed something the store cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The command writer no longer accepts commands
    #[error("command writer is shut down")]
    WriterClosed,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// System of record for workflow instances, responses and waits
///
/// Every mutating operation runs in a transaction. The `*_in` variants
/// take a transaction owned by the caller so that the write commits (or
/// rolls back) together with the caller's own work.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait WorkflowStorage: Send + Sync + 'static {
    /// Transaction handle accepted by the `*_in` operations
    type Tx: Send + 'static;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Recover broken instances and start the background loops
    async fn startup(&self) -> Result<(), StoreError>;

    /// Stop the background loops and flush pending writes (idempotent)
    async fn shutdown(&self);

    // =========================================================================
    // Instances
    // =========================================================================

    /// Insert new instances as enqueued, atomically
    async fn insert(&self, instances: Vec<PersistentWorkflow>) -> Result<(), StoreError>;

    /// Insert new instances inside the caller's transaction
    async fn insert_in(
        &self,
        tx: &mut Self::Tx,
        instances: Vec<PersistentWorkflow>,
    ) -> Result<(), StoreError>;

    /// Claim up to `max` dispatchable instances of a pool
    ///
    /// No two callers ever receive the same instance.
    async fn dequeue(&self, pool_id: &str, max: usize)
        -> Result<Vec<PersistentWorkflow>, StoreError>;

    /// Load an instance by id
    async fn load(&self, instance_id: Uuid) -> Result<Option<PersistentWorkflow>, StoreError>;

    /// Persist the instance's pending register call and suspend it
    ///
    /// Fails if the instance carries no register call.
    async fn register_callback(&self, instance: &mut PersistentWorkflow)
        -> Result<(), StoreError>;

    /// Record a failure on the instance; never fails
    async fn error(&self, instance: &PersistentWorkflow, cause: &str);

    /// Mark the instance finished; a failed write is recorded through [`error`](Self::error)
    async fn finish(&self, instance: &PersistentWorkflow);

    /// Move a failed instance back to dispatchable
    async fn restart(&self, instance_id: Uuid) -> Result<(), StoreError>;

    /// Move every failed instance back to dispatchable
    async fn restart_all(&self) -> Result<usize, StoreError>;

    /// Purge finished instances instead of keeping them
    fn set_remove_when_finished(&self, remove: bool);

    // =========================================================================
    // Responses
    // =========================================================================

    /// Deliver a response
    async fn notify(&self, response: Response) -> Result<(), StoreError>;

    /// Deliver several responses in one transaction
    async fn notify_all(&self, responses: Vec<Response>) -> Result<(), StoreError>;

    /// Deliver responses inside the caller's transaction
    async fn notify_in(&self, tx: &mut Self::Tx, responses: Vec<Response>)
        -> Result<(), StoreError>;
}
