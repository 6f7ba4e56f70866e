//! Write paths for batch commands
//!
//! [`SyncCommandWriter`] executes every command in its own transaction.
//! [`BatchingCommandWriter`] coalesces concurrent submissions into shared
//! transactions. Storage picks one at construction time.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::config::BatcherConfig;
use super::dialect::{BatchCommand, DatabaseDialect};
use super::store::StoreError;
use super::txn::TransactionController;

/// Executes batch commands against storage
///
/// `submit` resolves once the command is committed (or has failed).
#[async_trait]
pub trait CommandWriter: Send + Sync + 'static {
    /// Execute a command
    async fn submit(&self, command: BatchCommand) -> Result<(), StoreError>;

    /// Flush pending commands and stop accepting new ones
    async fn shutdown(&self);
}

/// Run one command in a transaction of its own
async fn execute_single<D, T>(
    dialect: &Arc<D>,
    txn: &T,
    command: BatchCommand,
) -> Result<(), StoreError>
where
    D: DatabaseDialect,
    T: TransactionController<Tx = D::Tx>,
{
    let dialect = Arc::clone(dialect);
    txn.run(move |tx| {
        Box::pin(async move {
            dialect
                .execute_batch(tx, std::slice::from_ref(&command))
                .await
        })
    })
    .await
}

// =============================================================================
// Synchronous writer
// =============================================================================

/// One transaction per command
pub struct SyncCommandWriter<D, T> {
    dialect: Arc<D>,
    txn: Arc<T>,
}

impl<D, T> SyncCommandWriter<D, T> {
    pub fn new(dialect: Arc<D>, txn: Arc<T>) -> Self {
        Self { dialect, txn }
    }
}

#[async_trait]
impl<D, T> CommandWriter for SyncCommandWriter<D, T>
where
    D: DatabaseDialect,
    T: TransactionController<Tx = D::Tx>,
{
    async fn submit(&self, command: BatchCommand) -> Result<(), StoreError> {
        execute_single(&self.dialect, self.txn.as_ref(), command).await
    }

    async fn shutdown(&self) {}
}

// =============================================================================
// Batching writer
// =============================================================================

struct Submission {
    command: BatchCommand,
    ack: oneshot::Sender<Result<(), StoreError>>,
}

/// Coalesces concurrent commands into shared transactions
///
/// A background task collects up to `max_batch_size` submissions, or
/// whatever arrived within `flush_interval` of the first one, and executes
/// them in one transaction. When that transaction fails every command of
/// the batch is retried on its own, so one bad command only fails itself.
pub struct BatchingCommandWriter {
    sender: Mutex<Option<mpsc::Sender<Submission>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingCommandWriter {
    /// Spawn the flush task
    pub fn start<D, T>(dialect: Arc<D>, txn: Arc<T>, config: BatcherConfig) -> Self
    where
        D: DatabaseDialect,
        T: TransactionController<Tx = D::Tx>,
    {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let worker = tokio::spawn(flush_loop(dialect, txn, config, receiver));

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }
}

#[async_trait]
impl CommandWriter for BatchingCommandWriter {
    #[instrument(skip(self, command), fields(kind = command.kind()))]
    async fn submit(&self, command: BatchCommand) -> Result<(), StoreError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(StoreError::WriterClosed)?;

        let (ack, done) = oneshot::channel();
        sender
            .send(Submission { command, ack })
            .await
            .map_err(|_| StoreError::WriterClosed)?;

        done.await.map_err(|_| StoreError::WriterClosed)?
    }

    async fn shutdown(&self) {
        // Dropping the last sender ends the flush loop after it drains
        drop(self.sender.lock().take());

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "batch writer task ended abnormally");
            }
            info!("batch writer drained");
        }
    }
}

async fn flush_loop<D, T>(
    dialect: Arc<D>,
    txn: Arc<T>,
    config: BatcherConfig,
    mut receiver: mpsc::Receiver<Submission>,
) where
    D: DatabaseDialect,
    T: TransactionController<Tx = D::Tx>,
{
    let max = config.max_batch_size.max(1);
    let mut batch: Vec<Submission> = Vec::with_capacity(max);

    while let Some(first) = receiver.recv().await {
        batch.push(first);

        let window = tokio::time::sleep(config.flush_interval);
        tokio::pin!(window);

        while batch.len() < max {
            tokio::select! {
                next = receiver.recv() => match next {
                    Some(submission) => batch.push(submission),
                    None => break,
                },
                _ = &mut window => break,
            }
        }

        flush(&dialect, txn.as_ref(), &mut batch).await;
    }

    debug!("batch writer channel closed");
}

async fn flush<D, T>(dialect: &Arc<D>, txn: &T, batch: &mut Vec<Submission>)
where
    D: DatabaseDialect,
    T: TransactionController<Tx = D::Tx>,
{
    let commands: Vec<BatchCommand> = batch.iter().map(|s| s.command.clone()).collect();
    let size = commands.len();

    let shared = Arc::clone(dialect);
    let result = txn
        .run(move |tx| Box::pin(async move { shared.execute_batch(tx, &commands).await }))
        .await;

    match result {
        Ok(()) => {
            debug!(size, "flushed command batch");
            for submission in batch.drain(..) {
                let _ = submission.ack.send(Ok(()));
            }
        }
        Err(e) => {
            warn!(size, error = %e, "command batch failed, retrying commands one by one");
            for submission in batch.drain(..) {
                let result = execute_single(dialect, txn, submission.command).await;
                let _ = submission.ack.send(result);
            }
        }
    }
}
