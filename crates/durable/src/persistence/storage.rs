//! Persistent storage: the transactional system of record plus its
//! background loops
//!
//! Two loops run between `startup` and `shutdown`:
//! - the queue updater promotes enqueued instances (and waits past their
//!   deadline) to ready, backing off according to [`QueueBackoff`]
//! - the stale-response reaper deletes unmatched responses past their
//!   removal timeout, in bounded batches
//!
//! [`QueueBackoff`]: super::QueueBackoff

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::config::{BatcherConfig, StorageConfig, MIN_REAPER_INTERVAL};
use super::dialect::{BatchCommand, DatabaseDialect};
use super::store::{StoreError, WorkflowStorage};
use super::txn::TransactionController;
use super::writer::{BatchingCommandWriter, CommandWriter, SyncCommandWriter};
use crate::monitoring::{MonitoringDataCollector, NullMonitoringDataCollector, ProcessingState};
use crate::workflow::{PersistentWorkflow, Response, WorkflowState};

struct Inner<D, T> {
    dialect: Arc<D>,
    txn: Arc<T>,
    config: StorageConfig,
    monitor: Arc<dyn MonitoringDataCollector>,
    queue_wake: Notify,
}

impl<D, T> Inner<D, T>
where
    D: DatabaseDialect,
    T: TransactionController<Tx = D::Tx>,
{
    async fn update_queue_state(&self, max: usize) -> Result<usize, StoreError> {
        let started = Instant::now();
        let dialect = Arc::clone(&self.dialect);
        let promoted = self
            .txn
            .run(move |tx| Box::pin(async move { dialect.update_queue_state(tx, max).await }))
            .await?;
        self.monitor
            .submit_measure_point("update_queue_state", promoted, started.elapsed());
        Ok(promoted)
    }

    /// Delete stale responses until a batch comes back short
    async fn delete_stale_responses(&self, cancel: &CancellationToken) -> usize {
        let batch = self.config.stale_response_delete_batch.max(1);
        let mut total = 0;

        loop {
            let started = Instant::now();
            let dialect = Arc::clone(&self.dialect);
            let result = self
                .txn
                .run(move |tx| {
                    Box::pin(async move { dialect.delete_stale_responses(tx, batch).await })
                })
                .await;

            match result {
                Ok(deleted) => {
                    self.monitor.submit_measure_point(
                        "delete_stale_responses",
                        deleted,
                        started.elapsed(),
                    );
                    total += deleted;
                    if deleted < batch || cancel.is_cancelled() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to delete stale responses");
                    break;
                }
            }
        }

        if total > 0 {
            info!(deleted = total, "deleted stale responses");
        }
        total
    }

    async fn resume_broken_business_processes(&self) -> Result<usize, StoreError> {
        let dialect = Arc::clone(&self.dialect);
        self.txn
            .run(move |tx| {
                Box::pin(async move { dialect.resume_broken_business_processes(tx).await })
            })
            .await
    }

    fn resolve_removal_timeout(&self, mut response: Response) -> Response {
        if response.removal_timeout.is_none() {
            response.removal_timeout = Some(self.config.stale_response_removal_timeout);
        }
        response
    }
}

/// [`WorkflowStorage`] over a [`DatabaseDialect`] and a
/// [`TransactionController`]
///
/// Writes issued by processor pools (`register_callback`, `finish`,
/// `error`) and single-response `notify` go through a [`CommandWriter`]:
/// synchronous by default, coalescing when built
/// [`with_batcher`](Self::with_batcher).
///
/// # Example
///
/// ```no_run
/// # async fn example() -> Result<(), durable_dispatch::persistence::StoreError> {
/// use durable_dispatch::persistence::*;
///
/// let store = InMemoryStore::new();
/// let storage = PersistentStorage::new(
///     InMemoryDialect::new("engine-1"),
///     store.transaction_controller(),
///     StorageConfig::default(),
/// )
/// .with_batcher(BatcherConfig::default());
///
/// storage.startup().await?;
/// // ...
/// storage.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct PersistentStorage<D, T> {
    inner: Arc<Inner<D, T>>,
    writer: Arc<dyn CommandWriter>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<D, T> PersistentStorage<D, T>
where
    D: DatabaseDialect,
    T: TransactionController<Tx = D::Tx>,
{
    /// Create storage that writes synchronously
    pub fn new(dialect: D, txn: T, config: StorageConfig) -> Self {
        dialect.set_remove_when_finished(config.remove_when_finished);

        let dialect = Arc::new(dialect);
        let txn = Arc::new(txn);
        let writer: Arc<dyn CommandWriter> =
            Arc::new(SyncCommandWriter::new(Arc::clone(&dialect), Arc::clone(&txn)));

        Self {
            inner: Arc::new(Inner {
                dialect,
                txn,
                config,
                monitor: Arc::new(NullMonitoringDataCollector),
                queue_wake: Notify::new(),
            }),
            writer,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Coalesce pool writes through a batching writer
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_batcher(mut self, config: BatcherConfig) -> Self {
        self.writer = Arc::new(BatchingCommandWriter::start(
            Arc::clone(&self.inner.dialect),
            Arc::clone(&self.inner.txn),
            config,
        ));
        self
    }

    /// Report measure points and workflow history to `monitor`
    ///
    /// Call before `startup`.
    pub fn with_monitor(mut self, monitor: Arc<dyn MonitoringDataCollector>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.monitor = monitor;
        } else {
            warn!("monitor ignored: storage already shared");
        }
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Transaction controller, for callers that supply their own transaction
    pub fn transaction_controller(&self) -> &T {
        self.inner.txn.as_ref()
    }

    fn spawn_queue_updater(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let ceiling = inner.config.queue_update_batch.max(1);
            let backoff = inner.config.queue_backoff;
            debug!(ceiling, "queue updater started");

            loop {
                let delay = match inner.update_queue_state(ceiling).await {
                    Ok(promoted) => {
                        if promoted > 0 {
                            debug!(promoted, "promoted instances to ready");
                        }
                        backoff.delay_for(promoted, ceiling)
                    }
                    Err(e) => {
                        error!(error = %e, "queue update failed");
                        backoff.empty
                    }
                };

                if delay.is_zero() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = inner.queue_wake.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            debug!("queue updater stopped");
        })
    }

    fn spawn_stale_response_reaper(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let period = inner
                .config
                .delete_stale_responses_interval
                .max(MIN_REAPER_INTERVAL);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.delete_stale_responses(&cancel).await;
                    }
                }
            }

            debug!("stale response reaper stopped");
        })
    }

    fn record_history(&self, state: ProcessingState, instance: &PersistentWorkflow) {
        if let Some(id) = instance.id {
            self.inner
                .monitor
                .submit_workflow_history(state, id, &instance.workflow_type);
        }
    }
}

#[async_trait]
impl<D, T> WorkflowStorage for PersistentStorage<D, T>
where
    D: DatabaseDialect,
    T: TransactionController<Tx = D::Tx>,
{
    type Tx = D::Tx;

    #[instrument(skip(self))]
    async fn startup(&self) -> Result<(), StoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("storage already started");
            return Ok(());
        }

        self.inner.delete_stale_responses(&self.cancel).await;

        let resumed = self.inner.resume_broken_business_processes().await?;
        if resumed > 0 {
            info!(resumed, "resumed broken workflow instances");
        }

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_queue_updater());
        tasks.push(self.spawn_stale_response_reaper());

        info!("storage started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        self.writer.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "storage task ended abnormally");
            }
        }

        info!("storage stopped");
    }

    #[instrument(skip(self, instances), fields(count = instances.len()))]
    async fn insert(&self, instances: Vec<PersistentWorkflow>) -> Result<(), StoreError> {
        if instances.is_empty() {
            return Ok(());
        }

        let count = instances.len();
        let started = Instant::now();
        let dialect = Arc::clone(&self.inner.dialect);
        self.inner
            .txn
            .run(move |tx| Box::pin(async move { dialect.insert(tx, &instances).await }))
            .await?;

        self.inner
            .monitor
            .submit_measure_point("insert", count, started.elapsed());
        self.inner.queue_wake.notify_one();
        Ok(())
    }

    async fn insert_in(
        &self,
        tx: &mut Self::Tx,
        instances: Vec<PersistentWorkflow>,
    ) -> Result<(), StoreError> {
        if instances.is_empty() {
            return Ok(());
        }

        let count = instances.len();
        let started = Instant::now();
        self.inner.dialect.insert(tx, &instances).await?;

        self.inner
            .monitor
            .submit_measure_point("insert", count, started.elapsed());
        self.inner.queue_wake.notify_one();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn dequeue(
        &self,
        pool_id: &str,
        max: usize,
    ) -> Result<Vec<PersistentWorkflow>, StoreError> {
        if max == 0 {
            return Ok(vec![]);
        }

        let started = Instant::now();
        let dialect = Arc::clone(&self.inner.dialect);
        let pool = pool_id.to_string();
        let claimed = self
            .inner
            .txn
            .run(move |tx| Box::pin(async move { dialect.dequeue(tx, &pool, max).await }))
            .await?;

        self.inner
            .monitor
            .submit_measure_point("dequeue", claimed.len(), started.elapsed());
        for instance in &claimed {
            self.record_history(ProcessingState::Dequeued, instance);
        }
        Ok(claimed)
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<PersistentWorkflow>, StoreError> {
        let dialect = Arc::clone(&self.inner.dialect);
        self.inner
            .txn
            .run(move |tx| Box::pin(async move { dialect.load(tx, instance_id).await }))
            .await
    }

    #[instrument(skip(self, instance), fields(instance_id = ?instance.id))]
    async fn register_callback(
        &self,
        instance: &mut PersistentWorkflow,
    ) -> Result<(), StoreError> {
        let call = instance
            .register_call
            .clone()
            .ok_or_else(|| StoreError::InvalidArgument("instance has no register call".into()))?;

        self.writer
            .submit(BatchCommand::register_callback(call, instance.payload.clone()))
            .await?;

        instance.register_call = None;
        instance.state = WorkflowState::Waiting;
        self.record_history(ProcessingState::Waiting, instance);
        Ok(())
    }

    async fn error(&self, instance: &PersistentWorkflow, cause: &str) {
        let Some(id) = instance.id else {
            error!(workflow_type = %instance.workflow_type, %cause, "cannot record error: instance has no id");
            return;
        };

        if let Err(e) = self.writer.submit(BatchCommand::error(id, cause)).await {
            error!(instance_id = %id, %cause, error = %e, "failed to record workflow error");
            return;
        }
        self.record_history(ProcessingState::Error, instance);
    }

    async fn finish(&self, instance: &PersistentWorkflow) {
        let Some(id) = instance.id else {
            error!(workflow_type = %instance.workflow_type, "cannot finish: instance has no id");
            return;
        };

        match self.writer.submit(BatchCommand::finish(id)).await {
            Ok(()) => self.record_history(ProcessingState::Finished, instance),
            Err(e) => {
                error!(instance_id = %id, error = %e, "failed to finish workflow instance");
                self.error(instance, &format!("finish failed: {e}")).await;
            }
        }
    }

    #[instrument(skip(self))]
    async fn restart(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let dialect = Arc::clone(&self.inner.dialect);
        self.inner
            .txn
            .run(move |tx| Box::pin(async move { dialect.restart(tx, instance_id).await }))
            .await?;
        self.inner.queue_wake.notify_one();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn restart_all(&self) -> Result<usize, StoreError> {
        let dialect = Arc::clone(&self.inner.dialect);
        let restarted = self
            .inner
            .txn
            .run(move |tx| Box::pin(async move { dialect.restart_all(tx).await }))
            .await?;
        info!(restarted, "restarted failed instances");
        Ok(restarted)
    }

    fn set_remove_when_finished(&self, remove: bool) {
        self.inner.dialect.set_remove_when_finished(remove);
    }

    async fn notify(&self, response: Response) -> Result<(), StoreError> {
        let response = self.inner.resolve_removal_timeout(response);
        self.writer.submit(BatchCommand::notify(response)).await
    }

    async fn notify_all(&self, responses: Vec<Response>) -> Result<(), StoreError> {
        let responses: Vec<Response> = responses
            .into_iter()
            .map(|r| self.inner.resolve_removal_timeout(r))
            .collect();

        let dialect = Arc::clone(&self.inner.dialect);
        self.inner
            .txn
            .run(move |tx| Box::pin(async move { dialect.notify(tx, &responses).await }))
            .await
    }

    async fn notify_in(
        &self,
        tx: &mut Self::Tx,
        responses: Vec<Response>,
    ) -> Result<(), StoreError> {
        let responses: Vec<Response> = responses
            .into_iter()
            .map(|r| self.inner.resolve_removal_timeout(r))
            .collect();
        self.inner.dialect.notify(tx, &responses).await
    }
}
