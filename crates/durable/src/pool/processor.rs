//! Storage-backed processor pool
//!
//! Claims dispatchable instances for one pool id and runs each on its own
//! task, bounded by a semaphore. The poll loop claims as many instances as
//! there are free slots, keeps going while claims come back full and
//! otherwise sleeps until the next poll or an engine wake-up.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::{PoolError, ProcessorPool};
use crate::engine::{ProcessingEngine, RunOutcome};
use crate::persistence::config::{env_millis, env_parse};
use crate::persistence::WorkflowStorage;
use crate::serde_millis::duration_millis;
use crate::workflow::{PersistentWorkflow, DEFAULT_POOL_ID};

/// Processor pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessorPoolConfig {
    /// Pool id instances are assigned to
    pub pool_id: String,

    /// Maximum instances running at once
    pub max_concurrency: usize,

    /// Maximum instances claimed per dequeue
    pub dequeue_batch: usize,

    /// Sleep between polls when no work was found
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Upper bound of the random delay added to each idle sleep
    #[serde(with = "duration_millis")]
    pub poll_jitter: Duration,

    /// How long shutdown waits for running instances
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ProcessorPoolConfig {
    fn default() -> Self {
        Self {
            pool_id: DEFAULT_POOL_ID.to_string(),
            max_concurrency: 10,
            dequeue_batch: 100,
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ProcessorPoolConfig {
    /// Configuration for a named pool
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `DISPATCH_POOL_*` environment variables
    pub fn from_env(pool_id: impl Into<String>) -> Self {
        let defaults = Self::new(pool_id);
        Self {
            max_concurrency: env_parse("DISPATCH_POOL_MAX_CONCURRENCY", defaults.max_concurrency)
                .max(1),
            dequeue_batch: env_parse("DISPATCH_POOL_DEQUEUE_BATCH", defaults.dequeue_batch).max(1),
            poll_interval: env_millis("DISPATCH_POOL_POLL_INTERVAL_MS", defaults.poll_interval),
            poll_jitter: env_millis("DISPATCH_POOL_POLL_JITTER_MS", defaults.poll_jitter),
            shutdown_timeout: env_millis(
                "DISPATCH_POOL_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            ),
            ..defaults
        }
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the dequeue batch size
    pub fn with_dequeue_batch(mut self, size: usize) -> Self {
        self.dequeue_batch = size.max(1);
        self
    }

    /// Set the idle poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Processor pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Not started yet
    Idle,
    /// Polling and running instances
    Running,
    /// Finishing running instances, no new claims
    Draining,
    /// Stopped
    Stopped,
}

/// State shared with the poll loop and dispatch tasks
struct Shared<S> {
    config: ProcessorPoolConfig,
    storage: Arc<S>,
    engine: RwLock<Option<Weak<dyn ProcessingEngine>>>,
    wake: Notify,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl<S> Shared<S> {
    fn engine(&self) -> Option<Arc<dyn ProcessingEngine>> {
        self.engine.read().as_ref().and_then(Weak::upgrade)
    }
}

/// Processor pool backed by a [`WorkflowStorage`]
///
/// # Example
///
/// ```ignore
/// let pool = PersistentProcessorPool::new(
///     ProcessorPoolConfig::new("orders").with_max_concurrency(20),
///     Arc::clone(&storage),
/// );
/// pools.add_pool(Arc::new(pool))?;
/// ```
pub struct PersistentProcessorPool<S> {
    shared: Arc<Shared<S>>,
    status: RwLock<PoolStatus>,
    cancel: Mutex<CancellationToken>,
    /// Cancels in-flight dispatches once the drain timeout is exceeded
    abort: Mutex<CancellationToken>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WorkflowStorage> PersistentProcessorPool<S> {
    pub fn new(config: ProcessorPoolConfig, storage: Arc<S>) -> Self {
        let config = ProcessorPoolConfig {
            max_concurrency: config.max_concurrency.max(1),
            dequeue_batch: config.dequeue_batch.max(1),
            ..config
        };
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            shared: Arc::new(Shared {
                config,
                storage,
                engine: RwLock::new(None),
                wake: Notify::new(),
                permits,
                tracker: TaskTracker::new(),
            }),
            status: RwLock::new(PoolStatus::Idle),
            cancel: Mutex::new(CancellationToken::new()),
            abort: Mutex::new(CancellationToken::new()),
            poll_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProcessorPoolConfig {
        &self.shared.config
    }

    pub fn status(&self) -> PoolStatus {
        *self.status.read()
    }
}

#[async_trait]
impl<S: WorkflowStorage> ProcessorPool for PersistentProcessorPool<S> {
    fn id(&self) -> &str {
        &self.shared.config.pool_id
    }

    fn set_engine(&self, engine: Weak<dyn ProcessingEngine>) {
        *self.shared.engine.write() = Some(engine);
    }

    #[instrument(skip(self), fields(pool_id = %self.shared.config.pool_id))]
    async fn startup(&self) -> Result<(), PoolError> {
        {
            let mut status = self.status.write();
            if matches!(*status, PoolStatus::Running | PoolStatus::Draining) {
                return Err(PoolError::AlreadyRunning);
            }
            *status = PoolStatus::Running;
        }

        info!(
            max_concurrency = self.shared.config.max_concurrency,
            dequeue_batch = self.shared.config.dequeue_batch,
            "starting processor pool"
        );

        let cancel = CancellationToken::new();
        let abort = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        *self.abort.lock() = abort.clone();
        self.shared.tracker.reopen();

        let handle = tokio::spawn(poll_loop(Arc::clone(&self.shared), cancel, abort));
        *self.poll_handle.lock() = Some(handle);
        Ok(())
    }

    #[instrument(skip(self), fields(pool_id = %self.shared.config.pool_id))]
    async fn shutdown(&self) -> Result<(), PoolError> {
        {
            let mut status = self.status.write();
            if *status != PoolStatus::Running {
                return Ok(());
            }
            *status = PoolStatus::Draining;
        }

        info!("initiating graceful shutdown");
        self.cancel.lock().cancel();

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "poll loop terminated abnormally");
            }
        }

        self.shared.tracker.close();
        let drained = tokio::time::timeout(
            self.shared.config.shutdown_timeout,
            self.shared.tracker.wait(),
        )
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.shared.tracker.len(),
                "shutdown timeout reached, canceling running instances"
            );
            // Canceled instances stay claimed and are resumed on the next startup
            self.abort.lock().cancel();
            self.shared.tracker.wait().await;
            *self.status.write() = PoolStatus::Stopped;
            return Err(PoolError::ShutdownTimeout);
        }

        *self.status.write() = PoolStatus::Stopped;

        info!("processor pool stopped");
        Ok(())
    }

    fn do_notify(&self) {
        self.shared.wake.notify_one();
    }

    fn current_load(&self) -> usize {
        self.shared.config.max_concurrency - self.shared.permits.available_permits()
    }

    fn max_concurrency(&self) -> usize {
        self.shared.config.max_concurrency
    }
}

async fn poll_loop<S: WorkflowStorage>(
    shared: Arc<Shared<S>>,
    cancel: CancellationToken,
    abort: CancellationToken,
) {
    let pool_id = shared.config.pool_id.as_str();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // One free slot is needed before claiming anything
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&shared.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let mut permits: Vec<OwnedSemaphorePermit> = vec![first];
        while permits.len() < shared.config.dequeue_batch {
            match Arc::clone(&shared.permits).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }

        let requested = permits.len();
        let claimed = match shared.storage.dequeue(pool_id, requested).await {
            Ok(instances) => instances,
            Err(e) => {
                error!(%pool_id, error = %e, "dequeue failed");
                Vec::new()
            }
        };

        let full = claimed.len() == requested;
        if !claimed.is_empty() {
            debug!(%pool_id, count = claimed.len(), "dispatching instances");
        }
        for (workflow, permit) in claimed.into_iter().zip(permits.drain(..)) {
            let task_shared = Arc::clone(&shared);
            let abort = abort.clone();
            shared.tracker.spawn(async move {
                let instance_id = workflow.id;
                tokio::select! {
                    _ = dispatch(&task_shared, workflow) => {}
                    _ = abort.cancelled() => {
                        warn!(?instance_id, "dispatch canceled by shutdown");
                    }
                }
                drop(permit);
            });
        }
        drop(permits);

        if full {
            continue;
        }

        let delay = shared.config.poll_interval + jitter(shared.config.poll_jitter);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(%pool_id, "poll loop exited");
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Run one claimed instance and record what became of it
async fn dispatch<S: WorkflowStorage>(shared: &Shared<S>, mut workflow: PersistentWorkflow) {
    let storage = &shared.storage;

    let Some(engine) = shared.engine() else {
        error!(instance_id = ?workflow.id, "no engine attached to processor pool");
        storage.error(&workflow, "processing engine unavailable").await;
        return;
    };

    let Some(runner) = engine.workflow_repository().runner(&workflow.workflow_type) else {
        error!(
            instance_id = ?workflow.id,
            workflow_type = %workflow.workflow_type,
            "no runner registered for workflow type"
        );
        let cause = format!("no runner registered for workflow type {}", workflow.workflow_type);
        storage.error(&workflow, &cause).await;
        return;
    };

    engine.dependency_injector().inject(&mut workflow);

    let outcome = AssertUnwindSafe(runner.run(engine.as_ref(), &mut workflow))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(RunOutcome::Finished)) => storage.finish(&workflow).await,
        Ok(Ok(RunOutcome::Suspended)) => {
            if workflow.register_call.is_none() {
                warn!(instance_id = ?workflow.id, "runner suspended without registering callbacks");
                storage
                    .error(&workflow, "suspended without a register call")
                    .await;
            } else if let Err(e) = storage.register_callback(&mut workflow).await {
                error!(instance_id = ?workflow.id, error = %e, "failed to persist register call");
                storage.error(&workflow, &e.to_string()).await;
            }
        }
        Ok(Err(e)) => {
            warn!(instance_id = ?workflow.id, error = %e, "workflow run failed");
            storage.error(&workflow, &format!("{e:#}")).await;
        }
        Err(panic) => {
            let cause = panic_message(panic.as_ref());
            error!(instance_id = ?workflow.id, %cause, "workflow runner panicked");
            storage.error(&workflow, &format!("panic: {cause}")).await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
