//! Persistent processing engine

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::injector::{DefaultDependencyInjector, DependencyInjector};
use super::lifecycle::{EngineState, Lifecycle, StartupGate};
use super::registry::WorkflowRepository;
use super::{EngineError, ProcessingEngine};
use crate::monitoring::{MonitoringDataCollector, NullMonitoringDataCollector};
use crate::persistence::{StoreError, WorkflowStorage};
use crate::pool::ProcessorPoolManager;
use crate::workflow::{
    PersistentWorkflow, RegisterCall, Response, WaitMode, WorkflowInstance, DEFAULT_POOL_ID,
};

/// Builder for [`PersistentEngine`]
pub struct PersistentEngineBuilder<S> {
    storage: Arc<S>,
    pools: Arc<ProcessorPoolManager>,
    repository: Arc<dyn WorkflowRepository>,
    injector: Option<Arc<dyn DependencyInjector>>,
    monitor: Option<Arc<dyn MonitoringDataCollector>>,
    engine_id: Option<String>,
}

impl<S: WorkflowStorage> PersistentEngineBuilder<S> {
    pub fn with_dependency_injector(mut self, injector: Arc<dyn DependencyInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MonitoringDataCollector>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Engine identity; pass the same id to the storage dialect
    pub fn with_engine_id(mut self, engine_id: impl Into<String>) -> Self {
        self.engine_id = Some(engine_id.into());
        self
    }

    pub fn build(self) -> Arc<PersistentEngine<S>> {
        let engine_id = self
            .engine_id
            .unwrap_or_else(|| format!("engine-{}", Uuid::now_v7()));

        Arc::new_cyclic(|this| PersistentEngine {
            engine_id,
            storage: self.storage,
            pools: self.pools,
            repository: self.repository,
            injector: self
                .injector
                .unwrap_or_else(|| Arc::new(DefaultDependencyInjector::new())),
            monitor: self
                .monitor
                .unwrap_or_else(|| Arc::new(NullMonitoringDataCollector)),
            lifecycle: Lifecycle::new(),
            gate: StartupGate::new(),
            this: this.clone(),
        })
    }
}

/// Engine over a [`WorkflowStorage`] and a set of processor pools
///
/// Submissions (`run`, `register_callbacks`, `notify`) wait until
/// [`startup`](Self::startup) has completed and fail fast once
/// [`shutdown`](Self::shutdown) has begun.
///
/// # Example
///
/// ```ignore
/// let pools = ProcessorPoolManager::new();
/// pools.add_pool(Arc::new(PersistentProcessorPool::new(
///     ProcessorPoolConfig::default(),
///     Arc::clone(&storage),
/// )))?;
///
/// let engine = PersistentEngine::builder(storage, Arc::new(pools), Arc::new(registry))
///     .with_engine_id("engine-1")
///     .build();
///
/// engine.startup().await?;
/// let id = engine
///     .run(PersistentWorkflow::new("order_fulfilment", json!({"order": 42})).into())
///     .await?;
/// ```
pub struct PersistentEngine<S> {
    engine_id: String,
    storage: Arc<S>,
    pools: Arc<ProcessorPoolManager>,
    repository: Arc<dyn WorkflowRepository>,
    injector: Arc<dyn DependencyInjector>,
    monitor: Arc<dyn MonitoringDataCollector>,
    lifecycle: Lifecycle,
    gate: StartupGate,
    this: Weak<Self>,
}

impl<S: WorkflowStorage> PersistentEngine<S> {
    pub fn builder(
        storage: Arc<S>,
        pools: Arc<ProcessorPoolManager>,
        repository: Arc<dyn WorkflowRepository>,
    ) -> PersistentEngineBuilder<S> {
        PersistentEngineBuilder {
            storage,
            pools,
            repository,
            injector: None,
            monitor: None,
            engine_id: None,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn pools(&self) -> &Arc<ProcessorPoolManager> {
        &self.pools
    }

    /// Start repository, storage and pools, then release blocked callers
    ///
    /// Valid only once, from [`EngineState::Raw`]. On failure the engine
    /// moves to [`EngineState::Failed`] and must be discarded.
    #[instrument(skip(self), fields(engine_id = %self.engine_id))]
    pub async fn startup(&self) -> Result<(), EngineError> {
        let _transition = self.lifecycle.transition.lock().await;
        self.lifecycle.ensure(EngineState::Raw)?;

        info!("starting engine");
        match self.start_components().await {
            Ok(()) => {
                self.lifecycle.advance(EngineState::Started)?;
                self.gate.open();
                info!("engine started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "engine startup failed");
                self.lifecycle.advance(EngineState::Failed)?;

                // Stop whatever did start; both calls are no-ops otherwise
                if let Err(pool_error) = self.pools.shutdown().await {
                    warn!(error = %pool_error, "pool shutdown after failed startup");
                }
                self.storage.shutdown().await;

                self.gate.open();
                Err(EngineError::StartupFailed(e.to_string()))
            }
        }
    }

    async fn start_components(&self) -> Result<(), EngineError> {
        if self.pools.get_processor_pool(DEFAULT_POOL_ID).is_none() {
            return Err(EngineError::MissingDefaultPool);
        }

        let this: Weak<dyn ProcessingEngine> = self.this.clone();
        self.injector.set_engine(this.clone());
        self.pools.set_engine(this);

        self.monitor.register_engine(&self.engine_id);
        self.repository
            .start()
            .await
            .map_err(|e| EngineError::StartupFailed(e.to_string()))?;
        self.monitor
            .register_workflow_repository(&self.repository.workflow_types());
        for pool_id in self.pools.pool_ids() {
            self.monitor.register_pool(&pool_id);
        }

        self.storage.startup().await?;
        self.pools.startup().await?;
        Ok(())
    }

    /// Stop pools, then storage
    ///
    /// Valid only from [`EngineState::Started`]. The engine ends in
    /// [`EngineState::Stopped`] even when a pool fails to drain in time;
    /// that failure is returned afterwards.
    #[instrument(skip(self), fields(engine_id = %self.engine_id))]
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let _transition = self.lifecycle.transition.lock().await;
        self.lifecycle.ensure(EngineState::Started)?;
        self.lifecycle.advance(EngineState::ShuttingDown)?;

        info!("shutting down engine");
        let pools = self.pools.shutdown().await;
        self.storage.shutdown().await;
        self.lifecycle.advance(EngineState::Stopped)?;
        info!("engine stopped");

        pools.map_err(EngineError::from)
    }

    /// Submit instances inside the caller's transaction
    ///
    /// Pools are notified right away; they pick the instances up once the
    /// caller commits.
    pub async fn run_batch_in(
        &self,
        tx: &mut S::Tx,
        instances: Vec<WorkflowInstance>,
    ) -> Result<Vec<Uuid>, EngineError> {
        self.admit().await?;
        let (instances, ids, pool_ids) = self.prepare(instances)?;

        self.storage
            .insert_in(tx, instances)
            .await
            .map_err(EngineError::RunFailed)?;

        self.notify_pools(&pool_ids);
        Ok(ids)
    }

    /// Deliver several responses in one transaction
    pub async fn notify_all(&self, responses: Vec<Response>) -> Result<(), EngineError> {
        self.admit().await?;
        self.storage.notify_all(responses).await?;
        Ok(())
    }

    /// Move every failed instance back to dispatchable
    pub async fn restart_all(&self) -> Result<usize, EngineError> {
        let restarted = self.storage.restart_all().await?;
        if restarted > 0 {
            self.notify_pools(&self.pools.pool_ids());
        }
        Ok(restarted)
    }

    /// Wait for startup, then check the engine still accepts work
    async fn admit(&self) -> Result<(), EngineError> {
        self.gate.wait().await;
        match self.lifecycle.get() {
            EngineState::Started => Ok(()),
            EngineState::ShuttingDown | EngineState::Stopped => Err(EngineError::ShuttingDown),
            actual => Err(EngineError::IllegalState {
                expected: EngineState::Started,
                actual,
            }),
        }
    }

    /// Validate the whole batch before touching storage
    #[allow(clippy::type_complexity)]
    fn prepare(
        &self,
        instances: Vec<WorkflowInstance>,
    ) -> Result<(Vec<PersistentWorkflow>, Vec<Uuid>, Vec<String>), EngineError> {
        let mut prepared = Vec::with_capacity(instances.len());
        let mut ids = Vec::with_capacity(instances.len());
        let mut pool_ids: Vec<String> = Vec::new();

        for instance in instances {
            let mut workflow = instance
                .into_persistent()
                .map_err(|other| EngineError::NotPersistent(other.workflow_type().to_string()))?;

            let id = *workflow.id.get_or_insert_with(Uuid::now_v7);
            self.resolve_pool(&mut workflow);

            let pool_id = workflow.pool_id();
            if !pool_ids.iter().any(|p| p == pool_id) {
                pool_ids.push(pool_id.to_string());
            }
            ids.push(id);
            prepared.push(workflow);
        }

        Ok((prepared, ids, pool_ids))
    }

    /// Unset pool → default; unknown pool → default with a logged fault
    fn resolve_pool(&self, workflow: &mut PersistentWorkflow) {
        let known = match workflow.pool_id.as_deref() {
            None => false,
            Some(pool_id) if self.pools.get_processor_pool(pool_id).is_some() => true,
            Some(pool_id) => {
                error!(
                    %pool_id,
                    instance_id = ?workflow.id,
                    workflow_type = %workflow.workflow_type,
                    "unknown processor pool, using the default pool"
                );
                false
            }
        };
        if !known {
            workflow.pool_id = Some(DEFAULT_POOL_ID.to_string());
        }
    }

    /// One wake-up per distinct pool
    fn notify_pools(&self, pool_ids: &[String]) {
        for pool_id in pool_ids {
            match self.pools.get_processor_pool(pool_id) {
                Some(pool) => pool.do_notify(),
                None => warn!(%pool_id, "no processor pool to notify"),
            }
        }
    }
}

#[async_trait]
impl<S: WorkflowStorage> ProcessingEngine for PersistentEngine<S> {
    fn engine_id(&self) -> &str {
        &self.engine_id
    }

    fn state(&self) -> EngineState {
        self.lifecycle.get()
    }

    fn workflow_repository(&self) -> Arc<dyn WorkflowRepository> {
        Arc::clone(&self.repository)
    }

    fn dependency_injector(&self) -> Arc<dyn DependencyInjector> {
        Arc::clone(&self.injector)
    }

    async fn run(&self, instance: WorkflowInstance) -> Result<Uuid, EngineError> {
        let ids = self.run_batch(vec![instance]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| EngineError::Store(StoreError::InvalidArgument("empty batch".into())))
    }

    #[instrument(skip(self, instances), fields(count = instances.len()))]
    async fn run_batch(&self, instances: Vec<WorkflowInstance>) -> Result<Vec<Uuid>, EngineError> {
        self.admit().await?;
        let (instances, ids, pool_ids) = self.prepare(instances)?;
        if instances.is_empty() {
            return Ok(ids);
        }

        self.storage
            .insert(instances)
            .await
            .map_err(EngineError::RunFailed)?;

        debug!(count = ids.len(), pools = pool_ids.len(), "submitted workflow instances");
        self.notify_pools(&pool_ids);
        Ok(ids)
    }

    async fn register_callbacks(
        &self,
        workflow: &mut PersistentWorkflow,
        wait_mode: WaitMode,
        timeout: Option<Duration>,
        correlation_ids: Vec<String>,
    ) -> Result<(), EngineError> {
        self.admit().await?;
        if correlation_ids.is_empty() {
            return Err(EngineError::NoCorrelationIds);
        }
        let id = workflow
            .id
            .ok_or_else(|| StoreError::InvalidArgument("instance has no id".into()))?;

        self.resolve_pool(workflow);
        workflow.register_call = Some(RegisterCall::new(id, wait_mode, timeout, correlation_ids)?);
        Ok(())
    }

    async fn notify(&self, response: Response) -> Result<(), EngineError> {
        self.admit().await?;
        self.storage.notify(response).await?;
        Ok(())
    }

    async fn restart(&self, instance_id: Uuid) -> Result<(), EngineError> {
        self.storage.restart(instance_id).await?;
        if let Some(workflow) = self.storage.load(instance_id).await? {
            self.notify_pools(&[workflow.pool_id().to_string()]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::engine::{RunOutcome, WorkflowRegistry, WorkflowRunner};
    use crate::pool::{PoolError, ProcessorPool};
    use crate::workflow::TransientWorkflow;

    /// Storage that records inserts and can be told to fail them
    #[derive(Default)]
    struct RecordingStorage {
        inserted: Mutex<Vec<PersistentWorkflow>>,
        fail_inserts: AtomicBool,
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    #[async_trait]
    impl WorkflowStorage for RecordingStorage {
        type Tx = Vec<PersistentWorkflow>;

        async fn startup(&self) -> Result<(), StoreError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        async fn insert(&self, instances: Vec<PersistentWorkflow>) -> Result<(), StoreError> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(StoreError::Database("connection refused".into()));
            }
            self.inserted.lock().extend(instances);
            Ok(())
        }

        async fn insert_in(
            &self,
            tx: &mut Self::Tx,
            instances: Vec<PersistentWorkflow>,
        ) -> Result<(), StoreError> {
            tx.extend(instances);
            Ok(())
        }

        async fn dequeue(&self, _: &str, _: usize) -> Result<Vec<PersistentWorkflow>, StoreError> {
            Ok(vec![])
        }

        async fn load(&self, _: Uuid) -> Result<Option<PersistentWorkflow>, StoreError> {
            Ok(None)
        }

        async fn register_callback(&self, _: &mut PersistentWorkflow) -> Result<(), StoreError> {
            Ok(())
        }

        async fn error(&self, _: &PersistentWorkflow, _: &str) {}

        async fn finish(&self, _: &PersistentWorkflow) {}

        async fn restart(&self, id: Uuid) -> Result<(), StoreError> {
            Err(StoreError::InstanceNotFound(id))
        }

        async fn restart_all(&self) -> Result<usize, StoreError> {
            Ok(0)
        }

        fn set_remove_when_finished(&self, _: bool) {}

        async fn notify(&self, _: Response) -> Result<(), StoreError> {
            Ok(())
        }

        async fn notify_all(&self, _: Vec<Response>) -> Result<(), StoreError> {
            Ok(())
        }

        async fn notify_in(&self, _: &mut Self::Tx, _: Vec<Response>) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Pool that only counts wake-ups
    struct CountingPool {
        id: String,
        notified: AtomicUsize,
    }

    impl CountingPool {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                notified: AtomicUsize::new(0),
            })
        }

        fn notified(&self) -> usize {
            self.notified.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessorPool for CountingPool {
        fn id(&self) -> &str {
            &self.id
        }

        fn set_engine(&self, _: Weak<dyn ProcessingEngine>) {}

        async fn startup(&self) -> Result<(), PoolError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), PoolError> {
            Ok(())
        }

        fn do_notify(&self) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }

        fn current_load(&self) -> usize {
            0
        }

        fn max_concurrency(&self) -> usize {
            1
        }
    }

    struct Noop;

    #[async_trait]
    impl WorkflowRunner for Noop {
        async fn run(
            &self,
            _: &dyn ProcessingEngine,
            _: &mut PersistentWorkflow,
        ) -> anyhow::Result<RunOutcome> {
            Ok(RunOutcome::Finished)
        }
    }

    struct Fixture {
        engine: Arc<PersistentEngine<RecordingStorage>>,
        storage: Arc<RecordingStorage>,
        default_pool: Arc<CountingPool>,
        orders_pool: Arc<CountingPool>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(RecordingStorage::default());
        let default_pool = CountingPool::new(DEFAULT_POOL_ID);
        let orders_pool = CountingPool::new("orders");

        let pools = ProcessorPoolManager::new();
        pools.add_pool(default_pool.clone()).unwrap();
        pools.add_pool(orders_pool.clone()).unwrap();

        let engine = PersistentEngine::builder(
            Arc::clone(&storage),
            Arc::new(pools),
            Arc::new(WorkflowRegistry::new().with_runner("test", Noop)),
        )
        .with_engine_id("engine-test")
        .build();

        Fixture {
            engine,
            storage,
            default_pool,
            orders_pool,
        }
    }

    fn persistent() -> WorkflowInstance {
        PersistentWorkflow::new("test", serde_json::json!({})).into()
    }

    #[tokio::test]
    async fn test_unknown_and_unset_pools_remap_to_default() {
        let f = fixture();
        f.engine.startup().await.unwrap();

        let unknown = PersistentWorkflow::new("test", serde_json::json!({})).with_pool("nope");
        let known = PersistentWorkflow::new("test", serde_json::json!({})).with_pool("orders");
        f.engine
            .run_batch(vec![unknown.into(), known.into(), persistent()])
            .await
            .unwrap();

        let pools: Vec<_> = f
            .storage
            .inserted
            .lock()
            .iter()
            .map(|w| w.pool_id.clone().unwrap())
            .collect();
        assert_eq!(pools, vec![DEFAULT_POOL_ID, "orders", DEFAULT_POOL_ID]);
    }

    #[tokio::test]
    async fn test_one_notification_per_distinct_pool() {
        let f = fixture();
        f.engine.startup().await.unwrap();

        let mut batch: Vec<WorkflowInstance> = (0..50).map(|_| persistent()).collect();
        batch.extend((0..30).map(|_| {
            WorkflowInstance::from(
                PersistentWorkflow::new("test", serde_json::json!({})).with_pool("orders"),
            )
        }));

        let ids = f.engine.run_batch(batch).await.unwrap();

        assert_eq!(ids.len(), 80);
        assert_eq!(f.default_pool.notified(), 1);
        assert_eq!(f.orders_pool.notified(), 1);
    }

    #[tokio::test]
    async fn test_ids_assigned_and_preserved() {
        let f = fixture();
        f.engine.startup().await.unwrap();

        let fixed = Uuid::now_v7();
        let ids = f
            .engine
            .run_batch(vec![
                PersistentWorkflow::new("test", serde_json::json!({}))
                    .with_id(fixed)
                    .into(),
                persistent(),
            ])
            .await
            .unwrap();

        assert_eq!(ids[0], fixed);
        assert_ne!(ids[1], fixed);
        assert_eq!(f.storage.inserted.lock()[1].id, Some(ids[1]));
    }

    #[tokio::test]
    async fn test_transient_instance_rejects_whole_batch() {
        let f = fixture();
        f.engine.startup().await.unwrap();

        let result = f
            .engine
            .run_batch(vec![
                persistent(),
                TransientWorkflow::new("ephemeral", serde_json::json!({})).into(),
            ])
            .await;

        assert!(matches!(result, Err(EngineError::NotPersistent(t)) if t == "ephemeral"));
        assert!(f.storage.inserted.lock().is_empty());
        assert_eq!(f.default_pool.notified(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_returned_without_notifications() {
        let f = fixture();
        f.engine.startup().await.unwrap();
        f.storage.fail_inserts.store(true, Ordering::SeqCst);

        let result = f.engine.run(persistent()).await;

        assert!(matches!(result, Err(EngineError::RunFailed(StoreError::Database(_)))));
        assert_eq!(f.default_pool.notified(), 0);
    }

    #[tokio::test]
    async fn test_run_in_external_transaction() {
        let f = fixture();
        f.engine.startup().await.unwrap();

        let mut tx = Vec::new();
        let ids = f
            .engine
            .run_batch_in(&mut tx, vec![persistent(), persistent()])
            .await
            .unwrap();

        assert_eq!(tx.len(), 2);
        assert_eq!(ids.len(), 2);
        assert!(f.storage.inserted.lock().is_empty());
        assert_eq!(f.default_pool.notified(), 1);
    }

    #[tokio::test]
    async fn test_register_callbacks_requires_correlation_ids() {
        let f = fixture();
        f.engine.startup().await.unwrap();

        let mut wf = PersistentWorkflow::new("test", serde_json::json!({}))
            .with_id(Uuid::now_v7())
            .with_pool("nope");

        let result = f
            .engine
            .register_callbacks(&mut wf, WaitMode::All, None, vec![])
            .await;
        assert!(matches!(result, Err(EngineError::NoCorrelationIds)));
        assert!(wf.register_call.is_none());

        f.engine
            .register_callbacks(&mut wf, WaitMode::First, None, vec!["c1".into()])
            .await
            .unwrap();
        assert_eq!(wf.pool_id(), DEFAULT_POOL_ID);
        assert_eq!(wf.register_call.unwrap().correlation_ids, vec!["c1"]);
    }

    #[tokio::test]
    async fn test_submissions_block_until_startup() {
        let f = fixture();

        let engine = Arc::clone(&f.engine);
        let submit = tokio::spawn(async move { engine.run(persistent()).await });

        let engine = Arc::clone(&f.engine);
        let register = tokio::spawn(async move {
            let mut wf = PersistentWorkflow::new("test", serde_json::json!({})).with_id(Uuid::now_v7());
            engine
                .register_callbacks(&mut wf, WaitMode::All, None, vec!["c".into()])
                .await
                .map(|_| wf)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!submit.is_finished());
        assert!(!register.is_finished());
        assert!(f.storage.inserted.lock().is_empty());

        f.engine.startup().await.unwrap();

        submit.await.unwrap().unwrap();
        let wf = register.await.unwrap().unwrap();
        assert!(wf.register_call.is_some());
        assert_eq!(f.storage.inserted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_violations() {
        let f = fixture();

        assert!(matches!(
            f.engine.shutdown().await,
            Err(EngineError::IllegalState {
                expected: EngineState::Started,
                actual: EngineState::Raw
            })
        ));

        f.engine.startup().await.unwrap();
        assert!(matches!(
            f.engine.startup().await,
            Err(EngineError::IllegalState {
                expected: EngineState::Raw,
                actual: EngineState::Started
            })
        ));

        f.engine.shutdown().await.unwrap();
        assert_eq!(f.engine.state(), EngineState::Stopped);
        assert_eq!(f.storage.started.load(Ordering::SeqCst), 1);
        assert_eq!(f.storage.stopped.load(Ordering::SeqCst), 1);

        assert!(matches!(
            f.engine.shutdown().await,
            Err(EngineError::IllegalState { .. })
        ));
        assert!(matches!(
            f.engine.run(persistent()).await,
            Err(EngineError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_startup_without_default_pool_fails() {
        let storage = Arc::new(RecordingStorage::default());
        let pools = ProcessorPoolManager::new();
        pools.add_pool(CountingPool::new("orders")).unwrap();

        let engine = PersistentEngine::builder(
            Arc::clone(&storage),
            Arc::new(pools),
            Arc::new(WorkflowRegistry::new().with_runner("test", Noop)),
        )
        .build();

        assert!(matches!(
            engine.startup().await,
            Err(EngineError::StartupFailed(_))
        ));
        assert_eq!(engine.state(), EngineState::Failed);
        assert_eq!(storage.started.load(Ordering::SeqCst), 0);

        // Blocked callers are released and refused
        assert!(matches!(
            engine.run(persistent()).await,
            Err(EngineError::IllegalState {
                actual: EngineState::Failed,
                ..
            })
        ));
        assert!(matches!(engine.startup().await, Err(EngineError::IllegalState { .. })));
    }

    #[tokio::test]
    async fn test_startup_with_empty_repository_fails() {
        let storage = Arc::new(RecordingStorage::default());
        let pools = ProcessorPoolManager::new();
        pools.add_pool(CountingPool::new(DEFAULT_POOL_ID)).unwrap();

        let engine =
            PersistentEngine::builder(storage, Arc::new(pools), Arc::new(WorkflowRegistry::new()))
                .build();

        assert!(matches!(
            engine.startup().await,
            Err(EngineError::StartupFailed(_))
        ));
        assert_eq!(engine.state(), EngineState::Failed);
    }
}
