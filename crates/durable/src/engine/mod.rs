//! Processing engine
//!
//! The engine module provides the [`PersistentEngine`], the public entry
//! point for submitting workflow instances, registering waits and
//! delivering responses. It orders startup and shutdown of the workflow
//! repository, storage and processor pools.

mod injector;
mod lifecycle;
mod persistent;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::persistence::StoreError;
use crate::pool::PoolError;
use crate::workflow::{PersistentWorkflow, Response, WaitMode, WorkflowInstance};

pub use injector::{DefaultDependencyInjector, DependencyInjector};
pub use lifecycle::{EngineState, StartupGate};
pub use persistent::{PersistentEngine, PersistentEngineBuilder};
pub use registry::{RepositoryError, RunOutcome, WorkflowRegistry, WorkflowRepository, WorkflowRunner};

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Operation not allowed in the current lifecycle state
    #[error("engine is {actual}, expected {expected}")]
    IllegalState {
        expected: EngineState,
        actual: EngineState,
    },

    /// Only persistent workflow instances can be submitted
    #[error("workflow instance of type {0} is not persistent")]
    NotPersistent(String),

    /// A wait needs at least one correlation id
    #[error("at least one correlation id is required")]
    NoCorrelationIds,

    /// The engine no longer accepts work
    #[error("engine is shutting down")]
    ShuttingDown,

    /// No pool is registered under the default pool id
    #[error("default processor pool is not registered")]
    MissingDefaultPool,

    /// Startup aborted; the engine must be discarded
    #[error("engine startup failed: {0}")]
    StartupFailed(String),

    /// Persisting submitted instances failed; nothing was stored
    #[error("failed to persist workflow instances: {0}")]
    RunFailed(#[source] StoreError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Pool error
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Engine operations available to pools, runners and injectors
#[async_trait]
pub trait ProcessingEngine: Send + Sync + 'static {
    /// Identity of this engine
    fn engine_id(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> EngineState;

    fn workflow_repository(&self) -> Arc<dyn WorkflowRepository>;

    fn dependency_injector(&self) -> Arc<dyn DependencyInjector>;

    /// Submit one instance; returns its id
    async fn run(&self, instance: WorkflowInstance) -> Result<Uuid, EngineError>;

    /// Submit instances atomically; returns their ids in submission order
    async fn run_batch(&self, instances: Vec<WorkflowInstance>) -> Result<Vec<Uuid>, EngineError>;

    /// Attach a register call to `workflow`, persisted when its runner
    /// returns [`RunOutcome::Suspended`]
    async fn register_callbacks(
        &self,
        workflow: &mut PersistentWorkflow,
        wait_mode: WaitMode,
        timeout: Option<Duration>,
        correlation_ids: Vec<String>,
    ) -> Result<(), EngineError>;

    /// Deliver a response to the waiting instance
    async fn notify(&self, response: Response) -> Result<(), EngineError>;

    /// Move a failed instance back to dispatchable
    async fn restart(&self, instance_id: Uuid) -> Result<(), EngineError>;
}
