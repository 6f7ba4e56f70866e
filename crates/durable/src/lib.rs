//! # Durable Dispatch
//!
//! The dispatch-and-persistence core of a workflow engine: it stores
//! workflow instances transactionally, hands them to processor pools with
//! bounded concurrency, and resumes suspended instances when correlated
//! responses arrive or their wait times out.
//!
//! ## Features
//!
//! - **Transactional submission**: batches are stored atomically, optionally inside the caller's transaction
//! - **Correlation callbacks**: instances wait for all or the first of several responses, with deadlines
//! - **Processor pools**: `FOR UPDATE SKIP LOCKED` claiming with bounded concurrency and wake-ups
//! - **Background upkeep**: queue promotion, stale-response reaping and crash recovery
//! - **Pluggable backends**: PostgreSQL for production, in-memory for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PersistentEngine                         │
//! │  (lifecycle, submission, register callbacks, notify)        │
//! └─────────────────────────────────────────────────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────────┐ ┌────────────────────────────┐
//! │     ProcessorPoolManager      │ │     PersistentStorage      │
//! │  (claim, run, record result) │ │  (queue updater, reaper)   │
//! └──────────────────────────────┘ └────────────────────────────┘
//!                                                │
//!                                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │       DatabaseDialect + TransactionController                │
//! │  (PostgreSQL: dispatch_instances, responses, waits)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_dispatch::prelude::*;
//!
//! let store = InMemoryStore::new();
//! let storage = Arc::new(PersistentStorage::new(
//!     InMemoryDialect::new("engine-1"),
//!     store.transaction_controller(),
//!     StorageConfig::default(),
//! ));
//!
//! let pools = ProcessorPoolManager::new();
//! pools.add_pool(Arc::new(PersistentProcessorPool::new(
//!     ProcessorPoolConfig::default(),
//!     Arc::clone(&storage),
//! )))?;
//!
//! let registry = WorkflowRegistry::new().with_runner("approval", Approval);
//! let engine = PersistentEngine::builder(storage, Arc::new(pools), Arc::new(registry))
//!     .with_engine_id("engine-1")
//!     .build();
//!
//! engine.startup().await?;
//! engine.run(PersistentWorkflow::new("approval", json!({})).into()).await?;
//! ```

pub mod engine;
pub mod monitoring;
pub mod persistence;
pub mod pool;
pub mod workflow;

mod serde_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        DependencyInjector, EngineError, EngineState, PersistentEngine, ProcessingEngine,
        RunOutcome, WorkflowRegistry, WorkflowRepository, WorkflowRunner,
    };
    pub use crate::monitoring::{MonitoringDataCollector, ProcessingState};
    pub use crate::persistence::{
        BatcherConfig, InMemoryDialect, InMemoryStore, PersistentStorage, PostgresDialect,
        PgTransactionController, StorageConfig, StoreError, WorkflowStorage,
    };
    pub use crate::pool::{
        PersistentProcessorPool, PoolError, ProcessorPool, ProcessorPoolConfig,
        ProcessorPoolManager,
    };
    pub use crate::workflow::{
        PersistentWorkflow, Response, WaitMode, WorkflowInstance, WorkflowState, DEFAULT_POOL_ID,
    };
}

// Re-export key types at crate root
pub use engine::{EngineError, EngineState, PersistentEngine, ProcessingEngine, WorkflowRegistry};
pub use persistence::{PersistentStorage, StoreError, WorkflowStorage};
pub use pool::{PersistentProcessorPool, PoolError, ProcessorPoolConfig, ProcessorPoolManager};
pub use workflow::{PersistentWorkflow, Response, WaitMode, WorkflowInstance};
