//! Processor pools
//!
//! A processor pool dequeues dispatchable instances assigned to it and runs
//! them with bounded concurrency. The engine wakes a pool through
//! [`ProcessorPool::do_notify`] whenever it inserts work for that pool.

mod manager;
mod processor;

use std::sync::Weak;

use async_trait::async_trait;

use crate::engine::ProcessingEngine;
use crate::persistence::StoreError;

pub use manager::ProcessorPoolManager;
pub use processor::{PersistentProcessorPool, PoolStatus, ProcessorPoolConfig};

/// Processor pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Pool already running
    #[error("processor pool is already running")]
    AlreadyRunning,

    /// Running instances did not finish within the shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// A pool with this id is already registered
    #[error("processor pool already registered: {0}")]
    DuplicatePool(String),
}

/// A pool of workers for one pool id
#[async_trait]
pub trait ProcessorPool: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Called during engine startup, before [`startup`](Self::startup)
    fn set_engine(&self, engine: Weak<dyn ProcessingEngine>);

    async fn startup(&self) -> Result<(), PoolError>;

    /// Stop dequeuing and wait for running instances
    async fn shutdown(&self) -> Result<(), PoolError>;

    /// Hint that new work may be available; never blocks
    fn do_notify(&self);

    /// Instances currently running
    fn current_load(&self) -> usize;

    fn max_concurrency(&self) -> usize;
}
