//! Registry of processor pools by pool id

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{error, info};

use super::{PoolError, ProcessorPool};
use crate::engine::ProcessingEngine;

/// Holds the processor pools of an engine
///
/// Pools are registered before engine startup; the engine starts and stops
/// them together.
#[derive(Default)]
pub struct ProcessorPoolManager {
    pools: DashMap<String, Arc<dyn ProcessorPool>>,
}

impl ProcessorPoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under its id
    pub fn add_pool(&self, pool: Arc<dyn ProcessorPool>) -> Result<(), PoolError> {
        let id = pool.id().to_string();
        match self.pools.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(PoolError::DuplicatePool(entry.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(pool);
                Ok(())
            }
        }
    }

    /// Builder-style [`add_pool`](Self::add_pool)
    pub fn with_pool(self, pool: Arc<dyn ProcessorPool>) -> Result<Self, PoolError> {
        self.add_pool(pool)?;
        Ok(self)
    }

    pub fn get_processor_pool(&self, pool_id: &str) -> Option<Arc<dyn ProcessorPool>> {
        self.pools.get(pool_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered pool ids, sorted
    pub fn pool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub(crate) fn set_engine(&self, engine: Weak<dyn ProcessingEngine>) {
        for pool in self.snapshot() {
            pool.set_engine(engine.clone());
        }
    }

    /// Start every pool; the first failure is returned
    pub(crate) async fn startup(&self) -> Result<(), PoolError> {
        let pools = self.snapshot();
        let results = join_all(pools.iter().map(|pool| pool.startup())).await;
        info!(pools = pools.len(), "processor pools started");
        results.into_iter().collect()
    }

    /// Stop every pool concurrently; all pools are stopped even if some fail
    pub(crate) async fn shutdown(&self) -> Result<(), PoolError> {
        let pools = self.snapshot();
        let results = join_all(pools.iter().map(|pool| pool.shutdown())).await;

        let mut first_error = None;
        for (pool, result) in pools.iter().zip(results) {
            if let Err(e) = result {
                error!(pool_id = %pool.id(), error = %e, "processor pool shutdown failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Clone the pools out so no map guard is held across an await
    fn snapshot(&self) -> Vec<Arc<dyn ProcessorPool>> {
        self.pools.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

impl std::fmt::Debug for ProcessorPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorPoolManager")
            .field("pools", &self.pool_ids())
            .finish()
    }
}
