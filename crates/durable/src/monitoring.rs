//! Monitoring hooks
//!
//! Components report registrations, storage measure points and workflow
//! history to a [`MonitoringDataCollector`]. Calls happen on hot paths and
//! must not block.

use std::time::Duration;

use uuid::Uuid;

/// Workflow history events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingState {
    /// Claimed by a processor pool
    Dequeued,
    /// Suspended on a register call
    Waiting,
    /// Completed
    Finished,
    /// Failed
    Error,
}

/// Receives monitoring data; every method defaults to a no-op
pub trait MonitoringDataCollector: Send + Sync + 'static {
    /// A storage operation touched `count` rows in `elapsed`
    fn submit_measure_point(&self, _operation: &str, _count: usize, _elapsed: Duration) {}

    fn register_engine(&self, _engine_id: &str) {}

    fn register_pool(&self, _pool_id: &str) {}

    fn register_workflow_repository(&self, _workflow_types: &[String]) {}

    fn submit_workflow_history(
        &self,
        _state: ProcessingState,
        _instance_id: Uuid,
        _workflow_type: &str,
    ) {
    }
}

/// Collector that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitoringDataCollector;

impl MonitoringDataCollector for NullMonitoringDataCollector {}
