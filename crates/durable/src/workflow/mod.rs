//! Workflow data model
//!
//! This module provides:
//! - [`WorkflowInstance`] - what callers submit (persistent or transient)
//! - [`PersistentWorkflow`] - the instance the storage layer owns
//! - [`RegisterCall`] and [`Response`] - correlation-based callbacks

mod callback;
mod instance;

pub use callback::{RegisterCall, Response, WaitMode};
pub use instance::{
    PersistentWorkflow, TransientWorkflow, WorkflowInstance, WorkflowState, DEFAULT_POOL_ID,
};
