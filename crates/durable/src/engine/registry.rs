//! Workflow repository: maps workflow type names to runners
//!
//! A runner executes the business logic of one workflow type. Pools look
//! the runner up by [`PersistentWorkflow::workflow_type`] when they dispatch
//! an instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::ProcessingEngine;
use crate::workflow::PersistentWorkflow;

/// What a runner did with an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The workflow completed
    Finished,

    /// The workflow suspended; it must carry a register call set through
    /// [`ProcessingEngine::register_callbacks`]
    Suspended,
}

/// Executes the business logic of a workflow type
///
/// # Example
///
/// ```ignore
/// struct Approval;
///
/// #[async_trait]
/// impl WorkflowRunner for Approval {
///     async fn run(
///         &self,
///         engine: &dyn ProcessingEngine,
///         workflow: &mut PersistentWorkflow,
///     ) -> anyhow::Result<RunOutcome> {
///         if workflow.response("approval").is_some() || workflow.wait_expired {
///             return Ok(RunOutcome::Finished);
///         }
///         engine
///             .register_callbacks(workflow, WaitMode::All, None, vec!["approval".into()])
///             .await?;
///         Ok(RunOutcome::Suspended)
///     }
/// }
/// ```
#[async_trait]
pub trait WorkflowRunner: Send + Sync + 'static {
    async fn run(
        &self,
        engine: &dyn ProcessingEngine,
        workflow: &mut PersistentWorkflow,
    ) -> anyhow::Result<RunOutcome>;
}

/// Errors from repository startup
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Nothing registered
    #[error("workflow repository has no workflow types")]
    Empty,

    /// Repository-specific failure
    #[error("workflow repository failed to start: {0}")]
    Failed(String),
}

/// Source of workflow runners, started once by the engine
#[async_trait]
pub trait WorkflowRepository: Send + Sync + 'static {
    /// Load and validate the available workflow types
    async fn start(&self) -> Result<(), RepositoryError>;

    /// Runner for a workflow type
    fn runner(&self, workflow_type: &str) -> Option<Arc<dyn WorkflowRunner>>;

    /// All registered workflow type names
    fn workflow_types(&self) -> Vec<String>;
}

/// In-process registry of workflow runners
#[derive(Default)]
pub struct WorkflowRegistry {
    runners: HashMap<String, Arc<dyn WorkflowRunner>>,
    started: AtomicBool,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner for a workflow type, replacing any previous one
    pub fn register(&mut self, workflow_type: impl Into<String>, runner: impl WorkflowRunner) {
        self.runners.insert(workflow_type.into(), Arc::new(runner));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_runner(mut self, workflow_type: impl Into<String>, runner: impl WorkflowRunner) -> Self {
        self.register(workflow_type, runner);
        self
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.runners.contains_key(workflow_type)
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WorkflowRepository for WorkflowRegistry {
    async fn start(&self) -> Result<(), RepositoryError> {
        if self.runners.is_empty() {
            return Err(RepositoryError::Empty);
        }
        self.started.store(true, Ordering::Release);
        info!(workflow_types = ?self.workflow_types(), "workflow repository started");
        Ok(())
    }

    fn runner(&self, workflow_type: &str) -> Option<Arc<dyn WorkflowRunner>> {
        self.runners.get(workflow_type).cloned()
    }

    fn workflow_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.runners.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflow_types())
            .finish()
    }
}
