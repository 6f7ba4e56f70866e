//! Workflow instances as submitted to and stored by the engine

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::callback::{RegisterCall, Response};

/// Id of the processor pool that always exists
pub const DEFAULT_POOL_ID: &str = "P#DEFAULT";

/// Lifecycle state of a stored workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Inserted, waiting for the queue updater
    Enqueued,

    /// Dispatchable: eligible for dequeue
    Ready,

    /// Claimed by a processor pool
    Running,

    /// Suspended on a register call
    Waiting,

    /// Completed successfully (kept only when finished instances are retained)
    Finished,

    /// Failed; can be restarted
    Error,
}

impl WorkflowState {
    /// Stable name used by the dialects
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    /// Parse a stored state name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enqueued" => Some(Self::Enqueued),
            "ready" => Some(Self::Ready),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "finished" => Some(Self::Finished),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workflow instance that can be persisted
///
/// `id` and `pool_id` may be left unset; the engine assigns a fresh id and
/// the default pool on submission.
///
/// # Example
///
/// ```
/// use durable_dispatch::workflow::PersistentWorkflow;
///
/// let wf = PersistentWorkflow::new("order_fulfilment", serde_json::json!({"order": 42}))
///     .with_pool("orders")
///     .with_priority(5);
///
/// assert_eq!(wf.pool_id(), "orders");
/// assert!(wf.id.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentWorkflow {
    /// Unique instance id (generated on submission if absent)
    pub id: Option<Uuid>,

    /// Workflow type, used to find the runner
    pub workflow_type: String,

    /// Processor pool this instance is assigned to
    pub pool_id: Option<String>,

    /// Higher priorities are dequeued first
    pub priority: i32,

    /// Current lifecycle state
    pub state: WorkflowState,

    /// Workflow data (JSON)
    pub payload: serde_json::Value,

    /// Pending wait, persisted on the next state transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_call: Option<RegisterCall>,

    /// Responses delivered with the instance on dequeue
    #[serde(default)]
    pub responses: Vec<Response>,

    /// Set when the instance was resumed because its wait timed out
    #[serde(default)]
    pub wait_expired: bool,
}

impl PersistentWorkflow {
    /// Create a new instance of the given workflow type
    pub fn new(workflow_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            workflow_type: workflow_type.into(),
            pool_id: None,
            priority: 0,
            state: WorkflowState::Enqueued,
            payload,
            register_call: None,
            responses: vec![],
            wait_expired: false,
        }
    }

    /// Set the instance id
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the processor pool
    pub fn with_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = Some(pool_id.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Effective pool id (the default pool when unset)
    pub fn pool_id(&self) -> &str {
        self.pool_id.as_deref().unwrap_or(DEFAULT_POOL_ID)
    }

    /// First delivered response for a correlation id
    pub fn response(&self, correlation_id: &str) -> Option<&Response> {
        self.responses
            .iter()
            .find(|r| r.correlation_id == correlation_id)
    }
}

/// A workflow instance that lives only in memory
///
/// The persistent engine refuses these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientWorkflow {
    pub workflow_type: String,
    pub payload: serde_json::Value,
}

impl TransientWorkflow {
    pub fn new(workflow_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            payload,
        }
    }
}

/// Anything a caller can submit to an engine
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowInstance {
    Persistent(PersistentWorkflow),
    Transient(TransientWorkflow),
}

impl WorkflowInstance {
    /// Workflow type of either variant
    pub fn workflow_type(&self) -> &str {
        match self {
            Self::Persistent(wf) => &wf.workflow_type,
            Self::Transient(wf) => &wf.workflow_type,
        }
    }

    /// The persistent variant, or the instance back if it is transient
    pub fn into_persistent(self) -> Result<PersistentWorkflow, Self> {
        match self {
            Self::Persistent(wf) => Ok(wf),
            other => Err(other),
        }
    }
}

impl From<PersistentWorkflow> for WorkflowInstance {
    fn from(wf: PersistentWorkflow) -> Self {
        Self::Persistent(wf)
    }
}

impl From<TransientWorkflow> for WorkflowInstance {
    fn from(wf: TransientWorkflow) -> Self {
        Self::Transient(wf)
    }
}
