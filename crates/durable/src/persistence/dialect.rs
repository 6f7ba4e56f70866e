//! Storage dialect abstraction and batch commands

use async_trait::async_trait;
use uuid::Uuid;

use super::store::StoreError;
use crate::workflow::{PersistentWorkflow, RegisterCall, Response};

/// A write that may be coalesced with others into one transaction
#[derive(Debug, Clone, PartialEq)]
pub enum BatchCommand {
    /// Persist a wait and suspend the instance
    RegisterCallback {
        call: RegisterCall,
        payload: serde_json::Value,
    },

    /// Deliver a response
    Notify(Response),

    /// Mark an instance finished
    Finish(Uuid),

    /// Record a failure on an instance
    Error { instance_id: Uuid, cause: String },
}

impl BatchCommand {
    pub fn register_callback(call: RegisterCall, payload: serde_json::Value) -> Self {
        Self::RegisterCallback { call, payload }
    }

    pub fn notify(response: Response) -> Self {
        Self::Notify(response)
    }

    pub fn finish(instance_id: Uuid) -> Self {
        Self::Finish(instance_id)
    }

    pub fn error(instance_id: Uuid, cause: impl Into<String>) -> Self {
        Self::Error {
            instance_id,
            cause: cause.into(),
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterCallback { .. } => "register_callback",
            Self::Notify(_) => "notify",
            Self::Finish(_) => "finish",
            Self::Error { .. } => "error",
        }
    }

    /// Instance the command writes to, if it targets one
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            Self::RegisterCallback { call, .. } => Some(call.instance_id),
            Self::Notify(_) => None,
            Self::Finish(id) => Some(*id),
            Self::Error { instance_id, .. } => Some(*instance_id),
        }
    }
}

/// Backend-specific persistence operations
///
/// Every operation runs inside the transaction it is given; dialects never
/// commit. Responses reach the dialect with their removal timeout resolved.
#[async_trait]
pub trait DatabaseDialect: Send + Sync + 'static {
    /// Transaction handle the operations run in
    type Tx: Send + 'static;

    /// Insert instances in state `enqueued`
    async fn insert(
        &self,
        tx: &mut Self::Tx,
        instances: &[PersistentWorkflow],
    ) -> Result<(), StoreError>;

    /// Claim up to `max` ready instances of a pool, highest priority first
    async fn dequeue(
        &self,
        tx: &mut Self::Tx,
        pool_id: &str,
        max: usize,
    ) -> Result<Vec<PersistentWorkflow>, StoreError>;

    /// Store responses and resolve the waits they answer
    async fn notify(&self, tx: &mut Self::Tx, responses: &[Response]) -> Result<(), StoreError>;

    /// Suspend an instance on a register call, matching early responses
    async fn register_callback(
        &self,
        tx: &mut Self::Tx,
        call: &RegisterCall,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Mark an instance finished (or remove it)
    async fn finish(&self, tx: &mut Self::Tx, instance_id: Uuid) -> Result<(), StoreError>;

    /// Put an instance into error state
    async fn record_error(
        &self,
        tx: &mut Self::Tx,
        instance_id: Uuid,
        cause: &str,
    ) -> Result<(), StoreError>;

    /// Move a failed instance back to ready
    async fn restart(&self, tx: &mut Self::Tx, instance_id: Uuid) -> Result<(), StoreError>;

    /// Move all failed instances back to ready
    async fn restart_all(&self, tx: &mut Self::Tx) -> Result<usize, StoreError>;

    /// Delete up to `max` unmatched responses past their removal timeout
    async fn delete_stale_responses(
        &self,
        tx: &mut Self::Tx,
        max: usize,
    ) -> Result<usize, StoreError>;

    /// Promote up to `max` enqueued or timed-out waiting instances to ready
    async fn update_queue_state(&self, tx: &mut Self::Tx, max: usize)
        -> Result<usize, StoreError>;

    /// Release instances this engine left running after a crash
    async fn resume_broken_business_processes(&self, tx: &mut Self::Tx)
        -> Result<usize, StoreError>;

    /// Load one instance
    async fn load(
        &self,
        tx: &mut Self::Tx,
        instance_id: Uuid,
    ) -> Result<Option<PersistentWorkflow>, StoreError>;

    /// Purge finished instances instead of keeping them
    fn set_remove_when_finished(&self, remove: bool);

    /// Execute a batch of commands in order
    async fn execute_batch(
        &self,
        tx: &mut Self::Tx,
        commands: &[BatchCommand],
    ) -> Result<(), StoreError> {
        for command in commands {
            match command {
                BatchCommand::RegisterCallback { call, payload } => {
                    self.register_callback(tx, call, payload).await?
                }
                BatchCommand::Notify(response) => {
                    self.notify(tx, std::slice::from_ref(response)).await?
                }
                BatchCommand::Finish(id) => self.finish(tx, *id).await?,
                BatchCommand::Error { instance_id, cause } => {
                    self.record_error(tx, *instance_id, cause).await?
                }
            }
        }
        Ok(())
    }
}
