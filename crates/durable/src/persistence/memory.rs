//! In-memory dialect and transaction controller
//!
//! All data lives behind one async mutex. A transaction holds the lock for
//! its whole lifetime and keeps a snapshot to restore on rollback or drop, so
//! transactions are serializable. A caller that holds an open transaction
//! must not start another one on the same store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};
use uuid::Uuid;

use super::dialect::DatabaseDialect;
use super::store::StoreError;
use super::txn::TransactionController;
use crate::workflow::{PersistentWorkflow, RegisterCall, Response, WaitMode, WorkflowState};

#[derive(Debug, Clone)]
struct Wait {
    correlation_id: String,
    response: Option<Response>,
}

#[derive(Debug, Clone)]
struct StoredInstance {
    workflow: PersistentWorkflow,
    seq: u64,
    claimed_by: Option<String>,
    last_error: Option<String>,
    wait_mode: Option<WaitMode>,
    deadline: Option<DateTime<Utc>>,
    wait_seq: u64,
    waits: Vec<Wait>,
    delivered: Vec<Response>,
    wait_expired: bool,
}

impl StoredInstance {
    fn new(workflow: PersistentWorkflow, seq: u64) -> Self {
        Self {
            workflow,
            seq,
            claimed_by: None,
            last_error: None,
            wait_mode: None,
            deadline: None,
            wait_seq: 0,
            waits: vec![],
            delivered: vec![],
            wait_expired: false,
        }
    }

    fn state(&self) -> WorkflowState {
        self.workflow.state
    }

    fn has_open_wait(&self, correlation_id: &str) -> bool {
        self.state() == WorkflowState::Waiting
            && self
                .waits
                .iter()
                .any(|w| w.correlation_id == correlation_id && w.response.is_none())
    }

    /// Attach a response to its wait; returns true if the instance resumed
    fn match_response(&mut self, response: Response) -> bool {
        if let Some(wait) = self
            .waits
            .iter_mut()
            .find(|w| w.correlation_id == response.correlation_id && w.response.is_none())
        {
            wait.response = Some(response);
        }

        let resolved = match self.wait_mode {
            Some(WaitMode::First) => true,
            Some(WaitMode::All) => self.waits.iter().all(|w| w.response.is_some()),
            None => false,
        };
        if resolved {
            self.release(false);
        }
        resolved
    }

    fn release(&mut self, expired: bool) {
        let matched: Vec<Response> = self.waits.drain(..).filter_map(|w| w.response).collect();
        self.delivered.extend(matched);
        self.wait_mode = None;
        self.deadline = None;
        self.wait_expired = expired;
        self.workflow.state = WorkflowState::Ready;
    }

    fn clear_wait(&mut self) {
        self.waits.clear();
        self.wait_mode = None;
        self.deadline = None;
    }

    /// Snapshot handed out by `load`
    fn view(&self) -> PersistentWorkflow {
        let mut workflow = self.workflow.clone();
        workflow.responses = self.delivered.clone();
        workflow.wait_expired = self.wait_expired;
        workflow
    }
}

#[derive(Debug, Clone)]
struct PendingResponse {
    response: Response,
    expires_at: DateTime<Utc>,
}

/// Everything the in-memory backend stores
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryState {
    instances: HashMap<Uuid, StoredInstance>,
    responses: Vec<PendingResponse>,
    seq: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn instance_mut(&mut self, id: Uuid) -> Result<&mut StoredInstance, StoreError> {
        self.instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))
    }
}

/// Shared in-memory database
///
/// # Example
///
/// ```
/// use durable_dispatch::persistence::{InMemoryDialect, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// let txn = store.transaction_controller();
/// let dialect = InMemoryDialect::new("engine-1");
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction controller over this store
    pub fn transaction_controller(&self) -> InMemoryTransactionController {
        InMemoryTransactionController {
            state: Arc::clone(&self.state),
        }
    }

    /// Get the number of stored instances
    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    /// Get the number of instances in a state
    pub async fn count_in_state(&self, state: WorkflowState) -> usize {
        self.state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| i.state() == state)
            .count()
    }

    /// Get the number of stored, unmatched responses
    pub async fn pending_response_count(&self) -> usize {
        self.state.lock().await.responses.len()
    }

    /// Current state of an instance
    pub async fn state_of(&self, id: Uuid) -> Option<WorkflowState> {
        self.state.lock().await.instances.get(&id).map(|i| i.state())
    }

    /// Engine that claimed an instance
    pub async fn claimed_by(&self, id: Uuid) -> Option<String> {
        self.state
            .lock()
            .await
            .instances
            .get(&id)
            .and_then(|i| i.claimed_by.clone())
    }

    /// Last recorded failure of an instance
    pub async fn last_error(&self, id: Uuid) -> Option<String> {
        self.state
            .lock()
            .await
            .instances
            .get(&id)
            .and_then(|i| i.last_error.clone())
    }

    /// Clear all data (for testing)
    pub async fn clear(&self) {
        *self.state.lock().await = MemoryState::default();
    }
}

/// Open in-memory transaction
///
/// Dropping it without a commit restores the state it started from.
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: Option<MemoryState>,
}

impl MemoryTx {
    fn state(&mut self) -> &mut MemoryState {
        &mut self.guard
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

/// Transaction controller of the in-memory backend
#[derive(Debug, Clone)]
pub struct InMemoryTransactionController {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl TransactionController for InMemoryTransactionController {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = Some(guard.clone());
        Ok(MemoryTx { guard, snapshot })
    }

    async fn commit(&self, mut tx: MemoryTx) -> Result<(), StoreError> {
        tx.snapshot = None;
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }
}

/// In-memory implementation of [`DatabaseDialect`]
///
/// Dequeues by priority, then insertion order.
#[derive(Debug)]
pub struct InMemoryDialect {
    engine_id: String,
    remove_when_finished: AtomicBool,
}

impl InMemoryDialect {
    /// Create a dialect that claims instances as `engine_id`
    pub fn new(engine_id: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
            remove_when_finished: AtomicBool::new(false),
        }
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }
}

#[async_trait]
impl DatabaseDialect for InMemoryDialect {
    type Tx = MemoryTx;

    async fn insert(
        &self,
        tx: &mut MemoryTx,
        instances: &[PersistentWorkflow],
    ) -> Result<(), StoreError> {
        let state = tx.state();
        for instance in instances {
            let id = instance
                .id
                .ok_or_else(|| StoreError::InvalidArgument("instance has no id".into()))?;
            if state.instances.contains_key(&id) {
                return Err(StoreError::InvalidArgument(format!(
                    "duplicate instance id {id}"
                )));
            }

            let mut workflow = instance.clone();
            workflow.pool_id = Some(instance.pool_id().to_string());
            workflow.state = WorkflowState::Enqueued;
            workflow.register_call = None;
            workflow.responses = vec![];
            workflow.wait_expired = false;

            let seq = state.next_seq();
            state.instances.insert(id, StoredInstance::new(workflow, seq));
        }
        trace!(count = instances.len(), "inserted instances");
        Ok(())
    }

    async fn dequeue(
        &self,
        tx: &mut MemoryTx,
        pool_id: &str,
        max: usize,
    ) -> Result<Vec<PersistentWorkflow>, StoreError> {
        let state = tx.state();

        let mut ready: Vec<(i32, u64, Uuid)> = state
            .instances
            .iter()
            .filter(|(_, i)| i.state() == WorkflowState::Ready && i.workflow.pool_id() == pool_id)
            .map(|(id, i)| (i.workflow.priority, i.seq, *id))
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ready.truncate(max);

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, _, id) in ready {
            let instance = state.instance_mut(id)?;
            instance.workflow.state = WorkflowState::Running;
            instance.claimed_by = Some(self.engine_id.clone());

            let mut workflow = instance.workflow.clone();
            workflow.responses = std::mem::take(&mut instance.delivered);
            workflow.wait_expired = std::mem::take(&mut instance.wait_expired);
            claimed.push(workflow);
        }
        Ok(claimed)
    }

    async fn notify(&self, tx: &mut MemoryTx, responses: &[Response]) -> Result<(), StoreError> {
        let state = tx.state();
        for response in responses {
            let target = state
                .instances
                .iter()
                .filter(|(_, i)| i.has_open_wait(&response.correlation_id))
                .min_by_key(|(_, i)| i.wait_seq)
                .map(|(id, _)| *id);

            match target {
                Some(id) => {
                    let resumed = state.instance_mut(id)?.match_response(response.clone());
                    debug!(instance_id = %id, correlation_id = %response.correlation_id, resumed, "matched response");
                }
                None => {
                    state.responses.push(PendingResponse {
                        expires_at: response.expires_at(Duration::ZERO),
                        response: response.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn register_callback(
        &self,
        tx: &mut MemoryTx,
        call: &RegisterCall,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let state = tx.state();
        let wait_seq = state.next_seq();

        let MemoryState {
            instances,
            responses,
            ..
        } = state;
        let instance = instances
            .get_mut(&call.instance_id)
            .ok_or(StoreError::InstanceNotFound(call.instance_id))?;

        instance.workflow.state = WorkflowState::Waiting;
        instance.workflow.payload = payload.clone();
        instance.claimed_by = None;
        instance.wait_mode = Some(call.wait_mode);
        instance.deadline = call.deadline;
        instance.wait_seq = wait_seq;
        instance.waits = call
            .correlation_ids
            .iter()
            .map(|id| Wait {
                correlation_id: id.clone(),
                response: None,
            })
            .collect();

        // Responses that arrived before the wait; the earliest one per id wins
        for correlation_id in &call.correlation_ids {
            if instance.state() != WorkflowState::Waiting {
                break;
            }
            if let Some(pos) = responses
                .iter()
                .position(|p| &p.response.correlation_id == correlation_id)
            {
                let pending = responses.remove(pos);
                instance.match_response(pending.response);
            }
        }
        Ok(())
    }

    async fn finish(&self, tx: &mut MemoryTx, instance_id: Uuid) -> Result<(), StoreError> {
        let state = tx.state();
        if self.remove_when_finished.load(Ordering::Relaxed) {
            return state
                .instances
                .remove(&instance_id)
                .map(|_| ())
                .ok_or(StoreError::InstanceNotFound(instance_id));
        }

        let instance = state.instance_mut(instance_id)?;
        instance.workflow.state = WorkflowState::Finished;
        instance.claimed_by = None;
        instance.clear_wait();
        Ok(())
    }

    async fn record_error(
        &self,
        tx: &mut MemoryTx,
        instance_id: Uuid,
        cause: &str,
    ) -> Result<(), StoreError> {
        let instance = tx.state().instance_mut(instance_id)?;
        instance.workflow.state = WorkflowState::Error;
        instance.claimed_by = None;
        instance.last_error = Some(cause.to_string());
        instance.clear_wait();
        Ok(())
    }

    async fn restart(&self, tx: &mut MemoryTx, instance_id: Uuid) -> Result<(), StoreError> {
        let instance = tx.state().instance_mut(instance_id)?;
        if instance.state() != WorkflowState::Error {
            return Err(StoreError::NotRestartable(instance_id));
        }
        instance.workflow.state = WorkflowState::Ready;
        instance.last_error = None;
        Ok(())
    }

    async fn restart_all(&self, tx: &mut MemoryTx) -> Result<usize, StoreError> {
        let mut restarted = 0;
        for instance in tx.state().instances.values_mut() {
            if instance.state() == WorkflowState::Error {
                instance.workflow.state = WorkflowState::Ready;
                instance.last_error = None;
                restarted += 1;
            }
        }
        Ok(restarted)
    }

    async fn delete_stale_responses(
        &self,
        tx: &mut MemoryTx,
        max: usize,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut removed = 0;
        tx.state().responses.retain(|p| {
            if removed < max && p.expires_at <= now {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn update_queue_state(&self, tx: &mut MemoryTx, max: usize) -> Result<usize, StoreError> {
        let now = Utc::now();
        let state = tx.state();

        let mut due: Vec<(u64, Uuid)> = state
            .instances
            .iter()
            .filter(|(_, i)| match i.state() {
                WorkflowState::Enqueued => true,
                WorkflowState::Waiting => i.deadline.is_some_and(|d| d <= now),
                _ => false,
            })
            .map(|(id, i)| (i.seq, *id))
            .collect();
        due.sort_unstable();
        due.truncate(max);

        for (_, id) in &due {
            let instance = state.instance_mut(*id)?;
            if instance.state() == WorkflowState::Waiting {
                instance.release(true);
            } else {
                instance.workflow.state = WorkflowState::Ready;
            }
        }
        Ok(due.len())
    }

    async fn resume_broken_business_processes(&self, tx: &mut MemoryTx) -> Result<usize, StoreError> {
        let mut resumed = 0;
        for instance in tx.state().instances.values_mut() {
            if instance.state() == WorkflowState::Running
                && instance.claimed_by.as_deref() == Some(self.engine_id.as_str())
            {
                instance.workflow.state = WorkflowState::Ready;
                instance.claimed_by = None;
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    async fn load(
        &self,
        tx: &mut MemoryTx,
        instance_id: Uuid,
    ) -> Result<Option<PersistentWorkflow>, StoreError> {
        Ok(tx.state().instances.get(&instance_id).map(StoredInstance::view))
    }

    fn set_remove_when_finished(&self, remove: bool) {
        self.remove_when_finished.store(remove, Ordering::Relaxed);
    }
}
