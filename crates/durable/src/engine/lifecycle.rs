//! Engine lifecycle state machine and startup gate

use parking_lot::RwLock;
use tokio::sync::watch;

use super::EngineError;

/// Lifecycle state of an engine
///
/// ```text
/// Raw ──► Started ──► ShuttingDown ──► Stopped
///  │
///  └────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Constructed, not started
    Raw,
    /// Accepting work
    Started,
    /// Stopping pools and storage
    ShuttingDown,
    /// Stopped for good
    Stopped,
    /// Startup failed; the engine must be discarded
    Failed,
}

impl EngineState {
    /// Whether `self -> next` is an allowed transition
    pub fn can_transition_to(self, next: EngineState) -> bool {
        matches!(
            (self, next),
            (Self::Raw, Self::Started)
                | (Self::Raw, Self::Failed)
                | (Self::Started, Self::ShuttingDown)
                | (Self::ShuttingDown, Self::Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Started => "started",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus a lock that serializes whole transitions
///
/// The state itself is read lock-free on the submission path; only
/// startup and shutdown take `transition`.
pub(crate) struct Lifecycle {
    state: RwLock<EngineState>,
    pub(crate) transition: tokio::sync::Mutex<()>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::Raw),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn get(&self) -> EngineState {
        *self.state.read()
    }

    /// Fail unless the current state is `expected`
    pub(crate) fn ensure(&self, expected: EngineState) -> Result<(), EngineError> {
        let actual = self.get();
        if actual != expected {
            return Err(EngineError::IllegalState { expected, actual });
        }
        Ok(())
    }

    /// Move to `next`, validated against the transition table
    pub(crate) fn advance(&self, next: EngineState) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            return Err(EngineError::IllegalState {
                expected: next,
                actual: *state,
            });
        }
        *state = next;
        Ok(())
    }
}

/// One-shot latch: closed until opened, then open forever
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// use durable_dispatch::engine::StartupGate;
///
/// let gate = StartupGate::new();
/// assert!(!gate.is_open());
/// gate.open();
/// gate.wait().await;
/// # });
/// ```
#[derive(Debug)]
pub struct StartupGate {
    open: watch::Sender<bool>,
}

impl Default for StartupGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupGate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self { open }
    }

    /// Release every current and future waiter
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Wait until the gate is open
    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|open| *open).await;
    }
}
