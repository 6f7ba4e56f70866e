//! Dependency injection hook

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::ProcessingEngine;
use crate::workflow::PersistentWorkflow;

/// Wires engine-scoped dependencies into instances before they run
pub trait DependencyInjector: Send + Sync + 'static {
    /// Called once during engine startup
    fn set_engine(&self, _engine: Weak<dyn ProcessingEngine>) {}

    /// Called by the processor pool right before an instance runs
    fn inject(&self, _workflow: &mut PersistentWorkflow) {}
}

/// Injector that only remembers its engine
#[derive(Default)]
pub struct DefaultDependencyInjector {
    engine: RwLock<Option<Weak<dyn ProcessingEngine>>>,
}

impl DefaultDependencyInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The engine, while it is alive
    pub fn engine(&self) -> Option<Arc<dyn ProcessingEngine>> {
        self.engine.read().as_ref().and_then(Weak::upgrade)
    }
}

impl DependencyInjector for DefaultDependencyInjector {
    fn set_engine(&self, engine: Weak<dyn ProcessingEngine>) {
        *self.engine.write() = Some(engine);
    }
}
