use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use crate::app::mirror::supervisor::MirrorSupervisor;
use crate::app::reconcile::TickTrigger;
use crate::app::registry::DeviceRegistry;

/// Shared state managed by the runtime. The registry mutex is the only
/// cross-command lock; the supervisor synchronizes internally.
pub struct AppState {
    pub registry: Arc<Mutex<DeviceRegistry>>,
    pub supervisor: Arc<MirrorSupervisor>,
    /// Present once the reconciliation loop has started.
    pub triggers: Mutex<Option<Sender<TickTrigger>>>,
    pub reconcile_stop: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(registry: Arc<Mutex<DeviceRegistry>>, supervisor: Arc<MirrorSupervisor>) -> Self {
        Self {
            registry,
            supervisor,
            triggers: Mutex::new(None),
            reconcile_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks the reconciliation loop for an out-of-band tick. Returns false
    /// when the loop is not running; the caller falls back to an inline pass.
    pub fn request_tick(&self, trigger: TickTrigger) -> bool {
        match self.triggers.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(sender) => sender.send(trigger).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }
}
