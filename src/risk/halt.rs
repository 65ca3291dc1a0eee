//! Execution halt switch.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Latching switch that stops new execution attempts.
///
/// Once tripped it stays tripped until explicitly cleared.
#[derive(Debug, Default)]
pub struct HaltSwitch {
    halted: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl HaltSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the switch. The first reason is kept.
    pub fn trip(&self, reason: impl Into<String>) {
        let mut current = self.reason.lock();
        if current.is_none() {
            let reason = reason.into();
            error!(%reason, "Execution halted");
            *current = Some(reason);
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn clear(&self) {
        let mut current = self.reason.lock();
        if current.take().is_some() {
            info!("Execution halt cleared");
        }
        self.halted.store(false, Ordering::SeqCst);
    }
}
