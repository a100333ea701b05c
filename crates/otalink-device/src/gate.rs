//! Single-session gate.
//!
//! At most one update session runs device-wide. The gate makes that an
//! explicit claim rather than an accident of execution order: `try_claim`
//! either returns a permit or fails, and dropping the permit re-opens the
//! gate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Default)]
pub struct SessionGate {
    busy: Arc<AtomicBool>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate. Fails while another session holds it.
    pub fn try_claim(&self) -> Option<SessionPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionPermit {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// RAII proof that the holder owns the only active session.
pub struct SessionPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
