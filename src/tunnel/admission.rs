//! Single-active-connection admission.
//!
//! The broker supports exactly one agent connection at a time. Admission of a
//! new candidate funnels through [`AdmissionGuard::admit`] so the invariant is
//! enforced in one place: an idle guard always grants; an occupied guard
//! probes the incumbent and only yields the slot when the probe says the
//! transport is dead. A rejected candidate is told `CLIENT_ALREADY_CONNECTED`
//! by the WebSocket layer, which closes it after a short grace delay.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

/// Wire error code sent to a rejected candidate.
pub const CODE_ALREADY_CONNECTED: &str = "CLIENT_ALREADY_CONNECTED";

/// Cheap, non-blocking check of whether a held connection reference still
/// refers to a live transport. For the real agent connection this is "the
/// outbound writer channel has not been closed".
pub trait LivenessProbe {
    fn is_alive(&self) -> bool;
}

/// Outcome of an admission pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Rejected {
        code: &'static str,
        reason: String,
    },
}

/// Two-state machine over the recorded active connection: `Idle` (slot empty)
/// or `Occupied`. All mutations of the slot go through `admit`/`release`;
/// the mutex is held only for the in-memory operation, never across an await.
pub struct AdmissionGuard<C> {
    active: Mutex<Option<Arc<C>>>,
}

impl<C> Default for AdmissionGuard<C> {
    fn default() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }
}

impl<C: LivenessProbe> AdmissionGuard<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `candidate` may become the active connection.
    ///
    /// Occupied + live incumbent rejects the candidate. Occupied + dead
    /// incumbent clears the slot and admits the candidate in the same pass,
    /// so a stale reference can never lock the broker out permanently.
    pub fn admit(&self, candidate: Arc<C>) -> Admission {
        let mut active = self.active.lock().expect("admission lock poisoned");
        if let Some(current) = active.as_ref() {
            if current.is_alive() {
                warn!("rejecting candidate connection, active agent still open");
                return Admission::Rejected {
                    code: CODE_ALREADY_CONNECTED,
                    reason: "Another client is already connected".to_string(),
                };
            }
            debug!("recorded agent connection is dead, yielding slot to candidate");
        }
        *active = Some(candidate);
        Admission::Granted
    }

    /// Clear the slot, but only if `conn` is the recorded connection.
    /// A stale close from an already-superseded connection must not clobber
    /// a newer one. Returns whether the slot was cleared.
    pub fn release(&self, conn: &Arc<C>) -> bool {
        let mut active = self.active.lock().expect("admission lock poisoned");
        match active.as_ref() {
            Some(current) if Arc::ptr_eq(current, conn) => {
                *active = None;
                true
            }
            _ => false,
        }
    }

    /// The recorded active connection, if any. Liveness is not re-checked
    /// here; callers that need a usable connection also check authentication.
    pub fn active(&self) -> Option<Arc<C>> {
        self.active.lock().expect("admission lock poisoned").clone()
    }
}
