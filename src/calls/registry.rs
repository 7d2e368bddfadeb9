//! Single-active-call arbitration.

use super::CallId;
use super::error::BusyError;
use super::state::CallState;
use std::sync::Mutex;
use tokio::sync::watch;

struct RegisteredCall {
    call_id: CallId,
    state_rx: watch::Receiver<CallState>,
}

/// Global slot holding at most one live call. Check-and-set is atomic under
/// the lock, so two racing starts cannot both win.
#[derive(Default)]
pub struct CallRegistry {
    active: Mutex<Option<RegisteredCall>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot for `call_id`. Fails without side effects when an
    /// occupant is still live; a lingering terminal occupant is evicted.
    pub fn try_start(
        &self,
        call_id: CallId,
        state_rx: watch::Receiver<CallState>,
    ) -> Result<(), BusyError> {
        let mut active = self.active.lock().unwrap();
        if let Some(current) = active.as_ref()
            && !current.state_rx.borrow().is_ended()
        {
            return Err(BusyError);
        }
        *active = Some(RegisteredCall { call_id, state_rx });
        Ok(())
    }

    /// Releases the slot, but only if `call_id` still owns it. A stale
    /// release from an already-replaced call must not evict the newer one.
    pub fn clear(&self, call_id: &CallId) {
        let mut active = self.active.lock().unwrap();
        if active.as_ref().is_some_and(|c| &c.call_id == call_id) {
            *active = None;
        }
    }

    /// Renames the occupant once the server assigns the real call id.
    pub fn rebind(&self, old_id: &CallId, new_id: CallId) {
        let mut active = self.active.lock().unwrap();
        if let Some(current) = active.as_mut()
            && &current.call_id == old_id
        {
            current.call_id = new_id;
        }
    }

    pub fn active_call_id(&self) -> Option<CallId> {
        let active = self.active.lock().unwrap();
        active
            .as_ref()
            .filter(|c| !c.state_rx.borrow().is_ended())
            .map(|c| c.call_id.clone())
    }
}
