//! Pending callbacks the agent owes the server.
//!
//! The ledger gives at-least-once delivery for death and creation notices:
//! entries are snapshotted into the heartbeat, and removed only after the
//! server accepts the heartbeat that carried them. Entries recorded while a
//! heartbeat is in flight survive the clear and ship with the next one.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::core::protocol::CallbackState;

#[derive(Debug, Default)]
struct LedgerState {
    death: HashSet<String>,
    created: Option<String>,
}

/// Thread-safe holder of unshipped `process_death` / `process_created` acks.
#[derive(Debug, Default)]
pub struct AckLedger {
    inner: Mutex<LedgerState>,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a shell died. Idempotent.
    pub fn record_death(&self, id: &str) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        state.death.insert(id.to_string());
    }

    /// Records the most recent spawn. A second spawn before a successful
    /// heartbeat overwrites the first; the creation slot is single-entry.
    pub fn record_created(&self, id: &str) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        state.created = Some(id.to_string());
    }

    /// Drops a pending death notice for `id`. Used when a shell id reappears
    /// in the registry (pid reuse) so the registry and the death set stay
    /// disjoint.
    pub fn absolve(&self, id: &str) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        state.death.remove(id);
    }

    pub fn contains_death(&self, id: &str) -> bool {
        self.inner
            .lock()
            .map(|state| state.death.contains(id))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .map(|state| state.death.is_empty() && state.created.is_none())
            .unwrap_or(true)
    }

    /// Copies the current ledger into a heartbeat callback. Death ids are
    /// sorted for a stable wire shape.
    pub fn snapshot(&self) -> CallbackState {
        let Ok(state) = self.inner.lock() else {
            return CallbackState::default();
        };
        let mut process_death: Vec<String> = state.death.iter().cloned().collect();
        process_death.sort();
        CallbackState {
            process_death,
            process_created: state.created.clone(),
        }
    }

    /// Removes exactly the entries that a successful heartbeat shipped.
    ///
    /// Deaths recorded after the snapshot stay pending, and the creation slot
    /// is reset only if no newer spawn overwrote it mid-flight.
    pub fn clear_shipped(&self, shipped: &CallbackState) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        for id in &shipped.process_death {
            state.death.remove(id);
        }
        if state.created == shipped.process_created {
            state.created = None;
        }
    }
}
