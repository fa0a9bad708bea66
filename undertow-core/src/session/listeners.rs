//! Listener registry.
//!
//! Front ends register a callback and receive an immutable snapshot of the
//! visible transfers after every reconciliation tick and state-changing
//! command. Listeners run on the notifying task and must not block.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::TransferRecord;

/// Callback invoked with the current snapshot.
pub type TransferListener = Arc<dyn Fn(&[TransferRecord]) + Send + Sync>;

/// Identifies a registered listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<(ListenerId, TransferListener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        listener: impl Fn(&[TransferRecord]) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns false when `id` was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Calls every listener once with `snapshot`.
    ///
    /// A panicking listener is logged and skipped; the others still run.
    /// Returns the number of listeners that failed.
    pub fn notify(&self, snapshot: &[TransferRecord]) -> usize {
        let listeners: Vec<(ListenerId, TransferListener)> = self.listeners.read().clone();

        let mut failures = 0;
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                warn!("Listener {:?} panicked during notification", id);
                failures += 1;
            }
        }
        failures
    }
}
