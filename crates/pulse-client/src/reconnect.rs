//! Reconnect callbacks.
//!
//! Views register a zero-argument callback to re-fetch whatever state they
//! may have missed while the channel was down. Callbacks run once per
//! recovery, never on the first connection.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub(crate) type Callback = Arc<dyn Fn() + Send + Sync>;

/// Set of registered callbacks keyed by registration id.
#[derive(Default)]
pub(crate) struct ReconnectCallbacks {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Callback>>,
}

impl ReconnectCallbacks {
    pub(crate) fn register(&self, callback: Callback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, callback);
        id
    }

    pub(crate) fn unregister(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Invoke every callback once. Returns how many panicked.
    ///
    /// The set is snapshotted first so callbacks may register, unregister,
    /// join or leave without deadlocking. A panic is caught and logged and
    /// the remaining callbacks still run.
    pub(crate) fn fire(&self) -> usize {
        let snapshot: Vec<(u64, Callback)> = self
            .entries
            .lock()
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        let mut failures = 0;
        for (id, callback) in snapshot {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                failures += 1;
                tracing::error!(
                    callback = id,
                    panic = panic_message(&*payload),
                    "Reconnect callback panicked"
                );
            }
        }
        failures
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle returned by
/// [`ConnectionManager::on_reconnect`](crate::manager::ConnectionManager::on_reconnect).
///
/// The callback stays registered for as long as this handle lives. Call
/// [`unregister`](Self::unregister) or drop it to remove the callback.
#[must_use = "dropping the registration unregisters the callback immediately"]
pub struct ReconnectRegistration {
    callbacks: Weak<ReconnectCallbacks>,
    id: u64,
}

impl ReconnectRegistration {
    pub(crate) fn new(callbacks: &Arc<ReconnectCallbacks>, id: u64) -> Self {
        Self {
            callbacks: Arc::downgrade(callbacks),
            id,
        }
    }

    /// Remove the callback now.
    pub fn unregister(self) {
        // Drop does the work.
    }
}

impl Drop for ReconnectRegistration {
    fn drop(&mut self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.unregister(self.id);
        }
    }
}

impl std::fmt::Debug for ReconnectRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectRegistration")
            .field("id", &self.id)
            .finish()
    }
}
