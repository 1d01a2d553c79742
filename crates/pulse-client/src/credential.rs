//! Credential sources and change detection.
//!
//! The bearer credential lives in a process-wide key-value store that the
//! login flow writes and this crate only reads. Two signals reveal changes:
//!
//! - a short-interval poll, which catches writes made by this same tab (the
//!   platform never notifies a tab about its own writes), and
//! - the store's cross-tab change notifications.
//!
//! [`CredentialWatcher`] merges both into one `watch` channel so the session
//! only ever reacts to "the credential is now X".

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Capacity of a store's change-notification channel.
const CHANGE_BUFFER: usize = 64;

/// Floor for the poll period; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A write observed in another tab (or process).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// New value; `None` when the key was removed.
    pub value: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential store is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Abstraction over the persistent key-value store holding the credential.
///
/// `set`/`remove` are same-tab writes and do not produce notifications on
/// this handle; [`subscribe`](CredentialStore::subscribe) only reports writes
/// made elsewhere.
pub trait CredentialStore: Send + Sync + 'static {
    /// Whether [`get`](CredentialStore::get) does blocking I/O. The watcher
    /// moves such reads onto the blocking pool.
    const BLOCKING: bool = false;

    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    /// Subscribe to cross-tab change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory store. [`apply_remote`](Self::apply_remote) stands in for a
/// write made by another tab.
pub struct MemoryCredentialStore {
    values: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            values: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Create a store already holding `value` under `key`.
    pub fn with_value(key: &str, value: &str) -> Self {
        let store = Self::new();
        store.set(key, value);
        store
    }

    /// Apply a write made by another tab and notify subscribers.
    pub fn apply_remote(&self, change: StorageChange) {
        {
            let mut values = self.values.write();
            match &change.value {
                Some(value) => values.insert(change.key.clone(), value.clone()),
                None => values.remove(&change.key),
            };
        }
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// A JSON object on disk (`{ "token": "..." }`), the native counterpart of the
/// browser's persistent storage.
///
/// Writes by other processes have no notification channel and are picked up
/// by the watcher's poll.
pub struct FileCredentialStore {
    path: PathBuf,
    // Never fires; held so subscribers pend instead of seeing `Closed`.
    changes: broadcast::Sender<StorageChange>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(1);
        Self {
            path: path.into(),
            changes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(HashMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(values)?;
        // Write-then-rename so a concurrent reader never sees a torn file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> Result<(), StoreError> {
        let mut values = self.load()?;
        f(&mut values);
        self.save(&values)
    }
}

impl CredentialStore for FileCredentialStore {
    const BLOCKING: bool = true;

    fn get(&self, key: &str) -> Option<String> {
        match self.load() {
            Ok(mut values) => values.remove(key),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Could not read credential store");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(e) = self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        }) {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not write credential store");
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.update(|values| {
            values.remove(key);
        }) {
            tracing::warn!(path = %self.path.display(), error = %e, "Could not write credential store");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Normalize a stored value: empty (or whitespace-only) means "no credential".
pub fn normalize(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Background task merging the poll and cross-tab signals into one channel.
///
/// Dropping the watcher (or calling [`stop`](Self::stop)) drops the loop
/// state on the spot: the poll timer and the notification subscription are
/// gone before `stop` returns.
pub struct CredentialWatcher {
    rx: watch::Receiver<Option<String>>,
    state: StopSlot,
    task: JoinHandle<()>,
}

impl CredentialWatcher {
    /// Read the current credential and start watching `key`.
    ///
    /// A zero `poll_interval` is raised to 1 ms. Must be called from within
    /// a tokio runtime.
    pub fn spawn<S: CredentialStore>(store: Arc<S>, key: &str, poll_interval: Duration) -> Self {
        let key = key.to_string();
        let (tx, rx) = watch::channel(normalize(store.get(&key)));
        // Subscribe before the task starts so no notification is missed.
        let changes = store.subscribe();
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let (task, state) = Stoppable::new(watch_loop(store, key, poll_interval, changes, tx));
        let task = tokio::spawn(task);
        Self { rx, state, task }
    }

    /// A receiver that is notified whenever the credential value changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.rx.clone()
    }

    pub fn current(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    pub fn stop(&self) {
        self.state.lock().take();
        self.task.abort();
    }
}

impl Drop for CredentialWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

type StopSlot = Arc<Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>>;

/// A future whose state the spawner can drop without waiting for the
/// runtime to poll the aborted task. The lock is held only inside `poll`.
struct Stoppable {
    state: StopSlot,
}

impl Stoppable {
    fn new(fut: impl Future<Output = ()> + Send + 'static) -> (Self, StopSlot) {
        let state: StopSlot = Arc::new(Mutex::new(Some(Box::pin(fut))));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl Future for Stoppable {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        let Some(fut) = state.as_mut() else {
            return Poll::Ready(());
        };
        let poll = fut.as_mut().poll(cx);
        if poll.is_ready() {
            state.take();
        }
        poll
    }
}

/// Read `key`, off the runtime thread when the store blocks.
async fn read<S: CredentialStore>(store: &Arc<S>, key: &str) -> Option<Option<String>> {
    if !S::BLOCKING {
        return Some(normalize(store.get(key)));
    }
    let store = Arc::clone(store);
    let key = key.to_string();
    match tokio::task::spawn_blocking(move || store.get(&key)).await {
        Ok(value) => Some(normalize(value)),
        Err(e) => {
            tracing::warn!(error = %e, "Credential read failed");
            None
        }
    }
}

async fn watch_loop<S: CredentialStore>(
    store: Arc<S>,
    key: String,
    poll_interval: Duration,
    changes: broadcast::Receiver<StorageChange>,
    tx: watch::Sender<Option<String>>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut changes = Some(changes);

    loop {
        let observed = tokio::select! {
            _ = ticker.tick() => read(&store, &key).await,
            change = next_change(&mut changes) => match change {
                Some(change) if change.key == key => Some(normalize(change.value)),
                Some(_) => continue,
                // Lagged or closed: fall back to reading the store.
                None => read(&store, &key).await,
            },
        };
        let Some(observed) = observed else {
            continue;
        };

        let changed = tx.send_if_modified(|current| {
            if *current == observed {
                return false;
            }
            *current = observed;
            true
        });
        if changed {
            tracing::debug!(key = %key, present = tx.borrow().is_some(), "Credential changed");
        }
        if tx.is_closed() {
            break;
        }
    }
}

/// Await the next cross-tab notification.
///
/// Returns `None` after a lag (the caller re-reads the store). Once the
/// source is closed it is dropped and this future pends forever, leaving
/// the poll as the only signal.
async fn next_change(changes: &mut Option<broadcast::Receiver<StorageChange>>) -> Option<StorageChange> {
    let Some(rx) = changes.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(change) => Some(change),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "Credential notifications lagged");
            None
        }
        Err(broadcast::error::RecvError::Closed) => {
            tracing::debug!("Credential notifications closed; polling only");
            *changes = None;
            None
        }
    }
}
