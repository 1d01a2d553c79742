//! The connection manager.
//!
//! One [`ConnectionManager`] per tab, constructed by the composition root and
//! handed (cloned) to every view that needs live data. Views only ever call
//! [`join`](ConnectionManager::join), [`leave`](ConnectionManager::leave),
//! [`on_reconnect`](ConnectionManager::on_reconnect) and read the event
//! stream; the raw connection stays private to the session task.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::connector::Connector;
use crate::credential::{CredentialStore, CredentialWatcher};
use crate::net_client::Connection;
use crate::reconnect::{ReconnectCallbacks, ReconnectRegistration};
use crate::session;
use crate::sync::{ConnectionState, Phase};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An application event pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    pub name: String,
    /// Present for room-scoped events, absent for user-wide ones.
    pub room_id: Option<String>,
    pub data: Value,
}

impl RealtimeEvent {
    /// Decode the payload into a domain type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// A filtered view of the event stream.
///
/// With no filters every event is delivered. [`named`](Self::named) may be
/// chained to accept several event names.
pub struct EventSubscription {
    rx: broadcast::Receiver<RealtimeEvent>,
    names: HashSet<String>,
    room_id: Option<String>,
}

impl EventSubscription {
    /// Only deliver events called `name`.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.names.insert(name.into());
        self
    }

    /// Only deliver events scoped to `room_id`.
    pub fn in_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn matches(&self, event: &RealtimeEvent) -> bool {
        if !self.names.is_empty() && !self.names.contains(&event.name) {
            return false;
        }
        match &self.room_id {
            Some(room) => event.room_id.as_deref() == Some(room.as_str()),
            None => true,
        }
    }

    /// Next matching event. `None` once the manager is gone.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Guarded {
    conn: ConnectionState,
    /// Bumped on every start/stop. Transitions from an older session task
    /// are ignored.
    generation: u64,
}

struct ActiveSession {
    generation: u64,
    driver: JoinHandle<()>,
    watcher: CredentialWatcher,
}

pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    state: Mutex<Guarded>,
    callbacks: Arc<ReconnectCallbacks>,
    connected: watch::Sender<bool>,
    phase: watch::Sender<Phase>,
    events: broadcast::Sender<RealtimeEvent>,
    session: Mutex<Option<ActiveSession>>,
}

impl Shared {
    /// Apply a lifecycle transition on behalf of session `generation`.
    /// Returns `false` if that session has been superseded.
    pub(crate) fn update(&self, generation: u64, apply: impl FnOnce(&mut ConnectionState)) -> bool {
        let mut guard = self.state.lock();
        if guard.generation != generation {
            return false;
        }
        apply(&mut guard.conn);
        self.publish(guard.conn.phase());
        true
    }

    /// Enter `Connected` over `conn`, replay membership and, on a recovery,
    /// run the reconnect callbacks.
    pub(crate) fn enter_connected(&self, generation: u64, conn: &Connection) -> bool {
        let recovery = {
            let mut guard = self.state.lock();
            if guard.generation != generation {
                return false;
            }
            let recovery = guard.conn.connected(conn.sid.clone(), conn.sender());
            self.publish(Phase::Connected);
            recovery
        };

        tracing::info!(
            sid = %conn.sid,
            rooms = recovery.replayed.len(),
            recovered = recovery.recovered,
            "Connected"
        );
        if recovery.recovered {
            let failed = self.callbacks.fire();
            tracing::info!(
                callbacks = self.callbacks.len(),
                failed,
                "Reconnect callbacks run"
            );
        }
        true
    }

    pub(crate) fn dispatch(&self, event: RealtimeEvent) {
        tracing::trace!(event = %event.name, room = ?event.room_id, "Event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self, phase: Phase) {
        self.phase.send_replace(phase);
        self.connected.send_if_modified(|current| {
            if *current == phase.is_connected() {
                return false;
            }
            *current = phase.is_connected();
            true
        });
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Handle to the tab's realtime connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let (connected, _) = watch::channel(false);
        let (phase, _) = watch::channel(Phase::NoCredential);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(Guarded {
                    conn: ConnectionState::new(),
                    generation: 0,
                }),
                callbacks: Arc::new(ReconnectCallbacks::default()),
                connected,
                phase,
                events,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------
    // Consumer surface
    // ------------------------------------------------------------------

    /// Ask for delivery of `room_id`. Idempotent; recorded even while
    /// offline and replayed on every (re)connect.
    pub fn join(&self, room_id: &str) {
        let sent = self.shared.state.lock().conn.join(room_id);
        tracing::debug!(room = room_id, sent, "Join");
    }

    /// Stop delivery of `room_id`. Unknown rooms are a no-op.
    pub fn leave(&self, room_id: &str) {
        let sent = self.shared.state.lock().conn.leave(room_id);
        tracing::debug!(room = room_id, sent, "Leave");
    }

    /// Run `callback` once after every recovery from a dropped connection.
    ///
    /// Never called for the first connection of a session. The callback runs
    /// on the session task and should only kick off work, not wait for it.
    pub fn on_reconnect<F>(&self, callback: F) -> ReconnectRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.shared.callbacks.register(Arc::new(callback));
        ReconnectRegistration::new(&self.shared.callbacks, id)
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.shared.phase.subscribe()
    }

    /// Current membership, sorted.
    pub fn rooms(&self) -> Vec<String> {
        self.shared.state.lock().conn.rooms().snapshot()
    }

    /// Server-assigned identity of the live connection.
    pub fn sid(&self) -> Option<String> {
        self.shared.state.lock().conn.sid().map(str::to_string)
    }

    /// Resolve once the connection is (or becomes) live.
    pub async fn connected(&self) {
        let mut rx = self.shared.connected.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|connected| *connected).await;
    }

    /// Subscribe to pushed events. Narrow with
    /// [`EventSubscription::named`] / [`EventSubscription::in_room`].
    pub fn events(&self) -> EventSubscription {
        EventSubscription {
            rx: self.shared.events.subscribe(),
            names: HashSet::new(),
            room_id: None,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start watching `store` and keep one connection open through
    /// `connector` for as long as a credential is present.
    ///
    /// Any previous session is stopped first. Must be called from within a
    /// tokio runtime.
    pub fn start<C, S>(&self, connector: C, store: Arc<S>) -> SessionHandle
    where
        C: Connector,
        S: CredentialStore,
    {
        self.stop();

        let generation = {
            let mut guard = self.shared.state.lock();
            guard.generation += 1;
            guard.generation
        };
        let config = &self.shared.config;
        let watcher = CredentialWatcher::spawn(
            store,
            &config.credential_key,
            config.credential_poll_interval(),
        );
        let credentials = watcher.subscribe();
        let driver = tokio::spawn(session::drive(
            Arc::clone(&self.shared),
            generation,
            connector,
            credentials,
        ));
        *self.shared.session.lock() = Some(ActiveSession {
            generation,
            driver,
            watcher,
        });
        tracing::info!(url = %config.url, generation, "Session started");

        SessionHandle {
            manager: self.clone(),
            generation,
        }
    }

    /// Close the connection, stop the credential watcher and enter
    /// [`Phase::Closed`]. Room membership and callbacks are kept.
    pub fn stop(&self) {
        let active = self.shared.session.lock().take();
        let link = {
            let mut guard = self.shared.state.lock();
            guard.generation += 1;
            let link = guard.conn.closed();
            self.shared.publish(Phase::Closed);
            link
        };
        if let Some(link) = link {
            link.close();
        }
        if let Some(active) = active {
            active.driver.abort();
            active.watcher.stop();
            tracing::info!(generation = active.generation, "Session stopped");
        }
    }

    fn stop_generation(&self, generation: u64) {
        let current = self
            .shared
            .session
            .lock()
            .as_ref()
            .map(|active| active.generation);
        if current == Some(generation) {
            self.stop();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("phase", &self.phase())
            .field("rooms", &self.rooms())
            .finish()
    }
}

/// Keeps a session running. Dropping it stops the session it belongs to;
/// a handle from an earlier `start` leaves a newer session alone.
#[must_use = "dropping the handle stops the session"]
pub struct SessionHandle {
    manager: ConnectionManager,
    generation: u64,
}

impl SessionHandle {
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn stop(self) {
        // Drop does the work.
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.manager.stop_generation(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn event(name: &str, room_id: Option<&str>) -> RealtimeEvent {
        RealtimeEvent {
            name: name.to_string(),
            room_id: room_id.map(str::to_string),
            data: json!({ "id": 7 }),
        }
    }

    #[test]
    fn membership_is_tracked_without_a_session() {
        let manager = ConnectionManager::new(ClientConfig::default());
        manager.join("dev1");
        manager.join("dev1");
        manager.join("dev2");
        manager.leave("dev2");
        manager.leave("ghost");
        assert_eq!(manager.rooms(), vec!["dev1"]);
        assert!(!manager.is_connected());
        assert_eq!(manager.phase(), Phase::NoCredential);
    }

    #[test]
    fn stop_without_a_session_closes() {
        let manager = ConnectionManager::new(ClientConfig::default());
        manager.stop();
        assert_eq!(manager.phase(), Phase::Closed);
    }

    #[test]
    fn subscription_filters_by_name_and_room() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let any = manager.events();
        let named = manager.events().named("message.created").named("device.updated");
        let scoped = manager.events().named("presence").in_room("dev1");

        let created = event("message.created", None);
        let presence_dev1 = event("presence", Some("dev1"));
        let presence_dev2 = event("presence", Some("dev2"));

        assert!(any.matches(&created));
        assert!(named.matches(&created));
        assert!(!named.matches(&presence_dev1));
        assert!(scoped.matches(&presence_dev1));
        assert!(!scoped.matches(&presence_dev2));
        assert!(!scoped.matches(&created));
    }

    #[tokio::test]
    async fn recv_skips_non_matching_events() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let mut sub = manager.events().in_room("dev2");
        manager.shared.dispatch(event("presence", Some("dev1")));
        manager.shared.dispatch(event("presence", Some("dev2")));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.room_id.as_deref(), Some("dev2"));
    }

    #[tokio::test]
    async fn lagged_subscriber_keeps_receiving() {
        let config = ClientConfig {
            event_buffer: 2,
            ..ClientConfig::default()
        };
        let manager = ConnectionManager::new(config);
        let mut sub = manager.events();
        for i in 0..5 {
            manager.shared.dispatch(event(&format!("e{i}"), None));
        }
        let got = sub.recv().await.unwrap();
        assert_eq!(got.name, "e3");
    }

    #[test]
    fn payload_decodes_into_domain_types() {
        #[derive(Deserialize)]
        struct Item {
            id: u32,
        }
        let item: Item = event("item.created", None).payload().unwrap();
        assert_eq!(item.id, 7);
    }
}
