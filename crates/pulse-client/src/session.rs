//! Session binder.
//!
//! One task per started session. It follows the credential channel and keeps
//! at most one connection open for the current value: a change closes the
//! old connection before the new one is attempted, a cleared credential
//! parks the task in `NoCredential`.

use std::sync::Arc;

use pulse_core::protocol::ServerFrame;
use tokio::sync::watch;

use crate::connector::Connector;
use crate::manager::{RealtimeEvent, Shared};
use crate::net_client::{Connection, NetEvent};
use crate::sync::ConnectionState;

/// Why [`run_session`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The credential value changed.
    CredentialChanged,
    /// Retry ceiling reached or credential refused.
    GaveUp,
    /// The session was superseded or its credential source went away.
    Shutdown,
}

enum Interrupt {
    Dropped(String),
    Credential(SessionEnd),
}

fn credential_end(changed: Result<(), watch::error::RecvError>) -> SessionEnd {
    match changed {
        Ok(()) => SessionEnd::CredentialChanged,
        Err(_) => SessionEnd::Shutdown,
    }
}

pub(crate) async fn drive<C: Connector>(
    shared: Arc<Shared>,
    generation: u64,
    connector: C,
    mut credentials: watch::Receiver<Option<String>>,
) {
    loop {
        let current = credentials.borrow_and_update().clone();
        match current {
            None => {
                if !shared.update(generation, ConnectionState::no_credential) {
                    return;
                }
                tracing::info!("No credential, connection idle");
            }
            Some(credential) => {
                let end =
                    run_session(&shared, generation, &connector, &credential, &mut credentials)
                        .await;
                match end {
                    SessionEnd::CredentialChanged => {
                        tracing::info!("Credential changed, reconnecting");
                        if !shared.update(generation, ConnectionState::credential_changed) {
                            return;
                        }
                        continue;
                    }
                    SessionEnd::GaveUp => {
                        if !shared.update(generation, ConnectionState::failed) {
                            return;
                        }
                        tracing::warn!("Giving up until the credential changes");
                    }
                    SessionEnd::Shutdown => return,
                }
            }
        }

        // NoCredential or Failed: only a new credential value moves on.
        if credentials.changed().await.is_err() {
            return;
        }
        if !shared.update(generation, ConnectionState::credential_changed) {
            return;
        }
    }
}

async fn run_session<C: Connector>(
    shared: &Shared,
    generation: u64,
    connector: &C,
    credential: &str,
    credentials: &mut watch::Receiver<Option<String>>,
) -> SessionEnd {
    let config = &shared.config;
    let mut failures: u32 = 0;

    loop {
        if !shared.update(generation, ConnectionState::connecting) {
            return SessionEnd::Shutdown;
        }
        tracing::debug!(url = %config.url, failures, "Connecting");

        let attempt = tokio::select! {
            result = connector.connect(&config.url, credential, config.connect_timeout()) => result,
            changed = credentials.changed() => return credential_end(changed),
        };

        match attempt {
            Ok(mut conn) => {
                failures = 0;
                if !shared.enter_connected(generation, &conn) {
                    conn.close();
                    return SessionEnd::Shutdown;
                }
                let interrupt = tokio::select! {
                    reason = pump(shared, &mut conn) => Interrupt::Dropped(reason),
                    changed = credentials.changed() => Interrupt::Credential(credential_end(changed)),
                };
                match interrupt {
                    Interrupt::Dropped(reason) => {
                        tracing::warn!(sid = %conn.sid, reason = %reason, "Connection lost");
                        if !shared.update(generation, ConnectionState::disconnected) {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Interrupt::Credential(end) => {
                        conn.close();
                        return end;
                    }
                }
            }
            Err(err) if err.is_unauthorized() => {
                tracing::warn!(error = %err, "Credential refused");
                return SessionEnd::GaveUp;
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(
                    error = %err,
                    attempt = failures,
                    max = config.reconnect_attempts,
                    "Connection attempt failed"
                );
                if failures >= config.reconnect_attempts {
                    return SessionEnd::GaveUp;
                }
                if !shared.update(generation, ConnectionState::disconnected) {
                    return SessionEnd::Shutdown;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay()) => {}
            changed = credentials.changed() => return credential_end(changed),
        }
    }
}

/// Forward events until the connection drops. Returns the reason.
async fn pump(shared: &Shared, conn: &mut Connection) -> String {
    loop {
        match conn.recv().await {
            Some(NetEvent::Frame(ServerFrame::Event {
                event,
                room_id,
                data,
            })) => shared.dispatch(RealtimeEvent {
                name: event,
                room_id,
                data,
            }),
            Some(NetEvent::Frame(ServerFrame::Error { message })) => {
                tracing::warn!(message = %message, "Server reported an error");
            }
            Some(NetEvent::Frame(ServerFrame::Pong)) => tracing::trace!("Pong"),
            Some(NetEvent::Frame(ServerFrame::Welcome { sid })) => {
                tracing::debug!(sid = %sid, "Unexpected second welcome");
            }
            Some(NetEvent::Unknown(raw)) => {
                tracing::debug!(raw = %raw, "Unrecognized frame");
            }
            Some(NetEvent::Disconnected) => return "closed by server".to_string(),
            Some(NetEvent::Error(e)) => return e,
            None => return "reader stopped".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pulse_core::protocol::ClientFrame;
    use pulse_core::transport::TransportError;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::ClientConfig;
    use crate::connector::{MemoryConnector, MemoryLink};
    use crate::credential::{CredentialStore, MemoryCredentialStore, StorageChange};
    use crate::manager::ConnectionManager;
    use crate::reconnect::ReconnectRegistration;
    use crate::sync::Phase;

    const KEY: &str = "token";

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ClientConfig::default())
    }

    fn counter(manager: &ConnectionManager, hits: &Arc<AtomicUsize>) -> ReconnectRegistration {
        let hits = Arc::clone(hits);
        manager.on_reconnect(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn wait_phase(manager: &ConnectionManager, phase: Phase) {
        let mut rx = manager.watch_phase();
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|p| *p == phase))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {phase}"))
            .unwrap();
    }

    async fn next_link(links: &mut mpsc::UnboundedReceiver<MemoryLink>) -> MemoryLink {
        tokio::time::timeout(Duration::from_secs(60), links.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    fn remote(store: &MemoryCredentialStore, value: Option<&str>) {
        store.apply_remote(StorageChange {
            key: KEY.to_string(),
            value: value.map(str::to_string),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_replays_rooms_and_runs_callbacks_once() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let hits = Arc::new(AtomicUsize::new(0));
        let _registration = counter(&manager, &hits);

        let _session = manager.start(connector.clone(), store);
        let mut first = next_link(&mut links).await;
        assert_eq!(first.credential, "tokA");
        wait_phase(&manager, Phase::Connected).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        manager.join("dev1");
        assert_eq!(first.peer.recv().await, Some(ClientFrame::join("dev1")));

        first.peer.close();
        wait_phase(&manager, Phase::Disconnected).await;
        assert!(!manager.is_connected());

        let mut second = next_link(&mut links).await;
        assert_eq!(second.peer.recv().await, Some(ClientFrame::join("dev1")));
        assert!(manager.is_connected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.sid().as_deref(), Some(second.sid.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_join_sends_one_request() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let _session = manager.start(connector, store);
        let mut link = next_link(&mut links).await;
        wait_phase(&manager, Phase::Connected).await;

        manager.join("dev1");
        manager.join("dev1");
        manager.join("dev2");
        assert_eq!(link.peer.recv().await, Some(ClientFrame::join("dev1")));
        assert_eq!(link.peer.recv().await, Some(ClientFrame::join("dev2")));
        assert_eq!(manager.rooms(), vec!["dev1", "dev2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn left_room_is_not_replayed() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        manager.join("dev2");
        let _session = manager.start(connector, store);
        let mut first = next_link(&mut links).await;
        assert_eq!(first.peer.recv().await, Some(ClientFrame::join("dev2")));

        manager.join("dev1");
        manager.leave("dev1");
        assert_eq!(first.peer.recv().await, Some(ClientFrame::join("dev1")));
        assert_eq!(first.peer.recv().await, Some(ClientFrame::leave("dev1")));
        first.peer.close();

        let mut second = next_link(&mut links).await;
        assert_eq!(second.peer.recv().await, Some(ClientFrame::join("dev2")));
        wait_phase(&manager, Phase::Connected).await;
        assert_eq!(second.peer.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_closes_and_stops_reconnecting() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        manager.join("dev1");
        let _session = manager.start(connector.clone(), Arc::clone(&store));
        let mut link = next_link(&mut links).await;
        assert_eq!(link.peer.recv().await, Some(ClientFrame::join("dev1")));

        remote(&store, None);
        assert_eq!(link.peer.recv().await, None);
        wait_phase(&manager, Phase::NoCredential).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
        assert!(links.try_recv().is_err());
        assert_eq!(manager.rooms(), vec!["dev1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_tab_login_is_picked_up_by_the_poll() {
        let store = Arc::new(MemoryCredentialStore::new());
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let _session = manager.start(connector, Arc::clone(&store));
        wait_phase(&manager, Phase::NoCredential).await;

        store.set(KEY, "tokA");
        let link = next_link(&mut links).await;
        assert_eq!(link.credential, "tokA");
        wait_phase(&manager, Phase::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_from_config_still_connects() {
        let config: ClientConfig = serde_json::from_str(r#"{"credentialPollMs":0}"#).unwrap();
        let store = Arc::new(MemoryCredentialStore::new());
        let (connector, mut links) = MemoryConnector::new();
        let manager = ConnectionManager::new(config);
        let _session = manager.start(connector, Arc::clone(&store));
        wait_phase(&manager, Phase::NoCredential).await;

        store.set(KEY, "tokA");
        let link = next_link(&mut links).await;
        assert_eq!(link.credential, "tokA");
        wait_phase(&manager, Phase::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn credential_change_swaps_exactly_one_connection() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let hits = Arc::new(AtomicUsize::new(0));
        let _registration = counter(&manager, &hits);
        let _session = manager.start(connector.clone(), Arc::clone(&store));
        let mut old = next_link(&mut links).await;
        wait_phase(&manager, Phase::Connected).await;

        store.set(KEY, "tokB");
        let new = next_link(&mut links).await;
        assert_eq!(new.credential, "tokB");
        assert!(old.peer.is_client_closed() || old.peer.recv().await.is_none());
        wait_phase(&manager, Phase::Connected).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.attempts(), 2);
        assert!(links.try_recv().is_err());
        // A credential switch is not a recovery.
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_outage_discards_recovery() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let hits = Arc::new(AtomicUsize::new(0));
        let _registration = counter(&manager, &hits);
        let _session = manager.start(connector, Arc::clone(&store));
        let mut link = next_link(&mut links).await;
        wait_phase(&manager, Phase::Connected).await;

        link.peer.close();
        wait_phase(&manager, Phase::Disconnected).await;
        remote(&store, None);
        wait_phase(&manager, Phase::NoCredential).await;
        remote(&store, Some("tokB"));

        let _link = next_link(&mut links).await;
        wait_phase(&manager, Phase::Connected).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_follow_registration_at_recovery_time() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let before = Arc::new(AtomicUsize::new(0));
        let during = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let _before = counter(&manager, &before);
        let gone = counter(&manager, &removed);

        let _session = manager.start(connector, store);
        let mut link = next_link(&mut links).await;
        wait_phase(&manager, Phase::Connected).await;
        link.peer.close();
        wait_phase(&manager, Phase::Disconnected).await;

        let _during = counter(&manager, &during);
        gone.unregister();

        let _link = next_link(&mut links).await;
        wait_phase(&manager, Phase::Connected).await;
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(during.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_is_isolated() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let hits = Arc::new(AtomicUsize::new(0));
        let _panics = manager.on_reconnect(|| panic!("refetch failed"));
        let _counts = counter(&manager, &hits);

        let _session = manager.start(connector, store);
        let mut link = next_link(&mut links).await;
        manager.join("dev1");
        link.peer.close();

        let mut link = next_link(&mut links).await;
        assert_eq!(link.peer.recv().await, Some(ClientFrame::join("dev1")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.phase(), Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_fails_until_the_credential_changes() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        for _ in 0..5 {
            connector.fail_next(TransportError::Io("connection refused".to_string()));
        }
        let manager = manager();
        let _session = manager.start(connector.clone(), Arc::clone(&store));

        wait_phase(&manager, Phase::Failed).await;
        assert_eq!(connector.attempts(), 5);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 5);

        store.set(KEY, "tokB");
        let link = next_link(&mut links).await;
        assert_eq!(link.credential, "tokB");
        wait_phase(&manager, Phase::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        for _ in 0..4 {
            connector.fail_next(TransportError::Timeout);
        }
        let manager = manager();
        let _session = manager.start(connector.clone(), store);
        let mut link = next_link(&mut links).await;
        assert_eq!(connector.attempts(), 5);

        for _ in 0..4 {
            connector.fail_next(TransportError::Timeout);
        }
        link.peer.close();
        let _link = next_link(&mut links).await;
        assert_eq!(connector.attempts(), 10);
        wait_phase(&manager, Phase::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn refused_credential_fails_immediately() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "stale"));
        let (connector, mut links) = MemoryConnector::new();
        connector.reject("stale");
        let manager = manager();
        manager.join("dev1");
        let _session = manager.start(connector.clone(), Arc::clone(&store));

        wait_phase(&manager, Phase::Failed).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.rooms(), vec!["dev1"]);

        remote(&store, Some("fresh"));
        let mut link = next_link(&mut links).await;
        assert_eq!(link.peer.recv().await, Some(ClientFrame::join("dev1")));
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_filtered_subscribers() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let mut presence = manager.events().named("presence").in_room("dev1");
        let mut all = manager.events();
        let _session = manager.start(connector, store);
        let link = next_link(&mut links).await;

        link.peer.send(&ServerFrame::Event {
            event: "message.created".to_string(),
            room_id: None,
            data: json!({ "id": 1 }),
        });
        link.peer.send(&ServerFrame::Event {
            event: "presence".to_string(),
            room_id: Some("dev1".to_string()),
            data: json!({ "roomId": "dev1", "status": "connected" }),
        });

        assert_eq!(all.recv().await.unwrap().name, "message.created");
        let got = presence.recv().await.unwrap();
        assert_eq!(got.room_id.as_deref(), Some("dev1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_and_goes_quiet() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let session = manager.start(connector.clone(), Arc::clone(&store));
        let mut link = next_link(&mut links).await;
        wait_phase(&manager, Phase::Connected).await;

        session.stop();
        assert_eq!(manager.phase(), Phase::Closed);
        assert!(!manager.is_connected());
        assert_eq!(link.peer.recv().await, None);

        store.set(KEY, "tokB");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.phase(), Phase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_replaces_the_previous_session() {
        let store = Arc::new(MemoryCredentialStore::with_value(KEY, "tokA"));
        let (connector, mut links) = MemoryConnector::new();
        let manager = manager();
        let first_session = manager.start(connector.clone(), Arc::clone(&store));
        let mut first = next_link(&mut links).await;

        let _second_session = manager.start(connector.clone(), Arc::clone(&store));
        assert_eq!(first.peer.recv().await, None);
        let _second = next_link(&mut links).await;
        wait_phase(&manager, Phase::Connected).await;

        // The stale handle must not stop the new session.
        drop(first_session);
        assert_eq!(manager.phase(), Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_resolves_once_live() {
        let store = Arc::new(MemoryCredentialStore::new());
        let (connector, _links) = MemoryConnector::new();
        let manager = manager();
        let _session = manager.start(connector, Arc::clone(&store));

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connected().await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!waiter.is_finished());

        remote(&store, Some("tokA"));
        tokio::time::timeout(Duration::from_secs(10), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(manager.is_connected());
    }
}
