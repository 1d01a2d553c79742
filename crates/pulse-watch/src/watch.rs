//! Watch loop: keeps the session running and prints what it sees.

use std::sync::Arc;

use pulse_client::connector::WsConnector;
use pulse_client::credential::CredentialStore;
use pulse_client::presence::{Level, PresenceNotifier};
use pulse_client::{ClientConfig, ConnectionManager};
use pulse_core::protocol::PRESENCE_EVENT;

/// Run until Ctrl-C.
pub async fn run<S: CredentialStore>(config: ClientConfig, rooms: &[String], store: Arc<S>) {
    let manager = ConnectionManager::new(config);
    for room in rooms {
        manager.join(room);
    }
    let _resync = manager.on_reconnect(|| {
        tracing::info!("Recovered from a drop; views would refetch now");
    });

    let notifier = PresenceNotifier::new(manager.config().presence_min_interval());
    let toasts = tokio::spawn(notifier.run(
        manager.events().named(PRESENCE_EVENT),
        |toast| match toast.level {
            Level::Success => tracing::info!(id = %toast.id, "{toast}"),
            Level::Warning => tracing::warn!(id = %toast.id, "{toast}"),
        },
    ));

    let mut events = manager.events();
    let mut phase = manager.watch_phase();
    let session = manager.start(WsConnector, store);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *phase.borrow_and_update();
                tracing::info!(phase = %current, rooms = ?manager.rooms(), "Connection phase");
            }
            event = events.recv() => match event {
                Some(event) => println!(
                    "{}",
                    serde_json::json!({
                        "event": event.name,
                        "roomId": event.room_id,
                        "data": event.data,
                    })
                ),
                None => break,
            },
        }
    }

    session.stop();
    toasts.abort();
    tracing::info!("Stopped");
}
