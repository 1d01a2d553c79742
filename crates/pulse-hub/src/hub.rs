//! Connection and room bookkeeping for the hub.
//!
//! Every accepted socket gets its own [`mpsc`] sender, keyed by the sid it
//! was welcomed with. Rooms map to sets of sids; publishing clones the frame
//! into each member's channel and the socket's write loop forwards it.

use std::collections::{HashMap, HashSet};

use pulse_core::protocol::{ServerFrame, validate_room_id};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};

/// Handle to a per-connection outbound channel.
pub type ClientTx = mpsc::UnboundedSender<ServerFrame>;
pub type ClientRx = mpsc::UnboundedReceiver<ServerFrame>;

/// Entry of `GET /api/rooms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub subscribers: usize,
}

/// All live connections and their room memberships.
///
/// Lock order is `clients` then `rooms` wherever both are taken.
#[derive(Default)]
pub struct RoomHub {
    clients: RwLock<HashMap<String, ClientTx>>,
    rooms: RwLock<HashMap<String, HashSet<String>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. Returns its sid and outbound receiver.
    pub async fn register(&self) -> (String, ClientRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut clients = self.clients.write().await;
        let mut sid = generate_sid();
        while clients.contains_key(&sid) {
            sid = generate_sid();
        }
        clients.insert(sid.clone(), tx);
        (sid, rx)
    }

    /// Send `frame` to one connection.
    pub async fn send_to(&self, sid: &str, frame: ServerFrame) -> bool {
        let clients = self.clients.read().await;
        match clients.get(sid) {
            // The connection may have just gone away.
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Add `sid` to `room_id`. Joining twice is harmless.
    pub async fn join(&self, sid: &str, room_id: &str) -> Result<(), String> {
        validate_room_id(room_id)?;
        let clients = self.clients.read().await;
        if !clients.contains_key(sid) {
            return Err("Unknown connection".to_string());
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(sid.to_string());
        Ok(())
    }

    /// Remove `sid` from `room_id`. Returns `false` if it was not a member.
    pub async fn leave(&self, sid: &str, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room_id) else {
            return false;
        };
        let removed = members.remove(sid);
        if members.is_empty() {
            rooms.remove(room_id);
        }
        removed
    }

    /// Forget a connection and all of its memberships.
    pub async fn disconnect(&self, sid: &str) {
        let mut clients = self.clients.write().await;
        clients.remove(sid);
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(sid);
            !members.is_empty()
        });
    }

    /// Deliver a room-scoped event to every member of `room_id`. Returns the
    /// number of connections reached.
    pub async fn publish(&self, room_id: &str, event: &str, data: Value) -> usize {
        let frame = ServerFrame::Event {
            event: event.to_string(),
            room_id: Some(room_id.to_string()),
            data,
        };
        let clients = self.clients.read().await;
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room_id) else {
            return 0;
        };
        members
            .iter()
            .filter_map(|sid| clients.get(sid))
            .filter(|tx| tx.send(frame.clone()).is_ok())
            .count()
    }

    /// Deliver a user-wide event to every connection.
    pub async fn broadcast(&self, event: &str, data: Value) -> usize {
        let frame = ServerFrame::Event {
            event: event.to_string(),
            room_id: None,
            data,
        };
        let clients = self.clients.read().await;
        clients
            .values()
            .filter(|tx| tx.send(frame.clone()).is_ok())
            .count()
    }

    /// Sids subscribed to `room_id`, sorted.
    pub async fn members(&self, room_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut members: Vec<String> = rooms
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.read().await;
        let mut summaries: Vec<RoomSummary> = rooms
            .iter()
            .map(|(room_id, members)| RoomSummary {
                room_id: room_id.clone(),
                subscribers: members.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Drop every connection, as a restart would. Each socket's write loop
    /// sees its channel close and closes the socket. Returns how many were
    /// dropped.
    pub async fn kick_all(&self) -> usize {
        let mut clients = self.clients.write().await;
        let mut rooms = self.rooms.write().await;
        let dropped = clients.len();
        clients.clear();
        rooms.clear();
        tracing::info!(dropped, "Dropped all connections");
        dropped
    }
}

/// Generate a random connection id (16-char hex string).
fn generate_sid() -> String {
    use rand::RngExt;
    let mut rng = rand::rng();
    let bytes: [u8; 8] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use serde_json::json;

    fn drain(rx: &mut ClientRx) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn sids_are_unique_hex() {
        let hub = RoomHub::new();
        let (a, _rx_a) = hub.register().await;
        let (b, _rx_b) = hub.register().await;
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hub.client_count().await, 2);
    }

    #[tokio::test]
    async fn publish_reaches_members_only() {
        let hub = RoomHub::new();
        let (a, mut rx_a) = hub.register().await;
        let (b, mut rx_b) = hub.register().await;
        assert_ok!(hub.join(&a, "dev1").await);
        assert_ok!(hub.join(&a, "dev1").await);
        assert_ok!(hub.join(&b, "dev2").await);

        let delivered = hub.publish("dev1", "presence", json!({ "status": "connected" })).await;
        assert_eq!(delivered, 1);
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerFrame::Event {
                event: "presence".to_string(),
                room_id: Some("dev1".to_string()),
                data: json!({ "status": "connected" }),
            }]
        );
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(hub.publish("ghost", "presence", Value::Null).await, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_without_a_room() {
        let hub = RoomHub::new();
        let (_a, mut rx_a) = hub.register().await;
        let (_b, mut rx_b) = hub.register().await;
        assert_eq!(hub.broadcast("message.created", json!({ "id": 1 })).await, 2);
        for rx in [&mut rx_a, &mut rx_b] {
            match drain(rx).as_slice() {
                [ServerFrame::Event { room_id: None, .. }] => {}
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn invalid_room_ids_are_refused() {
        let hub = RoomHub::new();
        let (a, _rx) = hub.register().await;
        assert_err!(hub.join(&a, "").await);
        assert_err!(hub.join(&a, "dev 1").await);
        assert_err!(hub.join("nobody", "dev1").await);
        assert!(hub.list_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn leave_and_disconnect_prune_empty_rooms() {
        let hub = RoomHub::new();
        let (a, _rx_a) = hub.register().await;
        let (b, _rx_b) = hub.register().await;
        assert_ok!(hub.join(&a, "dev1").await);
        assert_ok!(hub.join(&b, "dev1").await);
        assert_ok!(hub.join(&a, "dev2").await);

        assert!(hub.leave(&a, "dev1").await);
        assert!(!hub.leave(&a, "dev1").await);
        assert_eq!(hub.members("dev1").await, vec![b.clone()]);

        hub.disconnect(&b).await;
        assert_eq!(
            hub.list_rooms().await,
            vec![RoomSummary {
                room_id: "dev2".to_string(),
                subscribers: 1,
            }]
        );
    }

    #[tokio::test]
    async fn kick_all_closes_every_channel() {
        let hub = RoomHub::new();
        let (a, mut rx_a) = hub.register().await;
        assert_ok!(hub.join(&a, "dev1").await);

        assert_eq!(hub.kick_all().await, 1);
        assert_eq!(rx_a.recv().await, None);
        assert!(hub.list_rooms().await.is_empty());
        assert!(!hub.send_to(&a, ServerFrame::Pong).await);
    }
}
