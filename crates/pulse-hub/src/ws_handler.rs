//! WebSocket handler for the hub.
//!
//! Each WebSocket connection follows this lifecycle:
//!
//! 1. The connection is registered and greeted with `welcome { sid }`.
//! 2. A write task drains the connection's channel into the socket.
//! 3. The read loop applies `join-room` / `leave-room` / `ping` frames.
//! 4. When either side ends, the connection and its memberships are dropped.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use pulse_core::protocol::{ClientFrame, ServerFrame};

use crate::hub::RoomHub;

/// Drive a single WebSocket connection.
///
/// Called after the Axum upgrade, once the credential has been accepted.
pub async fn handle_socket(socket: WebSocket, hub: Arc<RoomHub>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (sid, mut rx) = hub.register().await;

    if send_one(&mut ws_sink, &ServerFrame::Welcome { sid: sid.clone() })
        .await
        .is_err()
    {
        hub.disconnect(&sid).await;
        return;
    }
    tracing::info!(sid = %sid, "Client connected");

    // Forward the connection's channel as text frames. The channel closing
    // (disconnect or kick) closes the socket.
    let mut write_handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if send_one(&mut ws_sink, &frame).await.is_err() {
                return;
            }
        }
        let _ = ws_sink.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => process_client_frame(&hub, &sid, frame).await,
                        Err(e) => Some(ServerFrame::Error {
                            message: format!("Invalid frame: {e}"),
                        }),
                    };
                    if let Some(reply) = reply {
                        hub.send_to(&sid, reply).await;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => continue,
            },
            _ = &mut write_handle => break,
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────
    write_handle.abort();
    hub.disconnect(&sid).await;
    tracing::info!(sid = %sid, "Client disconnected");
}

/// Apply one client frame. Returns the reply, if any.
async fn process_client_frame(hub: &RoomHub, sid: &str, frame: ClientFrame) -> Option<ServerFrame> {
    match frame {
        ClientFrame::JoinRoom { room_id } => match hub.join(sid, &room_id).await {
            Ok(()) => {
                tracing::debug!(sid, room = %room_id, "Joined room");
                None
            }
            Err(message) => Some(ServerFrame::Error { message }),
        },
        ClientFrame::LeaveRoom { room_id } => {
            let removed = hub.leave(sid, &room_id).await;
            tracing::debug!(sid, room = %room_id, removed, "Left room");
            None
        }
        ClientFrame::Ping => Some(ServerFrame::Pong),
    }
}

/// Send a single frame directly on the raw WebSocket sink.
async fn send_one(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_update_membership() {
        let hub = RoomHub::new();
        let (sid, _rx) = hub.register().await;

        assert_eq!(process_client_frame(&hub, &sid, ClientFrame::join("dev1")).await, None);
        assert_eq!(hub.members("dev1").await, vec![sid.clone()]);

        assert_eq!(process_client_frame(&hub, &sid, ClientFrame::leave("dev1")).await, None);
        assert!(hub.members("dev1").await.is_empty());
    }

    #[tokio::test]
    async fn bad_room_and_ping_get_replies() {
        let hub = RoomHub::new();
        let (sid, _rx) = hub.register().await;

        match process_client_frame(&hub, &sid, ClientFrame::join("has space")).await {
            Some(ServerFrame::Error { message }) => assert!(message.contains("whitespace")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            process_client_frame(&hub, &sid, ClientFrame::Ping).await,
            Some(ServerFrame::Pong)
        );
    }
}
