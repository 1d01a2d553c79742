//! Development push hub.
//!
//! # Routes
//!
//! | Method | Path                       | Description                                  |
//! |--------|----------------------------|----------------------------------------------|
//! | `GET`  | `/ws?token=…`              | WebSocket upgrade (401 on a refused token)   |
//! | `GET`  | `/api/rooms`               | Rooms with subscriber counts (JSON)          |
//! | `POST` | `/api/rooms/{room}/events` | Publish a room-scoped event                  |
//! | `POST` | `/api/events`              | Publish a user-wide event to every connection |

pub mod hub;
pub mod ws_handler;

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pulse_core::protocol::validate_room_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use hub::{RoomHub, RoomSummary};

/// Port used when `PORT` is unset or invalid.
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    pub port: u16,
    /// Accepted credentials. `None` accepts any non-empty token.
    pub tokens: Option<HashSet<String>>,
}

impl HubConfig {
    /// Read `PORT` and `PULSE_HUB_TOKENS` (comma-separated).
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("PORT")
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let tokens = lookup("PULSE_HUB_TOKENS").map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        });
        Self { port, tokens }
    }

    pub fn accepts(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        match &self.tokens {
            Some(tokens) => tokens.contains(token),
            None => true,
        }
    }
}

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct HubState {
    pub hub: Arc<RoomHub>,
    pub config: Arc<HubConfig>,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self {
            hub: Arc::new(RoomHub::new()),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(ws_route))
        .route("/api/rooms", get(rooms_route))
        .route("/api/rooms/{room}/events", post(publish_room_route))
        .route("/api/events", post(publish_all_route))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the hub on `listener` until the process ends.
pub async fn serve(listener: tokio::net::TcpListener, state: HubState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub delivered: usize,
}

/// `GET /ws`: check the token, then upgrade and hand off to
/// [`ws_handler::handle_socket`].
async fn ws_route(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<HubState>,
) -> Response {
    if !state.config.accepts(&params.token) {
        tracing::warn!("Rejected connection with invalid token");
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }
    ws.on_upgrade(move |socket| ws_handler::handle_socket(socket, state.hub))
}

/// `GET /api/rooms`
async fn rooms_route(State(state): State<HubState>) -> Json<Vec<RoomSummary>> {
    Json(state.hub.list_rooms().await)
}

/// `POST /api/rooms/{room}/events`
async fn publish_room_route(
    State(state): State<HubState>,
    Path(room): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, (StatusCode, String)> {
    validate_room_id(&room).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let delivered = state.hub.publish(&room, &req.event, req.data).await;
    tracing::info!(room = %room, event = %req.event, delivered, "Published room event");
    Ok(Json(PublishResponse { delivered }))
}

/// `POST /api/events`
async fn publish_all_route(
    State(state): State<HubState>,
    Json(req): Json<PublishRequest>,
) -> Json<PublishResponse> {
    let delivered = state.hub.broadcast(&req.event, req.data).await;
    tracing::info!(event = %req.event, delivered, "Published user-wide event");
    Json(PublishResponse { delivered })
}
