//! WebSocket route handlers.

use crate::global_ws::handle_global_websocket;
use crate::state::AppState;
use crate::websocket::handle_websocket;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Initial view size, sent by the client with the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ViewSize {
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(tab_id): Path<Uuid>,
    Query(size): Query<ViewSize>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, tab_id, size))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, tab_id: Uuid, size: ViewSize) {
    if let Err(e) = handle_websocket(socket, state, tab_id, (size.cols, size.rows)).await {
        tracing::error!(target: "tabterm::ws", "WebSocket error for tab {}: {}", tab_id, e);
    }
}

pub async fn events(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_global_websocket(socket, state).await {
            tracing::error!(target: "tabterm::ws", "Event WebSocket error: {}", e);
        }
    })
}
