use crate::state::{AppState, WsMessage};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, serde::Deserialize)]
pub struct WsQuery {
    pub user_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
}

/// Messages scoped to a user go only to that user's sockets; unscoped ones
/// go to everybody. Unfiltered sockets see everything.
pub fn visible_to(msg: &WsMessage, user: Option<&str>) -> bool {
    let Some(user) = user else { return true };
    match msg {
        WsMessage::TradeCreated { user_id, .. } | WsMessage::TradeSettled { user_id, .. } => {
            user_id == user
        }
        WsMessage::TradesChanged { user_id } => user_id.as_deref().map_or(true, |u| u == user),
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ws_tx.subscribe();

    // Forward broadcast messages to this client
    let send_task = tokio::spawn(async move {
        loop {
            let ws_msg = match rx.recv().await {
                Ok(m) => m,
                // Dropped notifications are fine; the client re-reads state.
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "ws client lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !visible_to(&ws_msg, user.as_deref()) {
                continue;
            }
            match serde_json::to_string(&ws_msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(_) => continue,
            }
        }
    });

    // Read (and discard) incoming messages; detect disconnect
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {} // Ignore client messages
            }
        }
    });

    // Wait for either task to finish (client disconnected)
    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}
