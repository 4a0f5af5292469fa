//! Browser-facing progress socket. Every text frame is one `ProgressView`.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

async fn handle_ui_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (observer_id, mut rx) = state.orchestrator.observers().subscribe_channel();
    tracing::debug!(observer = %observer_id, "Progress observer connected");

    // Forward progress views to this client
    let mut send_task = tokio::spawn(async move {
        while let Some(view) = rx.recv().await {
            let text = match serde_json::to_string(&view) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Failed to serialize progress view: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Drain client frames until it closes
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.orchestrator.unsubscribe(&observer_id);
    tracing::debug!(observer = %observer_id, "Progress observer disconnected");
}
