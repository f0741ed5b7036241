//! WebSocket stream of controller events

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::ApiState;
use crate::controller::ControllerEvent;
use crate::metrics;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> Response {
    // Subscribe before the upgrade so nothing emitted in between is lost
    let rx = state.controller.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, rx, state))
}

async fn stream_events(
    socket: WebSocket,
    mut rx: broadcast::Receiver<ControllerEvent>,
    state: Arc<ApiState>,
) {
    let count = state.ws_connections.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::record_websocket_connections(count);
    debug!("WebSocket client connected ({} total)", count);

    let (mut sender, mut receiver) = socket.split();

    // Start every client from the current panel state
    let snapshot = serde_json::json!({
        "event": "snapshot",
        "coils": state.controller.snapshot(),
        "sequence_running": state.controller.is_sequence_running(),
    });
    let mut open = sender
        .send(Message::Text(snapshot.to_string()))
        .await
        .is_ok();

    while open {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(text) => open = sender.send(Message::Text(text)).await.is_ok(),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => open = false,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => open = false,
                Some(Ok(_)) => {}
            },
        }
    }

    let count = state.ws_connections.fetch_sub(1, Ordering::SeqCst) - 1;
    metrics::record_websocket_connections(count);
    debug!("WebSocket client disconnected ({} remaining)", count);
}
