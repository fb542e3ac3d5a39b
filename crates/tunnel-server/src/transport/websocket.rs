//! WebSocket transport: one envelope per message.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnel_core::{PhysicalRequest, TransportKind};

use super::physical_request;
use crate::coordinator::{Coordinator, InboundFrame};
use crate::error::TunnelError;
use crate::server::AppState;

/// GET /ws
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let physical = physical_request(&state, TransportKind::WebSocket, &headers);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_connection(socket, state.coordinator, physical))
}

/// Drive one upgraded socket until either side closes it.
///
/// Upgrading counts as the opening control frame. Inbound messages are
/// handled one at a time in arrival order; outbound frames are sent as text
/// when they are valid UTF-8 and as binary otherwise.
async fn run_ws_connection(
    socket: WebSocket,
    coordinator: Arc<Coordinator>,
    physical: PhysicalRequest,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (conn, rx) = coordinator.open_streaming(physical).await;
    let writer = tokio::spawn(forward_frames(ws_tx, rx));

    while let Some(msg) = ws_rx.next().await {
        let payload = match msg {
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                info!(connection_id = %conn.id, "client sent close frame");
                break;
            }
            Err(e) => {
                let err = TunnelError::Transport(e.to_string());
                warn!(connection_id = %conn.id, error = %err, "websocket read failed");
                break;
            }
        };

        match coordinator.handle_frame(&conn, &InboundFrame::new(payload)).await {
            Ok(outcome) => debug!(connection_id = %conn.id, ?outcome, "frame handled"),
            Err(e) if e.is_fatal() => {
                warn!(connection_id = %conn.id, error = %e, "closing connection");
                break;
            }
            Err(e) => debug!(connection_id = %conn.id, error = %e, "frame rejected"),
        }
    }

    coordinator.disconnect(&conn);
    let _ = writer.await;
}

async fn forward_frames<S>(mut ws_tx: S, mut rx: mpsc::Receiver<Bytes>)
where
    S: futures::Sink<Message> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let msg = match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(frame),
        };
        if ws_tx.send(msg).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}
