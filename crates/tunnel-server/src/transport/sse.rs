//! Server-Sent-Events transport.
//!
//! `GET /sse` opens the event stream; the client posts envelopes to
//! `POST /sse/{connection}` and reads the replies from the stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use bytes::Bytes;
use futures::{StreamExt, stream};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use tunnel_core::{ConnectionId, TransportKind};

use super::physical_request;
use crate::connection::Connection;
use crate::coordinator::{Coordinator, InboundFrame};
use crate::dispatch::DispatchOutcome;
use crate::error::TunnelError;
use crate::server::AppState;

/// Disconnects the SSE connection when the response stream is dropped.
struct DisconnectGuard {
    coordinator: Arc<Coordinator>,
    connection: Arc<Connection>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        debug!(connection_id = %self.connection.id, "sse stream dropped");
        self.coordinator.disconnect(&self.connection);
    }
}

fn open_event(id: &ConnectionId) -> Event {
    Event::default()
        .event("open")
        .data(serde_json::json!({ "connection": id }).to_string())
}

/// SSE data cannot carry carriage returns.
fn frame_text(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame).replace('\r', "")
}

/// GET /sse
pub(crate) async fn sse_open(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let physical = physical_request(&state, TransportKind::Sse, &headers);
    let (conn, rx) = state.coordinator.open_streaming(physical).await;

    let opened = open_event(&conn.id);
    let guard = DisconnectGuard {
        coordinator: Arc::clone(&state.coordinator),
        connection: conn,
    };
    let frames = ReceiverStream::new(rx).map(move |frame| {
        let _ = &guard;
        Ok::<_, Infallible>(Event::default().data(frame_text(&frame)))
    });
    let events = stream::once(async move { Ok::<_, Infallible>(opened) }).chain(frames);

    Sse::new(events)
}

/// POST /sse/{connection}
pub(crate) async fn sse_post(
    State(state): State<AppState>,
    Path(connection): Path<String>,
    body: Bytes,
) -> Result<StatusCode, TunnelError> {
    let id = ConnectionId::from_raw(connection);
    let conn = state
        .coordinator
        .connection(&id)
        .filter(|conn| conn.transport() == TransportKind::Sse)
        .ok_or(TunnelError::UnknownConnection(id))?;

    match state.coordinator.handle_frame(&conn, &InboundFrame::new(body)).await? {
        DispatchOutcome::Completed | DispatchOutcome::Suspend => Ok(StatusCode::ACCEPTED),
        DispatchOutcome::Cancelled => Ok(StatusCode::NO_CONTENT),
    }
}
