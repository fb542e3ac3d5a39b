//! HTTP long-poll transport.
//!
//! A session is opened with `GET /poll` and stays suspended on the server.
//! Plain REST requests sent to `/poll/{connection}/{*path}` are dispatched
//! with their output redirected into the session; `GET /poll/{connection}`
//! picks up one frame at a time.

use axum::Json;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::debug;
use tunnel_core::{ConnectionId, TransportKind};

use super::{CONNECTION_HEADER, physical_request};
use crate::error::TunnelError;
use crate::server::AppState;

/// GET /poll
pub(crate) async fn open_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let physical = physical_request(&state, TransportKind::LongPoll, &headers);
    let conn = state.coordinator.open_long_poll(physical);

    let mut response = Json(serde_json::json!({ "connection": conn.id })).into_response();
    if let Ok(value) = HeaderValue::from_str(conn.id.as_str()) {
        let _ = response.headers_mut().insert(CONNECTION_HEADER, value);
    }
    response
}

/// GET /poll/{connection}
///
/// Waits up to the poll timeout for the next frame; `204` when none arrives.
pub(crate) async fn poll_session(
    State(state): State<AppState>,
    Path(connection): Path<String>,
) -> Result<Response, TunnelError> {
    let id = ConnectionId::from_raw(connection);
    match state.coordinator.poll(&id, state.config.poll_timeout).await? {
        Some(frame) => Ok(frame.into_response()),
        None => {
            debug!(connection_id = %id, "poll timed out");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// DELETE /poll/{connection}
pub(crate) async fn close_session(
    State(state): State<AppState>,
    Path(connection): Path<String>,
) -> Result<StatusCode, TunnelError> {
    state.coordinator.disconnect_id(&ConnectionId::from_raw(connection))?;
    Ok(StatusCode::NO_CONTENT)
}

/// ANY /poll/{connection}/{*path}
pub(crate) async fn forward_request(
    State(state): State<AppState>,
    Path((connection, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, TunnelError> {
    let id = ConnectionId::from_raw(connection);
    let target = match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let physical = physical_request(&state, TransportKind::LongPoll, &headers);
    let outcome = state
        .coordinator
        .forward_long_poll(&id, &physical, method, &target, body)
        .await?;
    debug!(connection_id = %id, %target, ?outcome, "long-poll request forwarded");
    Ok(StatusCode::ACCEPTED)
}
