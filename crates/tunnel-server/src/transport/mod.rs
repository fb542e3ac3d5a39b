//! Physical transports: WebSocket, SSE and HTTP long-poll.

pub mod long_poll;
pub mod sse;
pub mod websocket;

use axum::http::HeaderMap;
use axum::http::header::HOST;
use tunnel_core::{PhysicalRequest, TransportKind};

use crate::server::AppState;

/// Response header carrying the long-poll session id.
pub const CONNECTION_HEADER: &str = "x-tunnel-connection";

/// Describe the physical request that opened a connection.
///
/// The URL prefix is rebuilt from `x-forwarded-proto` and `Host`, falling
/// back to the bound address, plus the mount path.
pub(crate) fn physical_request(
    state: &AppState,
    transport: TransportKind,
    headers: &HeaderMap,
) -> PhysicalRequest {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| format!("{}:{}", state.config.host, state.config.port), str::to_owned);
    let prefix = format!("{scheme}://{host}{}", state.config.mount_prefix());
    PhysicalRequest::new(transport, prefix).with_headers(headers.clone())
}
