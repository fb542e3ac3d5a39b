//! Server error taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tunnel_core::{ConnectionId, EnvelopeError, TranslateError};

/// The REST stack failed to produce a response.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The upstream service could not be reached or answered with a broken response.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    /// Reading the response body failed.
    #[error("response body failed: {0}")]
    Body(String),
}

/// Any failure while handling traffic on a tunnel connection.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Malformed envelope; the message is dropped.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// Envelope headers do not form a valid request; the message is dropped.
    #[error(transparent)]
    Translate(#[from] TranslateError),
    /// The REST stack failed; an error payload was written to the client.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// I/O failure on the physical connection.
    #[error("transport error: {0}")]
    Transport(String),
    /// No suspended connection with this id.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

impl TunnelError {
    /// Whether the physical connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// HTTP status for handlers that answer a physical request.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Envelope(_) | Self::Translate(_) => StatusCode::BAD_REQUEST,
            Self::Dispatch(_) => StatusCode::BAD_GATEWAY,
            Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnknownConnection(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), axum::Json(body)).into_response()
    }
}
