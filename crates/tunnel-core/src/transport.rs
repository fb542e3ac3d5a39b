//! Transport kinds and the physical request a frame arrived on.

use std::fmt;

use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Long-lived transports the tunnel speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Full-duplex WebSocket; every message is one envelope.
    #[serde(rename = "websocket")]
    WebSocket,
    /// Server-Sent Events downstream, envelopes posted upstream.
    #[serde(rename = "sse")]
    Sse,
    /// HTTP long-poll; plain REST requests mirrored into a suspended session.
    #[serde(rename = "long-polling")]
    LongPoll,
}

impl TransportKind {
    /// Wire name, as carried in `x-tunnel-transport`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
            Self::LongPoll => "long-polling",
        }
    }

    /// Whether every physical message on this transport is an envelope.
    ///
    /// Only these transports suspend on the empty opening frame and receive
    /// heartbeats.
    pub fn carries_envelopes(self) -> bool {
        matches!(self, Self::WebSocket | Self::Sse)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The physical HTTP request that opened (or carries) a tunnel connection.
#[derive(Clone, Debug)]
pub struct PhysicalRequest {
    /// Transport the request arrived on.
    pub transport: TransportKind,
    /// Absolute URL prefix of the tunnel mount, e.g. `http://host:8082/api`.
    pub url_prefix: String,
    /// Headers of the physical request, inherited by synthetic requests.
    pub headers: HeaderMap,
}

impl PhysicalRequest {
    /// Create a physical request with no inherited headers.
    pub fn new(transport: TransportKind, url_prefix: impl Into<String>) -> Self {
        Self {
            transport,
            url_prefix: url_prefix.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Attach the headers of the physical request.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Same request seen through another transport.
    #[must_use]
    pub fn for_transport(&self, transport: TransportKind) -> Self {
        Self {
            transport,
            ..self.clone()
        }
    }
}
