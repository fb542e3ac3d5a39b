//! Response sink handed to the REST stack for one synthetic request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use tracing::debug;
use tunnel_core::WriteContext;

use crate::connection::Connection;

/// Payload of the completion acknowledgement for a correlated request that
/// produced no body.
const NULL_PAYLOAD: &[u8] = b"null";

struct SinkState {
    connection: Arc<Connection>,
    context: WriteContext,
    writes: AtomicUsize,
    completed: AtomicBool,
}

/// Writes response output of one request to a tunnel connection.
///
/// Every [`write`](Self::write) is one outbound frame and is wrapped
/// independently when the request carries a correlation id. Clones share
/// state.
#[derive(Clone)]
pub struct ResponseSink {
    inner: Arc<SinkState>,
}

impl ResponseSink {
    /// Sink writing to `connection` under `context`.
    pub fn new(connection: Arc<Connection>, context: WriteContext) -> Self {
        Self {
            inner: Arc::new(SinkState {
                connection,
                context,
                writes: AtomicUsize::new(0),
                completed: AtomicBool::new(false),
            }),
        }
    }

    /// Correlation id of the originating request.
    pub fn correlation_id(&self) -> Option<&str> {
        self.inner.context.correlation_id.as_deref()
    }

    /// Target connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.inner.connection
    }

    /// Whether the target connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.inner.connection.is_closed()
    }

    /// Write one chunk of response output. Empty chunks are skipped.
    pub fn write(&self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return true;
        }
        let _ = self.inner.writes.fetch_add(1, Ordering::AcqRel);
        self.inner.connection.write(&self.inner.context, chunk)
    }

    /// Write a `{"error": "<message>"}` payload.
    pub fn write_error(&self, message: &str) -> bool {
        let payload = serde_json::json!({ "error": message }).to_string();
        self.write(Bytes::from(payload))
    }

    /// Number of non-empty chunks written.
    pub fn writes(&self) -> usize {
        self.inner.writes.load(Ordering::Acquire)
    }

    /// Whether [`complete`](Self::complete) has run.
    pub fn is_complete(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Finish the response. A correlated request that produced no output gets
    /// a `null` reply so the client sees exactly one answer. Idempotent.
    pub fn complete(&self) {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.writes() == 0 && self.correlation_id().is_some() {
            debug!(
                connection_id = %self.inner.connection.id,
                correlation_id = self.correlation_id(),
                "empty response, sending null reply"
            );
            let _ = self.write(Bytes::from_static(NULL_PAYLOAD));
        }
    }
}
