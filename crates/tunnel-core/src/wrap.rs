//! Response framing and the outbound writer chain.
//!
//! Every payload written to a tunnel connection passes through a
//! [`WriterChain`], an ordered list of [`PayloadInterceptor`]s. The
//! [`CorrelationInterceptor`] frames payloads of correlated requests as
//! `{"id": "<id>", "data": <payload>}` and leaves everything else untouched.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

/// Frame `payload` as the reply to request `id`.
///
/// The payload is copied verbatim; only the id is JSON-encoded.
pub fn wrap_payload(id: &str, payload: &[u8]) -> Bytes {
    let id = serde_json::Value::String(id.to_owned()).to_string();
    let mut out = BytesMut::with_capacity(payload.len() + id.len() + 20);
    out.put_slice(b"{\"id\": ");
    out.put_slice(id.as_bytes());
    out.put_slice(b", \"data\": ");
    out.put_slice(payload);
    out.put_u8(b'}');
    out.freeze()
}

/// Per-write state visible to interceptors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteContext {
    /// Correlation id of the request that produced the write, if any.
    pub correlation_id: Option<String>,
}

impl WriteContext {
    /// Context of a control frame (heartbeat, open notice).
    pub fn control() -> Self {
        Self::default()
    }

    /// Context of a reply to request `id`.
    pub fn correlated(id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(id.into()),
        }
    }
}

/// One transform step applied to outbound payloads.
pub trait PayloadInterceptor: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Transform one outbound payload.
    fn transform(&self, ctx: &WriteContext, payload: Bytes) -> Bytes;
}

/// Frames replies to correlated requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelationInterceptor;

impl PayloadInterceptor for CorrelationInterceptor {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn transform(&self, ctx: &WriteContext, payload: Bytes) -> Bytes {
        match ctx.correlation_id.as_deref() {
            Some(id) => wrap_payload(id, &payload),
            None => payload,
        }
    }
}

/// Ordered interceptors applied front to back.
#[derive(Default, Clone)]
pub struct WriterChain {
    interceptors: VecDeque<Arc<dyn PayloadInterceptor>>,
}

impl WriterChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor.
    pub fn push_back(&mut self, interceptor: Arc<dyn PayloadInterceptor>) {
        self.interceptors.push_back(interceptor);
    }

    /// Insert at the front unless this exact interceptor is already present.
    /// Returns whether it was inserted.
    pub fn insert_first_if_absent(&mut self, interceptor: Arc<dyn PayloadInterceptor>) -> bool {
        if self.contains(&interceptor) {
            return false;
        }
        self.interceptors.push_front(interceptor);
        true
    }

    /// Whether this exact interceptor instance is in the chain.
    pub fn contains(&self, interceptor: &Arc<dyn PayloadInterceptor>) -> bool {
        self.interceptors
            .iter()
            .any(|existing| std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(interceptor)))
    }

    /// Run `payload` through every interceptor.
    pub fn apply(&self, ctx: &WriteContext, payload: Bytes) -> Bytes {
        self.interceptors
            .iter()
            .fold(payload, |payload, interceptor| interceptor.transform(ctx, payload))
    }

    /// Number of interceptors.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Interceptor names in application order.
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }
}

impl fmt::Debug for WriterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
