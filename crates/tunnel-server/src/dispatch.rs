//! Dispatch seam between the tunnel and the REST stack.
//!
//! A [`RestDispatcher`] runs one [`SyntheticRequest`] and writes its output to
//! a [`ResponseSink`]. Responses whose size is known up front are written
//! before `dispatch` returns ([`DispatchOutcome::Completed`]); streaming
//! bodies are forwarded chunk by chunk from a spawned task
//! ([`DispatchOutcome::Suspend`]).

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, HttpBody as _};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::header::HOST;
use tower::ServiceExt;
use tracing::{debug, warn};
use tunnel_core::SyntheticRequest;

use crate::error::DispatchError;
use crate::sink::ResponseSink;

/// How a dispatch ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The full response has been written.
    Completed,
    /// Output continues asynchronously; keep the connection suspended.
    Suspend,
    /// Nothing was dispatched.
    Cancelled,
}

/// The REST resource stack behind the tunnel.
#[async_trait]
pub trait RestDispatcher: Send + Sync + 'static {
    /// Run `request`, writing its response to `sink`.
    async fn dispatch(
        &self,
        request: SyntheticRequest,
        sink: ResponseSink,
    ) -> Result<DispatchOutcome, DispatchError>;
}

/// Write every chunk of `body` to `sink`, then complete it.
async fn forward_body<S, E>(body: S, sink: ResponseSink)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => {
                if !sink.write(chunk) && sink.is_closed() {
                    debug!(
                        connection_id = %sink.connection().id,
                        "connection closed, abandoning response stream"
                    );
                    return;
                }
            }
            Err(e) => {
                warn!(connection_id = %sink.connection().id, error = %e, "response stream failed");
                let _ = sink.write_error(&e.to_string());
                break;
            }
        }
    }
    sink.complete();
}

/// Dispatches into an in-process axum [`Router`].
#[derive(Clone)]
pub struct RouterDispatcher {
    router: Router,
}

impl RouterDispatcher {
    /// Dispatch into `router`.
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl RestDispatcher for RouterDispatcher {
    async fn dispatch(
        &self,
        request: SyntheticRequest,
        sink: ResponseSink,
    ) -> Result<DispatchOutcome, DispatchError> {
        let request = request.into_http_request().map(Body::from);
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {});
        debug!(status = %response.status(), "router responded");

        let body = response.into_body();
        if body.size_hint().exact().is_some() {
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| DispatchError::Body(e.to_string()))?;
            let _ = sink.write(bytes);
            return Ok(DispatchOutcome::Completed);
        }

        drop(tokio::spawn(forward_body(body.into_data_stream(), sink)));
        Ok(DispatchOutcome::Suspend)
    }
}

/// Forwards requests to an upstream HTTP service.
#[derive(Clone)]
pub struct HttpProxyDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProxyDispatcher {
    /// Proxy to `base_url` with a per-request `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Upstream URL for a synthetic request.
    pub fn upstream_url(&self, request: &SyntheticRequest) -> String {
        format!("{}{}", self.base_url, request.uri)
    }
}

#[async_trait]
impl RestDispatcher for HttpProxyDispatcher {
    async fn dispatch(
        &self,
        request: SyntheticRequest,
        sink: ResponseSink,
    ) -> Result<DispatchOutcome, DispatchError> {
        let url = self.upstream_url(&request);
        let mut headers = request.headers;
        let _ = headers.remove(HOST);

        let mut builder = self.client.request(request.method, &url).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        debug!(%url, status = %response.status(), "upstream responded");

        if response.content_length().is_some() {
            let bytes = response.bytes().await?;
            let _ = sink.write(bytes);
            return Ok(DispatchOutcome::Completed);
        }

        drop(tokio::spawn(forward_body(response.bytes_stream(), sink)));
        Ok(DispatchOutcome::Suspend)
    }
}
