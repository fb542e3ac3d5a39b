//! Envelope → synthetic HTTP request.

use std::io::BufRead;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Uri};
use tracing::debug;

use crate::envelope::Envelope;
use crate::errors::TranslateError;
use crate::transport::{PhysicalRequest, TransportKind};

/// Envelope header naming the request method.
pub const METHOD_KEY: &str = "method";
/// Envelope header naming the request path, optionally with a query.
pub const PATH_KEY: &str = "path";
/// Envelope header carrying the body's content type.
pub const TYPE_KEY: &str = "type";
/// Envelope header carrying the accepted response type.
pub const ACCEPT_KEY: &str = "accept";
/// Envelope header carrying the correlation id.
pub const ID_KEY: &str = "id";

/// Header naming the transport a synthetic request arrived on.
pub const TRANSPORT_HEADER: HeaderName = HeaderName::from_static("x-tunnel-transport");
/// Header supplying the correlation id of a plain long-poll request.
pub const CORRELATION_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

/// Physical-request headers that never reach the synthetic request.
const NOT_INHERITED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
    "content-type",
    "accept",
    "accept-encoding",
];

fn is_inherited(name: &HeaderName) -> bool {
    let name = name.as_str();
    !NOT_INHERITED.contains(&name) && !name.starts_with("sec-websocket-")
}

/// Request descriptor handed to the REST stack.
#[derive(Clone, Debug)]
pub struct SyntheticRequest {
    /// Request method, `GET` when the envelope has none.
    pub method: Method,
    /// Path and query, `/` when the envelope has none.
    pub uri: Uri,
    /// Inherited headers overlaid with the envelope's `type` and `accept`.
    pub headers: HeaderMap,
    /// Body bytes, if the envelope carried `data`.
    pub body: Option<Bytes>,
    /// Externally visible URL: the physical URL prefix plus [`Self::uri`].
    pub request_url: String,
    /// Correlation id scoped to this request.
    pub correlation_id: Option<String>,
    /// Transport the request arrived on.
    pub transport: TransportKind,
}

impl SyntheticRequest {
    /// Translate one envelope received on `physical`.
    ///
    /// The body stream is drained here; bytes after the `data` value are
    /// never read.
    pub fn from_envelope<R: BufRead>(
        envelope: Envelope<R>,
        physical: &PhysicalRequest,
    ) -> Result<Self, TranslateError> {
        let (headers, body) = envelope.into_parts();

        let method = parse_method(headers.get(METHOD_KEY).map(String::as_str))?;
        let uri = parse_target(headers.get(PATH_KEY).map_or("/", String::as_str))?;

        let mut http_headers = inherited_headers(physical);
        if let Some(content_type) = headers.get(TYPE_KEY) {
            let _ = http_headers.insert(CONTENT_TYPE, header_value("content-type", content_type)?);
        }
        if let Some(accept) = headers.get(ACCEPT_KEY) {
            let _ = http_headers.insert(ACCEPT, header_value("accept", accept)?);
        }

        let body = match body {
            Some(mut reader) => {
                let bytes = reader.read_all().map_err(crate::EnvelopeError::from)?;
                Some(Bytes::from(bytes))
            }
            None => None,
        };

        let request = Self {
            request_url: request_url(&physical.url_prefix, &uri),
            method,
            uri,
            headers: http_headers,
            body,
            correlation_id: headers.get(ID_KEY).cloned(),
            transport: physical.transport,
        };
        debug!(
            method = %request.method,
            path = request.path(),
            correlation_id = request.correlation_id.as_deref(),
            transport = %request.transport,
            body_len = request.body.as_ref().map_or(0, Bytes::len),
            "translated envelope"
        );
        Ok(request)
    }

    /// Build a synthetic request from a plain HTTP request, as carried by
    /// long-poll. The correlation id comes from `x-correlation-id`.
    pub fn from_parts(
        method: Method,
        target: &str,
        headers: &HeaderMap,
        body: Bytes,
        physical: &PhysicalRequest,
    ) -> Result<Self, TranslateError> {
        let uri = parse_target(target)?;
        let mut http_headers = inherited_headers(physical);
        for name in [CONTENT_TYPE, ACCEPT] {
            if let Some(value) = headers.get(&name) {
                let _ = http_headers.insert(name, value.clone());
            }
        }
        let correlation_id = headers
            .get(&CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        Ok(Self {
            request_url: request_url(&physical.url_prefix, &uri),
            method,
            uri,
            headers: http_headers,
            body: (!body.is_empty()).then_some(body),
            correlation_id,
            transport: physical.transport,
        })
    }

    /// Request path without the query.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Convert into an `http::Request` for dispatch.
    pub fn into_http_request(self) -> Request<Bytes> {
        let mut request = Request::new(self.body.unwrap_or_default());
        *request.method_mut() = self.method;
        *request.uri_mut() = self.uri;
        *request.headers_mut() = self.headers;
        request
    }
}

fn parse_method(raw: Option<&str>) -> Result<Method, TranslateError> {
    let Some(raw) = raw else {
        return Ok(Method::GET);
    };
    Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| TranslateError::InvalidMethod(raw.to_owned()))
}

/// Split at the first `?`; an empty path becomes `/`.
fn parse_target(raw: &str) -> Result<Uri, TranslateError> {
    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    };
    let mut target = String::with_capacity(raw.len() + 1);
    if !path.starts_with('/') {
        target.push('/');
    }
    target.push_str(path);
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    target.parse::<Uri>().map_err(|_| TranslateError::InvalidUri(raw.to_owned()))
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, TranslateError> {
    HeaderValue::from_str(value).map_err(|source| TranslateError::InvalidHeader { name, source })
}

fn inherited_headers(physical: &PhysicalRequest) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(physical.headers.len() + 1);
    for (name, value) in &physical.headers {
        if is_inherited(name) {
            let _ = headers.append(name.clone(), value.clone());
        }
    }
    let _ = headers.insert(TRANSPORT_HEADER, HeaderValue::from_static(physical.transport.as_str()));
    headers
}

fn request_url(prefix: &str, uri: &Uri) -> String {
    format!("{}{}", prefix.trim_end_matches('/'), uri)
}
