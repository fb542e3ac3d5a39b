//! Error types for envelope parsing and request translation.
//!
//! Both enums belong to the same failure class: the single offending message
//! is dropped and the connection stays open.

use thiserror::Error;

/// Malformed envelope framing.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The message did not start with `{`.
    #[error("invalid envelope: missing begin-object '{{'")]
    MissingObjectStart,
    /// A pair name was not quoted.
    #[error("invalid envelope: header name must be quoted")]
    MissingNameQuote,
    /// A pair name was not followed by `:`.
    #[error("invalid envelope: missing name-separator ':' after \"{name}\"")]
    MissingSeparator {
        /// Name of the pair being parsed.
        name: String,
    },
    /// The stream ended inside a quoted string.
    #[error("invalid envelope: unterminated quoted string")]
    UnterminatedString,
    /// The stream ended inside an unquoted literal.
    #[error("invalid envelope: unterminated literal")]
    UnterminatedLiteral,
    /// A structural character appeared where it is not allowed.
    #[error("invalid envelope: unexpected '{0}'")]
    UnexpectedToken(char),
    /// A header name or value was not valid UTF-8.
    #[error("invalid envelope: header is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// The underlying reader failed.
    #[error("envelope read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Envelope headers that cannot form an HTTP request.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// The `method` header is not a valid HTTP method token.
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    /// A header value cannot be carried in HTTP.
    #[error("invalid value for header {name}")]
    InvalidHeader {
        /// Header being set.
        name: &'static str,
        /// Underlying validation error.
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    /// The `path` header does not form a valid request target.
    #[error("invalid request target: {0}")]
    InvalidUri(String),
    /// Reading the body out of the envelope failed.
    #[error(transparent)]
    Body(#[from] EnvelopeError),
}
