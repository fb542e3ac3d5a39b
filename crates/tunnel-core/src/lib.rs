//! # tunnel-core
//!
//! The envelope protocol engine behind `resttunnel`.
//!
//! - [`envelope`]: streaming reader that extracts flat headers and isolates the
//!   `data` body without buffering it
//! - [`translate`]: builds the synthetic HTTP request dispatched into the REST stack
//! - [`wrap`]: correlation framing of outbound payloads and the ordered writer chain
//! - [`transport`]: transport kinds and the physical request a frame arrived on

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod translate;
pub mod transport;
pub mod wrap;

pub use envelope::{BodyReader, Envelope};
pub use errors::{EnvelopeError, TranslateError};
pub use ids::{ConnectionId, HeartbeatId};
pub use translate::SyntheticRequest;
pub use transport::{PhysicalRequest, TransportKind};
pub use wrap::{CorrelationInterceptor, PayloadInterceptor, WriteContext, WriterChain, wrap_payload};
