//! # tunnel-server
//!
//! Axum transports and connection coordination for the REST tunnel.
//!
//! - Transports: `WebSocket` (`/ws`), Server-Sent-Events (`/sse`) and HTTP
//!   long-poll (`/poll`)
//! - [`Coordinator`]: per-connection parse → translate → dispatch, suspension
//!   and long-poll pairing
//! - [`PendingRegistry`]: suspended connections keyed by connection id
//! - [`HeartbeatRegistry`]: one repeating timer per heartbeat group
//! - [`RestDispatcher`]: seam to the REST stack, backed by an in-process axum
//!   router or an upstream HTTP service
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod sink;
pub mod transport;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionState};
pub use coordinator::{Coordinator, CoordinatorConfig, InboundFrame};
pub use dispatch::{DispatchOutcome, HttpProxyDispatcher, RestDispatcher, RouterDispatcher};
pub use error::{DispatchError, TunnelError};
pub use heartbeat::{HeartbeatGroup, HeartbeatRegistry};
pub use registry::PendingRegistry;
pub use server::{AppState, ServerHandle, build_router, start};
pub use sink::ResponseSink;
