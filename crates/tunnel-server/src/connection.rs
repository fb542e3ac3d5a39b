//! Suspended tunnel connections.
//!
//! A [`Connection`] is the server side of one physical WebSocket, SSE stream
//! or long-poll session. Outbound payloads go through the connection's
//! [`WriterChain`] and then to its outlet: a bounded channel feeding the
//! socket/stream task, or a frame queue drained by continuation polls.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};
use tunnel_core::{
    ConnectionId, PayloadInterceptor, PhysicalRequest, TransportKind, WriteContext, WriterChain,
};

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No envelope in flight.
    Idle,
    /// An envelope has been handed to the REST stack.
    Dispatching,
    /// Kept open awaiting asynchronous output.
    Suspended,
    /// Disconnected; writes are no-ops.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Dispatching => "dispatching",
            Self::Suspended => "suspended",
            Self::Closed => "closed",
        })
    }
}

/// Frames waiting for the next continuation poll.
struct PollQueue {
    frames: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    notify: Notify,
    last_poll: Mutex<tokio::time::Instant>,
}

enum Outlet {
    Stream(Mutex<Option<mpsc::Sender<Bytes>>>),
    Poll(PollQueue),
}

/// Server side of one physical tunnel connection.
pub struct Connection {
    /// Connection identity.
    pub id: ConnectionId,
    physical: PhysicalRequest,
    chain: Mutex<WriterChain>,
    outlet: Outlet,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    heartbeat_scheduled: AtomicBool,
    dropped_frames: AtomicU64,
    /// Serializes inbound frames so they are processed in arrival order.
    pub(crate) inbound: tokio::sync::Mutex<()>,
    /// When this connection was established.
    pub connected_at: Instant,
}

impl Connection {
    /// A WebSocket or SSE connection whose frames are sent through `tx`.
    pub fn streaming(id: ConnectionId, physical: PhysicalRequest, tx: mpsc::Sender<Bytes>) -> Self {
        Self::with_outlet(id, physical, Outlet::Stream(Mutex::new(Some(tx))))
    }

    /// A long-poll session whose frames are queued for continuation polls.
    /// At most `capacity` frames are held; further frames are dropped.
    pub fn polling(id: ConnectionId, physical: PhysicalRequest, capacity: usize) -> Self {
        Self::with_outlet(
            id,
            physical,
            Outlet::Poll(PollQueue {
                frames: Mutex::new(VecDeque::new()),
                capacity,
                notify: Notify::new(),
                last_poll: Mutex::new(tokio::time::Instant::now()),
            }),
        )
    }

    fn with_outlet(id: ConnectionId, physical: PhysicalRequest, outlet: Outlet) -> Self {
        Self {
            id,
            physical,
            chain: Mutex::new(WriterChain::new()),
            outlet,
            state: Mutex::new(ConnectionState::Idle),
            closed: AtomicBool::new(false),
            heartbeat_scheduled: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
            inbound: tokio::sync::Mutex::new(()),
            connected_at: Instant::now(),
        }
    }

    /// Transport this connection arrived on.
    pub fn transport(&self) -> TransportKind {
        self.physical.transport
    }

    /// The physical request that opened this connection.
    pub fn physical(&self) -> &PhysicalRequest {
        &self.physical
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next`. A closed connection stays closed.
    pub fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the connection. Returns `true` on the first call only.
    ///
    /// Streaming outlets drop their sender so the socket task ends; pending
    /// polls are woken.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.lock() = ConnectionState::Closed;
        match &self.outlet {
            Outlet::Stream(tx) => drop(tx.lock().take()),
            Outlet::Poll(queue) => {
                queue.frames.lock().clear();
                queue.notify.notify_waiters();
            }
        }
        true
    }

    /// Claim the one-time heartbeat registration for this connection.
    /// Returns `true` only for the first caller.
    pub fn mark_heartbeat_scheduled(&self) -> bool {
        !self.heartbeat_scheduled.swap(true, Ordering::AcqRel)
    }

    /// Whether the heartbeat registration has been claimed.
    pub fn heartbeat_scheduled(&self) -> bool {
        self.heartbeat_scheduled.load(Ordering::Acquire)
    }

    /// Put `interceptor` at the front of the writer chain unless already present.
    pub fn attach_interceptor(&self, interceptor: Arc<dyn PayloadInterceptor>) -> bool {
        self.chain.lock().insert_first_if_absent(interceptor)
    }

    /// Interceptor names in application order.
    pub fn interceptors(&self) -> Vec<&'static str> {
        self.chain.lock().names()
    }

    /// Run `payload` through the writer chain and hand it to the outlet.
    ///
    /// Returns `false` when the frame was not delivered: the connection is
    /// closed or its send queue is full.
    pub fn write(&self, ctx: &WriteContext, payload: Bytes) -> bool {
        if self.is_closed() {
            debug!(connection_id = %self.id, "write after disconnect ignored");
            return false;
        }
        let frame = self.chain.lock().apply(ctx, payload);
        self.deliver(frame)
    }

    fn deliver(&self, frame: Bytes) -> bool {
        match &self.outlet {
            Outlet::Stream(tx) => {
                let guard = tx.lock();
                let Some(tx) = guard.as_ref() else {
                    return false;
                };
                match tx.try_send(frame) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => self.drop_frame(),
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            }
            Outlet::Poll(queue) => {
                {
                    let mut frames = queue.frames.lock();
                    if frames.len() >= queue.capacity {
                        drop(frames);
                        return self.drop_frame();
                    }
                    frames.push_back(frame);
                }
                queue.notify.notify_one();
                true
            }
        }
    }

    fn drop_frame(&self) -> bool {
        let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(connection_id = %self.id, dropped, "send queue full, dropping frame");
        false
    }

    /// Frames dropped because the send queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Frames queued for the next poll. Always zero for streaming outlets.
    pub fn queued_frames(&self) -> usize {
        match &self.outlet {
            Outlet::Stream(_) => 0,
            Outlet::Poll(queue) => queue.frames.lock().len(),
        }
    }

    /// Wait up to `timeout` for the next queued frame of a long-poll session.
    ///
    /// Returns `None` on timeout, on close, and for streaming connections.
    pub async fn next_frame(&self, timeout: Duration) -> Option<Bytes> {
        let Outlet::Poll(queue) = &self.outlet else {
            return None;
        };
        *queue.last_poll.lock() = tokio::time::Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let frame = loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            if let Some(frame) = queue.frames.lock().pop_front() {
                break Some(frame);
            }
            if self.is_closed() {
                break None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break None;
            }
        };

        *queue.last_poll.lock() = tokio::time::Instant::now();
        frame
    }

    /// Time since the last continuation poll. Zero for streaming connections.
    pub fn idle_for(&self) -> Duration {
        match &self.outlet {
            Outlet::Stream(_) => Duration::ZERO,
            Outlet::Poll(queue) => queue.last_poll.lock().elapsed(),
        }
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("transport", &self.transport())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
