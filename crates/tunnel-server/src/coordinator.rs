//! Connection/session coordination.
//!
//! The [`Coordinator`] owns the pending registry and heartbeat groups and
//! drives each physical frame through parse → translate → dispatch:
//!
//! - WebSocket/SSE: every inbound message is one envelope. An empty or
//!   header-less message is a control frame; the first one on a connection
//!   suspends it and subscribes it to heartbeats.
//! - Long-poll: plain REST requests are dispatched with a sink that writes
//!   into the suspended session, whose queue is drained by continuation polls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_core::{
    ConnectionId, CorrelationInterceptor, Envelope, PayloadInterceptor, PhysicalRequest,
    SyntheticRequest, TransportKind, WriteContext,
};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::dispatch::{DispatchOutcome, RestDispatcher};
use crate::error::TunnelError;
use crate::heartbeat::HeartbeatRegistry;
use crate::registry::PendingRegistry;
use crate::sink::ResponseSink;

/// One physical inbound message.
///
/// The dispatched flag guards against the transport delivering the same
/// message twice.
#[derive(Debug)]
pub struct InboundFrame {
    payload: Bytes,
    dispatched: AtomicBool,
}

impl InboundFrame {
    /// Wrap a received message.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            dispatched: AtomicBool::new(false),
        }
    }

    /// The empty opening frame of a streaming connection.
    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// Raw message bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Claim the frame for dispatch. Returns `true` only once.
    pub fn claim(&self) -> bool {
        !self.dispatched.swap(true, Ordering::AcqRel)
    }

    /// Whether the frame has been claimed.
    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }
}

/// Coordinator behaviour knobs.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Heartbeat group streaming connections join; `None` disables heartbeats.
    pub heartbeat_group: Option<String>,
    /// Frame long-poll replies with their correlation id.
    pub wrap_long_poll: bool,
    /// Outbound frames buffered per streaming connection.
    pub send_queue: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for CoordinatorConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_group: config.heartbeat_group.clone(),
            wrap_long_poll: config.wrap_long_poll,
            send_queue: config.max_send_queue,
        }
    }
}

/// Supervises every tunnel connection.
pub struct Coordinator {
    registry: Arc<PendingRegistry>,
    heartbeats: Arc<HeartbeatRegistry>,
    dispatcher: Arc<dyn RestDispatcher>,
    interceptor: Arc<dyn PayloadInterceptor>,
    config: CoordinatorConfig,
}

impl Coordinator {
    /// Create a coordinator.
    pub fn new(
        registry: Arc<PendingRegistry>,
        heartbeats: Arc<HeartbeatRegistry>,
        dispatcher: Arc<dyn RestDispatcher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            heartbeats,
            dispatcher,
            interceptor: Arc::new(CorrelationInterceptor),
            config,
        }
    }

    /// The pending registry.
    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.registry
    }

    /// The heartbeat groups.
    pub fn heartbeats(&self) -> &Arc<HeartbeatRegistry> {
        &self.heartbeats
    }

    /// Look up a suspended connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    /// Number of suspended connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Open a WebSocket or SSE connection. The opening counts as the empty
    /// control frame: the connection is suspended and joins the heartbeat group.
    pub async fn open_streaming(
        &self,
        physical: PhysicalRequest,
    ) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(self.config.send_queue);
        let transport = physical.transport;
        let conn = Arc::new(Connection::streaming(ConnectionId::new(), physical, tx));
        info!(connection_id = %conn.id, %transport, "connection opened");

        if let Err(e) = self.handle_frame(&conn, &InboundFrame::empty()).await {
            warn!(connection_id = %conn.id, error = %e, "opening frame failed");
        }
        (conn, rx)
    }

    /// Open a long-poll session, suspended until disconnect or expiry.
    pub fn open_long_poll(&self, physical: PhysicalRequest) -> Arc<Connection> {
        let conn = Arc::new(Connection::polling(
            ConnectionId::new(),
            physical,
            self.config.send_queue,
        ));
        info!(connection_id = %conn.id, transport = %TransportKind::LongPoll, "connection opened");
        self.suspend(&conn);
        conn
    }

    /// Register `conn` as suspended and route its output through the
    /// correlation interceptor. Idempotent.
    pub fn suspend(&self, conn: &Arc<Connection>) {
        if conn.is_closed() {
            return;
        }
        let registered = self.registry.register(Arc::clone(conn));
        let _ = conn.attach_interceptor(Arc::clone(&self.interceptor));
        conn.set_state(ConnectionState::Suspended);
        if registered {
            info!(connection_id = %conn.id, transport = %conn.transport(), "connection suspended");
        }
    }

    /// Process one inbound message on a WebSocket or SSE connection.
    ///
    /// Frames on one connection are handled in arrival order; a frame is
    /// dispatched at most once. Malformed envelopes are logged and dropped
    /// without closing the connection.
    pub async fn handle_frame(
        &self,
        conn: &Arc<Connection>,
        frame: &InboundFrame,
    ) -> Result<DispatchOutcome, TunnelError> {
        let _ordered = conn.inbound.lock().await;

        if conn.is_closed() {
            debug!(connection_id = %conn.id, "frame on closed connection ignored");
            return Ok(DispatchOutcome::Cancelled);
        }
        if !frame.claim() {
            debug!(connection_id = %conn.id, "frame already dispatched");
            return Ok(DispatchOutcome::Cancelled);
        }

        let envelope = Envelope::from_slice(frame.payload()).inspect_err(|e| {
            warn!(connection_id = %conn.id, error = %e, "dropping malformed envelope");
        })?;

        if envelope.headers().is_empty() && !envelope.has_body() {
            return Ok(self.control_frame(conn));
        }

        let request = SyntheticRequest::from_envelope(envelope, conn.physical()).inspect_err(|e| {
            warn!(connection_id = %conn.id, error = %e, "dropping untranslatable envelope");
        })?;

        let context = WriteContext {
            correlation_id: request.correlation_id.clone(),
        };
        self.run(conn, request, ResponseSink::new(Arc::clone(conn), context)).await
    }

    fn control_frame(&self, conn: &Arc<Connection>) -> DispatchOutcome {
        if !conn.transport().carries_envelopes() || !conn.mark_heartbeat_scheduled() {
            debug!(connection_id = %conn.id, "control frame ignored");
            return DispatchOutcome::Cancelled;
        }
        self.suspend(conn);
        if let Some(name) = &self.config.heartbeat_group {
            let _ = self.heartbeats.lookup_or_create(name).subscribe(Arc::clone(conn));
        }
        DispatchOutcome::Suspend
    }

    async fn run(
        &self,
        conn: &Arc<Connection>,
        request: SyntheticRequest,
        sink: ResponseSink,
    ) -> Result<DispatchOutcome, TunnelError> {
        conn.set_state(ConnectionState::Dispatching);
        let _ = conn.attach_interceptor(Arc::clone(&self.interceptor));
        debug!(
            connection_id = %conn.id,
            method = %request.method,
            path = request.path(),
            correlation_id = request.correlation_id.as_deref(),
            "dispatching"
        );

        match self.dispatcher.dispatch(request, sink.clone()).await {
            Ok(DispatchOutcome::Completed) => {
                sink.complete();
                conn.set_state(ConnectionState::Idle);
                Ok(DispatchOutcome::Completed)
            }
            Ok(DispatchOutcome::Suspend) => {
                self.suspend(conn);
                Ok(DispatchOutcome::Suspend)
            }
            Ok(DispatchOutcome::Cancelled) => {
                conn.set_state(ConnectionState::Idle);
                Ok(DispatchOutcome::Cancelled)
            }
            Err(e) => {
                warn!(connection_id = %conn.id, error = %e, "dispatch failed");
                let _ = sink.write_error(&e.to_string());
                conn.set_state(ConnectionState::Idle);
                Err(e.into())
            }
        }
    }

    /// Dispatch a plain long-poll request whose output goes to the suspended
    /// session `id`. Replies are framed only when long-poll wrapping is on.
    pub async fn forward_long_poll(
        &self,
        id: &ConnectionId,
        physical: &PhysicalRequest,
        method: Method,
        target: &str,
        body: Bytes,
    ) -> Result<DispatchOutcome, TunnelError> {
        let target_conn = self
            .registry
            .get(id)
            .ok_or_else(|| TunnelError::UnknownConnection(id.clone()))?;
        let _ordered = target_conn.inbound.lock().await;

        let request =
            SyntheticRequest::from_parts(method, target, &physical.headers, body, physical)?;
        let context = if self.config.wrap_long_poll {
            WriteContext {
                correlation_id: request.correlation_id.clone(),
            }
        } else {
            WriteContext::control()
        };
        let sink = ResponseSink::new(Arc::clone(&target_conn), context);
        self.run(&target_conn, request, sink).await
    }

    /// Wait for the next frame of long-poll session `id`.
    pub async fn poll(
        &self,
        id: &ConnectionId,
        timeout: Duration,
    ) -> Result<Option<Bytes>, TunnelError> {
        let conn = self
            .registry
            .get(id)
            .ok_or_else(|| TunnelError::UnknownConnection(id.clone()))?;
        Ok(conn.next_frame(timeout).await)
    }

    /// Tear down a connection: unregister it, drop its heartbeat membership
    /// and close it. Safe to call more than once.
    pub fn disconnect(&self, conn: &Arc<Connection>) {
        let _ = self.registry.remove(&conn.id);
        let _ = self.heartbeats.unsubscribe_all(&conn.id);
        if conn.close() {
            info!(
                connection_id = %conn.id,
                transport = %conn.transport(),
                age_secs = conn.age().as_secs(),
                dropped_frames = conn.dropped_frames(),
                "connection closed"
            );
        }
    }

    /// Disconnect by id.
    pub fn disconnect_id(&self, id: &ConnectionId) -> Result<(), TunnelError> {
        let conn = self
            .registry
            .get(id)
            .ok_or_else(|| TunnelError::UnknownConnection(id.clone()))?;
        self.disconnect(&conn);
        Ok(())
    }

    /// Disconnect long-poll sessions idle longer than `ttl`. Returns how many.
    pub fn reap_idle_polls(&self, ttl: Duration) -> usize {
        let stale = self.registry.stale_polls(ttl);
        for conn in &stale {
            self.disconnect(conn);
        }
        stale.len()
    }

    /// Disconnect everything and stop heartbeat timers.
    pub fn shutdown(&self) {
        for conn in self.registry.connections() {
            self.disconnect(&conn);
        }
        self.heartbeats.shutdown();
    }
}

/// Periodically disconnect stale long-poll sessions until `cancel` fires.
pub fn start_cleanup_task(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = coordinator.reap_idle_polls(ttl);
                    if removed > 0 {
                        info!(removed, "stale long-poll cleanup");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::error::DispatchError;

    const GROUP: &str = "/resttunnel.heartbeat";

    /// Records requests and answers from a fixed script.
    #[derive(Default)]
    struct ScriptedDispatcher {
        seen: Mutex<Vec<(Method, String, Option<Bytes>)>>,
        calls: AtomicUsize,
        fail: bool,
        suspend: bool,
    }

    #[async_trait]
    impl RestDispatcher for ScriptedDispatcher {
        async fn dispatch(
            &self,
            request: SyntheticRequest,
            sink: ResponseSink,
        ) -> Result<DispatchOutcome, DispatchError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .push((request.method.clone(), request.uri.to_string(), request.body.clone()));
            if self.fail {
                return Err(DispatchError::Body("backend exploded".into()));
            }
            if request.path() == "/topics" {
                let _ = sink.write(Bytes::from_static(br#"["topic-a"]"#));
            }
            if self.suspend {
                let _ = sink.write(Bytes::from_static(b"\"partial\""));
                return Ok(DispatchOutcome::Suspend);
            }
            Ok(DispatchOutcome::Completed)
        }
    }

    fn coordinator_with(
        dispatcher: ScriptedDispatcher,
        config: CoordinatorConfig,
    ) -> (Coordinator, Arc<ScriptedDispatcher>) {
        let dispatcher = Arc::new(dispatcher);
        let coordinator = Coordinator::new(
            Arc::new(PendingRegistry::new()),
            Arc::new(HeartbeatRegistry::new(Duration::from_secs(60), CancellationToken::new())),
            Arc::clone(&dispatcher) as Arc<dyn RestDispatcher>,
            config,
        );
        (coordinator, dispatcher)
    }

    fn coordinator() -> (Coordinator, Arc<ScriptedDispatcher>) {
        coordinator_with(ScriptedDispatcher::default(), CoordinatorConfig::default())
    }

    fn physical(transport: TransportKind) -> PhysicalRequest {
        PhysicalRequest::new(transport, "http://localhost:8082")
    }

    #[tokio::test]
    async fn opening_suspends_and_subscribes_once() {
        let (coord, _) = coordinator();
        let (conn, _rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;

        assert_eq!(conn.state(), ConnectionState::Suspended);
        assert!(conn.heartbeat_scheduled());
        assert!(coord.registry().contains(&conn.id));
        let group = coord.heartbeats().get(GROUP).unwrap();
        assert_eq!(group.member_count(), 1);
        assert_eq!(conn.interceptors(), vec!["correlation"]);

        let outcome = coord.handle_frame(&conn, &InboundFrame::empty()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Cancelled);
        assert_eq!(group.member_count(), 1);
        assert_eq!(coord.heartbeats().timers_started(), 1);
        assert_eq!(conn.interceptors().len(), 1);
    }

    #[tokio::test]
    async fn empty_object_is_a_control_frame() {
        let (coord, dispatcher) = coordinator();
        let (conn, _rx) = coord.open_streaming(physical(TransportKind::Sse)).await;
        let outcome = coord.handle_frame(&conn, &InboundFrame::new("  { }  ")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Cancelled);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn topics_request_is_wrapped() {
        let (coord, dispatcher) = coordinator();
        let (conn, mut rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;

        let frame = InboundFrame::new(r#"{"id": "1", "method": "GET", "path": "/topics"}"#);
        let outcome = coord.handle_frame(&conn, &frame).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(
            rx.recv().await.unwrap(),
            Bytes::from_static(br#"{"id": "1", "data": ["topic-a"]}"#)
        );
        assert_eq!(conn.state(), ConnectionState::Idle);
        let seen = dispatcher.seen.lock();
        assert_eq!(seen[0].0, Method::GET);
        assert_eq!(seen[0].1, "/topics");
        assert!(seen[0].2.is_none());
    }

    #[tokio::test]
    async fn uncorrelated_reply_is_raw() {
        let (coord, _) = coordinator();
        let (conn, mut rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;
        let frame = InboundFrame::new(r#"{"path": "/topics"}"#);
        let _ = coord.handle_frame(&conn, &frame).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(br#"["topic-a"]"#));
    }

    #[tokio::test]
    async fn correlated_request_without_output_gets_null_reply() {
        let (coord, _) = coordinator();
        let (conn, mut rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;
        let frame = InboundFrame::new(r#"{"id": "7", "method": "DELETE", "path": "/topics/a"}"#);
        let _ = coord.handle_frame(&conn, &frame).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(br#"{"id": "7", "data": null}"#));
    }

    #[tokio::test]
    async fn duplicate_frame_dispatched_once() {
        let (coord, dispatcher) = coordinator();
        let (conn, _rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;
        let frame = InboundFrame::new(r#"{"id": "d", "path": "/topics"}"#);

        let first = coord.handle_frame(&conn, &frame).await.unwrap();
        let second = coord.handle_frame(&conn, &frame).await.unwrap();

        assert_eq!(first, DispatchOutcome::Completed);
        assert_eq!(second, DispatchOutcome::Cancelled);
        assert!(frame.is_dispatched());
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_envelope_is_dropped_and_connection_survives() {
        let (coord, dispatcher) = coordinator();
        let (conn, mut rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;

        let err = coord.handle_frame(&conn, &InboundFrame::new(r#"{"id" "1"}"#)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Envelope(_)));
        assert!(!err.is_fatal());
        assert!(!conn.is_closed());

        let next = InboundFrame::new(r#"{"id": "2", "path": "/topics"}"#);
        let ok = coord.handle_frame(&conn, &next).await;
        assert_eq!(ok.unwrap(), DispatchOutcome::Completed);
        assert!(rx.recv().await.is_some());
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn untranslatable_envelope_is_dropped() {
        let (coord, _) = coordinator();
        let (conn, _rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;
        let err = coord
            .handle_frame(&conn, &InboundFrame::new(r#"{"method": "NOT A METHOD"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Translate(_)));
    }

    #[tokio::test]
    async fn dispatch_error_is_reported_to_client() {
        let dispatcher = ScriptedDispatcher {
            fail: true,
            ..ScriptedDispatcher::default()
        };
        let (coord, _) = coordinator_with(dispatcher, CoordinatorConfig::default());
        let (conn, mut rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;

        let err = coord
            .handle_frame(&conn, &InboundFrame::new(r#"{"id": "x", "path": "/boom"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Dispatch(_)));

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["id"], "x");
        assert_eq!(value["data"]["error"], "response body failed: backend exploded");
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn suspend_outcome_keeps_connection_registered() {
        let dispatcher = ScriptedDispatcher {
            suspend: true,
            ..ScriptedDispatcher::default()
        };
        let (coord, _) = coordinator_with(dispatcher, CoordinatorConfig::default());
        let (conn, _rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;
        let outcome = coord
            .handle_frame(&conn, &InboundFrame::new(r#"{"id": "s", "path": "/watch"}"#))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Suspend);
        assert_eq!(conn.state(), ConnectionState::Suspended);
        assert!(coord.registry().contains(&conn.id));
    }

    #[tokio::test]
    async fn body_is_passed_to_dispatcher() {
        let (coord, dispatcher) = coordinator();
        let (conn, _rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;
        let frame = InboundFrame::new(concat!(
            r#"{"id": "p", "method": "POST", "path": "/topics/a", "type": "application/json", "#,
            r#""data": {"records": [{"value": "S2Fma2E="}]}}"#
        ));
        let _ = coord.handle_frame(&conn, &frame).await.unwrap();
        let seen = dispatcher.seen.lock();
        assert_eq!(seen[0].0, Method::POST);
        assert_eq!(seen[0].2.as_deref(), Some(&br#"{"records": [{"value": "S2Fma2E="}]}"#[..]));
    }

    #[tokio::test]
    async fn disconnect_unregisters_and_silences_writes() {
        let (coord, _) = coordinator();
        let (conn, _rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;
        let sink = ResponseSink::new(Arc::clone(&conn), WriteContext::correlated("late"));

        coord.disconnect(&conn);
        coord.disconnect(&conn);

        assert!(!coord.registry().contains(&conn.id));
        assert_eq!(coord.heartbeats().member_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!sink.write(Bytes::from_static(b"{}")));

        let outcome = coord
            .handle_frame(&conn, &InboundFrame::new(r#"{"path": "/topics"}"#))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Cancelled);
    }

    #[tokio::test]
    async fn long_poll_output_lands_on_poll_response() {
        let (coord, _) = coordinator();
        let session = coord.open_long_poll(physical(TransportKind::LongPoll));
        assert_eq!(session.state(), ConnectionState::Suspended);
        assert!(!session.heartbeat_scheduled());

        let current = physical(TransportKind::LongPoll);
        let outcome = coord
            .forward_long_poll(&session.id, &current, Method::GET, "/topics", Bytes::new())
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed);

        let frame = coord.poll(&session.id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.unwrap(), Bytes::from_static(br#"["topic-a"]"#));
    }

    #[tokio::test]
    async fn long_poll_queue_bounded_by_send_queue() {
        let config = CoordinatorConfig {
            send_queue: 2,
            ..CoordinatorConfig::default()
        };
        let (coord, _) = coordinator_with(ScriptedDispatcher::default(), config);
        let session = coord.open_long_poll(physical(TransportKind::LongPoll));
        let current = physical(TransportKind::LongPoll);

        for _ in 0..5 {
            let _ = coord
                .forward_long_poll(&session.id, &current, Method::GET, "/topics", Bytes::new())
                .await
                .unwrap();
        }
        assert_eq!(session.queued_frames(), 2);
        assert_eq!(session.dropped_frames(), 3);
    }

    #[tokio::test]
    async fn long_poll_wrapping_is_configurable() {
        let config = CoordinatorConfig {
            wrap_long_poll: true,
            ..CoordinatorConfig::default()
        };
        let (coord, _) = coordinator_with(ScriptedDispatcher::default(), config);
        let session = coord.open_long_poll(physical(TransportKind::LongPoll));

        let mut headers = http::HeaderMap::new();
        let _ = headers.insert("x-correlation-id", http::HeaderValue::from_static("lp-1"));
        let current = physical(TransportKind::LongPoll).with_headers(headers);
        let _ = coord
            .forward_long_poll(&session.id, &current, Method::GET, "/topics", Bytes::new())
            .await
            .unwrap();

        let frame = coord.poll(&session.id, Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(frame, Bytes::from_static(br#"{"id": "lp-1", "data": ["topic-a"]}"#));
    }

    #[tokio::test]
    async fn long_poll_to_unknown_session() {
        let (coord, _) = coordinator();
        let id = ConnectionId::from_raw("conn_gone");
        let err = coord
            .forward_long_poll(
                &id,
                &physical(TransportKind::LongPoll),
                Method::GET,
                "/",
                Bytes::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::UnknownConnection(_)));
        assert!(coord.poll(&id, Duration::from_millis(1)).await.is_err());
        assert!(coord.disconnect_id(&id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_long_poll_sessions_are_reaped() {
        let (coord, _) = coordinator();
        let session = coord.open_long_poll(physical(TransportKind::LongPoll));
        let (stream, _rx) = coord.open_streaming(physical(TransportKind::Sse)).await;

        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(coord.reap_idle_polls(Duration::from_secs(120)), 1);
        assert!(session.is_closed());
        assert!(!stream.is_closed());
        assert_eq!(coord.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_runs_until_cancelled() {
        let (coord, _) = coordinator();
        let coord = Arc::new(coord);
        let session = coord.open_long_poll(physical(TransportKind::LongPoll));
        let cancel = CancellationToken::new();
        let handle = start_cleanup_task(
            Arc::clone(&coord),
            Duration::from_secs(10),
            Duration::from_secs(30),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(session.is_closed());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (coord, _) = coordinator();
        let (a, _rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;
        let b = coord.open_long_poll(physical(TransportKind::LongPoll));
        coord.shutdown();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(coord.connection_count(), 0);
    }

    #[tokio::test]
    async fn heartbeats_disabled() {
        let config = CoordinatorConfig {
            heartbeat_group: None,
            ..CoordinatorConfig::default()
        };
        let (coord, _) = coordinator_with(ScriptedDispatcher::default(), config);
        let (conn, _rx) = coord.open_streaming(physical(TransportKind::WebSocket)).await;
        assert_eq!(conn.state(), ConnectionState::Suspended);
        assert_eq!(coord.heartbeats().member_count(), 0);
    }
}
