//! Heartbeat broadcasting.
//!
//! Connections subscribe to a named [`HeartbeatGroup`]. The first
//! subscription starts the group's single repeating timer; each tick writes
//! `{"heartbeat": "<id>", "time": <epoch-ms>}` to every member as a control
//! frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use tunnel_core::{ConnectionId, HeartbeatId, WriteContext};

use crate::connection::Connection;

/// One broadcast group with at most one running timer.
pub struct HeartbeatGroup {
    name: String,
    id: HeartbeatId,
    interval: Duration,
    members: DashMap<ConnectionId, Arc<Connection>>,
    scheduled: AtomicBool,
    ticks: AtomicU64,
    timers_started: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl HeartbeatGroup {
    fn new(
        name: String,
        interval: Duration,
        timers_started: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            id: HeartbeatId::new(),
            interval,
            members: DashMap::new(),
            scheduled: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            timers_started,
            cancel,
        }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity stamped into this group's heartbeat frames.
    pub fn id(&self) -> &HeartbeatId {
        &self.id
    }

    /// Add `connection` to the group, starting the timer if none is running.
    /// Returns `false` if the connection was already a member.
    pub fn subscribe(self: &Arc<Self>, connection: Arc<Connection>) -> bool {
        let id = connection.id.clone();
        let added = self.members.insert(id.clone(), connection).is_none();
        if added {
            debug!(
                group = %self.name,
                connection_id = %id,
                members = self.members.len(),
                "heartbeat subscribe"
            );
        }
        let _ = self.schedule_fixed_broadcast();
        added
    }

    /// Remove a member. Returns whether it was present.
    pub fn unsubscribe(&self, id: &ConnectionId) -> bool {
        self.members.remove(id).is_some()
    }

    /// Start the repeating broadcast unless it is already running.
    /// Returns `true` if this call started it.
    pub fn schedule_fixed_broadcast(self: &Arc<Self>) -> bool {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.timers_started.fetch_add(1, Ordering::Relaxed);
        info!(
            group = %self.name,
            heartbeat_id = %self.id,
            interval_secs = self.interval.as_secs(),
            "heartbeat timer started"
        );

        let group = Arc::clone(self);
        drop(tokio::spawn(async move {
            let start = time::Instant::now() + group.interval;
            let mut ticker = time::interval_at(start, group.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let delivered = group.broadcast();
                        trace!(group = %group.name, delivered, "heartbeat tick");
                    }
                    () = group.cancel.cancelled() => {
                        debug!(group = %group.name, "heartbeat timer stopped");
                        break;
                    }
                }
            }
        }));
        true
    }

    /// The heartbeat payload for the current instant.
    pub fn payload(&self) -> Bytes {
        let frame = serde_json::json!({
            "heartbeat": self.id.as_str(),
            "time": Utc::now().timestamp_millis(),
        });
        Bytes::from(frame.to_string())
    }

    /// Write one heartbeat to every member, dropping closed members.
    /// Returns the number of frames delivered.
    pub fn broadcast(&self) -> usize {
        let _ = self.ticks.fetch_add(1, Ordering::Relaxed);
        let payload = self.payload();
        let ctx = WriteContext::control();
        let mut delivered = 0;
        self.members.retain(|_, conn| {
            if conn.is_closed() {
                return false;
            }
            if conn.write(&ctx, payload.clone()) {
                delivered += 1;
            }
            true
        });
        delivered
    }

    /// Whether the timer is running.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Number of subscribed connections.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Broadcasts performed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// Named heartbeat groups sharing one interval and one shutdown token.
pub struct HeartbeatRegistry {
    groups: DashMap<String, Arc<HeartbeatGroup>>,
    interval: Duration,
    timers_started: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl HeartbeatRegistry {
    /// Create a registry whose timers stop when `cancel` fires.
    pub fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            groups: DashMap::new(),
            interval,
            timers_started: Arc::new(AtomicUsize::new(0)),
            cancel,
        }
    }

    /// Find the group called `name`, creating it on first use.
    pub fn lookup_or_create(&self, name: &str) -> Arc<HeartbeatGroup> {
        if let Some(group) = self.groups.get(name) {
            return Arc::clone(group.value());
        }
        let entry = self.groups.entry(name.to_string()).or_insert_with(|| {
            Arc::new(HeartbeatGroup::new(
                name.to_string(),
                self.interval,
                Arc::clone(&self.timers_started),
                self.cancel.child_token(),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Look up an existing group.
    pub fn get(&self, name: &str) -> Option<Arc<HeartbeatGroup>> {
        self.groups.get(name).map(|group| Arc::clone(group.value()))
    }

    /// Remove a connection from every group.
    pub fn unsubscribe_all(&self, id: &ConnectionId) -> usize {
        self.groups.iter().filter(|group| group.unsubscribe(id)).count()
    }

    /// Total memberships across groups.
    pub fn member_count(&self) -> usize {
        self.groups.iter().map(|group| group.member_count()).sum()
    }

    /// Timers started since creation.
    pub fn timers_started(&self) -> usize {
        self.timers_started.load(Ordering::Relaxed)
    }

    /// Stop every timer.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tunnel_core::{PhysicalRequest, TransportKind};

    fn streaming() -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(Connection::streaming(
            ConnectionId::new(),
            PhysicalRequest::new(TransportKind::WebSocket, "http://localhost"),
            tx,
        ));
        (conn, rx)
    }

    fn registry(interval: Duration) -> HeartbeatRegistry {
        HeartbeatRegistry::new(interval, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn five_subscribers_share_one_timer() {
        let registry = registry(Duration::from_secs(60));
        let group = registry.lookup_or_create("/resttunnel.heartbeat");
        let mut receivers = Vec::new();
        for _ in 0..5 {
            let (conn, rx) = streaming();
            assert!(group.subscribe(conn));
            receivers.push(rx);
        }
        assert_eq!(registry.timers_started(), 1);
        assert!(group.is_scheduled());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(group.ticks(), 1);

        for rx in &mut receivers {
            let frame = rx.try_recv().unwrap();
            let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
            assert_eq!(value["heartbeat"], group.id().as_str());
            assert!(value["time"].is_i64());
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn lookup_returns_same_group() {
        let registry = registry(Duration::from_secs(60));
        let a = registry.lookup_or_create("g");
        let b = registry.lookup_or_create("g");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("other").is_none());
    }

    #[tokio::test]
    async fn resubscribe_is_noop() {
        let registry = registry(Duration::from_secs(60));
        let group = registry.lookup_or_create("g");
        let (conn, _rx) = streaming();
        assert!(group.subscribe(Arc::clone(&conn)));
        assert!(!group.subscribe(conn));
        assert_eq!(group.member_count(), 1);
        assert_eq!(registry.timers_started(), 1);
    }

    #[tokio::test]
    async fn broadcast_drops_closed_members() {
        let registry = registry(Duration::from_secs(60));
        let group = registry.lookup_or_create("g");
        let (alive, mut alive_rx) = streaming();
        let (dead, _dead_rx) = streaming();
        let _ = group.subscribe(alive);
        let _ = group.subscribe(Arc::clone(&dead));
        let _ = dead.close();

        assert_eq!(group.broadcast(), 1);
        assert_eq!(group.member_count(), 1);
        assert!(alive_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_all_groups() {
        let registry = registry(Duration::from_secs(60));
        let (conn, _rx) = streaming();
        let _ = registry.lookup_or_create("a").subscribe(Arc::clone(&conn));
        let _ = registry.lookup_or_create("b").subscribe(Arc::clone(&conn));
        assert_eq!(registry.member_count(), 2);
        assert_eq!(registry.unsubscribe_all(&conn.id), 2);
        assert_eq!(registry.member_count(), 0);
        assert_eq!(registry.timers_started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_timers() {
        let registry = registry(Duration::from_secs(1));
        let group = registry.lookup_or_create("g");
        let (conn, _rx) = streaming();
        let _ = group.subscribe(conn);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(group.ticks(), 1);

        registry.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(group.ticks(), 1);
    }

    #[test]
    fn payload_shape() {
        let registry = registry(Duration::from_secs(60));
        let group = registry.lookup_or_create("g");
        let value: serde_json::Value = serde_json::from_slice(&group.payload()).unwrap();
        assert!(value["heartbeat"].as_str().unwrap().starts_with("hb_"));
        assert!(value["time"].as_i64().unwrap() > 0);
    }
}
