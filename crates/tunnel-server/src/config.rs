//! Server configuration.

use std::time::Duration;

use tunnel_settings::TunnelSettings;

/// Runtime configuration for the tunnel server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Path the tunnel routes are mounted under.
    pub mount_path: String,
    /// Outbound frames buffered per streaming connection.
    pub max_send_queue: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Heartbeat group streaming connections join; `None` disables heartbeats.
    pub heartbeat_group: Option<String>,
    /// Interval between heartbeat frames.
    pub heartbeat_interval: Duration,
    /// How long a continuation poll waits for a frame.
    pub poll_timeout: Duration,
    /// Long-poll sessions idle longer than this are disconnected.
    pub session_ttl: Duration,
    /// Interval between stale-session sweeps.
    pub cleanup_interval: Duration,
    /// Frame long-poll replies with their correlation id.
    pub wrap_long_poll: bool,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            mount_path: "/".into(),
            max_send_queue: 256,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            heartbeat_group: Some("/resttunnel.heartbeat".into()),
            heartbeat_interval: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(30),
            session_ttl: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(60),
            wrap_long_poll: false,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Derive the server configuration from loaded settings.
    pub fn from_settings(settings: &TunnelSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            mount_path: settings.server.mount_path.clone(),
            max_send_queue: settings.server.max_send_queue,
            max_message_size: settings.server.max_message_size,
            heartbeat_group: settings
                .heartbeat
                .enabled
                .then(|| settings.heartbeat.group.clone()),
            heartbeat_interval: settings.heartbeat.interval(),
            poll_timeout: Duration::from_secs(settings.long_poll.poll_timeout_secs),
            session_ttl: Duration::from_secs(settings.long_poll.session_ttl_secs),
            cleanup_interval: Duration::from_secs(settings.long_poll.cleanup_interval_secs),
            wrap_long_poll: settings.long_poll.wrap_responses,
            ..Self::default()
        }
    }

    /// Mount path without a trailing slash; empty for the root.
    pub fn mount_prefix(&self) -> &str {
        self.mount_path.trim_end_matches('/')
    }
}
