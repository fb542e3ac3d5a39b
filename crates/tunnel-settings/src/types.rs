//! Settings types.
//!
//! Every section deserializes with `#[serde(default)]`, so a settings file
//! only needs the keys it changes. Keys are camelCase on disk.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelSettings {
    /// Listener and per-connection limits.
    pub server: ServerSettings,
    /// Keep-alive broadcasting.
    pub heartbeat: HeartbeatSettings,
    /// Long-poll sessions.
    pub long_poll: LongPollSettings,
    /// Upstream REST service the tunnel proxies to.
    pub upstream: UpstreamSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl TunnelSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !self.server.mount_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.mountPath must start with '/', got {:?}",
                self.server.mount_path
            )));
        }
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue("server.maxSendQueue must be positive".into()));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.intervalSecs must be positive".into(),
            ));
        }
        if self.long_poll.poll_timeout_secs == 0 || self.long_poll.cleanup_interval_secs == 0 {
            return Err(SettingsError::InvalidValue("longPoll timeouts must be positive".into()));
        }
        if self.long_poll.poll_timeout_secs >= self.long_poll.session_ttl_secs {
            return Err(SettingsError::InvalidValue(format!(
                "longPoll.pollTimeoutSecs ({}) must be shorter than longPoll.sessionTtlSecs ({})",
                self.long_poll.poll_timeout_secs, self.long_poll.session_ttl_secs
            )));
        }
        if let Some(url) = &self.upstream.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SettingsError::InvalidValue(format!(
                    "upstream.baseUrl must be an http(s) URL, got {url:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Path the tunnel routes are mounted under.
    pub mount_path: String,
    /// Outbound frames buffered per streaming connection before dropping.
    pub max_send_queue: usize,
    /// Largest accepted WebSocket message or envelope body, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8082,
            mount_path: "/".to_string(),
            max_send_queue: 256,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Heartbeat settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Subscribe streaming connections to heartbeats.
    pub enabled: bool,
    /// Seconds between heartbeat frames.
    pub interval_secs: u64,
    /// Name of the heartbeat group streaming connections join.
    pub group: String,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            group: "/resttunnel.heartbeat".to_string(),
        }
    }
}

impl HeartbeatSettings {
    /// Heartbeat interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Long-poll settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LongPollSettings {
    /// How long a continuation poll waits for a frame before returning 204.
    pub poll_timeout_secs: u64,
    /// Sessions not polled for this long are disconnected.
    pub session_ttl_secs: u64,
    /// Frame long-poll replies with their correlation id.
    pub wrap_responses: bool,
    /// Seconds between stale-session sweeps.
    pub cleanup_interval_secs: u64,
}

impl Default for LongPollSettings {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 30,
            session_ttl_secs: 120,
            wrap_responses: false,
            cleanup_interval_secs: 60,
        }
    }
}

/// Upstream REST service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    /// Base URL synthetic requests are forwarded to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 30,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
