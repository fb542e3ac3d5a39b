//! # tunnel-telemetry
//!
//! Installs the global `tracing` subscriber: an [`EnvFilter`] built from the
//! configured level and per-module overrides (`RUST_LOG` wins when set), with
//! human-readable or JSON output on stdout.

#![deny(unsafe_code)]

use std::str::FromStr;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Telemetry setup failures.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The level string is not a tracing level.
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    /// A global subscriber is already installed.
    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Per-module level overrides (e.g. `tunnel_core` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Config with the level parsed from `level` (`"info"`, `"DEBUG"`, ...).
    pub fn from_level_str(level: &str, json: bool) -> Result<Self, TelemetryError> {
        let log_level = Level::from_str(level.trim())
            .map_err(|_| TelemetryError::InvalidLevel(level.to_string()))?;
        Ok(Self {
            log_level,
            module_levels: Vec::new(),
            json,
        })
    }

    /// Add a per-module override.
    #[must_use]
    pub fn with_module_level(mut self, module: impl Into<String>, level: Level) -> Self {
        self.module_levels.push((module.into(), level));
        self
    }

    /// Filter directive string, e.g. `info,tunnel_server=debug`.
    pub fn filter_directives(&self) -> String {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push(',');
            directives.push_str(module);
            directives.push('=');
            directives.push_str(&level.to_string().to_lowercase());
        }
        directives
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()?;
    Ok(())
}
