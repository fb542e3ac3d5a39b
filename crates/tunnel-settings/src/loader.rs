//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TunnelSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `TUNNEL_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::TunnelSettings;

/// Resolve the path to the settings file (`~/.resttunnel/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".resttunnel").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TunnelSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TunnelSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<TunnelSettings> {
    let defaults = serde_json::to_value(TunnelSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut TunnelSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
pub fn apply_overrides(settings: &mut TunnelSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("TUNNEL_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_parsed(&lookup, "TUNNEL_PORT", |v| parse_u16_range(v, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = string("TUNNEL_MOUNT_PATH") {
        settings.server.mount_path = v;
    }

    // ── Heartbeat ───────────────────────────────────────────────────
    if let Some(v) =
        read_parsed(&lookup, "TUNNEL_HEARTBEAT_INTERVAL", |v| parse_u64_range(v, 1, 86_400))
    {
        settings.heartbeat.interval_secs = v;
    }
    if let Some(v) = read_parsed(&lookup, "TUNNEL_HEARTBEAT_ENABLED", parse_bool) {
        settings.heartbeat.enabled = v;
    }

    // ── Long-poll ───────────────────────────────────────────────────
    if let Some(v) = read_parsed(&lookup, "TUNNEL_LONG_POLL_WRAP", parse_bool) {
        settings.long_poll.wrap_responses = v;
    }

    // ── Upstream ────────────────────────────────────────────────────
    if let Some(v) = string("TUNNEL_UPSTREAM_URL") {
        settings.upstream.base_url = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("TUNNEL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_parsed(&lookup, "TUNNEL_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

fn read_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = lookup(name)?;
    let result = parse(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
