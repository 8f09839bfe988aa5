// =============================================================================
// Process Settings — engine-wide configuration with atomic save
// =============================================================================
//
// These are the settings of the *process*, not of any single bot: listen
// address, filesystem locations, supervisor deadlines. Per-bot configuration
// lives in the durable store (`config::BotConfig`) and is re-read each cycle.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older settings file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_status_dir() -> String {
    "status".to_string()
}

fn default_logs_dir() -> String {
    "logs".to_string()
}

fn default_config_cache_ttl_s() -> u64 {
    60
}

fn default_maintenance_every_cycles() -> u64 {
    50
}

fn default_stop_drain_deadline_s() -> u64 {
    10
}

fn default_node_timeout_s() -> u64 {
    300
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level process settings for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Control-plane listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory where workers publish `bot_{id}.json` status files.
    #[serde(default = "default_status_dir")]
    pub status_dir: String,

    /// Directory where workers write `bot_{id}.log` files.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,

    /// How long a worker may serve a cached `BotConfig` before re-reading
    /// the store (seconds).
    #[serde(default = "default_config_cache_ttl_s")]
    pub config_cache_ttl_s: u64,

    /// Every N cycles the worker runs a maintenance pass: store session
    /// refresh, cache prune, subscription reconcile, durable status write.
    #[serde(default = "default_maintenance_every_cycles")]
    pub maintenance_every_cycles: u64,

    /// How long `stop` waits for a worker to drain before force-killing it
    /// (seconds).
    #[serde(default = "default_stop_drain_deadline_s")]
    pub stop_drain_deadline_s: u64,

    /// Default wall-clock budget for a single pipeline node (seconds);
    /// individual nodes may override via their config.
    #[serde(default = "default_node_timeout_s")]
    pub node_timeout_s: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            status_dir: default_status_dir(),
            logs_dir: default_logs_dir(),
            config_cache_ttl_s: default_config_cache_ttl_s(),
            maintenance_every_cycles: default_maintenance_every_cycles(),
            stop_drain_deadline_s: default_stop_drain_deadline_s(),
            node_timeout_s: default_node_timeout_s(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(path = %path.display(), bind_addr = %settings.bind_addr, "settings loaded");
        Ok(settings)
    }

    /// Persist the current settings to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.bind_addr, "0.0.0.0:3001");
        assert_eq!(s.config_cache_ttl_s, 60);
        assert_eq!(s.maintenance_every_cycles, 50);
        assert_eq!(s.stop_drain_deadline_s, 10);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{ "bind_addr": "127.0.0.1:9000" }"#).unwrap();
        assert_eq!(s.bind_addr, "127.0.0.1:9000");
        assert_eq!(s.status_dir, "status");
    }

    #[test]
    fn roundtrip_serialisation() {
        let s = Settings::default();
        let json = serde_json::to_string(&s).unwrap();
        let s2: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(s.bind_addr, s2.bind_addr);
        assert_eq!(s.node_timeout_s, s2.node_timeout_s);
    }
}
