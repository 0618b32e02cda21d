// =============================================================================
// Engine Configuration — tunable timings and capacities
// =============================================================================
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file. File I/O failures surface as persistence
// errors, like the state files.
// =============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_tick_channel_capacity() -> usize {
    16
}

fn default_tick_min_process_interval_ms() -> u64 {
    100
}

fn default_fill_poll_attempts() -> u8 {
    3
}

fn default_fill_poll_interval_ms() -> u64 {
    500
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

fn default_auto_save_interval_ms() -> u64 {
    300_000
}

fn default_data_dir() -> String {
    "./data".to_string()
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Engine-wide tunables. Every field has a serde default so that older JSON
/// files missing new fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of each strategy's tick ring; overflow drops the oldest tick.
    #[serde(default = "default_tick_channel_capacity")]
    pub tick_channel_capacity: usize,

    /// Floor between two state-machine runs when the price has not changed.
    #[serde(default = "default_tick_min_process_interval_ms")]
    pub tick_min_process_interval_ms: u64,

    /// How many times to poll `get_fills` for a pending order.
    #[serde(default = "default_fill_poll_attempts")]
    pub fill_poll_attempts: u8,

    /// Delay between fill polls.
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,

    /// How long `stop_strategy` waits for a graceful trader exit before
    /// forcing it.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Interval of the periodic background save.
    #[serde(default = "default_auto_save_interval_ms")]
    pub auto_save_interval_ms: u64,

    /// Directory holding the per-market state files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_channel_capacity: default_tick_channel_capacity(),
            tick_min_process_interval_ms: default_tick_min_process_interval_ms(),
            fill_poll_attempts: default_fill_poll_attempts(),
            fill_poll_interval_ms: default_fill_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            auto_save_interval_ms: default_auto_save_interval_ms(),
            data_dir: default_data_dir(),
        }
    }
}

impl EngineConfig {
    /// Read a config file. A missing or unparseable file is reported as a
    /// persistence error; callers fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Persistence(format!("read {path:?}: {e}")))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| EngineError::Persistence(format!("parse {path:?}: {e}")))?;

        info!(
            path = %path.display(),
            tick_capacity = config.tick_channel_capacity,
            auto_save_ms = config.auto_save_interval_ms,
            "engine config loaded"
        );
        Ok(config)
    }

    /// Write the config through a tmp sibling and rename it into place, the
    /// same crash-safe pattern the state files use.
    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");

        let content = serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::Persistence(format!("serialize config: {e}")))?;
        std::fs::write(&tmp_path, &content)
            .map_err(|e| EngineError::Persistence(format!("write {tmp_path:?}: {e}")))?;
        std::fs::rename(&tmp_path, path)
            .map_err(|e| EngineError::Persistence(format!("rename to {path:?}: {e}")))?;

        debug!(path = %path.display(), "engine config written");
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
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tick_channel_capacity, 16);
        assert_eq!(cfg.tick_min_process_interval_ms, 100);
        assert_eq!(cfg.fill_poll_attempts, 3);
        assert_eq!(cfg.fill_poll_interval_ms, 500);
        assert_eq!(cfg.stop_timeout_ms, 2000);
        assert_eq!(cfg.auto_save_interval_ms, 300_000);
        assert_eq!(cfg.data_dir, "./data");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.tick_channel_capacity, 16);
        assert_eq!(cfg.stop_timeout_ms, 2000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "fill_poll_attempts": 5, "data_dir": "/var/lattice" }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.fill_poll_attempts, 5);
        assert_eq!(cfg.data_dir, "/var/lattice");
        assert_eq!(cfg.fill_poll_interval_ms, 500);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.tick_channel_capacity, cfg2.tick_channel_capacity);
        assert_eq!(cfg.auto_save_interval_ms, cfg2.auto_save_interval_ms);
    }

    #[test]
    fn saved_file_reloads() {
        let path = std::env::temp_dir().join(format!(
            "lattice-config-{}.json",
            uuid::Uuid::new_v4().simple()
        ));

        let mut cfg = EngineConfig::default();
        cfg.fill_poll_attempts = 7;
        cfg.data_dir = "/tmp/lattice".into();
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.fill_poll_attempts, 7);
        assert_eq!(loaded.data_dir, "/tmp/lattice");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_is_a_persistence_error() {
        let err = EngineConfig::load("/nonexistent/lattice/engine_config.json").unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
    }
}
