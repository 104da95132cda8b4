//! Configuration
//!
//! Defaults → TOML file → environment overrides. Binaries apply their CLI flags
//! on top of the loaded value.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::models::StreamId;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "ticklog.toml";

/// Ceiling for every seconds-valued setting (one week).
pub const MAX_SECS: u64 = 7 * 24 * 3_600;

/// Ceiling for every millisecond-valued setting (one day).
pub const MAX_MS: u64 = 24 * 3_600 * 1_000;

// =============================================================================
// TOP LEVEL
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Streams handled by this process.
    pub streams: Vec<String>,
    pub storage: StorageConfig,
    pub writer: WriterConfig,
    pub rotation: RotationConfig,
    pub signal: SignalConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            streams: vec!["btc".to_string(), "eth".to_string(), "sol".to_string()],
            storage: StorageConfig::default(),
            writer: WriterConfig::default(),
            rotation: RotationConfig::default(),
            signal: SignalConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load with the standard precedence. A missing file is not an error; a
    /// malformed one is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let path: PathBuf = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("TICKLOG_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TICKLOG_STREAMS") {
            let streams: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !streams.is_empty() {
                self.streams = streams;
            }
        }
        if let Ok(v) = std::env::var("TICKLOG_DB_PATH") {
            self.storage.db_path = v;
        }
        env_parse("TICKLOG_BUSY_TIMEOUT_MS", &mut self.storage.busy_timeout_ms);

        env_parse("TICKLOG_FAILURE_THRESHOLD", &mut self.writer.failure_threshold);
        env_parse("TICKLOG_REPLAY_CAPACITY", &mut self.writer.replay_capacity);
        env_parse("TICKLOG_REPLAY_TTL_SECS", &mut self.writer.replay_ttl_secs);
        env_parse("TICKLOG_REPLAY_BATCH_SIZE", &mut self.writer.replay_batch_size);
        env_parse("TICKLOG_SIGNAL_POLL_MS", &mut self.writer.signal_poll_interval_ms);
        env_parse("TICKLOG_MAX_ERROR_COUNT", &mut self.writer.max_error_count);
        env_parse("TICKLOG_STATS_INTERVAL_SECS", &mut self.writer.stats_interval_secs);

        env_parse("TICKLOG_SETTLE_MS", &mut self.rotation.settle_ms);
        env_parse("TICKLOG_GRACE_MS", &mut self.rotation.grace_ms);
        env_parse("TICKLOG_ROTATION_JITTER_MS", &mut self.rotation.jitter_ms);
        env_parse("TICKLOG_STALE_SIGNAL_SECS", &mut self.rotation.stale_signal_secs);
        env_parse("TICKLOG_PRESERVE_PREVIOUS", &mut self.rotation.preserve_previous);
        if let Ok(v) = std::env::var("TICKLOG_EXPORT_DIR") {
            self.rotation.export_dir = PathBuf::from(v);
        }
        // Name kept from the original deployment scripts
        if let Ok(v) = std::env::var("EXPORT_DEBUG_MODE") {
            self.rotation.debug_mode = matches!(v.to_lowercase().as_str(), "1" | "true" | "on");
        }

        if let Ok(v) = std::env::var("TICKLOG_SIGNAL_DIR") {
            self.signal.dir = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.stream_ids()?;
        if self.writer.failure_threshold == 0 {
            bail!("writer.failure_threshold must be at least 1");
        }
        if self.writer.replay_capacity == 0 {
            bail!("writer.replay_capacity must be at least 1");
        }
        if self.writer.replay_batch_size == 0 {
            bail!("writer.replay_batch_size must be at least 1");
        }
        if self.writer.signal_poll_interval_ms == 0 || self.writer.signal_poll_interval_ms > 500 {
            bail!(
                "writer.signal_poll_interval_ms must be in 1..=500 (got {})",
                self.writer.signal_poll_interval_ms
            );
        }
        if self.rotation.settle_ms < self.writer.signal_poll_interval_ms {
            bail!(
                "rotation.settle_ms ({}) must cover the writer poll interval ({})",
                self.rotation.settle_ms,
                self.writer.signal_poll_interval_ms
            );
        }
        if self.rotation.interval_secs == 0 || self.rotation.debug_interval_secs == 0 {
            bail!("rotation intervals must be non-zero");
        }

        let secs = [
            ("writer.replay_ttl_secs", self.writer.replay_ttl_secs),
            ("writer.stats_interval_secs", self.writer.stats_interval_secs),
            ("rotation.interval_secs", self.rotation.interval_secs),
            ("rotation.offset_secs", self.rotation.offset_secs),
            ("rotation.debug_interval_secs", self.rotation.debug_interval_secs),
            ("rotation.debug_offset_secs", self.rotation.debug_offset_secs),
            ("rotation.stale_signal_secs", self.rotation.stale_signal_secs),
        ];
        for (key, value) in secs {
            if value > MAX_SECS {
                bail!("{} must be at most {} (got {})", key, MAX_SECS, value);
            }
        }

        let millis = [
            ("storage.busy_timeout_ms", self.storage.busy_timeout_ms),
            ("writer.healthy_probe_interval_ms", self.writer.healthy_probe_interval_ms),
            ("writer.down_probe_interval_ms", self.writer.down_probe_interval_ms),
            ("writer.replay_drain_interval_ms", self.writer.replay_drain_interval_ms),
            ("writer.reconnect_poll_interval_ms", self.writer.reconnect_poll_interval_ms),
            ("writer.rotation_wait_timeout_ms", self.writer.rotation_wait_timeout_ms),
            ("rotation.settle_ms", self.rotation.settle_ms),
            ("rotation.grace_ms", self.rotation.grace_ms),
            ("rotation.jitter_ms", self.rotation.jitter_ms),
        ];
        for (key, value) in millis {
            if value > MAX_MS {
                bail!("{} must be at most {} (got {})", key, MAX_MS, value);
            }
        }
        Ok(())
    }

    /// Parsed, de-duplicated stream ids in configuration order.
    pub fn stream_ids(&self) -> Result<Vec<StreamId>> {
        if self.streams.is_empty() {
            bail!("no streams configured");
        }
        let mut ids: Vec<StreamId> = Vec::with_capacity(self.streams.len());
        for raw in &self.streams {
            let id = StreamId::parse(raw)?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

fn env_parse<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => debug!(key, value = %v, "ignoring unparsable env override"),
        }
    }
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Backend location and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Upper bound on how long a write or probe may wait on the backend.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "ticklog.db".to_string(),
            busy_timeout_ms: 200,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Writer-side reliability tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    // Circuit breaker
    pub failure_threshold: u32,
    pub healthy_probe_interval_ms: u64,
    pub down_probe_interval_ms: u64,

    // Replay buffer
    pub replay_capacity: usize,
    pub replay_ttl_secs: u64,
    pub replay_batch_size: usize,
    pub replay_drain_interval_ms: u64,

    // Rotation protocol
    pub signal_poll_interval_ms: u64,
    pub reconnect_poll_interval_ms: u64,
    pub rotation_wait_timeout_ms: u64,

    // Housekeeping
    pub stats_interval_secs: u64,
    /// Shut the ingestion loop down after this many errors (0 = never).
    pub max_error_count: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            healthy_probe_interval_ms: 1_000,
            down_probe_interval_ms: 100,

            replay_capacity: 10_000,
            replay_ttl_secs: 30,
            replay_batch_size: 50,
            replay_drain_interval_ms: 100,

            signal_poll_interval_ms: 500,
            reconnect_poll_interval_ms: 250,
            rotation_wait_timeout_ms: 10_000,

            stats_interval_secs: 30,
            max_error_count: 1_000,
        }
    }
}

impl WriterConfig {
    pub fn replay_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.replay_ttl_secs.min(MAX_SECS) as i64)
    }

    pub fn replay_drain_interval(&self) -> Duration {
        Duration::from_millis(self.replay_drain_interval_ms)
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_interval_ms)
    }

    pub fn reconnect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_poll_interval_ms)
    }

    pub fn rotation_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.rotation_wait_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

/// Orchestrator timing and export policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Wait after raising the signal before the swap.
    pub settle_ms: u64,
    /// Wait after the swap before reading the previous target.
    pub grace_ms: u64,

    pub interval_secs: u64,
    /// Delay past each interval boundary before a cycle starts.
    pub offset_secs: u64,
    pub debug_mode: bool,
    pub debug_interval_secs: u64,
    pub debug_offset_secs: u64,
    pub jitter_ms: u64,
    /// A signal raised by another orchestrator is left alone until it is
    /// older than settle + grace + this many seconds.
    pub stale_signal_secs: u64,

    /// Keep the previous target after a verified export.
    pub preserve_previous: bool,
    pub export_dir: PathBuf,
    pub fallback_export_dirs: Vec<PathBuf>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2_000,
            grace_ms: 3_000,

            interval_secs: 3_600,
            offset_secs: 60,
            debug_mode: false,
            debug_interval_secs: 300,
            debug_offset_secs: 30,
            jitter_ms: 0,
            stale_signal_secs: 600,

            preserve_previous: false,
            export_dir: PathBuf::from("/exports"),
            fallback_export_dirs: vec![PathBuf::from("/tmp/exports"), PathBuf::from("./exports")],
        }
    }
}

impl RotationConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Age past which a raised signal no live cycle can still own.
    pub fn stale_signal_after(&self) -> chrono::Duration {
        let window_ms = self.settle_ms.min(MAX_MS) + self.grace_ms.min(MAX_MS);
        chrono::Duration::milliseconds(window_ms as i64)
            + chrono::Duration::seconds(self.stale_signal_secs.min(MAX_SECS) as i64)
    }
}

/// Where rotation flag files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub dir: PathBuf,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.writer.replay_capacity, 10_000);
        assert_eq!(config.writer.replay_ttl_secs, 30);
        assert_eq!(config.writer.replay_batch_size, 50);
        assert_eq!(config.writer.failure_threshold, 3);
        assert_eq!(config.stream_ids().unwrap().len(), 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            streams = ["btc"]

            [writer]
            replay_capacity = 500

            [rotation]
            debug_mode = true
            "#,
        )
        .unwrap();

        assert_eq!(config.streams, vec!["btc".to_string()]);
        assert_eq!(config.writer.replay_capacity, 500);
        assert_eq!(config.writer.replay_batch_size, 50);
        assert!(config.rotation.debug_mode);
        assert_eq!(config.rotation.settle_ms, 2_000);
        assert_eq!(config.storage.busy_timeout_ms, 200);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.writer.replay_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.writer.signal_poll_interval_ms = 2_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streams = vec!["BTC-USDT".to_string()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rotation.settle_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_values_past_ceilings() {
        let mut config = AppConfig::default();
        config.writer.replay_ttl_secs = u64::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("writer.replay_ttl_secs"), "{}", err);

        let mut config = AppConfig::default();
        config.rotation.interval_secs = u64::MAX / 2;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rotation.offset_secs = MAX_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rotation.debug_offset_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rotation.stale_signal_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rotation.jitter_ms = u64::MAX;
        assert!(config.validate().is_err());

        // The ceilings themselves are accepted and usable
        let mut config = AppConfig::default();
        config.writer.replay_ttl_secs = MAX_SECS;
        config.rotation.interval_secs = MAX_SECS;
        config.rotation.offset_secs = MAX_SECS;
        config.rotation.settle_ms = MAX_MS;
        config.rotation.grace_ms = MAX_MS;
        config.rotation.stale_signal_secs = MAX_SECS;
        config.validate().unwrap();
        assert_eq!(config.writer.replay_ttl(), chrono::Duration::seconds(MAX_SECS as i64));
        assert!(config.rotation.stale_signal_after() > chrono::Duration::seconds(MAX_SECS as i64));
        let schedule = crate::rotation::Schedule::from_config(&config.rotation);
        let now = chrono::Utc::now();
        assert!(schedule.next_run_after(now) > now);
    }

    #[test]
    fn test_example_file_matches_defaults() {
        let config = AppConfig::from_toml_str(include_str!("../ticklog.example.toml")).unwrap();
        config.validate().unwrap();
        let defaults = AppConfig::default();
        assert_eq!(config.streams, defaults.streams);
        assert_eq!(config.writer.rotation_wait_timeout_ms, defaults.writer.rotation_wait_timeout_ms);
        assert_eq!(config.rotation.export_dir, defaults.rotation.export_dir);
        assert_eq!(config.rotation.stale_signal_secs, defaults.rotation.stale_signal_secs);
        assert_eq!(config.signal.dir, defaults.signal.dir);
    }

    #[test]
    fn test_stream_ids_dedup() {
        let mut config = AppConfig::default();
        config.streams = vec!["btc".into(), "BTC".into(), "eth".into()];
        let ids = config.stream_ids().unwrap();
        assert_eq!(ids.len(), 2);
    }
}
