use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted overdue window, one hundred years.
pub const MAX_OVERDUE_AFTER_DAYS: i64 = 36_500;

/// Engine tuning. Loaded from `data/engine_config.json` by the runner;
/// any field missing from the file keeps its default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Snapshot cache time-to-live. Writes invalidate explicitly regardless.
    pub cache_ttl_secs: u64,
    /// Upper bound on concurrent sweep workers (each holds one connection).
    pub sweep_workers: usize,
    /// How long a writer waits for a representative's lock before the
    /// attempt counts as a concurrency conflict.
    pub lock_timeout_ms: u64,
    /// Store access timeout (SQLite busy timeout) per connection.
    pub store_busy_timeout_ms: u64,
    /// Snapshots scoring below this land in the low-integrity bucket.
    pub low_integrity_threshold: i64,
    /// Age in days after which an unpaid invoice becomes overdue.
    pub overdue_after_days: i64,
    /// Allow `snapshot_or_last_known` to serve the cached aggregate when
    /// the fresh computation fails. Off unless explicitly enabled.
    pub degraded_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            sweep_workers: 4,
            lock_timeout_ms: 2_000,
            store_busy_timeout_ms: 5_000,
            low_integrity_threshold: 70,
            overdue_after_days: 30,
            degraded_mode: false,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file.
    /// In tests, use EngineConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Small timeouts and a short TTL so tests fail fast.
    pub fn default_test() -> Self {
        Self {
            cache_ttl_secs: 30,
            sweep_workers: 4,
            lock_timeout_ms: 500,
            store_busy_timeout_ms: 2_000,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_workers == 0 {
            anyhow::bail!("sweep_workers must be at least 1");
        }
        if !(0..=100).contains(&self.low_integrity_threshold) {
            anyhow::bail!(
                "low_integrity_threshold must be within 0..=100, got {}",
                self.low_integrity_threshold
            );
        }
        if !(0..=MAX_OVERDUE_AFTER_DAYS).contains(&self.overdue_after_days) {
            anyhow::bail!(
                "overdue_after_days must be within 0..={MAX_OVERDUE_AFTER_DAYS}, got {}",
                self.overdue_after_days
            );
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn store_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store_busy_timeout_ms)
    }
}
