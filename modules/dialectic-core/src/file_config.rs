use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// TOML-backed tunables loaded from disk.
/// Secrets (DB URL, engine key) stay as env vars.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub dedup: DedupConfig,
    pub engine: EngineConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerConfig {
    /// Jobs handled in parallel by one process.
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Budget for a whole job; must stay under the queue lease.
    pub job_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1_000,
            job_timeout_secs: 300,
            shutdown_grace_secs: 30,
            maintenance_interval_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueConfig {
    pub max_attempts: i32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Visibility timeout: an active job whose lease lapses is redelivered.
    pub lease_secs: i64,
    pub retain_completed_hours: i64,
    pub retain_failed_days: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 5_000,
            backoff_max_ms: 300_000,
            lease_secs: 600,
            retain_completed_hours: 24,
            retain_failed_days: 7,
        }
    }
}

impl QueueConfig {
    /// Delay before the next delivery after `attempts` failed deliveries.
    pub fn backoff_for(&self, attempts: i32) -> Duration {
        let exp = attempts.saturating_sub(1).clamp(0, 20) as u32;
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DedupConfig {
    pub top_k: i64,
    /// Candidates below this cosine similarity never reach the validator.
    pub similarity_floor: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_floor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub timeout_secs: u64,
    pub embedding_dimension: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            embedding_dimension: 768,
        }
    }
}

/// Cosine similarity a search hit must reach when the caller gives no threshold.
pub const DEFAULT_SEARCH_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SearchConfig {
    pub default_threshold: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_SEARCH_THRESHOLD,
        }
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

impl FileConfig {
    fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            anyhow::bail!("worker.concurrency must be at least 1");
        }
        if self.queue.max_attempts < 1 {
            anyhow::bail!("queue.max_attempts must be at least 1");
        }
        if self.worker.job_timeout_secs as i64 >= self.queue.lease_secs {
            anyhow::bail!(
                "worker.job_timeout_secs ({}) must be shorter than queue.lease_secs ({})",
                self.worker.job_timeout_secs,
                self.queue.lease_secs
            );
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_floor) {
            anyhow::bail!("dedup.similarity_floor must be within [0, 1]");
        }
        Ok(())
    }
}
