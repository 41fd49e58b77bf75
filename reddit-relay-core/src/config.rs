use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::serde_secs;

/// Everything the relay runtime needs besides its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub database_path: PathBuf,
    /// Low-power host preset, see [`RelayConfig::apply_constrained_host`].
    pub constrained_host: bool,
    pub scheduler: SchedulerConfig,
    pub lifecycle: LifecycleConfig,
    pub pipeline: PipelineConfig,
    pub delivery: DeliveryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            database_path: PathBuf::from("./data/relay.db"),
            constrained_host: false,
            scheduler: SchedulerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            pipeline: PipelineConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ceiling on rule cycles running at the same time. Extra cycles queue.
    pub max_concurrent_cycles: usize,
    /// Consecutive failed cycles before a rule is flagged degraded.
    pub degraded_after_failures: u32,
    /// How long `stop` waits for in-flight media jobs before interrupting them.
    #[serde(rename = "shutdown_grace_secs", with = "serde_secs")]
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent_cycles: 4,
            degraded_after_failures: 3,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    #[serde(rename = "approval_timeout_secs", with = "serde_secs")]
    pub approval_timeout: Duration,
    /// Posts of one rule allowed in `Processing` at once.
    pub per_rule_processing_limit: u64,
    #[serde(rename = "sweep_interval_secs", with = "serde_secs")]
    pub sweep_interval: Duration,
    #[serde(rename = "dedup_retention_secs", with = "serde_secs")]
    pub dedup_retention: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            approval_timeout: Duration::from_secs(24 * 3600),
            per_rule_processing_limit: 1,
            sweep_interval: Duration::from_secs(60),
            dedup_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ceiling on media jobs running at the same time across all rules.
    pub max_concurrent_jobs: usize,
    /// Ceiling on encoder processes, independent of the job ceiling.
    pub max_concurrent_encodes: usize,
    #[serde(rename = "download_timeout_secs", with = "serde_secs")]
    pub download_timeout: Duration,
    pub download_attempts: u32,
    #[serde(rename = "merge_timeout_secs", with = "serde_secs")]
    pub merge_timeout: Duration,
    pub merge_attempts: u32,
    #[serde(rename = "encode_timeout_secs", with = "serde_secs")]
    pub encode_timeout: Duration,
    pub encode_attempts: u32,
    pub encoder_threads: u32,
    pub encoder_preset: String,
    #[serde(rename = "max_video_duration_secs", with = "serde_secs")]
    pub max_video_duration: Duration,
    pub max_video_height: u32,
    /// Gallery posts keep at most this many images.
    pub max_gallery_items: usize,
    pub work_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_concurrent_jobs: 2,
            max_concurrent_encodes: 1,
            download_timeout: Duration::from_secs(60),
            download_attempts: 3,
            merge_timeout: Duration::from_secs(60),
            merge_attempts: 2,
            encode_timeout: Duration::from_secs(300),
            encode_attempts: 2,
            encoder_threads: 4,
            encoder_preset: "veryfast".to_string(),
            max_video_duration: Duration::from_secs(600),
            max_video_height: 1080,
            max_gallery_items: 10,
            work_dir: PathBuf::from("./temp"),
            assets_dir: PathBuf::from("./data/assets"),
            ffmpeg_path: None,
            ffprobe_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per post for transient delivery failures.
    pub attempts: u32,
    /// Pause before retry `n` is `n * retry_delay`.
    #[serde(rename = "retry_delay_secs", with = "serde_secs")]
    pub retry_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// A setting whose value would stall or crash the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid config: {field} must be greater than zero")]
pub struct ConfigError {
    pub field: &'static str,
}

impl RelayConfig {
    /// Reject zero intervals, timeouts, attempt counts and concurrency ceilings.
    /// `retry_delay` and `shutdown_grace` may be zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        let l = &self.lifecycle;
        let p = &self.pipeline;
        let d = &self.delivery;
        let durations = [
            ("lifecycle.sweep_interval_secs", l.sweep_interval),
            ("lifecycle.approval_timeout_secs", l.approval_timeout),
            ("lifecycle.dedup_retention_secs", l.dedup_retention),
            ("pipeline.download_timeout_secs", p.download_timeout),
            ("pipeline.merge_timeout_secs", p.merge_timeout),
            ("pipeline.encode_timeout_secs", p.encode_timeout),
        ];
        let counts = [
            ("scheduler.max_concurrent_cycles", s.max_concurrent_cycles as u64),
            ("scheduler.degraded_after_failures", u64::from(s.degraded_after_failures)),
            ("lifecycle.per_rule_processing_limit", l.per_rule_processing_limit),
            ("pipeline.max_concurrent_jobs", p.max_concurrent_jobs as u64),
            ("pipeline.max_concurrent_encodes", p.max_concurrent_encodes as u64),
            ("pipeline.download_attempts", u64::from(p.download_attempts)),
            ("pipeline.merge_attempts", u64::from(p.merge_attempts)),
            ("pipeline.encode_attempts", u64::from(p.encode_attempts)),
            ("pipeline.encoder_threads", u64::from(p.encoder_threads)),
            ("delivery.attempts", u64::from(d.attempts)),
        ];

        if let Some((field, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError { field: *field });
        }
        if let Some((field, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError { field: *field });
        }
        Ok(())
    }

    /// Apply the low-power preset when `constrained_host` is set. Lowers parallelism,
    /// doubles stage timeouts and shrinks the encoder's thread count.
    pub fn apply_constrained_host(mut self) -> Self {
        if !self.constrained_host {
            return self;
        }
        let p = &mut self.pipeline;
        p.max_concurrent_jobs = 1;
        p.max_concurrent_encodes = 1;
        p.encoder_threads = p.encoder_threads.clamp(1, 2);
        p.encoder_preset = "ultrafast".to_string();
        p.download_timeout *= 2;
        p.merge_timeout *= 2;
        p.encode_timeout *= 2;
        self.scheduler.max_concurrent_cycles = self.scheduler.max_concurrent_cycles.clamp(1, 2);
        self
    }

    pub fn trace_loaded(&self) {
        info!(
            database_path = %self.database_path.display(),
            constrained_host = self.constrained_host,
            max_concurrent_cycles = self.scheduler.max_concurrent_cycles,
            max_concurrent_jobs = self.pipeline.max_concurrent_jobs,
            max_concurrent_encodes = self.pipeline.max_concurrent_encodes,
            encoder_threads = self.pipeline.encoder_threads,
            encode_timeout_secs = self.pipeline.encode_timeout.as_secs(),
            approval_timeout_secs = self.lifecycle.approval_timeout.as_secs(),
            "Loaded RelayConfig"
        );
        debug!(?self, "RelayConfig loaded (full debug)");
    }
}
