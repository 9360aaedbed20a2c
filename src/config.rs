//! Configuration for the conversion pool.
//!
//! All pool behaviour is controlled through [`PoolConfig`], built via its
//! [`PoolConfigBuilder`]. Every knob lives in one cloneable struct so a config
//! can be shared with worker tasks, logged at start-up, and compared between
//! runs.
//!
//! Timing fields are stored as integers (`*_secs`, `*_ms`) so they map one to
//! one onto CLI flags and environment variables; the `Duration` accessors are
//! what the pool uses internally.

use crate::error::ConvertError;
use crate::format::TargetFormat;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::ConversionPool`].
///
/// # Example
/// ```rust
/// use officeconv::PoolConfig;
///
/// let config = PoolConfig::builder()
///     .pool_size(4)
///     .queue_capacity(100)
///     .job_timeout_secs(60)
///     .build()
///     .unwrap();
/// assert_eq!(config.pool_size, 4);
/// ```
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of engine instances, and so the maximum number of concurrent
    /// conversions. Default: 2.
    ///
    /// Each instance is a full office suite in memory (typically 150–300 MB
    /// resident while converting). Size the pool to memory first and cores
    /// second.
    pub pool_size: usize,

    /// Maximum number of jobs waiting for an engine. Default: 64.
    pub queue_capacity: usize,

    /// Default per-job deadline, measured from submission. Default: 120.
    pub job_timeout_secs: u64,

    /// How long a worker waits for an idle instance per checkout attempt. Default: 30.
    pub checkout_timeout_secs: u64,

    /// Checkout attempts before a job fails with `EngineUnavailable`. Default: 3.
    pub checkout_retries: u32,

    /// Initial backoff between retried attempts (doubles each time). Default: 500.
    pub retry_backoff_ms: u64,

    /// Extra admission attempts when the queue is full. Default: 0 (fail fast).
    pub admission_retries: u32,

    /// Consecutive failures on one slot before respawns are delayed. Default: 3.
    pub failure_threshold: u32,

    /// First respawn cooldown once `failure_threshold` is reached. Default: 1000.
    pub cooldown_base_ms: u64,

    /// Upper bound on the respawn cooldown. Default: 60000.
    pub cooldown_max_ms: u64,

    /// Consecutive engine failures across the whole pool that mark it
    /// degraded. Default: 10.
    pub pool_failure_limit: u32,

    /// How long a degraded pool refuses new work. Default: 30.
    pub degraded_cooldown_secs: u64,

    /// Output and process polling period while an engine runs. Default: 100.
    pub poll_interval_ms: u64,

    /// Time allowed for a killed engine to be reaped. Default: 5000.
    pub kill_grace_ms: u64,

    /// Time an engine may keep running after its output is complete. Default: 5000.
    pub exit_grace_ms: u64,

    /// Deadline for the warm-up probe of a fresh instance. Default: 60.
    pub probe_timeout_secs: u64,

    /// Start every instance (and pay the cold start) when the pool starts,
    /// instead of on first checkout. Default: true.
    pub warm_start: bool,

    /// Targets this pool accepts. Default: every [`TargetFormat`].
    pub supported_formats: Vec<TargetFormat>,

    /// Largest accepted source document in bytes. Default: 256 MiB.
    pub max_input_bytes: u64,

    /// Parent directory of per-job workspaces.
    /// Default: `<runtime dir>/workspaces` (see [`soffice_locate::default_runtime_dir`]).
    pub workspace_root: Option<PathBuf>,

    /// Parent directory of per-slot engine profiles.
    /// Default: `<runtime dir>/profiles`.
    pub profile_root: Option<PathBuf>,

    /// Where results without an explicit destination are written.
    /// Default: `<runtime dir>/output`.
    pub output_dir: Option<PathBuf>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional observer for job lifecycle events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            queue_capacity: 64,
            job_timeout_secs: 120,
            checkout_timeout_secs: 30,
            checkout_retries: 3,
            retry_backoff_ms: 500,
            admission_retries: 0,
            failure_threshold: 3,
            cooldown_base_ms: 1000,
            cooldown_max_ms: 60_000,
            pool_failure_limit: 10,
            degraded_cooldown_secs: 30,
            poll_interval_ms: 100,
            kill_grace_ms: 5000,
            exit_grace_ms: 5000,
            probe_timeout_secs: 60,
            warm_start: true,
            supported_formats: TargetFormat::ALL.to_vec(),
            max_input_bytes: 256 * 1024 * 1024,
            workspace_root: None,
            profile_root: None,
            output_dir: None,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("pool_size", &self.pool_size)
            .field("queue_capacity", &self.queue_capacity)
            .field("job_timeout_secs", &self.job_timeout_secs)
            .field("checkout_timeout_secs", &self.checkout_timeout_secs)
            .field("checkout_retries", &self.checkout_retries)
            .field("admission_retries", &self.admission_retries)
            .field("failure_threshold", &self.failure_threshold)
            .field("pool_failure_limit", &self.pool_failure_limit)
            .field("warm_start", &self.warm_start)
            .field("supported_formats", &self.supported_formats)
            .field("max_input_bytes", &self.max_input_bytes)
            .field("workspace_root", &self.workspace_root)
            .field("profile_root", &self.profile_root)
            .field("output_dir", &self.output_dir)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn JobProgressCallback>"),
            )
            .finish()
    }
}

impl PoolConfig {
    /// Create a new builder for `PoolConfig`.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn degraded_cooldown(&self) -> Duration {
        Duration::from_secs(self.degraded_cooldown_secs)
    }

    /// Exponential backoff before retry number `attempt` (0-based), capped at 30 s.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor).min(30_000))
    }

    /// Respawn cooldown for a slot with `failures` consecutive failures.
    ///
    /// Zero below `failure_threshold`; `base * 2^(failures - threshold)`
    /// capped at `cooldown_max_ms` from there on.
    pub fn respawn_cooldown(&self, failures: u32) -> Duration {
        if failures < self.failure_threshold {
            return Duration::ZERO;
        }
        let exp = (failures - self.failure_threshold).min(32);
        let ms = self
            .cooldown_base_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.cooldown_max_ms);
        Duration::from_millis(ms)
    }

    pub fn supports(&self, target: TargetFormat) -> bool {
        self.supported_formats.contains(&target)
    }

    pub fn resolved_workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| soffice_locate::default_runtime_dir().join("workspaces"))
    }

    pub fn resolved_profile_root(&self) -> PathBuf {
        self.profile_root
            .clone()
            .unwrap_or_else(|| soffice_locate::default_runtime_dir().join("profiles"))
    }

    pub fn resolved_output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| soffice_locate::default_runtime_dir().join("output"))
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn pool_size(mut self, n: usize) -> Self {
        self.config.pool_size = n;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.config.queue_capacity = n;
        self
    }

    pub fn job_timeout_secs(mut self, secs: u64) -> Self {
        self.config.job_timeout_secs = secs;
        self
    }

    pub fn checkout_timeout_secs(mut self, secs: u64) -> Self {
        self.config.checkout_timeout_secs = secs;
        self
    }

    pub fn checkout_retries(mut self, n: u32) -> Self {
        self.config.checkout_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn admission_retries(mut self, n: u32) -> Self {
        self.config.admission_retries = n;
        self
    }

    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.config.failure_threshold = n;
        self
    }

    pub fn cooldown_base_ms(mut self, ms: u64) -> Self {
        self.config.cooldown_base_ms = ms;
        self
    }

    pub fn cooldown_max_ms(mut self, ms: u64) -> Self {
        self.config.cooldown_max_ms = ms;
        self
    }

    pub fn pool_failure_limit(mut self, n: u32) -> Self {
        self.config.pool_failure_limit = n;
        self
    }

    pub fn degraded_cooldown_secs(mut self, secs: u64) -> Self {
        self.config.degraded_cooldown_secs = secs;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn kill_grace_ms(mut self, ms: u64) -> Self {
        self.config.kill_grace_ms = ms;
        self
    }

    pub fn exit_grace_ms(mut self, ms: u64) -> Self {
        self.config.exit_grace_ms = ms;
        self
    }

    pub fn probe_timeout_secs(mut self, secs: u64) -> Self {
        self.config.probe_timeout_secs = secs;
        self
    }

    pub fn warm_start(mut self, v: bool) -> Self {
        self.config.warm_start = v;
        self
    }

    pub fn supported_formats(mut self, formats: impl IntoIterator<Item = TargetFormat>) -> Self {
        let mut formats: Vec<TargetFormat> = formats.into_iter().collect();
        formats.dedup();
        self.config.supported_formats = formats;
        self
    }

    pub fn max_input_bytes(mut self, n: u64) -> Self {
        self.config.max_input_bytes = n;
        self
    }

    pub fn workspace_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = Some(dir.into());
        self
    }

    pub fn profile_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.profile_root = Some(dir.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PoolConfig, ConvertError> {
        let c = &self.config;
        let invalid = |msg: String| Err(ConvertError::InvalidConfig(msg));

        if c.pool_size == 0 {
            return invalid("pool_size must be ≥ 1".into());
        }
        if c.queue_capacity == 0 {
            return invalid("queue_capacity must be ≥ 1".into());
        }
        if c.job_timeout_secs == 0 {
            return invalid("job_timeout_secs must be ≥ 1".into());
        }
        if c.checkout_retries == 0 {
            return invalid("checkout_retries must be ≥ 1".into());
        }
        if c.failure_threshold == 0 || c.pool_failure_limit == 0 {
            return invalid("failure_threshold and pool_failure_limit must be ≥ 1".into());
        }
        if c.cooldown_base_ms > c.cooldown_max_ms {
            return invalid(format!(
                "cooldown_base_ms ({}) exceeds cooldown_max_ms ({})",
                c.cooldown_base_ms, c.cooldown_max_ms
            ));
        }
        if c.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be ≥ 1".into());
        }
        if c.supported_formats.is_empty() {
            return invalid("supported_formats must not be empty".into());
        }
        if c.max_input_bytes == 0 {
            return invalid("max_input_bytes must be ≥ 1".into());
        }
        Ok(self.config)
    }
}
