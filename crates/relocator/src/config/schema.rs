use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            logging: LoggingConfig::default(),
            pool: PoolConfig::default(),
            guard: GuardConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_max_tasks_per_worker")]
    pub max_tasks_per_worker: u64,
    #[serde(default = "default_worker_idle_timeout_ms")]
    pub worker_idle_timeout_ms: u64,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// Stack reserved for each worker thread; the per-worker memory ceiling.
    #[serde(default = "default_worker_stack_size_bytes")]
    pub worker_stack_size_bytes: usize,
    /// Number of recent task durations averaged in stats.
    #[serde(default = "default_duration_history")]
    pub duration_history: usize,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    num_cpus::get()
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_max_tasks_per_worker() -> u64 {
    100
}

fn default_worker_idle_timeout_ms() -> u64 {
    60_000
}

fn default_stats_interval_ms() -> u64 {
    30_000
}

fn default_worker_stack_size_bytes() -> usize {
    8 * MIB as usize
}

fn default_duration_history() -> usize {
    100
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            task_timeout_ms: default_task_timeout_ms(),
            max_tasks_per_worker: default_max_tasks_per_worker(),
            worker_idle_timeout_ms: default_worker_idle_timeout_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            worker_stack_size_bytes: default_worker_stack_size_bytes(),
            duration_history: default_duration_history(),
        }
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QuotaLimits {
    #[serde(default = "default_storage_quota")]
    pub storage_bytes: u64,
    #[serde(default = "default_class_a_quota")]
    pub class_a_operations: u64,
    #[serde(default = "default_class_b_quota")]
    pub class_b_operations: u64,
    #[serde(default = "default_transfer_quota")]
    pub transfer_bytes: u64,
}

fn default_storage_quota() -> u64 {
    10 * GIB
}

fn default_class_a_quota() -> u64 {
    1_000_000
}

fn default_class_b_quota() -> u64 {
    10_000_000
}

fn default_transfer_quota() -> u64 {
    100 * GIB
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            storage_bytes: default_storage_quota(),
            class_a_operations: default_class_a_quota(),
            class_b_operations: default_class_b_quota(),
            transfer_bytes: default_transfer_quota(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AlertBands {
    #[serde(default = "default_info_band")]
    pub info: f64,
    #[serde(default = "default_warning_band")]
    pub warning: f64,
    #[serde(default = "default_critical_band")]
    pub critical: f64,
}

fn default_info_band() -> f64 {
    50.0
}

fn default_warning_band() -> f64 {
    80.0
}

fn default_critical_band() -> f64 {
    90.0
}

impl Default for AlertBands {
    fn default() -> Self {
        Self {
            info: default_info_band(),
            warning: default_warning_band(),
            critical: default_critical_band(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_failures() -> u32 {
    5
}

fn default_breaker_timeout_ms() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            timeout_ms: default_breaker_timeout_ms(),
        }
    }
}

/// Unit prices used for the monthly cost estimate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Pricing {
    #[serde(default = "default_storage_price")]
    pub storage_per_gb_month: f64,
    #[serde(default = "default_class_a_price")]
    pub class_a_per_million: f64,
    #[serde(default = "default_class_b_price")]
    pub class_b_per_million: f64,
    #[serde(default)]
    pub transfer_per_gb: f64,
}

fn default_storage_price() -> f64 {
    0.015
}

fn default_class_a_price() -> f64 {
    4.50
}

fn default_class_b_price() -> f64 {
    0.36
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            storage_per_gb_month: default_storage_price(),
            class_a_per_million: default_class_a_price(),
            class_b_per_million: default_class_b_price(),
            transfer_per_gb: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub quotas: QuotaLimits,
    /// Projected percentage at which an operation is refused and the breaker opens.
    #[serde(default = "default_block_threshold")]
    pub block_threshold_percent: f64,
    /// Projected percentage at which an advisory warning is emitted.
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold_percent: f64,
    /// Measured percentage at which the watchdog opens the breaker on its own.
    #[serde(default = "default_autonomous_trip")]
    pub autonomous_trip_percent: f64,
    #[serde(default)]
    pub alert_bands: AlertBands,
    #[serde(default = "default_upload_multiplier")]
    pub upload_format_multiplier: u64,
    #[serde(default = "default_usage_cache_ttl_ms")]
    pub usage_cache_ttl_ms: u64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub pricing: Pricing,
}

fn default_block_threshold() -> f64 {
    95.0
}

fn default_warn_threshold() -> f64 {
    80.0
}

fn default_autonomous_trip() -> f64 {
    97.0
}

fn default_upload_multiplier() -> u64 {
    3
}

fn default_usage_cache_ttl_ms() -> u64 {
    60_000
}

fn default_monitor_interval_ms() -> u64 {
    300_000
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            quotas: QuotaLimits::default(),
            block_threshold_percent: default_block_threshold(),
            warn_threshold_percent: default_warn_threshold(),
            autonomous_trip_percent: default_autonomous_trip(),
            alert_bands: AlertBands::default(),
            upload_format_multiplier: default_upload_multiplier(),
            usage_cache_ttl_ms: default_usage_cache_ttl_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            breaker: BreakerConfig::default(),
            pricing: Pricing::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Webp,
    Jpeg,
    Thumbnail,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Thumbnail => "thumbnail",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Jpeg | OutputFormat::Thumbnail => "jpg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "image/webp",
            OutputFormat::Jpeg | OutputFormat::Thumbnail => "image/jpeg",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constraints handed to the transcoder for every item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeOptions {
    #[serde(default = "default_target_size")]
    pub target_size_bytes: u64,
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
    #[serde(default = "default_formats")]
    pub formats: Vec<OutputFormat>,
}

fn default_target_size() -> u64 {
    500 * 1024
}

fn default_max_dimension() -> u32 {
    2048
}

fn default_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Webp, OutputFormat::Jpeg, OutputFormat::Thumbnail]
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            target_size_bytes: default_target_size(),
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            formats: default_formats(),
        }
    }
}

/// Per-job settings. A copy is persisted with every job so a paused job
/// resumes with the settings it started with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Carried for compatibility; batches always run one at a time.
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_true")]
    pub enable_cost_protection: bool,
    #[serde(default = "default_pause_threshold")]
    pub pause_on_error_threshold: Option<u64>,
    #[serde(default = "default_true")]
    pub validate_after: bool,
    #[serde(default = "default_validation_sample_size")]
    pub validation_sample_size: usize,
    #[serde(default)]
    pub cleanup_source: bool,
    #[serde(default)]
    pub transcode: TranscodeOptions,
}

fn default_batch_size() -> usize {
    50
}

fn default_max_concurrent_batches() -> usize {
    1
}

fn default_pause_threshold() -> Option<u64> {
    Some(100)
}

fn default_validation_sample_size() -> usize {
    10
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            retry: RetryPolicy::default(),
            enable_cost_protection: true,
            pause_on_error_threshold: default_pause_threshold(),
            validate_after: true,
            validation_sample_size: default_validation_sample_size(),
            cleanup_source: false,
            transcode: TranscodeOptions::default(),
        }
    }
}

impl MigrationConfig {
    /// Semantic checks shared by the config loader and job start.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.max_concurrent_batches == 0 {
            return Err("max_concurrent_batches must be at least 1".to_string());
        }
        if self.transcode.formats.is_empty() {
            return Err("transcode.formats must name at least one format".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err("retry.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err("retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        Ok(())
    }
}
