use serde::{Deserialize, Serialize};

/// Main configuration structure for the auditor
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub rank: RankConfig,
    #[serde(default)]
    pub staging: StagingConfig,
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrawlerConfig {
    /// Global bound on in-flight fetches
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Per-host token refill rate
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Per-host token bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Maximum pages dispatched per run
    #[serde(default = "default_page_budget")]
    pub page_budget: u32,

    /// Optional link depth limit from the seeds
    #[serde(default)]
    pub max_depth: Option<u32>,

    /// Fraction of browser-fetched pages above which an advisory is raised
    #[serde(default = "default_browser_ratio_advisory")]
    pub browser_ratio_advisory: f64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserAgentConfig {
    pub crawler_name: String,
    pub crawler_version: String,
    pub contact_url: String,
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Format: CrawlerName/Version (+ContactURL; ContactEmail)
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Path to the SQLite database file
    pub database_path: String,
}

/// Headless browser session pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Concurrent browser sessions (separate from the HTTP limit)
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,

    /// Pages a session serves before it is torn down and replaced
    #[serde(default = "default_session_page_quota")]
    pub session_page_quota: u32,

    #[serde(default = "default_page_timeout_ms")]
    pub page_timeout_ms: u64,

    /// How long the network must stay quiet before the DOM is read
    #[serde(default = "default_network_idle_ms")]
    pub network_idle_ms: u64,

    /// In-flight sub-requests still counted as "idle"
    #[serde(default = "default_max_idle_inflight")]
    pub max_idle_inflight: u32,

    /// Watchdog kills sessions older than this
    #[serde(default = "default_max_session_lifetime_secs")]
    pub max_session_lifetime_secs: u64,

    /// URL patterns suppressed before extraction
    #[serde(default = "default_blocked_resource_patterns")]
    pub blocked_resource_patterns: Vec<String>,
}

/// Resource guardrail thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuardrailConfig {
    /// Sustained CPU usage that throttles the global limit
    #[serde(default = "default_cpu_soft_percent")]
    pub cpu_soft_percent: f32,

    /// Sustained memory usage that throttles the global limit
    #[serde(default = "default_memory_soft_percent")]
    pub memory_soft_percent: f32,

    /// Memory usage that fails the run
    #[serde(default = "default_memory_hard_percent")]
    pub memory_hard_percent: f32,

    /// Free disk space below which the run fails
    #[serde(default = "default_min_free_disk_mb")]
    pub min_free_disk_mb: u64,

    /// Samples in the rolling window
    #[serde(default = "default_window")]
    pub window: usize,

    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

/// Link graph ranking configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RankConfig {
    /// Edge count above which PageRank runs on the host graph
    #[serde(default = "default_host_aggregation_threshold")]
    pub host_aggregation_threshold: usize,
}

/// How producers reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StagingMode {
    /// Bounded queue drained by the single writer
    Staged,
    /// Producers commit each record in its own short transaction
    Direct,
}

/// Staging queue and writer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StagingConfig {
    #[serde(default = "default_staging_mode")]
    pub mode: StagingMode,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Queue depth beyond which producers block
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Consecutive failed commits before affected runs fail
    #[serde(default = "default_max_commit_failures")]
    pub max_commit_failures: u32,

    /// Average producer-to-commit latency that raises an advisory
    #[serde(default = "default_latency_warn_ms")]
    pub latency_warn_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_concurrency() -> u32 {
    8
}
fn default_requests_per_second() -> f64 {
    2.0
}
fn default_burst() -> u32 {
    4
}
fn default_page_budget() -> u32 {
    5000
}
fn default_browser_ratio_advisory() -> f64 {
    0.3
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_sessions() -> u32 {
    2
}
fn default_session_page_quota() -> u32 {
    25
}
fn default_page_timeout_ms() -> u64 {
    20_000
}
fn default_network_idle_ms() -> u64 {
    500
}
fn default_max_idle_inflight() -> u32 {
    2
}
fn default_max_session_lifetime_secs() -> u64 {
    300
}
fn default_blocked_resource_patterns() -> Vec<String> {
    [
        "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.woff", "*.woff2",
        "*.ttf", "*.otf", "*.mp4", "*.webm", "*.mp3", "*.css",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_cpu_soft_percent() -> f32 {
    85.0
}
fn default_memory_soft_percent() -> f32 {
    80.0
}
fn default_memory_hard_percent() -> f32 {
    95.0
}
fn default_min_free_disk_mb() -> u64 {
    512
}
fn default_window() -> usize {
    5
}
fn default_sample_interval_ms() -> u64 {
    2_000
}
fn default_host_aggregation_threshold() -> usize {
    50_000
}
fn default_staging_mode() -> StagingMode {
    StagingMode::Staged
}
fn default_batch_size() -> usize {
    200
}
fn default_queue_capacity() -> usize {
    2_000
}
fn default_flush_interval_ms() -> u64 {
    250
}
fn default_max_commit_failures() -> u32 {
    3
}
fn default_latency_warn_ms() -> u64 {
    5_000
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            page_budget: default_page_budget(),
            max_depth: None,
            browser_ratio_advisory: default_browser_ratio_advisory(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sessions: default_max_sessions(),
            session_page_quota: default_session_page_quota(),
            page_timeout_ms: default_page_timeout_ms(),
            network_idle_ms: default_network_idle_ms(),
            max_idle_inflight: default_max_idle_inflight(),
            max_session_lifetime_secs: default_max_session_lifetime_secs(),
            blocked_resource_patterns: default_blocked_resource_patterns(),
        }
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            cpu_soft_percent: default_cpu_soft_percent(),
            memory_soft_percent: default_memory_soft_percent(),
            memory_hard_percent: default_memory_hard_percent(),
            min_free_disk_mb: default_min_free_disk_mb(),
            window: default_window(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            host_aggregation_threshold: default_host_aggregation_threshold(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            mode: default_staging_mode(),
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            max_commit_failures: default_max_commit_failures(),
            latency_warn_ms: default_latency_warn_ms(),
        }
    }
}
