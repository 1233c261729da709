//! seo-auditor: a local website crawler and SEO audit engine
//!
//! This crate fetches pages over plain HTTP (escalating to a headless browser
//! for JavaScript-dependent pages), extracts structured page facts, evaluates
//! audit rules against them, tracks how findings change between runs and
//! scores pages by internal PageRank.

pub mod audit;
pub mod config;
pub mod crawler;
pub mod graph;
pub mod jobs;
pub mod model;
pub mod rate;
pub mod robots;
pub mod staging;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for seo-auditor operations
#[derive(Debug, Error)]
pub enum AuditorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("Browser error: {0}")]
    Browser(#[from] crawler::BrowserError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidTransition {
        from: state::JobState,
        to: state::JobState,
    },

    #[error("Unknown job: {0}")]
    JobNotFound(String),

    #[error("Run {run_id} already has a live job ({job_id})")]
    RunBusy { run_id: model::RunId, job_id: String },

    #[error("Unknown run: {0}")]
    RunNotFound(model::RunId),

    #[error("Seed resolution failed: {0}")]
    SeedResolution(String),

    #[error("Staging writer failed for run {run_id}: {message}")]
    StoreWrite {
        run_id: model::RunId,
        message: String,
    },

    #[error("Staging writer is closed")]
    StagingClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task failed: {0}")]
    Task(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for seo-auditor operations
pub type Result<T> = std::result::Result<T, AuditorError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use jobs::{FailureReason, JobStatus, JobSupervisor, RunTarget};
pub use model::{
    DeltaRecord, DeltaStatus, Finding, JobId, LinkEdge, PageFact, RankScore, RunId, Severity,
};
pub use state::JobState;
pub use url::{normalize_url, SiteScope};
