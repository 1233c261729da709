//! Configuration module
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use seo_auditor::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("auditor.toml")).unwrap();
//! println!("Global concurrency: {}", config.crawler.max_concurrency);
//! ```

mod parser;
mod types;
mod validation;

pub use types::{
    BrowserConfig, Config, CrawlerConfig, GuardrailConfig, OutputConfig, RankConfig,
    StagingConfig, StagingMode, UserAgentConfig,
};

pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
