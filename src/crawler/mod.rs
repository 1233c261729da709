//! Crawler module for web page fetching and processing
//!
//! This module contains the core crawling logic, including:
//! - HTTP fetching with bounded retry
//! - JavaScript detection and headless browser escalation
//! - HTML parsing and link extraction
//! - The run-scoped frontier and sitemap seeding
//! - Overall crawl coordination

mod browser;
mod coordinator;
mod fetcher;
mod parser;
mod scheduler;
mod sitemap;
mod spa;

pub use browser::{
    BrowserError, BrowserPool, BrowserStats, ChromiumLauncher, PoolSettings, RenderOptions,
    RenderSession, SessionLauncher,
};
pub use coordinator::{CrawlOutcome, CrawlResources, CrawlScheduler};
pub use fetcher::{
    build_http_client, FetchError, FetchOutcome, Fetcher, HttpFetcher, HttpResponse, PageRequest,
    RetryPolicy,
};
pub use parser::{parse_html, ParsedPage};
pub use scheduler::{Admission, Frontier, QueuedUrl};
pub use sitemap::{is_sitemap_index, parse_locs, resolve_sitemap};
pub use spa::{SpaClassifier, SpaDecision, SpaSignal, MIN_TEXT_RATIO};
