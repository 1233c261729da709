//! Robots.txt handling module
//!
//! This module fetches, parses and caches robots.txt files. Disallowed URLs
//! are skipped by the crawler and `Crawl-delay` feeds the rate controller.

mod cache;
mod parser;

pub use cache::{CachedRobots, RobotsCache};
pub use parser::RobotsRules;

use reqwest::Client;
use url::Url;

/// Returns the robots.txt origin key for a URL (`scheme://host[:port]`)
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Fetches robots.txt for the origin of `url`
///
/// # Outcomes
///
/// | Response | Rules |
/// |----------|-------|
/// | 2xx | parsed content |
/// | 4xx | allow all |
/// | 5xx | allow all, warning logged |
/// | network error | allow all, warning logged |
pub async fn fetch_robots(client: &Client, url: &Url) -> RobotsRules {
    let robots_url = match url.join("/robots.txt") {
        Ok(u) => u,
        Err(_) => return RobotsRules::allow_all(),
    };

    match client.get(robots_url.as_str()).send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                match response.text().await {
                    Ok(body) => {
                        tracing::debug!("Fetched {} ({} bytes)", robots_url, body.len());
                        RobotsRules::from_content(&body)
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read {}: {}; allowing all", robots_url, e);
                        RobotsRules::allow_all()
                    }
                }
            } else if status.is_client_error() {
                tracing::debug!("{} returned {}; allowing all", robots_url, status);
                RobotsRules::allow_all()
            } else {
                tracing::warn!("{} returned {}; allowing all", robots_url, status);
                RobotsRules::allow_all()
            }
        }
        Err(e) => {
            tracing::warn!("Failed to fetch {}: {}; allowing all", robots_url, e);
            RobotsRules::allow_all()
        }
    }
}
