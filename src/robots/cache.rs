//! Per-run robots.txt cache
//!
//! Each origin is fetched at most once per run, even when several workers
//! reach a new host at the same time.

use crate::robots::RobotsRules;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Robots.txt rules together with when they were fetched
#[derive(Debug, Clone)]
pub struct CachedRobots {
    pub rules: RobotsRules,
    pub fetched_at: DateTime<Utc>,
}

impl CachedRobots {
    pub fn new(rules: RobotsRules) -> Self {
        Self {
            rules,
            fetched_at: Utc::now(),
        }
    }
}

/// Robots cache keyed by origin (`scheme://host[:port]`)
#[derive(Debug, Default)]
pub struct RobotsCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<CachedRobots>>>>,
}

impl RobotsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached rules for `origin`, running `fetch` on first use
    ///
    /// Concurrent callers for the same origin wait on one fetch.
    pub async fn get_or_fetch<F, Fut>(&self, origin: &str, fetch: F) -> CachedRobots
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RobotsRules>,
    {
        let cell = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.entry(origin.to_string()).or_default().clone()
        };

        cell.get_or_init(move || async move { CachedRobots::new(fetch().await) })
            .await
            .clone()
    }

    /// Number of origins with a resolved entry
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|c| c.initialized()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fetches_once_per_origin() {
        let cache = RobotsCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let cached = cache
                .get_or_fetch("https://ex.com", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    RobotsRules::from_content("User-agent: *\nDisallow: /x")
                })
                .await;
            assert!(!cached.rules.is_allowed("https://ex.com/x", "TestBot"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_origins_are_independent() {
        let cache = RobotsCache::new();
        cache
            .get_or_fetch("https://a.com", || async { RobotsRules::allow_all() })
            .await;
        let b = cache
            .get_or_fetch("https://b.com", || async {
                RobotsRules::from_content("User-agent: *\nDisallow: /")
            })
            .await;

        assert!(!b.rules.is_allowed("https://b.com/", "TestBot"));
        assert_eq!(cache.len(), 2);
    }
}
