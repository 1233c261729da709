//! Run-scoped crawl frontier
//!
//! This module handles:
//! - Deduplication of normalized URLs across the whole run
//! - Sorted dispatch: each pop takes the smallest pending URL. With more than
//!   one fetch in flight, completion order decides what is pending, so only a
//!   crawl at concurrency 1 repeats its whole dispatch order
//! - The page budget and the optional depth limit
//! - Keeping the crawl inside the project's site scope

use crate::config::CrawlerConfig;
use crate::url::{extract_host, normalize_url, SiteScope};
use std::collections::{BTreeMap, HashSet};
use url::Url;

/// A URL queued for fetching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUrl {
    /// Normalized URL
    pub url: Url,

    /// Lowercased host of `url`
    pub host: String,

    /// Link distance from the nearest seed
    pub depth: u32,
}

/// What happened to a URL offered to the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Already queued or dispatched in this run
    Duplicate,
    /// Host is outside the project's site scope
    OutOfScope,
    /// Deeper than `max-depth`
    TooDeep,
    /// Not a normalizable HTTP(S) URL
    Invalid,
}

/// Frontier and visited set for one run
#[derive(Debug)]
pub struct Frontier {
    /// Pending URLs keyed by their normalized string (popped in sorted order)
    queue: BTreeMap<String, QueuedUrl>,

    /// Every URL ever admitted, queued or dispatched
    seen: HashSet<String>,

    scope: SiteScope,
    page_budget: u32,
    max_depth: Option<u32>,
    dispatched: u32,
}

impl Frontier {
    pub fn new(config: &CrawlerConfig, scope: SiteScope) -> Self {
        Self {
            queue: BTreeMap::new(),
            seen: HashSet::new(),
            scope,
            page_budget: config.page_budget,
            max_depth: config.max_depth,
            dispatched: 0,
        }
    }

    pub fn scope(&self) -> &SiteScope {
        &self.scope
    }

    /// Offers a URL at `depth`
    pub fn offer(&mut self, url: &str, depth: u32) -> Admission {
        let Ok(normalized) = normalize_url(url) else {
            return Admission::Invalid;
        };
        let Some(host) = extract_host(&normalized) else {
            return Admission::Invalid;
        };

        if !self.scope.contains_host(&host) {
            return Admission::OutOfScope;
        }
        if matches!(self.max_depth, Some(max) if depth > max) {
            return Admission::TooDeep;
        }

        let key = normalized.to_string();
        if !self.seen.insert(key.clone()) {
            return Admission::Duplicate;
        }

        self.queue.insert(
            key,
            QueuedUrl {
                url: normalized,
                host,
                depth,
            },
        );
        Admission::Queued
    }

    /// Seeds enter at depth 0
    pub fn push_seed(&mut self, url: &str) -> Admission {
        self.offer(url, 0)
    }

    /// Links found on a page at `parent_depth`
    pub fn push_discovered(&mut self, url: &str, parent_depth: u32) -> Admission {
        self.offer(url, parent_depth.saturating_add(1))
    }

    /// Pops the smallest URL pending right now, unless the page budget is spent
    ///
    /// A URL discovered later still pops first if it sorts first.
    pub fn pop_next(&mut self) -> Option<QueuedUrl> {
        if self.budget_exhausted() {
            return None;
        }
        let (_, queued) = self.queue.pop_first()?;
        self.dispatched += 1;
        Some(queued)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.dispatched >= self.page_budget
    }

    pub fn dispatched(&self) -> u32 {
        self.dispatched
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
