//! Live job progress
//!
//! Workers bump atomic counters; callers read a consistent-enough snapshot
//! through `get_job_state`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Snapshot of a job's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub pages_fetched: u64,
    pub pages_via_browser: u64,
    /// Pages whose HTML suggested JavaScript rendering
    pub pages_js_required: u64,
    pub pages_failed: u64,
    pub robots_blocked: u64,
    pub edges_staged: u64,
    pub findings: u64,
    pub rule_errors: u64,
    pub rank_scores: u64,
}

#[derive(Debug, Default)]
pub struct ProgressCounters {
    pages_fetched: AtomicU64,
    pages_via_browser: AtomicU64,
    pages_js_required: AtomicU64,
    pages_failed: AtomicU64,
    robots_blocked: AtomicU64,
    edges_staged: AtomicU64,
    findings: AtomicU64,
    rule_errors: AtomicU64,
    rank_scores: AtomicU64,
    advisories: Mutex<Vec<String>>,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(add_pages_fetched, pages_fetched);
    counter!(add_pages_via_browser, pages_via_browser);
    counter!(add_pages_js_required, pages_js_required);
    counter!(add_pages_failed, pages_failed);
    counter!(add_robots_blocked, robots_blocked);
    counter!(add_edges_staged, edges_staged);
    counter!(add_findings, findings);
    counter!(add_rule_errors, rule_errors);
    counter!(add_rank_scores, rank_scores);

    /// Records a non-fatal advisory once
    pub fn advise(&self, advisory: impl Into<String>) {
        let advisory = advisory.into();
        let mut advisories = self
            .advisories
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !advisories.contains(&advisory) {
            advisories.push(advisory);
        }
    }

    pub fn advisories(&self) -> Vec<String> {
        self.advisories
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> JobProgress {
        JobProgress {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            pages_via_browser: self.pages_via_browser.load(Ordering::Relaxed),
            pages_js_required: self.pages_js_required.load(Ordering::Relaxed),
            pages_failed: self.pages_failed.load(Ordering::Relaxed),
            robots_blocked: self.robots_blocked.load(Ordering::Relaxed),
            edges_staged: self.edges_staged.load(Ordering::Relaxed),
            findings: self.findings.load(Ordering::Relaxed),
            rule_errors: self.rule_errors.load(Ordering::Relaxed),
            rank_scores: self.rank_scores.load(Ordering::Relaxed),
        }
    }
}
