//! Core records produced and consumed by a run
//!
//! Every fact, edge and finding carries the id of the run that produced it.
//! Cross-run comparison always names both run ids explicitly.

use crate::state::JobState;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a crawl run (database row id)
pub type RunId = i64;

/// Identifier of a job supervising a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Formats a timestamp as fixed-width RFC 3339 so stored values sort lexically
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a timestamp written by [`format_timestamp`]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// How a page was fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchMethod {
    Http,
    Browser,
}

impl FetchMethod {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Browser => "browser",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "browser" => Some(Self::Browser),
            _ => None,
        }
    }
}

/// A heading element (`<h1>` .. `<h6>`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    pub level: u8,
    pub text: String,
}

/// An alternate-language link (`<link rel="alternate" hreflang=..>`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hreflang {
    pub lang: String,
    pub href: String,
}

/// Structured facts extracted from one fetched page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFact {
    pub run_id: RunId,
    pub url: String,
    pub host: String,
    pub depth: u32,
    pub fetch_method: FetchMethod,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub title: Option<String>,
    /// Meta tags keyed by `name` or `property` (lowercased)
    pub meta: BTreeMap<String, String>,
    pub headings: Vec<Heading>,
    pub canonical: Option<String>,
    pub hreflang: Vec<Hreflang>,
    pub word_count: u32,
    /// Visible text length divided by HTML length
    pub text_density: f64,
    pub js_required: bool,
    pub render_timeout: bool,
    /// Set when the fetch itself failed (transient exhaustion or permanent error)
    pub fetch_error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl PageFact {
    /// A blank fact for `url`, filled in by the fetchers
    pub fn empty(run_id: RunId, url: &str, host: &str, depth: u32) -> Self {
        Self {
            run_id,
            url: url.to_string(),
            host: host.to_string(),
            depth,
            fetch_method: FetchMethod::Http,
            status_code: None,
            content_type: None,
            title: None,
            meta: BTreeMap::new(),
            headings: Vec::new(),
            canonical: None,
            hreflang: Vec::new(),
            word_count: 0,
            text_density: 0.0,
            js_required: false,
            render_timeout: false,
            fetch_error: None,
            fetched_at: Utc::now(),
        }
    }

    /// True for a 2xx response carrying HTML
    pub fn is_html_success(&self) -> bool {
        let ok = matches!(self.status_code, Some(code) if (200..300).contains(&code));
        let html = self
            .content_type
            .as_deref()
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);
        ok && html && self.fetch_error.is_none()
    }

    pub fn meta_content(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }
}

/// A directed internal link observed during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEdge {
    pub run_id: RunId,
    pub src: String,
    pub dst: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Audit severity, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// What a rule observed and why it matters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// The offending PageFact field
    pub field: String,
    /// The observed value, rendered as text
    pub observed: String,
    pub rationale: String,
    /// Suggested remediation value for auto-fixable rules
    pub suggested_fix: Option<String>,
}

/// One rule firing on one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub run_id: RunId,
    pub url: String,
    pub rule_id: String,
    pub severity: Severity,
    pub evidence: Evidence,
    pub auto_fixable: bool,
    pub detected_at: DateTime<Utc>,
}

/// Run-over-run classification of a (url, rule) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaStatus {
    Added,
    Removed,
    Changed,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub url: String,
    pub rule_id: String,
    pub status: DeltaStatus,
    pub previous_severity: Option<Severity>,
    pub current_severity: Option<Severity>,
}

/// What a rank score is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RankSubject {
    Url(String),
    Host(String),
}

impl RankSubject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Url(_) => "url",
            Self::Host(_) => "host",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Url(s) | Self::Host(s) => s,
        }
    }

    pub fn from_parts(kind: &str, key: String) -> Option<Self> {
        match kind {
            "url" => Some(Self::Url(key)),
            "host" => Some(Self::Host(key)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankScore {
    pub run_id: RunId,
    pub subject: RankSubject,
    pub score: f64,
    pub iterations_used: u32,
    pub converged: bool,
    /// True when the score was redistributed from a host-level computation
    pub host_aggregated: bool,
    pub computed_at: DateTime<Utc>,
}

/// What a job does with its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Crawl, audit, delta, link graph and ranks
    CrawlAudit,
    /// Link graph and ranks recomputed for an existing run
    LinkRank,
}

impl JobKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::CrawlAudit => "crawl_audit",
            Self::LinkRank => "link_rank",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "crawl_audit" => Some(Self::CrawlAudit),
            "link_rank" => Some(Self::LinkRank),
            _ => None,
        }
    }
}

/// Persisted job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub run_id: RunId,
    pub kind: JobKind,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Rendered failure reason for FAILED jobs
    pub error: Option<String>,
}

/// A rule that failed while evaluating one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleErrorRecord {
    pub run_id: RunId,
    pub url: String,
    pub rule_id: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Inbound/outbound degree of one URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStat {
    pub url: String,
    pub inbound: u32,
    pub outbound: u32,
    pub orphan: bool,
}
