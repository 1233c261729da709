//! Job supervision
//!
//! This module handles:
//! - Starting crawl+audit and link/rank jobs as background tasks
//! - The forward-only job state machine and its persisted records
//! - Cancellation and resource guardrails
//! - Progress counters and structured failure reasons
//! - Query access to stored run results

pub mod guardrails;
mod progress;
mod queries;
mod supervisor;

pub use guardrails::{Guardrail, LoadMonitor, LoadSampler, LoadSample, LoadSignal, SystemSampler};
pub use progress::{JobProgress, ProgressCounters};
pub use queries::RunQueries;
pub use supervisor::JobSupervisor;

use crate::model::{JobId, JobKind, RunId};
use crate::state::JobState;
use crate::AuditorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a crawl starts from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunTarget {
    /// Explicit seed URLs
    Seeds(Vec<String>),
    /// A sitemap (or sitemap index) whose `<loc>` entries become seeds
    Sitemap(String),
}

/// Why a job ended in FAILED
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ResourceExhausted { guardrail: Guardrail },
    StoreWriteFailure(String),
    SeedResolution(String),
    Internal(String),
}

impl FailureReason {
    /// Prefixed form stored in the job's `error` column
    pub fn to_db_string(&self) -> String {
        match self {
            Self::ResourceExhausted { guardrail } => format!("resource_exhausted:{}", guardrail),
            Self::StoreWriteFailure(message) => format!("store_write:{}", message),
            Self::SeedResolution(message) => format!("seed_resolution:{}", message),
            Self::Internal(message) => format!("internal:{}", message),
        }
    }

    /// Parses a stored reason; unknown forms come back as `Internal`
    pub fn from_db_string(s: &str) -> Self {
        let (kind, detail) = s.split_once(':').unwrap_or(("internal", s));
        match kind {
            "resource_exhausted" => match detail {
                "memory" => Self::ResourceExhausted {
                    guardrail: Guardrail::Memory,
                },
                "disk" => Self::ResourceExhausted {
                    guardrail: Guardrail::Disk,
                },
                _ => Self::Internal(s.to_string()),
            },
            "store_write" => Self::StoreWriteFailure(detail.to_string()),
            "seed_resolution" => Self::SeedResolution(detail.to_string()),
            "internal" => Self::Internal(detail.to_string()),
            _ => Self::Internal(s.to_string()),
        }
    }
}

impl From<AuditorError> for FailureReason {
    fn from(e: AuditorError) -> Self {
        match e {
            AuditorError::StoreWrite { message, .. } => Self::StoreWriteFailure(message),
            AuditorError::StagingClosed => {
                Self::StoreWriteFailure("staging writer is closed".to_string())
            }
            AuditorError::Storage(e) => Self::StoreWriteFailure(e.to_string()),
            AuditorError::SeedResolution(message) => Self::SeedResolution(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted { guardrail } => {
                write!(f, "resource exhausted: {} guardrail tripped", guardrail)
            }
            Self::StoreWriteFailure(message) => write!(f, "store write failed: {}", message),
            Self::SeedResolution(message) => write!(f, "seed resolution failed: {}", message),
            Self::Internal(message) => write!(f, "internal error: {}", message),
        }
    }
}

/// What `get_job_state` reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub run_id: RunId,
    pub kind: JobKind,
    pub state: JobState,
    pub progress: JobProgress,
    /// Set once the job is FAILED
    pub reason: Option<FailureReason>,
    pub advisories: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_db_strings() {
        let reasons = [
            FailureReason::ResourceExhausted {
                guardrail: Guardrail::Disk,
            },
            FailureReason::StoreWriteFailure("disk I/O error: x".to_string()),
            FailureReason::SeedResolution("sitemap unreachable".to_string()),
            FailureReason::Internal("boom".to_string()),
        ];
        for reason in reasons {
            assert_eq!(FailureReason::from_db_string(&reason.to_db_string()), reason);
        }
        assert_eq!(
            FailureReason::from_db_string("something odd"),
            FailureReason::Internal("something odd".to_string())
        );
    }

    #[test]
    fn test_failure_reason_from_error() {
        let reason = FailureReason::from(AuditorError::StoreWrite {
            run_id: 1,
            message: "locked".to_string(),
        });
        assert_eq!(reason, FailureReason::StoreWriteFailure("locked".to_string()));
        assert_eq!(
            FailureReason::from(AuditorError::SeedResolution("none".to_string())),
            FailureReason::SeedResolution("none".to_string())
        );
    }

    #[test]
    fn test_guardrail_reason_names_the_guardrail() {
        let reason = FailureReason::ResourceExhausted {
            guardrail: Guardrail::Memory,
        };
        assert!(reason.to_string().contains("memory"));
    }
}
