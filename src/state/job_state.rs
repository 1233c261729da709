//! Job state definitions for supervising a run
//!
//! States only move forward: every transition must strictly increase the
//! state's rank, so no state is reachable twice for the same job id.

use crate::AuditorError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the current state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    // ===== Active States =====
    /// Job is registered but has not started work
    Pending,

    /// Job is resolving seeds and acquiring resources
    Starting,

    /// Job is crawling, auditing or ranking
    Running,

    // ===== Terminal States =====
    /// Job finished all stages
    Succeeded,

    /// Job stopped with a structured failure reason
    Failed,

    /// Job was cancelled by the caller
    Cancelled,
}

impl JobState {
    /// Position in the forward-only ordering; terminal states share a rank
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Succeeded | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Returns true if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        next.rank() > self.rank()
    }

    /// Validates a transition and returns the new state
    pub fn transition(self, next: JobState) -> Result<JobState, AuditorError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AuditorError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Converts the job state to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses a job state from a database string representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::Starting,
            Self::Running,
            Self::Succeeded,
            Self::Failed,
            Self::Cancelled,
        ]
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}
