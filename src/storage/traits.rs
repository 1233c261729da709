//! Storage traits and error types
//!
//! This module defines the trait interfaces for storage backends and
//! associated error types. Reading and writing are split: any number of
//! readers may answer queries, while [`BatchSink`] is only ever driven by
//! the staging writer.

use crate::model::{
    Finding, JobId, JobRecord, LinkEdge, PageFact, RankScore, RuleErrorRecord, RunId,
};
use crate::staging::StagedRecord;
use crate::storage::{RunCounts, RunRecord};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Read access to persisted runs
///
/// Every query names the run it reads. Nothing here crosses run boundaries
/// except [`Storage::previous_completed_run`], which only returns an id.
pub trait Storage {
    // ===== Run Management =====

    /// Gets a run by ID
    fn get_run(&self, run_id: RunId) -> StorageResult<RunRecord>;

    /// Gets the most recent run of a project
    fn latest_run(&self, project: &str) -> StorageResult<Option<RunRecord>>;

    /// Finds the run a delta should compare against
    ///
    /// # Arguments
    ///
    /// * `run_id` - The current run
    ///
    /// # Returns
    ///
    /// The highest run id below `run_id` for the same project whose
    /// crawl-audit job succeeded, if any
    fn previous_completed_run(&self, run_id: RunId) -> StorageResult<Option<RunId>>;

    // ===== Job Management =====

    fn get_job(&self, job_id: &JobId) -> StorageResult<Option<JobRecord>>;

    fn jobs_for_run(&self, run_id: RunId) -> StorageResult<Vec<JobRecord>>;

    // ===== Run Contents =====

    /// Page facts of a run, ordered by URL
    fn page_facts(&self, run_id: RunId) -> StorageResult<Vec<PageFact>>;

    /// Link edges of a run, ordered by (src, dst)
    fn link_edges(&self, run_id: RunId) -> StorageResult<Vec<LinkEdge>>;

    /// Findings of a run, ordered by (url, rule_id)
    fn findings(&self, run_id: RunId) -> StorageResult<Vec<Finding>>;

    fn rule_errors(&self, run_id: RunId) -> StorageResult<Vec<RuleErrorRecord>>;

    /// Rank scores of a run, highest score first
    fn rank_scores(&self, run_id: RunId) -> StorageResult<Vec<RankScore>>;

    // ===== Statistics =====

    fn run_counts(&self, run_id: RunId) -> StorageResult<RunCounts>;
}

/// Transactional write access, driven only by the staging writer
pub trait BatchSink: Send {
    /// Inserts a new run row and returns its id
    fn create_run(&mut self, project: &str, config_hash: &str) -> StorageResult<RunId>;

    /// Applies records in one transaction
    ///
    /// # Arguments
    ///
    /// * `records` - Records to upsert, in staging order
    /// * `committed_seq` - When set, the staging checkpoint is advanced to
    ///   this sequence number inside the same transaction
    fn apply_batch(
        &mut self,
        records: &[StagedRecord],
        committed_seq: Option<u64>,
    ) -> StorageResult<()>;

    /// Highest staging sequence number already committed (0 when none)
    fn committed_seq(&self) -> StorageResult<u64>;
}
