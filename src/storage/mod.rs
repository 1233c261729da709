//! Storage module for persisting run data
//!
//! This module handles all database operations for the auditor, including:
//! - SQLite database initialization and schema management
//! - Run-scoped page facts, link edges, findings and rank scores
//! - Job records with forward-only state
//! - The staging checkpoint used for crash recovery

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{BatchSink, Storage, StorageError, StorageResult};

use crate::model::RunId;
use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
pub fn open_storage(path: &Path) -> StorageResult<SqliteStorage> {
    SqliteStorage::new(path)
}

/// Represents a crawl run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: RunId,
    pub project: String,
    pub started_at: String,
    pub config_hash: String,
}

/// Row counts of one run, used by `--stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub pages: u64,
    pub failed_pages: u64,
    pub browser_pages: u64,
    pub edges: u64,
    pub findings: u64,
    pub rule_errors: u64,
    pub rank_scores: u64,
}
