//! Staging between producers and the store
//!
//! This module handles:
//! - The bounded queue producers stage facts, edges, findings and ranks into
//! - The append-only journal that makes staged records survive a crash
//! - The single writer that commits staged records in transactional batches
//! - Direct-write mode, where producers commit their own records

mod journal;
mod queue;
mod writer;

pub use journal::{journal_path_for, Journal, JournalEntry};
pub use queue::{StagedRecord, StagingQueue};
pub use writer::StagingStats;
