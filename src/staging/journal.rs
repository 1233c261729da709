//! Append-only staging journal
//!
//! Every staged record is written here as one JSON line before it enters
//! the writer queue. Entries whose sequence number is above the store's
//! committed checkpoint are replayed when the writer starts. Replays are
//! safe because every record is applied as an upsert.

use crate::staging::StagedRecord;
use crate::storage::StorageResult;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub record: StagedRecord,
}

/// Journal file sitting next to the database
pub fn journal_path_for(database_path: &Path) -> PathBuf {
    let mut name = database_path.as_os_str().to_os_string();
    name.push(".staging.jsonl");
    PathBuf::from(name)
}

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Opens (or creates) the journal in append mode
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, seq: u64, record: &StagedRecord) -> StorageResult<()> {
        let entry = JournalEntry {
            seq,
            record: record.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    /// Drops every entry; appends continue from the start of the file
    pub fn truncate(&mut self) -> StorageResult<()> {
        self.file.set_len(0)?;
        Ok(())
    }

    /// Reads all entries in file order
    ///
    /// A torn final line (crash mid-write) is skipped with a warning.
    pub fn read_entries(path: &Path) -> StorageResult<Vec<JournalEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping unreadable journal line in {:?}: {}", path, e),
            }
        }
        Ok(entries)
    }
}
