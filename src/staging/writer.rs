//! The single store writer
//!
//! Drains the staging queue into the store in batches. A batch is cut when
//! it reaches `batch-size` records or when `flush-interval-ms` passes after
//! its first record. Each batch commits in one transaction together with
//! the staging checkpoint. A failed commit retries the whole batch; after
//! `max-commit-failures` consecutive failures the runs in the batch fail.

use crate::config::StagingConfig;
use crate::model::RunId;
use crate::staging::queue::{Envelope, Producer, StagedRecord, WriterMessage};
use crate::storage::BatchSink;
use crate::AuditorError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StagingStats {
    pub committed_records: u64,
    pub committed_batches: u64,
    pub commit_failures: u64,
    pub discarded_records: u64,
    pub replayed_records: u64,
    /// Running average of producer-to-commit latency
    pub avg_latency_ms: f64,
}

/// State shared between producers and the writer
#[derive(Debug, Default)]
pub(crate) struct WriterState {
    failed_runs: Mutex<HashMap<RunId, String>>,
    discarded_runs: Mutex<HashSet<RunId>>,
    stats: Mutex<StagingStats>,
    advisories: Mutex<Vec<String>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WriterState {
    pub fn failure_for(&self, run_id: RunId) -> Option<String> {
        locked(&self.failed_runs).get(&run_id).cloned()
    }

    pub fn fail_run(&self, run_id: RunId, message: &str) {
        locked(&self.failed_runs)
            .entry(run_id)
            .or_insert_with(|| message.to_string());
    }

    pub fn is_discarded(&self, run_id: RunId) -> bool {
        locked(&self.discarded_runs).contains(&run_id)
    }

    pub fn discard_run(&self, run_id: RunId) {
        locked(&self.discarded_runs).insert(run_id);
    }

    pub fn readmit_run(&self, run_id: RunId) {
        locked(&self.discarded_runs).remove(&run_id);
    }

    pub fn stats(&self) -> StagingStats {
        *locked(&self.stats)
    }

    pub fn advisories(&self) -> Vec<String> {
        locked(&self.advisories).clone()
    }

    pub fn record_replayed(&self, count: u64) {
        locked(&self.stats).replayed_records += count;
    }

    pub fn record_commit_failure(&self) {
        locked(&self.stats).commit_failures += 1;
    }

    /// Folds one committed batch into the counters and returns the new average latency
    pub fn record_commit(&self, records: u64, total_latency: Duration) -> f64 {
        let mut stats = locked(&self.stats);
        let previous = stats.committed_records as f64;
        let total_ms = total_latency.as_secs_f64() * 1000.0;
        stats.committed_records += records;
        stats.committed_batches += 1;
        if stats.committed_records > 0 {
            stats.avg_latency_ms =
                (stats.avg_latency_ms * previous + total_ms) / stats.committed_records as f64;
        }
        stats.avg_latency_ms
    }

    fn record_discarded(&self, count: u64) {
        locked(&self.stats).discarded_records += count;
    }

    fn push_advisory(&self, advisory: String) -> bool {
        let mut advisories = locked(&self.advisories);
        if advisories.contains(&advisory) {
            return false;
        }
        advisories.push(advisory);
        true
    }
}

pub(crate) struct StoreWriter {
    sink: Box<dyn BatchSink>,
    rx: mpsc::Receiver<WriterMessage>,
    state: Arc<WriterState>,
    producer: Arc<tokio::sync::Mutex<Producer>>,
    pending: Vec<Envelope>,
    deadline: Option<Instant>,
    batch_size: usize,
    flush_interval: Duration,
    max_commit_failures: u32,
    latency_warn_ms: u64,
}

impl StoreWriter {
    pub fn new(
        config: &StagingConfig,
        sink: Box<dyn BatchSink>,
        rx: mpsc::Receiver<WriterMessage>,
        state: Arc<WriterState>,
        producer: Arc<tokio::sync::Mutex<Producer>>,
    ) -> Self {
        Self {
            sink,
            rx,
            state,
            producer,
            pending: Vec::new(),
            deadline: None,
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            max_commit_failures: config.max_commit_failures.max(1),
            latency_warn_ms: config.latency_warn_ms,
        }
    }

    async fn next_message(&mut self) -> Option<Option<WriterMessage>> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.rx.recv()).await.ok(),
            None => Some(self.rx.recv().await),
        }
    }

    pub async fn run(mut self) {
        tracing::debug!("Staging writer started");

        loop {
            let message = match self.next_message().await {
                // Interval elapsed with a partial batch
                None => {
                    self.commit_pending().await;
                    continue;
                }
                Some(message) => message,
            };

            match message {
                Some(WriterMessage::Record(envelope)) => {
                    if self.pending.is_empty() {
                        self.deadline = Some(Instant::now() + self.flush_interval);
                    }
                    self.pending.push(envelope);
                    if self.pending.len() >= self.batch_size {
                        self.commit_pending().await;
                    }
                }
                Some(WriterMessage::CreateRun {
                    project,
                    config_hash,
                    reply,
                }) => {
                    let _ = reply.send(self.sink.create_run(&project, &config_hash));
                }
                Some(WriterMessage::Flush { run_id, reply }) => {
                    self.commit_pending().await;
                    let result = match self.state.failure_for(run_id) {
                        Some(message) => Err(AuditorError::StoreWrite { run_id, message }),
                        None => Ok(()),
                    };
                    let _ = reply.send(result);
                }
                Some(WriterMessage::Shutdown(reply)) => {
                    self.commit_pending().await;
                    let _ = reply.send(());
                    break;
                }
                None => {
                    self.commit_pending().await;
                    break;
                }
            }
        }

        tracing::debug!("Staging writer stopped");
    }

    /// Commits the pending batch, retrying it whole on failure
    async fn commit_pending(&mut self) {
        self.deadline = None;
        if self.pending.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.pending);
        let last_seq = batch.iter().map(|e| e.seq).max().unwrap_or(0);
        let enqueued: Vec<Instant> = batch
            .iter()
            .map(|e| Instant::from_std(e.enqueued_at))
            .collect();

        let total = batch.len();
        let records: Vec<StagedRecord> = batch
            .into_iter()
            .map(|e| e.record)
            .filter(|record| {
                record.is_job()
                    || (!self.state.is_discarded(record.run_id())
                        && self.state.failure_for(record.run_id()).is_none())
            })
            .collect();
        let discarded = total - records.len();
        if discarded > 0 {
            tracing::debug!("Discarded {} staged records of cancelled or failed runs", discarded);
            self.state.record_discarded(discarded as u64);
        }

        let mut failures = 0;
        loop {
            match self.sink.apply_batch(&records, Some(last_seq)) {
                Ok(()) => {
                    let now = Instant::now();
                    let total_latency: Duration = enqueued
                        .iter()
                        .map(|at| now.saturating_duration_since(*at))
                        .sum();
                    let avg = self.state.record_commit(records.len() as u64, total_latency);
                    tracing::debug!("Committed batch of {} records up to seq {}", records.len(), last_seq);
                    self.check_latency(avg);
                    self.compact(last_seq);
                    return;
                }
                Err(e) => {
                    failures += 1;
                    self.state.record_commit_failure();
                    tracing::warn!(
                        "Batch commit failed ({}/{}): {}",
                        failures,
                        self.max_commit_failures,
                        e
                    );

                    if failures >= self.max_commit_failures {
                        let message = format!("batch commit failed {} times: {}", failures, e);
                        let runs: BTreeSet<RunId> = records.iter().map(|r| r.run_id()).collect();
                        for run_id in runs {
                            tracing::error!("Failing run {}: {}", run_id, message);
                            self.state.fail_run(run_id, &message);
                        }
                        return;
                    }

                    tokio::time::sleep(Duration::from_millis(100 * u64::from(failures))).await;
                }
            }
        }
    }

    fn check_latency(&self, avg_latency_ms: f64) {
        if self.latency_warn_ms == 0 || avg_latency_ms <= self.latency_warn_ms as f64 {
            return;
        }
        let advisory = format!(
            "staging latency {:.0}ms exceeds {}ms; consider staging mode \"direct\"",
            avg_latency_ms, self.latency_warn_ms
        );
        if self.state.push_advisory(advisory.clone()) {
            tracing::warn!("{}", advisory);
        }
    }

    /// Empties the journal once every assigned sequence is committed
    fn compact(&self, committed_seq: u64) {
        let Ok(mut producer) = self.producer.try_lock() else {
            return;
        };
        if producer.last_assigned != committed_seq {
            return;
        }
        if let Some(journal) = producer.journal.as_mut() {
            if let Err(e) = journal.truncate() {
                tracing::warn!("Failed to compact staging journal: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{StagingConfig, StagingMode};
    use crate::model::{JobId, JobKind, JobRecord, PageFact, RunId};
    use crate::staging::journal::{journal_path_for, Journal};
    use crate::staging::{StagedRecord, StagingQueue};
    use crate::state::JobState;
    use crate::storage::{BatchSink, SqliteStorage, Storage, StorageError, StorageResult};
    use crate::AuditorError;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryState {
        batches: Vec<Vec<StagedRecord>>,
        committed: u64,
        fail_next: u32,
        runs: i64,
    }

    #[derive(Clone, Default)]
    struct MemorySink {
        state: Arc<Mutex<MemoryState>>,
    }

    impl MemorySink {
        fn failing(times: u32) -> Self {
            let sink = Self::default();
            sink.state.lock().unwrap().fail_next = times;
            sink
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.state.lock().unwrap().batches.iter().map(Vec::len).collect()
        }

        fn records(&self) -> Vec<StagedRecord> {
            self.state.lock().unwrap().batches.concat()
        }
    }

    impl BatchSink for MemorySink {
        fn create_run(&mut self, _project: &str, _config_hash: &str) -> StorageResult<RunId> {
            let mut state = self.state.lock().unwrap();
            state.runs += 1;
            Ok(state.runs)
        }

        fn apply_batch(
            &mut self,
            records: &[StagedRecord],
            committed_seq: Option<u64>,
        ) -> StorageResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(StorageError::Database("disk I/O error".to_string()));
            }
            state.batches.push(records.to_vec());
            if let Some(seq) = committed_seq {
                state.committed = state.committed.max(seq);
            }
            Ok(())
        }

        fn committed_seq(&self) -> StorageResult<u64> {
            Ok(self.state.lock().unwrap().committed)
        }
    }

    fn config(batch_size: usize) -> StagingConfig {
        StagingConfig {
            batch_size,
            flush_interval_ms: 20,
            ..StagingConfig::default()
        }
    }

    fn fact(run_id: RunId, path: &str) -> StagedRecord {
        StagedRecord::Fact(PageFact::empty(
            run_id,
            &format!("https://ex.com{}", path),
            "ex.com",
            0,
        ))
    }

    fn job(run_id: RunId, state: JobState) -> StagedRecord {
        StagedRecord::Job(JobRecord {
            id: JobId::new(),
            run_id,
            kind: JobKind::CrawlAudit,
            state,
            started_at: None,
            ended_at: None,
            error: None,
        })
    }

    #[tokio::test]
    async fn test_batches_by_size() {
        let sink = MemorySink::default();
        let queue = StagingQueue::start(&config(2), Box::new(sink.clone()), None).unwrap();

        for i in 0..5 {
            queue.stage(fact(1, &format!("/{}", i))).await.unwrap();
        }
        queue.flush(1).await.unwrap();

        assert_eq!(sink.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(sink.state.lock().unwrap().committed, 5);
        assert_eq!(queue.stats().committed_records, 5);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_batch_commits_after_interval() {
        let sink = MemorySink::default();
        let queue = StagingQueue::start(&config(100), Box::new(sink.clone()), None).unwrap();

        queue.stage(fact(1, "/")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sink.batch_sizes(), vec![1]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_commit_is_retried_whole() {
        let sink = MemorySink::failing(1);
        let queue = StagingQueue::start(&config(10), Box::new(sink.clone()), None).unwrap();

        queue.stage(fact(1, "/")).await.unwrap();
        queue.stage(fact(1, "/a")).await.unwrap();
        queue.flush(1).await.unwrap();

        assert_eq!(sink.batch_sizes(), vec![2]);
        assert_eq!(queue.stats().commit_failures, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_fails_after_consecutive_commit_failures() {
        let sink = MemorySink::failing(10);
        let queue = StagingQueue::start(&config(10), Box::new(sink.clone()), None).unwrap();

        queue.stage(fact(7, "/")).await.unwrap();
        let result = queue.flush(7).await;
        assert!(matches!(result, Err(AuditorError::StoreWrite { run_id: 7, .. })));
        assert!(queue.failure_for(7).is_some());
        assert_eq!(queue.stats().commit_failures, 3);

        // Later records of the failed run are refused
        assert!(queue.stage(fact(7, "/a")).await.is_err());
        // Other runs are unaffected
        assert!(queue.flush(8).await.is_ok());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_discarded_run_keeps_job_records() {
        let sink = MemorySink::default();
        let queue = StagingQueue::start(&config(10), Box::new(sink.clone()), None).unwrap();

        queue.stage(fact(3, "/")).await.unwrap();
        queue.discard_run(3);
        queue.stage(fact(3, "/a")).await.unwrap();
        queue.stage(job(3, JobState::Cancelled)).await.unwrap();
        queue.flush(3).await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_job());
        assert_eq!(queue.stats().discarded_records, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_readmitted_run_commits_again() {
        let sink = MemorySink::default();
        let queue = StagingQueue::start(&config(10), Box::new(sink.clone()), None).unwrap();

        queue.stage(fact(4, "/")).await.unwrap();
        queue.discard_run(4);
        queue.flush(4).await.unwrap();
        assert!(sink.records().is_empty());

        queue.readmit_run(4);
        queue.stage(fact(4, "/a")).await.unwrap();
        queue.flush(4).await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(&records[0], StagedRecord::Fact(f) if f.url == "https://ex.com/a"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_mode_commits_each_record() {
        let sink = MemorySink::default();
        let staging = StagingConfig {
            mode: StagingMode::Direct,
            ..config(10)
        };
        let queue = StagingQueue::start(&staging, Box::new(sink.clone()), None).unwrap();

        let run_id = queue.create_run("site", "h").await.unwrap();
        queue.stage(fact(run_id, "/")).await.unwrap();
        queue.stage(fact(run_id, "/a")).await.unwrap();

        // Committed before flush
        assert_eq!(sink.batch_sizes(), vec![1, 1]);
        assert!(queue.flush(run_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_journal_replay_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("audit.db");
        let journal_path = journal_path_for(&db_path);

        let mut store = SqliteStorage::new(&db_path).unwrap();
        let run_id = store.create_run("site", "h").unwrap();
        drop(store);

        // A crash left three records journaled but never committed
        let mut journal = Journal::open(&journal_path).unwrap();
        for (seq, path) in [(1, "/"), (2, "/a"), (3, "/")] {
            journal.append(seq, &fact(run_id, path)).unwrap();
        }
        drop(journal);

        for _ in 0..2 {
            let sink = SqliteStorage::new(&db_path).unwrap();
            let queue = StagingQueue::start(&config(2), Box::new(sink), Some(&journal_path)).unwrap();
            queue.shutdown().await;
        }

        let reader = SqliteStorage::new(&db_path).unwrap();
        assert_eq!(reader.page_facts(run_id).unwrap().len(), 2);
        assert_eq!(reader.committed_seq().unwrap(), 3);
        assert!(Journal::read_entries(&journal_path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequences_continue_past_checkpoint() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("audit.db");
        let journal_path = journal_path_for(&db_path);

        let mut store = SqliteStorage::new(&db_path).unwrap();
        let run_id = store.create_run("site", "h").unwrap();
        store.apply_batch(&[], Some(40)).unwrap();
        drop(store);

        let queue = StagingQueue::start(
            &config(10),
            Box::new(SqliteStorage::new(&db_path).unwrap()),
            Some(&journal_path),
        )
        .unwrap();
        queue.stage(fact(run_id, "/")).await.unwrap();
        queue.flush(run_id).await.unwrap();
        queue.shutdown().await;

        let reader = SqliteStorage::new(&db_path).unwrap();
        assert_eq!(reader.committed_seq().unwrap(), 41);
    }
}
