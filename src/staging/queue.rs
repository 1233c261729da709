//! Producer side of staging
//!
//! Crawl workers, the rule engine and the rank computer hand records to a
//! [`StagingQueue`]. In staged mode each record is journaled, given a
//! sequence number and queued for the single [`StoreWriter`]; a full queue
//! suspends the producer. In direct mode each record is committed in its
//! own short transaction before `stage` returns.

use crate::config::{StagingConfig, StagingMode};
use crate::model::{Finding, JobRecord, LinkEdge, PageFact, RankScore, RuleErrorRecord, RunId};
use crate::staging::journal::Journal;
use crate::staging::writer::{StagingStats, StoreWriter, WriterState};
use crate::storage::{BatchSink, StorageResult};
use crate::AuditorError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Anything the store persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StagedRecord {
    Fact(PageFact),
    Edge(LinkEdge),
    Finding(Finding),
    RuleError(RuleErrorRecord),
    Rank(RankScore),
    /// Deletes every rank score of a run; staged ahead of a fresh ranking
    RankReset(RunId),
    Job(JobRecord),
}

impl StagedRecord {
    pub fn run_id(&self) -> RunId {
        match self {
            Self::Fact(fact) => fact.run_id,
            Self::Edge(edge) => edge.run_id,
            Self::Finding(finding) => finding.run_id,
            Self::RuleError(error) => error.run_id,
            Self::Rank(rank) => rank.run_id,
            Self::RankReset(run_id) => *run_id,
            Self::Job(job) => job.run_id,
        }
    }

    pub fn is_job(&self) -> bool {
        matches!(self, Self::Job(_))
    }
}

/// A queued record with its sequence number and enqueue time
#[derive(Debug)]
pub(crate) struct Envelope {
    pub seq: u64,
    pub enqueued_at: Instant,
    pub record: StagedRecord,
}

pub(crate) enum WriterMessage {
    Record(Envelope),
    CreateRun {
        project: String,
        config_hash: String,
        reply: oneshot::Sender<StorageResult<RunId>>,
    },
    /// Resolves after everything queued before it is committed
    Flush {
        run_id: RunId,
        reply: oneshot::Sender<Result<(), AuditorError>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Sequence allocation and the journal, guarded together so sequence order
/// matches queue order
#[derive(Debug)]
pub(crate) struct Producer {
    pub journal: Option<Journal>,
    pub last_assigned: u64,
}

enum Backend {
    Staged {
        tx: mpsc::Sender<WriterMessage>,
        producer: Arc<tokio::sync::Mutex<Producer>>,
    },
    Direct {
        sink: Arc<Mutex<Box<dyn BatchSink>>>,
        max_commit_failures: u32,
    },
}

struct QueueInner {
    backend: Backend,
    state: Arc<WriterState>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle used by every producer of a process
#[derive(Clone)]
pub struct StagingQueue {
    inner: Arc<QueueInner>,
}

impl StagingQueue {
    /// Starts staging over `sink`; must be called inside a Tokio runtime
    ///
    /// In staged mode, journal entries above the sink's committed checkpoint
    /// are replayed before the writer task starts.
    ///
    /// # Arguments
    ///
    /// * `config` - Staging configuration
    /// * `sink` - The store, owned by the writer from here on
    /// * `journal_path` - Journal location; `None` disables journaling
    pub fn start(
        config: &StagingConfig,
        mut sink: Box<dyn BatchSink>,
        journal_path: Option<&Path>,
    ) -> StorageResult<Self> {
        let state = Arc::new(WriterState::default());

        let backend = match config.mode {
            StagingMode::Direct => {
                tracing::info!("Staging in direct mode: producers commit their own records");
                Backend::Direct {
                    sink: Arc::new(Mutex::new(sink)),
                    max_commit_failures: config.max_commit_failures.max(1),
                }
            }
            StagingMode::Staged => {
                let mut last_assigned = sink.committed_seq()?;
                let journal = match journal_path {
                    Some(path) => {
                        let replayed = replay_journal(sink.as_mut(), path, config.batch_size)?;
                        last_assigned = last_assigned.max(replayed.max_seq);
                        state.record_replayed(replayed.applied);
                        let mut journal = Journal::open(path)?;
                        journal.truncate()?;
                        Some(journal)
                    }
                    None => None,
                };

                let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
                let producer = Arc::new(tokio::sync::Mutex::new(Producer {
                    journal,
                    last_assigned,
                }));
                let writer = StoreWriter::new(config, sink, rx, state.clone(), producer.clone());
                let handle = tokio::spawn(writer.run());

                return Ok(Self {
                    inner: Arc::new(QueueInner {
                        backend: Backend::Staged { tx, producer },
                        state,
                        writer: Mutex::new(Some(handle)),
                    }),
                });
            }
        };

        Ok(Self {
            inner: Arc::new(QueueInner {
                backend,
                state,
                writer: Mutex::new(None),
            }),
        })
    }

    /// Inserts a run row through the writer
    pub async fn create_run(&self, project: &str, config_hash: &str) -> Result<RunId, AuditorError> {
        match &self.inner.backend {
            Backend::Staged { tx, .. } => {
                let (reply, rx) = oneshot::channel();
                tx.send(WriterMessage::CreateRun {
                    project: project.to_string(),
                    config_hash: config_hash.to_string(),
                    reply,
                })
                .await
                .map_err(|_| AuditorError::StagingClosed)?;
                Ok(rx.await.map_err(|_| AuditorError::StagingClosed)??)
            }
            Backend::Direct { sink, .. } => {
                let mut sink = sink
                    .lock()
                    .map_err(|_| AuditorError::Task("store lock poisoned".to_string()))?;
                Ok(sink.create_run(project, config_hash)?)
            }
        }
    }

    /// Hands one record to the store
    ///
    /// Suspends while the queue is full. Job records always go through.
    /// Other records of a discarded run are dropped, and staging them for a
    /// run whose writes have failed returns the failure.
    pub async fn stage(&self, record: StagedRecord) -> Result<(), AuditorError> {
        let run_id = record.run_id();
        if !record.is_job() {
            if let Some(message) = self.inner.state.failure_for(run_id) {
                return Err(AuditorError::StoreWrite { run_id, message });
            }
            if self.inner.state.is_discarded(run_id) {
                return Ok(());
            }
        }

        match &self.inner.backend {
            Backend::Staged { tx, producer } => {
                let mut producer = producer.lock().await;
                let seq = producer.last_assigned + 1;
                if let Some(journal) = producer.journal.as_mut() {
                    journal.append(seq, &record)?;
                }
                producer.last_assigned = seq;

                tx.send(WriterMessage::Record(Envelope {
                    seq,
                    enqueued_at: Instant::now(),
                    record,
                }))
                .await
                .map_err(|_| AuditorError::StagingClosed)
            }
            Backend::Direct {
                sink,
                max_commit_failures,
            } => self.commit_direct(sink, *max_commit_failures, record).await,
        }
    }

    async fn commit_direct(
        &self,
        sink: &Arc<Mutex<Box<dyn BatchSink>>>,
        max_commit_failures: u32,
        record: StagedRecord,
    ) -> Result<(), AuditorError> {
        let run_id = record.run_id();
        let records = [record];
        let mut failures = 0;

        loop {
            let started = Instant::now();
            let result = {
                let mut sink = sink
                    .lock()
                    .map_err(|_| AuditorError::Task("store lock poisoned".to_string()))?;
                sink.apply_batch(&records, None)
            };

            match result {
                Ok(()) => {
                    self.inner.state.record_commit(1, started.elapsed());
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    self.inner.state.record_commit_failure();
                    tracing::warn!("Direct write failed ({}/{}): {}", failures, max_commit_failures, e);
                    if failures >= max_commit_failures {
                        let message = e.to_string();
                        self.inner.state.fail_run(run_id, &message);
                        return Err(AuditorError::StoreWrite { run_id, message });
                    }
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(failures))).await;
                }
            }
        }
    }

    /// Waits until everything staged so far for `run_id` is committed
    pub async fn flush(&self, run_id: RunId) -> Result<(), AuditorError> {
        match &self.inner.backend {
            Backend::Staged { tx, .. } => {
                let (reply, rx) = oneshot::channel();
                tx.send(WriterMessage::Flush { run_id, reply })
                    .await
                    .map_err(|_| AuditorError::StagingClosed)?;
                rx.await.map_err(|_| AuditorError::StagingClosed)?
            }
            Backend::Direct { .. } => match self.inner.state.failure_for(run_id) {
                Some(message) => Err(AuditorError::StoreWrite { run_id, message }),
                None => Ok(()),
            },
        }
    }

    /// Stops committing non-job records of a cancelled run
    ///
    /// Batches already committed stay in the store.
    pub fn discard_run(&self, run_id: RunId) {
        self.inner.state.discard_run(run_id);
    }

    /// Lets a discarded run commit again
    ///
    /// Call only once the job that discarded it has stopped staging.
    pub fn readmit_run(&self, run_id: RunId) {
        self.inner.state.readmit_run(run_id);
    }

    pub fn failure_for(&self, run_id: RunId) -> Option<String> {
        self.inner.state.failure_for(run_id)
    }

    pub fn advisories(&self) -> Vec<String> {
        self.inner.state.advisories()
    }

    pub fn stats(&self) -> StagingStats {
        self.inner.state.stats()
    }

    /// Commits what is queued and stops the writer task
    pub async fn shutdown(&self) {
        if let Backend::Staged { tx, .. } = &self.inner.backend {
            let (reply, rx) = oneshot::channel();
            if tx.send(WriterMessage::Shutdown(reply)).await.is_ok() {
                let _ = rx.await;
            }
        }

        let handle = self
            .inner
            .writer
            .lock()
            .ok()
            .and_then(|mut writer| writer.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Staging writer task failed: {}", e);
            }
        }
    }
}

struct Replayed {
    applied: u64,
    max_seq: u64,
}

fn replay_journal(
    sink: &mut dyn BatchSink,
    path: &Path,
    batch_size: usize,
) -> StorageResult<Replayed> {
    let committed = sink.committed_seq()?;
    let entries = Journal::read_entries(path)?;
    let max_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0);

    let pending: Vec<_> = entries.into_iter().filter(|e| e.seq > committed).collect();
    if pending.is_empty() {
        return Ok(Replayed {
            applied: 0,
            max_seq,
        });
    }

    tracing::info!(
        "Replaying {} staged records above checkpoint {} from {:?}",
        pending.len(),
        committed,
        path
    );

    for chunk in pending.chunks(batch_size.max(1)) {
        let last = chunk.iter().map(|e| e.seq).max().unwrap_or(committed);
        let records: Vec<StagedRecord> = chunk.iter().map(|e| e.record.clone()).collect();
        sink.apply_batch(&records, Some(last))?;
    }

    Ok(Replayed {
        applied: pending.len() as u64,
        max_seq,
    })
}
