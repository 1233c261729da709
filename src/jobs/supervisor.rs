//! Job supervisor
//!
//! Every job runs as one background task that walks the state machine
//! PENDING -> STARTING -> RUNNING -> {SUCCEEDED | FAILED | CANCELLED}.
//! Each transition is staged as a job record, so the store always holds the
//! latest state. A crawl+audit job runs crawl, audit and rank in order, and
//! flushes staging between stages so no stage reads a half-written run.

use crate::audit::RuleEngine;
use crate::config::{compute_config_hash, validate, Config};
use crate::crawler::{
    build_http_client, resolve_sitemap, BrowserPool, CrawlOutcome, CrawlResources,
    CrawlScheduler, Fetcher, HttpFetcher, RetryPolicy, SpaClassifier,
};
use crate::graph::RankComputer;
use crate::jobs::guardrails::LoadMonitor;
use crate::jobs::progress::ProgressCounters;
use crate::jobs::queries::{build_graph, RunQueries};
use crate::jobs::{FailureReason, JobStatus, RunTarget};
use crate::model::{JobId, JobKind, JobRecord, RunId};
use crate::rate::RateController;
use crate::robots::RobotsCache;
use crate::staging::{journal_path_for, StagedRecord, StagingQueue};
use crate::state::JobState;
use crate::storage::{SqliteStorage, Storage, StorageError};
use crate::AuditorError;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How a job stopped short of SUCCEEDED
enum Halt {
    Cancelled,
    Failed(FailureReason),
}

impl From<AuditorError> for Halt {
    fn from(e: AuditorError) -> Self {
        Halt::Failed(FailureReason::from(e))
    }
}

struct JobSlot {
    record: JobRecord,
    reason: Option<FailureReason>,
}

/// In-memory side of one job
struct JobEntry {
    slot: Mutex<JobSlot>,
    progress: Arc<ProgressCounters>,
    cancel: CancellationToken,
    state_tx: watch::Sender<JobState>,
}

impl JobEntry {
    fn new(run_id: RunId, kind: JobKind) -> Self {
        let (state_tx, _) = watch::channel(JobState::Pending);
        Self {
            slot: Mutex::new(JobSlot {
                record: JobRecord {
                    id: JobId::new(),
                    run_id,
                    kind,
                    state: JobState::Pending,
                    started_at: None,
                    ended_at: None,
                    error: None,
                },
                reason: None,
            }),
            progress: Arc::new(ProgressCounters::new()),
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    fn slot(&self) -> MutexGuard<'_, JobSlot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self) -> JobRecord {
        self.slot().record.clone()
    }
}

struct Shared {
    reader: Arc<Mutex<SqliteStorage>>,
    staging: StagingQueue,
    data_path: PathBuf,
    /// Host aggregation threshold for link/rank jobs
    rank_threshold: usize,
    jobs: Mutex<HashMap<String, Arc<JobEntry>>>,
    /// The live job of each run
    live_runs: Mutex<HashMap<RunId, JobId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Starts, cancels and reports on jobs
///
/// All runs share one store and one staging writer; each run gets its own
/// rate controller, robots cache and browser pool.
#[derive(Clone)]
pub struct JobSupervisor {
    shared: Arc<Shared>,
}

impl JobSupervisor {
    /// Opens the store named by `config.output.database_path`
    ///
    /// Replays any staging journal left by an earlier process. Must be
    /// called inside a Tokio runtime.
    pub fn open(config: &Config) -> Result<Self, AuditorError> {
        let path = Path::new(&config.output.database_path);
        let writer = SqliteStorage::new(path)?;
        let reader = SqliteStorage::new(path)?;
        let journal = journal_path_for(path);
        let staging = StagingQueue::start(&config.staging, Box::new(writer), Some(&journal))?;

        let stats = staging.stats();
        if stats.replayed_records > 0 {
            tracing::info!("Replayed {} staged record(s) from {}", stats.replayed_records, journal.display());
        }

        Ok(Self {
            shared: Arc::new(Shared {
                reader: Arc::new(Mutex::new(reader)),
                staging,
                data_path: path.to_path_buf(),
                rank_threshold: config.rank.host_aggregation_threshold,
                jobs: Mutex::new(HashMap::new()),
                live_runs: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Query access to stored runs
    pub fn queries(&self) -> RunQueries {
        RunQueries::new(self.shared.reader.clone())
    }

    /// Creates a run for `project` and starts its crawl+audit job
    ///
    /// # Arguments
    ///
    /// * `project` - Project name; runs of one project are compared for deltas
    /// * `target` - Seeds or a sitemap URL
    /// * `config` - Effective configuration of the run (its database path is
    ///   ignored; the supervisor's store is used)
    ///
    /// # Returns
    ///
    /// The id of the new job, in PENDING
    pub async fn start_run(
        &self,
        project: &str,
        target: RunTarget,
        config: Config,
    ) -> Result<JobId, AuditorError> {
        validate(&config)?;
        let config_hash = compute_config_hash(&config);
        let run_id = self.shared.staging.create_run(project, &config_hash).await?;
        tracing::info!("Created run {} for project '{}'", run_id, project);

        let entry = self.register(run_id, JobKind::CrawlAudit)?;
        let job_id = entry.record().id;
        self.shared.staging.stage(StagedRecord::Job(entry.record())).await?;

        let supervisor = self.clone();
        tokio::spawn(async move {
            let result = supervisor.crawl_audit(&entry, target, &config).await;
            supervisor.finish(&entry, result).await;
        });

        Ok(job_id)
    }

    /// Recomputes the link graph and ranks of an existing run as a new job
    pub async fn start_link_rank(&self, run_id: RunId) -> Result<JobId, AuditorError> {
        lock(&self.shared.reader)
            .get_run(run_id)
            .map_err(|e| match e {
                StorageError::RunNotFound(id) => AuditorError::RunNotFound(id),
                other => AuditorError::Storage(other),
            })?;
        let threshold = self.shared.rank_threshold;

        let entry = self.register(run_id, JobKind::LinkRank)?;
        let job_id = entry.record().id;
        self.shared.staging.stage(StagedRecord::Job(entry.record())).await?;

        let supervisor = self.clone();
        tokio::spawn(async move {
            let result = supervisor.link_rank(&entry, threshold).await;
            supervisor.finish(&entry, result).await;
        });

        Ok(job_id)
    }

    /// Requests cancellation
    ///
    /// Returns immediately; the job reaches CANCELLED once its in-flight work
    /// has stopped. Cancelling a finished job is a no-op.
    pub fn cancel_run(&self, job_id: &JobId) -> Result<(), AuditorError> {
        let entry = self.entry(job_id)?;
        let record = entry.record();
        if record.state.is_terminal() {
            return Ok(());
        }

        tracing::info!("Cancelling job {} (run {})", job_id, record.run_id);
        if record.kind == JobKind::CrawlAudit {
            self.shared.staging.discard_run(record.run_id);
        }
        entry.cancel.cancel();
        Ok(())
    }

    /// Current state, progress counters and failure reason of a job
    ///
    /// Jobs of earlier processes are answered from the store, without
    /// progress counters.
    pub fn get_job_state(&self, job_id: &JobId) -> Result<JobStatus, AuditorError> {
        if let Ok(entry) = self.entry(job_id) {
            let (record, reason) = {
                let slot = entry.slot();
                (slot.record.clone(), slot.reason.clone())
            };
            let mut advisories = entry.progress.advisories();
            advisories.extend(self.shared.staging.advisories());
            return Ok(JobStatus {
                job_id: record.id,
                run_id: record.run_id,
                kind: record.kind,
                state: record.state,
                progress: entry.progress.snapshot(),
                reason,
                advisories,
                started_at: record.started_at,
                ended_at: record.ended_at,
            });
        }

        let record = lock(&self.shared.reader)
            .get_job(job_id)?
            .ok_or_else(|| AuditorError::JobNotFound(job_id.to_string()))?;
        Ok(JobStatus {
            job_id: record.id,
            run_id: record.run_id,
            kind: record.kind,
            state: record.state,
            progress: Default::default(),
            reason: record.error.as_deref().map(FailureReason::from_db_string),
            advisories: Vec::new(),
            started_at: record.started_at,
            ended_at: record.ended_at,
        })
    }

    /// Waits until the job is terminal and its final record is committed
    pub async fn wait(&self, job_id: &JobId) -> Result<JobStatus, AuditorError> {
        let entry = self.entry(job_id)?;
        let mut rx = entry.state_tx.subscribe();
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| AuditorError::Task(format!("job {} vanished", job_id)))?;
        self.get_job_state(job_id)
    }

    /// Cancels live jobs and drains the staging writer
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<JobEntry>> = lock(&self.shared.jobs).values().cloned().collect();
        for entry in &entries {
            if entry.record().state.is_active() {
                let _ = self.cancel_run(&entry.record().id);
            }
        }
        for entry in &entries {
            let mut rx = entry.state_tx.subscribe();
            let _ = rx.wait_for(|state| state.is_terminal()).await;
        }
        self.shared.staging.shutdown().await;
    }

    // ===== Job Bookkeeping =====

    fn entry(&self, job_id: &JobId) -> Result<Arc<JobEntry>, AuditorError> {
        lock(&self.shared.jobs)
            .get(job_id.as_str())
            .cloned()
            .ok_or_else(|| AuditorError::JobNotFound(job_id.to_string()))
    }

    /// Registers a PENDING job, enforcing one live job per run
    fn register(&self, run_id: RunId, kind: JobKind) -> Result<Arc<JobEntry>, AuditorError> {
        let mut live_runs = lock(&self.shared.live_runs);
        if let Some(job_id) = live_runs.get(&run_id) {
            return Err(AuditorError::RunBusy {
                run_id,
                job_id: job_id.to_string(),
            });
        }

        let entry = Arc::new(JobEntry::new(run_id, kind));
        let job_id = entry.record().id;
        live_runs.insert(run_id, job_id.clone());
        lock(&self.shared.jobs).insert(job_id.0.clone(), entry.clone());
        tracing::info!("Job {} ({}) registered for run {}", job_id, kind.to_db_string(), run_id);
        Ok(entry)
    }

    /// Moves a job forward and stages its record
    async fn advance(
        &self,
        entry: &JobEntry,
        next: JobState,
        reason: Option<FailureReason>,
    ) -> Result<(), AuditorError> {
        let record = {
            let mut slot = entry.slot();
            let state = slot.record.state.transition(next)?;
            let now = Utc::now();
            slot.record.state = state;
            if state == JobState::Starting {
                slot.record.started_at = Some(now);
            }
            if state.is_terminal() {
                slot.record.ended_at = Some(now);
                slot.record.error = reason.as_ref().map(FailureReason::to_db_string);
                slot.reason = reason;
            }
            slot.record.clone()
        };

        tracing::info!("Job {} (run {}) -> {}", record.id, record.run_id, record.state);
        if !record.state.is_terminal() {
            entry.state_tx.send_replace(record.state);
        }
        self.shared.staging.stage(StagedRecord::Job(record)).await
    }

    async fn finish(&self, entry: &JobEntry, result: Result<(), Halt>) {
        let (state, reason) = match result {
            Ok(()) => (JobState::Succeeded, None),
            Err(Halt::Cancelled) => (JobState::Cancelled, None),
            Err(Halt::Failed(reason)) => (JobState::Failed, Some(reason)),
        };

        let record = entry.record();
        if let Some(reason) = &reason {
            tracing::error!("Job {} (run {}) failed: {}", record.id, record.run_id, reason);
        }

        if let Err(e) = self.advance(entry, state, reason).await {
            tracing::error!("Could not record final state of job {}: {}", record.id, e);
        }
        // Failed and discarded runs still commit their job records
        if let Err(e) = self.shared.staging.flush(record.run_id).await {
            tracing::debug!("Final flush of run {}: {}", record.run_id, e);
        }
        // Pending records of the cancelled job are gone; later jobs on the run may write
        if state == JobState::Cancelled && record.kind == JobKind::CrawlAudit {
            self.shared.staging.readmit_run(record.run_id);
        }

        lock(&self.shared.live_runs).remove(&record.run_id);
        entry.state_tx.send_replace(state);
    }

    fn check_cancelled(entry: &JobEntry) -> Result<(), Halt> {
        if entry.cancel.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    // ===== Pipelines =====

    async fn crawl_audit(&self, entry: &JobEntry, target: RunTarget, config: &Config) -> Result<(), Halt> {
        let run_id = entry.record().run_id;
        Self::check_cancelled(entry)?;
        self.advance(entry, JobState::Starting, None).await?;

        let client = build_http_client(config).map_err(AuditorError::from)?;
        let seeds = match target {
            RunTarget::Seeds(seeds) => seeds,
            RunTarget::Sitemap(url) => resolve_sitemap(&client, &url).await?,
        };
        if seeds.is_empty() {
            return Err(Halt::Failed(FailureReason::SeedResolution(
                "no seed URLs to crawl".to_string(),
            )));
        }

        let rate = RateController::new(&config.crawler);
        let browser = config
            .browser
            .enabled
            .then(|| Arc::new(BrowserPool::chromium(&config.browser)));
        let watchdog = browser
            .as_ref()
            .map(|pool| pool.spawn_watchdog(entry.cancel.child_token()));

        let fetcher = Fetcher::new(
            HttpFetcher::new(client, rate.clone(), RetryPolicy::default()),
            Arc::new(SpaClassifier::new()),
            browser.clone(),
        );
        let resources = CrawlResources {
            fetcher: Arc::new(fetcher),
            rate,
            robots: Arc::new(RobotsCache::new()),
            staging: self.shared.staging.clone(),
        };

        let scheduler = CrawlScheduler::new(
            run_id,
            config,
            &seeds,
            resources,
            entry.progress.clone(),
            entry.cancel.clone(),
        )?
        .with_monitor(LoadMonitor::system(&config.guardrails, &self.shared.data_path));

        Self::check_cancelled(entry)?;
        self.advance(entry, JobState::Running, None).await?;

        let outcome = scheduler.run().await;

        // Browser sessions never outlive the crawl
        if let Some(pool) = &browser {
            pool.shutdown().await;
            let stats = pool.stats();
            tracing::info!(
                "Run {}: browser rendered {} page(s), {} recycle event(s), {} watchdog termination(s)",
                run_id,
                stats.pages_rendered,
                stats.recycle_events,
                stats.watchdog_terminations
            );
        }
        if let Some(handle) = watchdog {
            handle.abort();
        }

        match outcome? {
            CrawlOutcome::Cancelled => return Err(Halt::Cancelled),
            CrawlOutcome::ResourceExhausted(guardrail) => {
                // Keep what was fetched before the guardrail tripped
                self.shared.staging.flush(run_id).await?;
                return Err(Halt::Failed(FailureReason::ResourceExhausted { guardrail }));
            }
            CrawlOutcome::BudgetReached => {
                tracing::info!("Run {}: page budget of {} reached", run_id, config.crawler.page_budget);
            }
            CrawlOutcome::Completed => {}
        }

        self.shared.staging.flush(run_id).await?;
        Self::check_cancelled(entry)?;
        self.audit(entry, run_id).await?;

        Self::check_cancelled(entry)?;
        self.rank(entry, run_id, config.rank.host_aggregation_threshold).await?;
        Self::check_cancelled(entry)
    }

    async fn link_rank(&self, entry: &JobEntry, threshold: usize) -> Result<(), Halt> {
        let run_id = entry.record().run_id;
        Self::check_cancelled(entry)?;
        self.advance(entry, JobState::Starting, None).await?;
        self.advance(entry, JobState::Running, None).await?;
        self.rank(entry, run_id, threshold).await?;
        Self::check_cancelled(entry)
    }

    /// Evaluates every rule against the run's committed facts
    async fn audit(&self, entry: &JobEntry, run_id: RunId) -> Result<(), Halt> {
        let facts = lock(&self.shared.reader).page_facts(run_id).map_err(AuditorError::from)?;
        let evaluation = RuleEngine::new().evaluate_all(&facts);

        tracing::info!(
            "Run {}: audit produced {} finding(s) and {} rule error(s) over {} page(s)",
            run_id,
            evaluation.findings.len(),
            evaluation.errors.len(),
            facts.len()
        );

        entry.progress.add_findings(evaluation.findings.len() as u64);
        entry.progress.add_rule_errors(evaluation.errors.len() as u64);

        for finding in evaluation.findings {
            self.shared.staging.stage(StagedRecord::Finding(finding)).await?;
        }
        for error in evaluation.errors {
            self.shared.staging.stage(StagedRecord::RuleError(error)).await?;
        }
        self.shared.staging.flush(run_id).await?;
        Ok(())
    }

    /// Builds the link graph from committed rows and stores its ranks
    async fn rank(&self, entry: &JobEntry, run_id: RunId, threshold: usize) -> Result<(), Halt> {
        let graph = {
            let reader = lock(&self.shared.reader);
            let facts = reader.page_facts(run_id).map_err(AuditorError::from)?;
            let edges = reader.link_edges(run_id).map_err(AuditorError::from)?;
            build_graph(run_id, &facts, &edges)
        };

        let output = RankComputer::new(threshold).compute(run_id, &graph);
        if output.host_aggregated {
            entry.progress.advise(format!(
                "link graph has {} edges (threshold {}); page scores were derived from host-level PageRank",
                graph.edge_count(),
                threshold
            ));
        }
        if !output.converged {
            entry.progress.advise(format!(
                "PageRank stopped after {} iterations without converging",
                output.iterations_used
            ));
        }

        Self::check_cancelled(entry)?;
        entry.progress.add_rank_scores(output.scores.len() as u64);
        // A rerun may switch between page and host level; never mix the two
        self.shared.staging.stage(StagedRecord::RankReset(run_id)).await?;
        for score in output.scores {
            self.shared.staging.stage(StagedRecord::Rank(score)).await?;
        }
        self.shared.staging.flush(run_id).await?;

        tracing::info!(
            "Run {}: ranked {} page(s) in {} iteration(s)",
            run_id,
            graph.page_count(),
            output.iterations_used
        );
        Ok(())
    }
}
