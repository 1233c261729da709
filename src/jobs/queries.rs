//! Read access to stored runs
//!
//! Queries go through their own connection, never the staging writer's.
//! Deltas and link statistics are derived on demand from stored rows.

use crate::audit::classify;
use crate::graph::{LinkGraph, LinkGraphBuilder};
use crate::model::{DeltaRecord, Finding, LinkEdge, LinkStat, PageFact, RankScore, RuleErrorRecord, RunId};
use crate::storage::{RunCounts, RunRecord, SqliteStorage, Storage, StorageResult};
use crate::url::SiteScope;
use std::sync::{Arc, Mutex, MutexGuard};

/// Query handle over the store; cheap to clone
#[derive(Clone)]
pub struct RunQueries {
    storage: Arc<Mutex<SqliteStorage>>,
}

impl RunQueries {
    pub fn new(storage: Arc<Mutex<SqliteStorage>>) -> Self {
        Self { storage }
    }

    fn storage(&self) -> MutexGuard<'_, SqliteStorage> {
        self.storage.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn run(&self, run_id: RunId) -> StorageResult<RunRecord> {
        self.storage().get_run(run_id)
    }

    pub fn latest_run(&self, project: &str) -> StorageResult<Option<RunRecord>> {
        self.storage().latest_run(project)
    }

    pub fn page_facts(&self, run_id: RunId) -> StorageResult<Vec<PageFact>> {
        self.storage().page_facts(run_id)
    }

    pub fn findings(&self, run_id: RunId) -> StorageResult<Vec<Finding>> {
        self.storage().findings(run_id)
    }

    pub fn rule_errors(&self, run_id: RunId) -> StorageResult<Vec<RuleErrorRecord>> {
        self.storage().rule_errors(run_id)
    }

    pub fn link_edges(&self, run_id: RunId) -> StorageResult<Vec<LinkEdge>> {
        self.storage().link_edges(run_id)
    }

    pub fn rank_scores(&self, run_id: RunId) -> StorageResult<Vec<RankScore>> {
        self.storage().rank_scores(run_id)
    }

    pub fn run_counts(&self, run_id: RunId) -> StorageResult<RunCounts> {
        self.storage().run_counts(run_id)
    }

    /// Run-over-run change of every finding
    ///
    /// Compares against the immediately preceding completed run of the same
    /// project. Without one, every current finding is `Added`.
    pub fn deltas(&self, run_id: RunId) -> StorageResult<Vec<DeltaRecord>> {
        let storage = self.storage();
        let current = storage.findings(run_id)?;
        let previous = match storage.previous_completed_run(run_id)? {
            Some(previous_id) => storage.findings(previous_id)?,
            None => Vec::new(),
        };
        Ok(classify(&previous, &current))
    }

    /// Inbound/outbound degree and orphan flag of every page
    pub fn link_stats(&self, run_id: RunId) -> StorageResult<Vec<LinkStat>> {
        Ok(self.link_graph(run_id)?.link_stats())
    }

    /// Rebuilds the link graph of a run from its stored facts and edges
    pub fn link_graph(&self, run_id: RunId) -> StorageResult<LinkGraph> {
        let (facts, edges) = {
            let storage = self.storage();
            (storage.page_facts(run_id)?, storage.link_edges(run_id)?)
        };
        Ok(build_graph(run_id, &facts, &edges))
    }
}

/// Builds a run's graph, scoped by its seeds (the depth-0 pages)
pub(crate) fn build_graph(run_id: RunId, facts: &[PageFact], edges: &[LinkEdge]) -> LinkGraph {
    let mut seeds: Vec<&str> = facts
        .iter()
        .filter(|f| f.depth == 0)
        .map(|f| f.url.as_str())
        .collect();
    if seeds.is_empty() {
        seeds = facts.iter().map(|f| f.url.as_str()).collect();
    }

    let mut builder = LinkGraphBuilder::new(run_id, SiteScope::from_urls(&seeds));
    for fact in facts {
        builder.add_page(&fact.url);
    }
    for edge in edges {
        if let Err(rejection) = builder.add_edge(edge) {
            tracing::debug!("Stored edge {} -> {} skipped: {:?}", edge.src, edge.dst, rejection);
        }
    }
    builder.build()
}
