//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the [`Storage`]
//! and [`BatchSink`] traits.

use crate::model::{
    format_timestamp, parse_timestamp, Evidence, FetchMethod, Finding, JobId, JobKind, JobRecord,
    LinkEdge, PageFact, RankScore, RankSubject, RuleErrorRecord, RunId, Severity,
};
use crate::staging::StagedRecord;
use crate::state::JobState;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{BatchSink, Storage, StorageError, StorageResult};
use crate::storage::{RunCounts, RunRecord};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        // WAL lets readers query while the staging writer commits
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

// ===== Row Conversion =====

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp {}", raw)))
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("bad timestamp {}", raw))),
        None => Ok(None),
    }
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        project: row.get(1)?,
        started_at: row.get(2)?,
        config_hash: row.get(3)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let kind: String = row.get(2)?;
    let state: String = row.get(3)?;
    Ok(JobRecord {
        id: JobId(row.get(0)?),
        run_id: row.get(1)?,
        kind: JobKind::from_db_string(&kind)
            .ok_or_else(|| conversion_error(2, format!("unknown job kind {}", kind)))?,
        state: JobState::from_db_string(&state)
            .ok_or_else(|| conversion_error(3, format!("unknown job state {}", state)))?,
        started_at: optional_timestamp_column(row, 4)?,
        ended_at: optional_timestamp_column(row, 5)?,
        error: row.get(6)?,
    })
}

fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<PageFact> {
    let method: String = row.get(4)?;
    Ok(PageFact {
        run_id: row.get(0)?,
        url: row.get(1)?,
        host: row.get(2)?,
        depth: row.get(3)?,
        fetch_method: FetchMethod::from_db_string(&method)
            .ok_or_else(|| conversion_error(4, format!("unknown fetch method {}", method)))?,
        status_code: row.get(5)?,
        content_type: row.get(6)?,
        title: row.get(7)?,
        meta: json_column(row, 8)?,
        headings: json_column(row, 9)?,
        canonical: row.get(10)?,
        hreflang: json_column(row, 11)?,
        word_count: row.get(12)?,
        text_density: row.get(13)?,
        js_required: row.get(14)?,
        render_timeout: row.get(15)?,
        fetch_error: row.get(16)?,
        fetched_at: timestamp_column(row, 17)?,
    })
}

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<LinkEdge> {
    Ok(LinkEdge {
        run_id: row.get(0)?,
        src: row.get(1)?,
        dst: row.get(2)?,
        first_seen: timestamp_column(row, 3)?,
        last_seen: timestamp_column(row, 4)?,
    })
}

fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<Finding> {
    let severity: String = row.get(3)?;
    let evidence: Evidence = json_column(row, 4)?;
    Ok(Finding {
        run_id: row.get(0)?,
        url: row.get(1)?,
        rule_id: row.get(2)?,
        severity: Severity::from_db_string(&severity)
            .ok_or_else(|| conversion_error(3, format!("unknown severity {}", severity)))?,
        evidence,
        auto_fixable: row.get(5)?,
        detected_at: timestamp_column(row, 6)?,
    })
}

fn rank_from_row(row: &Row<'_>) -> rusqlite::Result<RankScore> {
    let kind: String = row.get(1)?;
    let key: String = row.get(2)?;
    Ok(RankScore {
        run_id: row.get(0)?,
        subject: RankSubject::from_parts(&kind, key)
            .ok_or_else(|| conversion_error(1, format!("unknown subject kind {}", kind)))?,
        score: row.get(3)?,
        iterations_used: row.get(4)?,
        converged: row.get(5)?,
        host_aggregated: row.get(6)?,
        computed_at: timestamp_column(row, 7)?,
    })
}

// ===== Record Upserts =====

fn upsert_fact(conn: &Connection, fact: &PageFact) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO page_facts (run_id, url, host, depth, fetch_method, status_code,
            content_type, title, meta_json, headings_json, canonical, hreflang_json,
            word_count, text_density, js_required, render_timeout, fetch_error, fetched_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(run_id, url) DO UPDATE SET
            host = excluded.host,
            depth = excluded.depth,
            fetch_method = excluded.fetch_method,
            status_code = excluded.status_code,
            content_type = excluded.content_type,
            title = excluded.title,
            meta_json = excluded.meta_json,
            headings_json = excluded.headings_json,
            canonical = excluded.canonical,
            hreflang_json = excluded.hreflang_json,
            word_count = excluded.word_count,
            text_density = excluded.text_density,
            js_required = excluded.js_required,
            render_timeout = excluded.render_timeout,
            fetch_error = excluded.fetch_error,
            fetched_at = excluded.fetched_at",
        params![
            fact.run_id,
            fact.url,
            fact.host,
            fact.depth,
            fact.fetch_method.to_db_string(),
            fact.status_code,
            fact.content_type,
            fact.title,
            serde_json::to_string(&fact.meta)?,
            serde_json::to_string(&fact.headings)?,
            fact.canonical,
            serde_json::to_string(&fact.hreflang)?,
            fact.word_count,
            fact.text_density,
            fact.js_required,
            fact.render_timeout,
            fact.fetch_error,
            format_timestamp(&fact.fetched_at),
        ],
    )?;
    Ok(())
}

fn upsert_edge(conn: &Connection, edge: &LinkEdge) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO link_edges (run_id, src, dst, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(run_id, src, dst) DO UPDATE SET
            first_seen = MIN(link_edges.first_seen, excluded.first_seen),
            last_seen = MAX(link_edges.last_seen, excluded.last_seen)",
        params![
            edge.run_id,
            edge.src,
            edge.dst,
            format_timestamp(&edge.first_seen),
            format_timestamp(&edge.last_seen),
        ],
    )?;
    Ok(())
}

fn upsert_finding(conn: &Connection, finding: &Finding) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO findings (run_id, url, rule_id, severity, evidence_json, auto_fixable, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(run_id, url, rule_id) DO UPDATE SET
            severity = excluded.severity,
            evidence_json = excluded.evidence_json,
            auto_fixable = excluded.auto_fixable,
            detected_at = excluded.detected_at",
        params![
            finding.run_id,
            finding.url,
            finding.rule_id,
            finding.severity.to_db_string(),
            serde_json::to_string(&finding.evidence)?,
            finding.auto_fixable,
            format_timestamp(&finding.detected_at),
        ],
    )?;
    Ok(())
}

fn upsert_rule_error(conn: &Connection, error: &RuleErrorRecord) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO rule_errors (run_id, url, rule_id, message, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(run_id, url, rule_id) DO UPDATE SET
            message = excluded.message,
            recorded_at = excluded.recorded_at",
        params![
            error.run_id,
            error.url,
            error.rule_id,
            error.message,
            format_timestamp(&error.recorded_at),
        ],
    )?;
    Ok(())
}

fn clear_ranks(conn: &Connection, run_id: RunId) -> StorageResult<()> {
    conn.execute("DELETE FROM rank_scores WHERE run_id = ?1", params![run_id])?;
    Ok(())
}

fn upsert_rank(conn: &Connection, rank: &RankScore) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO rank_scores (run_id, subject_kind, subject, score, iterations_used,
            converged, host_aggregated, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(run_id, subject_kind, subject) DO UPDATE SET
            score = excluded.score,
            iterations_used = excluded.iterations_used,
            converged = excluded.converged,
            host_aggregated = excluded.host_aggregated,
            computed_at = excluded.computed_at",
        params![
            rank.run_id,
            rank.subject.kind(),
            rank.subject.key(),
            rank.score,
            rank.iterations_used,
            rank.converged,
            rank.host_aggregated,
            format_timestamp(&rank.computed_at),
        ],
    )?;
    Ok(())
}

/// Job rows only move forward: an update with a lower or equal state rank
/// leaves the stored row untouched.
fn upsert_job(conn: &Connection, job: &JobRecord) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO jobs (id, run_id, kind, state, state_rank, started_at, ended_at, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            state_rank = excluded.state_rank,
            started_at = COALESCE(excluded.started_at, jobs.started_at),
            ended_at = COALESCE(excluded.ended_at, jobs.ended_at),
            error = COALESCE(excluded.error, jobs.error)
         WHERE excluded.state_rank > jobs.state_rank",
        params![
            job.id.as_str(),
            job.run_id,
            job.kind.to_db_string(),
            job.state.to_db_string(),
            job.state.rank(),
            job.started_at.as_ref().map(format_timestamp),
            job.ended_at.as_ref().map(format_timestamp),
            job.error,
        ],
    )?;
    Ok(())
}

fn apply_record(conn: &Connection, record: &StagedRecord) -> StorageResult<()> {
    match record {
        StagedRecord::Fact(fact) => upsert_fact(conn, fact),
        StagedRecord::Edge(edge) => upsert_edge(conn, edge),
        StagedRecord::Finding(finding) => upsert_finding(conn, finding),
        StagedRecord::RuleError(error) => upsert_rule_error(conn, error),
        StagedRecord::Rank(rank) => upsert_rank(conn, rank),
        StagedRecord::RankReset(run_id) => clear_ranks(conn, *run_id),
        StagedRecord::Job(job) => upsert_job(conn, job),
    }
}

impl BatchSink for SqliteStorage {
    fn create_run(&mut self, project: &str, config_hash: &str) -> StorageResult<RunId> {
        let now = format_timestamp(&Utc::now());
        self.conn.execute(
            "INSERT INTO runs (project, started_at, config_hash) VALUES (?1, ?2, ?3)",
            params![project, now, config_hash],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn apply_batch(
        &mut self,
        records: &[StagedRecord],
        committed_seq: Option<u64>,
    ) -> StorageResult<()> {
        let tx = self.conn.transaction()?;

        for record in records {
            apply_record(&tx, record)?;
        }

        if let Some(seq) = committed_seq {
            let seq = i64::try_from(seq)
                .map_err(|_| StorageError::ConstraintViolation(format!("sequence {}", seq)))?;
            tx.execute(
                "INSERT INTO staging_checkpoint (id, committed_seq) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET
                    committed_seq = MAX(staging_checkpoint.committed_seq, excluded.committed_seq)",
                params![seq],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn committed_seq(&self) -> StorageResult<u64> {
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT committed_seq FROM staging_checkpoint WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.and_then(|s| u64::try_from(s).ok()).unwrap_or(0))
    }
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn get_run(&self, run_id: RunId) -> StorageResult<RunRecord> {
        self.conn
            .query_row(
                "SELECT id, project, started_at, config_hash FROM runs WHERE id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn latest_run(&self, project: &str) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, project, started_at, config_hash FROM runs
                 WHERE project = ?1 ORDER BY id DESC LIMIT 1",
                params![project],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn previous_completed_run(&self, run_id: RunId) -> StorageResult<Option<RunId>> {
        let run = self.get_run(run_id)?;
        let previous = self
            .conn
            .query_row(
                "SELECT r.id FROM runs r
                 WHERE r.project = ?1 AND r.id < ?2
                   AND EXISTS (
                       SELECT 1 FROM jobs j
                       WHERE j.run_id = r.id AND j.kind = ?3 AND j.state = ?4
                   )
                 ORDER BY r.id DESC LIMIT 1",
                params![
                    run.project,
                    run_id,
                    JobKind::CrawlAudit.to_db_string(),
                    JobState::Succeeded.to_db_string()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(previous)
    }

    // ===== Job Management =====

    fn get_job(&self, job_id: &JobId) -> StorageResult<Option<JobRecord>> {
        let job = self
            .conn
            .query_row(
                "SELECT id, run_id, kind, state, started_at, ended_at, error FROM jobs WHERE id = ?1",
                params![job_id.as_str()],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    fn jobs_for_run(&self, run_id: RunId) -> StorageResult<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, kind, state, started_at, ended_at, error FROM jobs
             WHERE run_id = ?1 ORDER BY started_at, id",
        )?;
        let jobs = stmt
            .query_map(params![run_id], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    // ===== Run Contents =====

    fn page_facts(&self, run_id: RunId) -> StorageResult<Vec<PageFact>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, url, host, depth, fetch_method, status_code, content_type, title,
                    meta_json, headings_json, canonical, hreflang_json, word_count, text_density,
                    js_required, render_timeout, fetch_error, fetched_at
             FROM page_facts WHERE run_id = ?1 ORDER BY url",
        )?;
        let facts = stmt
            .query_map(params![run_id], fact_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(facts)
    }

    fn link_edges(&self, run_id: RunId) -> StorageResult<Vec<LinkEdge>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, src, dst, first_seen, last_seen FROM link_edges
             WHERE run_id = ?1 ORDER BY src, dst",
        )?;
        let edges = stmt
            .query_map(params![run_id], edge_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    fn findings(&self, run_id: RunId) -> StorageResult<Vec<Finding>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, url, rule_id, severity, evidence_json, auto_fixable, detected_at
             FROM findings WHERE run_id = ?1 ORDER BY url, rule_id",
        )?;
        let findings = stmt
            .query_map(params![run_id], finding_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(findings)
    }

    fn rule_errors(&self, run_id: RunId) -> StorageResult<Vec<RuleErrorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, url, rule_id, message, recorded_at FROM rule_errors
             WHERE run_id = ?1 ORDER BY url, rule_id",
        )?;
        let errors = stmt
            .query_map(params![run_id], |row| {
                Ok(RuleErrorRecord {
                    run_id: row.get(0)?,
                    url: row.get(1)?,
                    rule_id: row.get(2)?,
                    message: row.get(3)?,
                    recorded_at: timestamp_column(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    fn rank_scores(&self, run_id: RunId) -> StorageResult<Vec<RankScore>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, subject_kind, subject, score, iterations_used, converged,
                    host_aggregated, computed_at
             FROM rank_scores WHERE run_id = ?1 ORDER BY score DESC, subject_kind, subject",
        )?;
        let scores = stmt
            .query_map(params![run_id], rank_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scores)
    }

    // ===== Statistics =====

    fn run_counts(&self, run_id: RunId) -> StorageResult<RunCounts> {
        self.get_run(run_id)?;

        let count = |sql: &str| -> StorageResult<u64> {
            let n: i64 = self.conn.query_row(sql, params![run_id], |row| row.get(0))?;
            Ok(u64::try_from(n).unwrap_or(0))
        };

        Ok(RunCounts {
            pages: count("SELECT COUNT(*) FROM page_facts WHERE run_id = ?1")?,
            failed_pages: count(
                "SELECT COUNT(*) FROM page_facts WHERE run_id = ?1 AND fetch_error IS NOT NULL",
            )?,
            browser_pages: count(
                "SELECT COUNT(*) FROM page_facts WHERE run_id = ?1 AND fetch_method = 'browser'",
            )?,
            edges: count("SELECT COUNT(*) FROM link_edges WHERE run_id = ?1")?,
            findings: count("SELECT COUNT(*) FROM findings WHERE run_id = ?1")?,
            rule_errors: count("SELECT COUNT(*) FROM rule_errors WHERE run_id = ?1")?,
            rank_scores: count("SELECT COUNT(*) FROM rank_scores WHERE run_id = ?1")?,
        })
    }
}
