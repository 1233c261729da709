//! Database schema definitions and migrations
//!
//! This module contains all SQL schema definitions for the auditor database.
//! Every run-scoped table is keyed by `run_id` first, so runs never overwrite
//! each other and re-applying a record is an upsert.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    started_at TEXT NOT NULL,
    config_hash TEXT NOT NULL
);

-- Jobs supervising a run; state_rank only ever increases
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    kind TEXT NOT NULL,
    state TEXT NOT NULL,
    state_rank INTEGER NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    error TEXT
);

-- One row per fetched page per run
CREATE TABLE IF NOT EXISTS page_facts (
    run_id INTEGER NOT NULL REFERENCES runs(id),
    url TEXT NOT NULL,
    host TEXT NOT NULL,
    depth INTEGER NOT NULL,
    fetch_method TEXT NOT NULL,
    status_code INTEGER,
    content_type TEXT,
    title TEXT,
    meta_json TEXT NOT NULL,
    headings_json TEXT NOT NULL,
    canonical TEXT,
    hreflang_json TEXT NOT NULL,
    word_count INTEGER NOT NULL,
    text_density REAL NOT NULL,
    js_required INTEGER NOT NULL,
    render_timeout INTEGER NOT NULL,
    fetch_error TEXT,
    fetched_at TEXT NOT NULL,
    PRIMARY KEY (run_id, url)
);

-- Internal link graph
CREATE TABLE IF NOT EXISTS link_edges (
    run_id INTEGER NOT NULL REFERENCES runs(id),
    src TEXT NOT NULL,
    dst TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    PRIMARY KEY (run_id, src, dst)
);

-- Rule findings
CREATE TABLE IF NOT EXISTS findings (
    run_id INTEGER NOT NULL REFERENCES runs(id),
    url TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    severity TEXT NOT NULL,
    evidence_json TEXT NOT NULL,
    auto_fixable INTEGER NOT NULL,
    detected_at TEXT NOT NULL,
    PRIMARY KEY (run_id, url, rule_id)
);

-- Rules that failed on a page
CREATE TABLE IF NOT EXISTS rule_errors (
    run_id INTEGER NOT NULL REFERENCES runs(id),
    url TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    message TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (run_id, url, rule_id)
);

-- PageRank scores per URL or per host
CREATE TABLE IF NOT EXISTS rank_scores (
    run_id INTEGER NOT NULL REFERENCES runs(id),
    subject_kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    score REAL NOT NULL,
    iterations_used INTEGER NOT NULL,
    converged INTEGER NOT NULL,
    host_aggregated INTEGER NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (run_id, subject_kind, subject)
);

-- Highest staging sequence number known to be committed
CREATE TABLE IF NOT EXISTS staging_checkpoint (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    committed_seq INTEGER NOT NULL
);

-- Create indexes for performance
CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project);
CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs(run_id);
CREATE INDEX IF NOT EXISTS idx_link_edges_dst ON link_edges(run_id, dst);
CREATE INDEX IF NOT EXISTS idx_findings_rule ON findings(run_id, rule_id);
"#;

/// Initializes the database schema
///
/// Creates all tables and indexes if they don't exist. Safe to call on an
/// existing database.
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Gets the current schema version
///
/// This can be used for future migrations if the schema changes.
pub fn get_schema_version() -> u32 {
    1
}
