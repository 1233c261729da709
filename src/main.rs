//! seo-auditor main entry point
//!
//! This is the command-line interface for the local crawler and audit engine.

use clap::Parser;
use seo_auditor::audit::summarize;
use seo_auditor::config::load_config_with_hash;
use seo_auditor::jobs::RunQueries;
use seo_auditor::{Config, JobState, JobSupervisor, RunId, RunTarget};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// seo-auditor: crawl a site and audit it for SEO problems
///
/// Pages are fetched over HTTP, escalating to a headless browser when they
/// need JavaScript. Findings, link graph and PageRank scores are stored in
/// the configured SQLite database.
#[derive(Parser, Debug)]
#[command(name = "seo-auditor")]
#[command(version)]
#[command(about = "Local website crawler and SEO audit engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Project name; runs of the same project are compared for deltas
    #[arg(long, required_unless_present = "stats")]
    project: Option<String>,

    /// Seed URL (repeatable)
    #[arg(long = "seed", value_name = "URL", conflicts_with = "sitemap")]
    seeds: Vec<String>,

    /// Sitemap URL whose entries become the seeds
    #[arg(long, value_name = "URL")]
    sitemap: Option<String>,

    /// Show row counts for a stored run and exit
    #[arg(long, value_name = "RUN_ID", conflicts_with_all = ["seeds", "sitemap"])]
    stats: Option<RunId>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let config = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            cfg
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let supervisor = JobSupervisor::open(&config)?;

    if let Some(run_id) = cli.stats {
        print_stats(&supervisor.queries(), run_id)?;
    } else {
        let target = match cli.sitemap {
            Some(sitemap) => RunTarget::Sitemap(sitemap),
            None if !cli.seeds.is_empty() => RunTarget::Seeds(cli.seeds),
            None => return Err("either --seed or --sitemap is required".into()),
        };
        let project = cli.project.unwrap_or_default();
        handle_run(&supervisor, &project, target, config).await?;
    }

    supervisor.shutdown().await;
    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("seo_auditor=info,warn"),
            1 => EnvFilter::new("seo_auditor=debug,info"),
            2 => EnvFilter::new("seo_auditor=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Runs one crawl+audit job, cancelling it on Ctrl-C
async fn handle_run(
    supervisor: &JobSupervisor,
    project: &str,
    target: RunTarget,
    config: Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id = supervisor.start_run(project, target, config).await?;
    tracing::info!("Started job {}", job_id);

    let status = tokio::select! {
        status = supervisor.wait(&job_id) => status?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted; cancelling job {}", job_id);
            supervisor.cancel_run(&job_id)?;
            supervisor.wait(&job_id).await?
        }
    };

    println!("Job {}: {} (run {})", status.job_id, status.state, status.run_id);
    println!(
        "  Pages: {} fetched, {} failed, {} via browser, {} blocked by robots.txt",
        status.progress.pages_fetched,
        status.progress.pages_failed,
        status.progress.pages_via_browser,
        status.progress.robots_blocked
    );
    for advisory in &status.advisories {
        println!("  Advisory: {}", advisory);
    }
    if let Some(reason) = &status.reason {
        println!("  Reason: {}", reason);
    }

    if status.state == JobState::Succeeded {
        print_stats(&supervisor.queries(), status.run_id)?;
        Ok(())
    } else {
        Err(format!("job ended in {}", status.state).into())
    }
}

/// Prints row counts, delta totals and the top-ranked pages of a run
fn print_stats(queries: &RunQueries, run_id: RunId) -> Result<(), Box<dyn std::error::Error>> {
    let run = queries.run(run_id)?;
    let counts = queries.run_counts(run_id)?;

    println!("\n=== Run {} ({}) ===", run.id, run.project);
    println!("Started: {}", run.started_at);
    println!("Pages: {} ({} failed, {} via browser)", counts.pages, counts.failed_pages, counts.browser_pages);
    println!("Link edges: {}", counts.edges);
    println!("Findings: {} ({} rule errors)", counts.findings, counts.rule_errors);

    let delta = summarize(&queries.deltas(run_id)?);
    println!(
        "Since previous run: {} added, {} removed, {} changed, {} stable",
        delta.added, delta.removed, delta.changed, delta.stable
    );

    let orphans = queries
        .link_stats(run_id)?
        .into_iter()
        .filter(|s| s.orphan)
        .count();
    println!("Orphaned pages: {}", orphans);

    let ranks = queries.rank_scores(run_id)?;
    if !ranks.is_empty() {
        println!("Top pages by PageRank:");
        for score in ranks.iter().filter(|s| s.subject.kind() == "url").take(10) {
            println!("  {:.5}  {}", score.score, score.subject.key());
        }
    }
    Ok(())
}
