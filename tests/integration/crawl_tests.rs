//! Integration tests for the crawl+audit pipeline
//!
//! These tests use wiremock to create mock HTTP servers and drive whole jobs
//! through the supervisor against a temporary database.

use seo_auditor::config::{
    BrowserConfig, Config, CrawlerConfig, GuardrailConfig, OutputConfig, RankConfig,
    StagingConfig, UserAgentConfig,
};
use seo_auditor::jobs::{FailureReason, JobSupervisor, RunTarget};
use seo_auditor::model::{DeltaStatus, JobKind, RankSubject};
use seo_auditor::{AuditorError, JobState};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration writing to `db_path`
fn create_test_config(db_path: &str) -> Config {
    Config {
        crawler: CrawlerConfig {
            max_concurrency: 4,
            requests_per_second: 100.0,
            burst: 20,
            ..CrawlerConfig::default()
        },
        user_agent: UserAgentConfig {
            crawler_name: "TestBot".to_string(),
            crawler_version: "1.0.0".to_string(),
            contact_url: "https://example.com/contact".to_string(),
            contact_email: "test@example.com".to_string(),
        },
        output: OutputConfig {
            database_path: db_path.to_string(),
        },
        browser: BrowserConfig {
            enabled: false,
            ..BrowserConfig::default()
        },
        // Never trip on the test machine's real load
        guardrails: GuardrailConfig {
            cpu_soft_percent: 100.0,
            memory_soft_percent: 100.0,
            memory_hard_percent: 100.0,
            min_free_disk_mb: 0,
            ..GuardrailConfig::default()
        },
        rank: RankConfig::default(),
        staging: StagingConfig::default(),
    }
}

fn setup() -> (TempDir, Config) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = dir.path().join("audit.db");
    let config = create_test_config(db.to_str().expect("utf-8 temp path"));
    (dir, config)
}

fn html(title: Option<&str>, body: &str) -> ResponseTemplate {
    let title = title
        .map(|t| format!("<title>{}</title>", t))
        .unwrap_or_default();
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(format!(
            "<html><head>{}</head><body>{}</body></html>",
            title, body
        ))
}

async fn mount_page(server: &MockServer, route: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_homepage_and_child_link_graph() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_page(&server, "/", html(Some("Home"), r#"<a href="/a">A</a>"#)).await;
    mount_page(&server, "/a", html(Some("Page A"), "no links here")).await;

    let (_dir, config) = setup();
    let supervisor = JobSupervisor::open(&config).unwrap();
    let job_id = supervisor
        .start_run(
            "site",
            RunTarget::Seeds(vec![format!("{}/", base), format!("{}/a", base)]),
            config,
        )
        .await
        .unwrap();

    let status = supervisor.wait(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Succeeded, "reason: {:?}", status.reason);
    assert_eq!(status.kind, JobKind::CrawlAudit);
    assert_eq!(status.progress.pages_fetched, 2);
    assert!(status.started_at.is_some() && status.ended_at.is_some());

    let queries = supervisor.queries();
    let run_id = status.run_id;
    assert_eq!(queries.page_facts(run_id).unwrap().len(), 2);

    let stats = queries.link_stats(run_id).unwrap();
    let home = stats.iter().find(|s| s.url == format!("{}/", base)).unwrap();
    let child = stats.iter().find(|s| s.url == format!("{}/a", base)).unwrap();
    assert_eq!(home.inbound, 0);
    assert!(!home.orphan);
    assert_eq!(child.inbound, 1);
    assert!(!child.orphan);

    for edge in queries.link_edges(run_id).unwrap() {
        assert_ne!(edge.src, edge.dst);
    }

    let ranks = queries.rank_scores(run_id).unwrap();
    let page_ranks: Vec<_> = ranks
        .iter()
        .filter(|r| matches!(r.subject, RankSubject::Url(_)))
        .collect();
    assert_eq!(page_ranks.len(), 2);
    assert!(page_ranks.iter().all(|r| r.converged && !r.host_aggregated));
    let total: f64 = page_ranks.iter().map(|r| r.score).sum();
    assert!((total - 1.0).abs() < 1e-6);

    // Both pages lack a meta description
    let findings = queries.findings(run_id).unwrap();
    assert_eq!(
        findings
            .iter()
            .filter(|f| f.rule_id == "meta_description.missing")
            .count(),
        2
    );

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_429_three_times_is_recorded_as_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    // A fourth request would succeed, but must never be made
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(Some("Home"), ""))
        .expect(0)
        .mount(&server)
        .await;

    let (_dir, config) = setup();
    let supervisor = JobSupervisor::open(&config).unwrap();
    let job_id = supervisor
        .start_run("site", RunTarget::Seeds(vec![format!("{}/", server.uri())]), config)
        .await
        .unwrap();

    let status = supervisor.wait(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.progress.pages_failed, 1);

    let facts = supervisor.queries().page_facts(status.run_id).unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].status_code, Some(429));
    let error = facts[0].fetch_error.as_deref().unwrap();
    assert!(error.contains("3 attempt"), "unexpected error: {}", error);

    let findings = supervisor.queries().findings(status.run_id).unwrap();
    assert!(findings.iter().any(|f| f.rule_id == "status.http_error"));
}

#[tokio::test]
async fn test_second_run_reports_deltas() {
    let server = MockServer::start().await;
    // First run sees no title, later runs see one
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(None, "welcome"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_page(&server, "/", html(Some("Welcome home"), "welcome")).await;

    let (_dir, config) = setup();
    let supervisor = JobSupervisor::open(&config).unwrap();
    let seeds = RunTarget::Seeds(vec![format!("{}/", server.uri())]);

    let first = supervisor
        .start_run("site", seeds.clone(), config.clone())
        .await
        .unwrap();
    let first = supervisor.wait(&first).await.unwrap();
    assert_eq!(first.state, JobState::Succeeded);

    let first_findings = supervisor.queries().findings(first.run_id).unwrap();
    let missing_title = first_findings
        .iter()
        .find(|f| f.rule_id == "title.missing")
        .expect("title.missing finding");
    assert_eq!(missing_title.severity, seo_auditor::Severity::Critical);

    let second = supervisor.start_run("site", seeds, config).await.unwrap();
    let second = supervisor.wait(&second).await.unwrap();
    assert_eq!(second.state, JobState::Succeeded);
    assert_ne!(first.run_id, second.run_id);

    let deltas = supervisor.queries().deltas(second.run_id).unwrap();
    let title = deltas.iter().find(|d| d.rule_id == "title.missing").unwrap();
    assert_eq!(title.status, DeltaStatus::Removed);
    assert_eq!(title.previous_severity, Some(seo_auditor::Severity::Critical));
    assert_eq!(title.current_severity, None);

    let meta = deltas
        .iter()
        .find(|d| d.rule_id == "meta_description.missing")
        .unwrap();
    assert_eq!(meta.status, DeltaStatus::Stable);

    // The first run has nothing to compare against
    let initial = supervisor.queries().deltas(first.run_id).unwrap();
    assert!(initial.iter().all(|d| d.status == DeltaStatus::Added));
}

#[tokio::test]
async fn test_cancel_run_stops_promptly() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "/",
        html(Some("Slow"), "").set_delay(Duration::from_secs(10)),
    )
    .await;

    let (_dir, config) = setup();
    let supervisor = JobSupervisor::open(&config).unwrap();
    let job_id = supervisor
        .start_run("site", RunTarget::Seeds(vec![format!("{}/", server.uri())]), config)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    supervisor.cancel_run(&job_id).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), supervisor.wait(&job_id))
        .await
        .expect("cancellation should not wait for the slow page")
        .unwrap();
    assert_eq!(status.state, JobState::Cancelled);
    assert!(status.reason.is_none());

    // Cancelling again is a no-op
    supervisor.cancel_run(&job_id).unwrap();

    let jobs_state = supervisor.get_job_state(&job_id).unwrap();
    assert_eq!(jobs_state.state, JobState::Cancelled);
}

#[tokio::test]
async fn test_link_rank_after_cancelled_run_stores_scores() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_page(&server, "/", html(Some("Home"), r#"<a href="/slow">Slow</a>"#)).await;
    mount_page(
        &server,
        "/slow",
        html(Some("Slow"), "").set_delay(Duration::from_secs(10)),
    )
    .await;

    let (_dir, mut config) = setup();
    config.staging.batch_size = 1;
    config.staging.flush_interval_ms = 10;
    let supervisor = JobSupervisor::open(&config).unwrap();
    let crawl = supervisor
        .start_run("site", RunTarget::Seeds(vec![format!("{}/", base)]), config)
        .await
        .unwrap();

    let fetched = async {
        while supervisor.get_job_state(&crawl).unwrap().progress.pages_fetched < 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), fetched)
        .await
        .expect("the homepage should be fetched");
    tokio::time::sleep(Duration::from_millis(200)).await;

    supervisor.cancel_run(&crawl).unwrap();
    let crawl = supervisor.wait(&crawl).await.unwrap();
    assert_eq!(crawl.state, JobState::Cancelled);

    let rank_job = supervisor.start_link_rank(crawl.run_id).await.unwrap();
    let status = supervisor.wait(&rank_job).await.unwrap();
    assert_eq!(status.state, JobState::Succeeded, "reason: {:?}", status.reason);
    assert!(status.progress.rank_scores > 0);

    let ranks = supervisor.queries().rank_scores(crawl.run_id).unwrap();
    assert_eq!(ranks.len() as u64, status.progress.rank_scores);
}

#[tokio::test]
async fn test_run_with_zero_rate_is_rejected() {
    let (_dir, mut config) = setup();
    let supervisor = JobSupervisor::open(&config).unwrap();
    config.crawler.requests_per_second = 0.0;

    let result = supervisor
        .start_run("site", RunTarget::Seeds(vec!["https://ex.com/".to_string()]), config)
        .await;
    assert!(matches!(result, Err(AuditorError::Config(_))));
}

#[tokio::test]
async fn test_sitemap_target_seeds_the_crawl() {
    let server = MockServer::start().await;
    let base = server.uri();
    let sitemap = format!(
        r#"<urlset><url><loc>{0}/</loc></url><url><loc>{0}/about</loc></url></urlset>"#,
        base
    );
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sitemap))
        .mount(&server)
        .await;
    mount_page(&server, "/", html(Some("Home"), "")).await;
    mount_page(&server, "/about", html(Some("About"), "")).await;

    let (_dir, config) = setup();
    let supervisor = JobSupervisor::open(&config).unwrap();
    let job_id = supervisor
        .start_run("site", RunTarget::Sitemap(format!("{}/sitemap.xml", base)), config)
        .await
        .unwrap();

    let status = supervisor.wait(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(supervisor.queries().page_facts(status.run_id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_unreachable_sitemap_fails_with_reason() {
    let server = MockServer::start().await;

    let (_dir, config) = setup();
    let supervisor = JobSupervisor::open(&config).unwrap();
    let job_id = supervisor
        .start_run(
            "site",
            RunTarget::Sitemap(format!("{}/missing.xml", server.uri())),
            config,
        )
        .await
        .unwrap();

    let status = supervisor.wait(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(matches!(status.reason, Some(FailureReason::SeedResolution(_))));
}

#[tokio::test]
async fn test_link_rank_job_on_existing_run() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_page(&server, "/", html(Some("Home"), r#"<a href="/a">A</a>"#)).await;
    mount_page(&server, "/a", html(Some("A"), r#"<a href="/">home</a>"#)).await;

    let (_dir, config) = setup();
    let supervisor = JobSupervisor::open(&config).unwrap();
    let crawl = supervisor
        .start_run("site", RunTarget::Seeds(vec![format!("{}/", base)]), config)
        .await
        .unwrap();
    let crawl = supervisor.wait(&crawl).await.unwrap();
    assert_eq!(crawl.state, JobState::Succeeded);

    let rank_job = supervisor.start_link_rank(crawl.run_id).await.unwrap();
    let status = supervisor.wait(&rank_job).await.unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.kind, JobKind::LinkRank);
    assert_eq!(status.run_id, crawl.run_id);
    assert_eq!(status.progress.rank_scores, 2);

    let ranks = supervisor.queries().rank_scores(crawl.run_id).unwrap();
    assert_eq!(ranks.len(), 2);
    for rank in &ranks {
        assert!((rank.score - 0.5).abs() < 1e-6);
    }

    assert!(matches!(
        supervisor.start_link_rank(9_999).await,
        Err(AuditorError::RunNotFound(9_999))
    ));
}
