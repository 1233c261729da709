//! Crawl coordinator - dispatch loop of one run
//!
//! This module ties the frontier, robots.txt, the rate controller and the
//! fetchers together:
//! - Pops URLs in sorted order and keeps up to `max-concurrency` visits in flight
//! - Stages every page fact and accepted link edge
//! - Feeds discovered links back into the frontier
//! - Samples system load and throttles or stops on the guardrails
//! - Stops promptly on cancellation

use crate::config::{Config, CrawlerConfig};
use crate::crawler::fetcher::{FetchOutcome, Fetcher, PageRequest};
use crate::crawler::scheduler::{Admission, Frontier, QueuedUrl};
use crate::graph::LinkGraphBuilder;
use crate::jobs::guardrails::{Guardrail, LoadMonitor, LoadSignal};
use crate::jobs::ProgressCounters;
use crate::model::{FetchMethod, RunId};
use crate::rate::RateController;
use crate::robots::{fetch_robots, origin_of, RobotsCache};
use crate::staging::{StagedRecord, StagingQueue};
use crate::url::SiteScope;
use crate::AuditorError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Pages fetched before the browser ratio is judged
const BROWSER_RATIO_MIN_PAGES: u64 = 10;

/// Run-owned resources a crawl works with
#[derive(Clone)]
pub struct CrawlResources {
    pub fetcher: Arc<Fetcher>,
    /// Must be the controller the fetcher's HTTP client acquires from
    pub rate: RateController,
    pub robots: Arc<RobotsCache>,
    pub staging: StagingQueue,
}

/// How a crawl ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Frontier drained
    Completed,
    /// Page budget spent with URLs still queued
    BudgetReached,
    Cancelled,
    ResourceExhausted(Guardrail),
}

enum Visit {
    Fetched(FetchOutcome),
    Blocked(String),
}

/// Crawl loop of one run
pub struct CrawlScheduler {
    run_id: RunId,
    config: CrawlerConfig,
    agent: String,
    sample_interval: Duration,
    frontier: Frontier,
    graph: LinkGraphBuilder,
    resources: CrawlResources,
    progress: Arc<ProgressCounters>,
    cancel: CancellationToken,
    monitor: Option<LoadMonitor>,
    ratio_advised: bool,
}

impl CrawlScheduler {
    /// Creates a scheduler seeded with `seeds`
    ///
    /// # Arguments
    ///
    /// * `run_id` - Run the facts and edges belong to
    /// * `config` - Effective configuration of the run
    /// * `seeds` - Seed URLs; the project scope is derived from them
    /// * `resources` - Fetcher, rate controller, robots cache and staging queue
    /// * `progress` - Counters shared with the job status
    /// * `cancel` - Cancels the crawl
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlScheduler)` - At least one seed was admitted
    /// * `Err(AuditorError::SeedResolution)` - No seed could be crawled
    pub fn new(
        run_id: RunId,
        config: &Config,
        seeds: &[String],
        resources: CrawlResources,
        progress: Arc<ProgressCounters>,
        cancel: CancellationToken,
    ) -> Result<Self, AuditorError> {
        let scope = SiteScope::from_urls(seeds);
        let mut frontier = Frontier::new(&config.crawler, scope.clone());

        let mut admitted = 0;
        for seed in seeds {
            match frontier.push_seed(seed) {
                Admission::Queued | Admission::Duplicate => admitted += 1,
                rejected => tracing::warn!("Seed {} not crawlable: {:?}", seed, rejected),
            }
        }
        if admitted == 0 {
            return Err(AuditorError::SeedResolution(format!(
                "none of {} seed(s) is a crawlable URL",
                seeds.len()
            )));
        }

        Ok(Self {
            run_id,
            config: config.crawler.clone(),
            agent: config.user_agent.crawler_name.clone(),
            sample_interval: Duration::from_millis(config.guardrails.sample_interval_ms.max(1)),
            frontier,
            graph: LinkGraphBuilder::new(run_id, scope),
            resources,
            progress,
            cancel,
            monitor: None,
            ratio_advised: false,
        })
    }

    /// Enables load sampling against the guardrails
    pub fn with_monitor(mut self, monitor: LoadMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Runs the crawl until the frontier drains, the budget is spent, a hard
    /// guardrail trips or the crawl is cancelled
    ///
    /// Fetch failures never end the crawl; they are recorded on the fact.
    /// A staging failure does, and is returned.
    pub async fn run(mut self) -> Result<CrawlOutcome, AuditorError> {
        tracing::info!(
            "Run {}: crawling {} seed(s) (budget {} pages)",
            self.run_id,
            self.frontier.len(),
            self.config.page_budget
        );

        let max_in_flight = self.config.max_concurrency.max(1) as usize;
        let mut tasks: JoinSet<Visit> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut stop: Option<CrawlOutcome> = None;
        let mut aborted = false;
        let mut processed: u64 = 0;

        loop {
            if self.cancel.is_cancelled() && !aborted {
                tasks.abort_all();
                aborted = true;
                stop.get_or_insert(CrawlOutcome::Cancelled);
            }

            if stop.is_none() {
                while tasks.len() < max_in_flight {
                    let Some(queued) = self.frontier.pop_next() else {
                        break;
                    };
                    tasks.spawn(visit(
                        self.run_id,
                        queued,
                        self.resources.clone(),
                        self.agent.clone(),
                    ));
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !aborted => {
                    tracing::info!("Run {}: cancellation requested, aborting {} visit(s)", self.run_id, tasks.len());
                    tasks.abort_all();
                    aborted = true;
                    stop.get_or_insert(CrawlOutcome::Cancelled);
                }

                _ = ticker.tick(), if self.monitor.is_some() && stop.is_none() => {
                    if let Some(guardrail) = self.check_load() {
                        stop = Some(CrawlOutcome::ResourceExhausted(guardrail));
                    }
                }

                Some(joined) = tasks.join_next() => {
                    let visit = match joined {
                        Ok(visit) => visit,
                        Err(e) if e.is_cancelled() => continue,
                        Err(e) => return Err(AuditorError::Task(e.to_string())),
                    };
                    if aborted {
                        continue;
                    }
                    self.handle_visit(visit).await?;

                    processed += 1;
                    if processed % 50 == 0 {
                        tracing::info!(
                            "Run {}: {} pages processed, {} queued",
                            self.run_id,
                            processed,
                            self.frontier.len()
                        );
                    }
                }
            }
        }

        let outcome = stop.unwrap_or(
            if self.frontier.budget_exhausted() && !self.frontier.is_empty() {
                CrawlOutcome::BudgetReached
            } else {
                CrawlOutcome::Completed
            },
        );

        tracing::info!(
            "Run {}: crawl finished ({:?}) after {} dispatched page(s)",
            self.run_id,
            outcome,
            self.frontier.dispatched()
        );
        Ok(outcome)
    }

    async fn handle_visit(&mut self, visit: Visit) -> Result<(), AuditorError> {
        let FetchOutcome { fact, links } = match visit {
            Visit::Fetched(outcome) => outcome,
            Visit::Blocked(url) => {
                tracing::debug!("Disallowed by robots.txt: {}", url);
                self.progress.add_robots_blocked(1);
                return Ok(());
            }
        };

        if fact.fetch_error.is_some() {
            self.progress.add_pages_failed(1);
        } else {
            self.progress.add_pages_fetched(1);
        }
        if fact.fetch_method == FetchMethod::Browser {
            self.progress.add_pages_via_browser(1);
        }
        if fact.js_required {
            self.progress.add_pages_js_required(1);
        }

        let src = fact.url.clone();
        let depth = fact.depth;
        let seen_at = fact.fetched_at;

        self.graph.add_page(&src);
        self.resources.staging.stage(StagedRecord::Fact(fact)).await?;

        for link in &links {
            self.frontier.push_discovered(link, depth);
            match self.graph.observe(&src, link, seen_at) {
                Ok(edge) => {
                    self.resources.staging.stage(StagedRecord::Edge(edge)).await?;
                    self.progress.add_edges_staged(1);
                }
                Err(rejection) => {
                    tracing::trace!("Edge {} -> {} dropped: {:?}", src, link, rejection);
                }
            }
        }

        self.check_browser_ratio();
        Ok(())
    }

    fn check_browser_ratio(&mut self) {
        if self.ratio_advised {
            return;
        }
        let snapshot = self.progress.snapshot();
        let pages = snapshot.pages_fetched + snapshot.pages_failed;
        if browser_ratio_exceeded(
            snapshot.pages_js_required,
            pages,
            self.config.browser_ratio_advisory,
        ) {
            let advisory = format!(
                "{} of {} pages need the browser (advisory ratio {:.2})",
                snapshot.pages_js_required, pages, self.config.browser_ratio_advisory
            );
            tracing::warn!("Run {}: {}", self.run_id, advisory);
            self.progress.advise(advisory);
            self.ratio_advised = true;
        }
    }

    /// Returns the guardrail that must stop the crawl, if any
    fn check_load(&mut self) -> Option<Guardrail> {
        let monitor = self.monitor.as_mut()?;
        match monitor.check() {
            LoadSignal::Normal => {
                self.resources.rate.relax();
                None
            }
            LoadSignal::Soft(reason) => {
                if let Some(event) = self.resources.rate.throttle() {
                    self.progress.advise(format!("load throttled ({}): {}", reason, event));
                }
                None
            }
            LoadSignal::Hard(guardrail) => {
                tracing::error!(
                    "Run {}: {} guardrail tripped; no further pages will be dispatched",
                    self.run_id,
                    guardrail
                );
                Some(guardrail)
            }
        }
    }
}

/// Whether the share of pages needing the browser exceeds `ratio`
fn browser_ratio_exceeded(js_required: u64, pages: u64, ratio: f64) -> bool {
    pages >= BROWSER_RATIO_MIN_PAGES && js_required as f64 / pages as f64 > ratio
}

async fn visit(run_id: RunId, queued: QueuedUrl, resources: CrawlResources, agent: String) -> Visit {
    let origin = origin_of(&queued.url);
    let client = resources.fetcher.http().client().clone();
    let page = queued.url.clone();
    let robots = resources
        .robots
        .get_or_fetch(&origin, move || async move { fetch_robots(&client, &page).await })
        .await;

    resources
        .rate
        .set_crawl_delay(&queued.host, robots.rules.crawl_delay(&agent));

    if !robots.rules.is_allowed(queued.url.as_str(), &agent) {
        return Visit::Blocked(queued.url.to_string());
    }

    let request = PageRequest {
        run_id,
        url: queued.url,
        host: queued.host,
        depth: queued.depth,
    };
    Visit::Fetched(resources.fetcher.fetch_page(&request).await)
}
