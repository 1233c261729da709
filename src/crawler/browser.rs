//! Headless browser escalation path
//!
//! A `BrowserPool` hands pages to a bounded set of recyclable sessions. A
//! session serves at most `session_page_quota` pages before it is torn down
//! and replaced, and a watchdog terminates sessions that outlive
//! `max_session_lifetime_secs`. Sessions are created through the
//! `SessionLauncher` trait; `ChromiumLauncher` drives a real Chromium over
//! CDP.

use crate::config::BrowserConfig;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    SetBlockedUrLsParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Browser-specific errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrowserError {
    #[error("failed to launch browser session: {0}")]
    Launch(String),

    #[error("render timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("page load failed: {0}")]
    Navigation(String),

    #[error("browser session was terminated by the watchdog")]
    Terminated,

    #[error("browser pool is shut down")]
    Closed,
}

/// Per-page render settings
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// URL patterns whose requests are blocked before loading
    pub blocked_patterns: Vec<String>,
    /// Quiet period required before the DOM is read
    pub network_idle: Duration,
    /// In-flight sub-requests tolerated during the quiet period
    pub max_idle_inflight: usize,
}

/// One browser process (or equivalent) able to render pages
#[async_trait]
pub trait RenderSession: Send + Sync {
    /// Loads `url`, waits for the network to settle and returns the DOM HTML
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<String, BrowserError>;

    /// Graceful teardown
    async fn close(&self);

    /// Forced teardown used by the watchdog
    async fn terminate(&self) {
        self.close().await;
    }
}

/// Creates render sessions
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn RenderSession>, BrowserError>;
}

/// Pool limits derived from `[browser]`
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_sessions: usize,
    pub page_quota: u32,
    pub page_timeout: Duration,
    pub max_lifetime: Duration,
    pub render: RenderOptions,
}

impl From<&BrowserConfig> for PoolSettings {
    fn from(config: &BrowserConfig) -> Self {
        Self {
            max_sessions: config.max_sessions.max(1) as usize,
            page_quota: config.session_page_quota.max(1),
            page_timeout: Duration::from_millis(config.page_timeout_ms),
            max_lifetime: Duration::from_secs(config.max_session_lifetime_secs),
            render: RenderOptions {
                blocked_patterns: config.blocked_resource_patterns.clone(),
                network_idle: Duration::from_millis(config.network_idle_ms),
                max_idle_inflight: config.max_idle_inflight as usize,
            },
        }
    }
}

/// Counters exposed through job progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrowserStats {
    pub launches: u64,
    /// Sessions torn down on quota or at shutdown
    pub recycle_events: u64,
    pub watchdog_terminations: u64,
    pub pages_rendered: u64,
    pub render_timeouts: u64,
}

#[derive(Clone)]
struct SessionSlot {
    id: u64,
    session: Arc<dyn RenderSession>,
    pages_served: u32,
}

struct LiveSession {
    session: Arc<dyn RenderSession>,
    launched_at: Instant,
}

#[derive(Default)]
struct Counters {
    launches: AtomicU64,
    recycle_events: AtomicU64,
    watchdog_terminations: AtomicU64,
    pages_rendered: AtomicU64,
    render_timeouts: AtomicU64,
}

/// Bounded pool of recyclable render sessions, owned by one run
pub struct BrowserPool {
    launcher: Arc<dyn SessionLauncher>,
    settings: PoolSettings,
    permits: Semaphore,
    idle: Mutex<Vec<SessionSlot>>,
    live: Mutex<HashMap<u64, LiveSession>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// A checked-out session
///
/// Dropped without `hand_back` (the render future was aborted), the session
/// leaves the live set at once and is closed in the background.
struct Lease<'a> {
    pool: &'a BrowserPool,
    slot: SessionSlot,
    returned: bool,
}

impl Lease<'_> {
    fn hand_back(mut self) -> SessionSlot {
        self.returned = true;
        self.slot.clone()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if lock(&self.pool.live).remove(&self.slot.id).is_none() {
            return;
        }
        self.pool
            .counters
            .recycle_events
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Browser session {} released by an interrupted render", self.slot.id);

        let session = self.slot.session.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                session.close().await;
            });
        }
    }
}

impl BrowserPool {
    pub fn new(config: &BrowserConfig, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self::with_settings(PoolSettings::from(config), launcher)
    }

    /// A pool backed by locally launched Chromium
    pub fn chromium(config: &BrowserConfig) -> Self {
        Self::new(config, Arc::new(ChromiumLauncher))
    }

    pub fn with_settings(settings: PoolSettings, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            launcher,
            permits: Semaphore::new(settings.max_sessions),
            settings,
            idle: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> BrowserStats {
        BrowserStats {
            launches: self.counters.launches.load(Ordering::Relaxed),
            recycle_events: self.counters.recycle_events.load(Ordering::Relaxed),
            watchdog_terminations: self.counters.watchdog_terminations.load(Ordering::Relaxed),
            pages_rendered: self.counters.pages_rendered.load(Ordering::Relaxed),
            render_timeouts: self.counters.render_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn live_sessions(&self) -> usize {
        lock(&self.live).len()
    }

    fn is_live(&self, id: u64) -> bool {
        lock(&self.live).contains_key(&id)
    }

    async fn checkout(&self) -> Result<SessionSlot, BrowserError> {
        if let Some(slot) = lock(&self.idle).pop() {
            return Ok(slot);
        }

        let session = self.launcher.launch().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.launches.fetch_add(1, Ordering::Relaxed);
        lock(&self.live).insert(
            id,
            LiveSession {
                session: session.clone(),
                launched_at: Instant::now(),
            },
        );
        tracing::debug!("Launched browser session {}", id);

        Ok(SessionSlot {
            id,
            session,
            pages_served: 0,
        })
    }

    async fn retire(&self, slot: SessionSlot, reason: &str) {
        let was_live = lock(&self.live).remove(&slot.id).is_some();
        if was_live {
            slot.session.close().await;
            self.counters.recycle_events.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Retired browser session {} after {} page(s): {}",
                slot.id,
                slot.pages_served,
                reason
            );
        }
    }

    /// Renders one page on a pooled session
    ///
    /// Waits for a free session slot. The per-page timeout covers navigation
    /// and the network-idle wait.
    pub async fn render(&self, url: &str) -> Result<String, BrowserError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrowserError::Closed);
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BrowserError::Closed)?;

        let lease = Lease {
            pool: self,
            slot: self.checkout().await?,
            returned: false,
        };
        let session = lease.slot.session.clone();
        let timeout_ms = self.settings.page_timeout.as_millis() as u64;

        let result = match tokio::time::timeout(
            self.settings.page_timeout,
            session.render(url, &self.settings.render),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout { timeout_ms }),
        };
        let mut slot = lease.hand_back();
        slot.pages_served += 1;

        if !self.is_live(slot.id) {
            return Err(BrowserError::Terminated);
        }

        match &result {
            Ok(_) => {
                self.counters.pages_rendered.fetch_add(1, Ordering::Relaxed);
            }
            Err(BrowserError::Timeout { .. }) => {
                self.counters.render_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }

        if self.closed.load(Ordering::Acquire) {
            self.retire(slot, "pool shut down").await;
        } else if slot.pages_served >= self.settings.page_quota {
            self.retire(slot, "page quota reached").await;
        } else {
            lock(&self.idle).push(slot);
        }

        result
    }

    /// Closes every session and refuses new renders
    ///
    /// Sessions still rendering are closed too; their renders end with
    /// `BrowserError::Terminated`.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();

        let idle: Vec<SessionSlot> = lock(&self.idle).drain(..).collect();
        for slot in idle {
            self.retire(slot, "pool shut down").await;
        }

        let busy: Vec<(u64, Arc<dyn RenderSession>)> = lock(&self.live)
            .drain()
            .map(|(id, live)| (id, live.session))
            .collect();
        for (id, session) in busy {
            tracing::debug!("Closing browser session {} while it renders", id);
            session.close().await;
            self.counters.recycle_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Terminates every session older than the maximum lifetime
    ///
    /// Returns the number of sessions terminated by this pass.
    pub async fn check_lifetimes(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(u64, Arc<dyn RenderSession>)> = {
            let mut live = lock(&self.live);
            let ids: Vec<u64> = live
                .iter()
                .filter(|(_, s)| now.duration_since(s.launched_at) > self.settings.max_lifetime)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| live.remove(&id).map(|s| (id, s.session)))
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        {
            let expired_ids: HashSet<u64> = expired.iter().map(|(id, _)| *id).collect();
            lock(&self.idle).retain(|slot| !expired_ids.contains(&slot.id));
        }

        for (id, session) in &expired {
            tracing::warn!(
                "Watchdog terminating browser session {} (older than {:?})",
                id,
                self.settings.max_lifetime
            );
            session.terminate().await;
            self.counters
                .watchdog_terminations
                .fetch_add(1, Ordering::Relaxed);
        }
        expired.len()
    }

    /// Runs `check_lifetimes` periodically until cancelled or the pool is dropped
    pub fn spawn_watchdog(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = (self.settings.max_lifetime / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(5));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        if pool.closed.load(Ordering::Acquire) && pool.live_sessions() == 0 {
                            break;
                        }
                        pool.check_lifetimes().await;
                    }
                }
            }
        })
    }
}

// ===== Chromium =====

/// Launches a local headless Chromium per session
#[derive(Debug, Default, Clone, Copy)]
pub struct ChromiumLauncher;

#[async_trait]
impl SessionLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn RenderSession>, BrowserError> {
        let config = ChromiumConfig::builder()
            .no_sandbox()
            .build()
            .map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(ChromiumSession {
            browser: tokio::sync::Mutex::new(browser),
            handler_task,
        }))
    }
}

struct ChromiumSession {
    browser: tokio::sync::Mutex<Browser>,
    handler_task: JoinHandle<()>,
}

/// Closes the page even when the render future is dropped on timeout
struct PageGuard {
    page: Option<Page>,
}

impl PageGuard {
    fn page(&self) -> Result<&Page, BrowserError> {
        self.page
            .as_ref()
            .ok_or_else(|| BrowserError::Navigation("page already closed".to_string()))
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                tracing::debug!("Failed to close page: {}", e);
            }
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = page.close().await;
                });
            }
        }
    }
}

fn cdp_error(e: impl std::fmt::Display) -> BrowserError {
    BrowserError::Navigation(e.to_string())
}

impl ChromiumSession {
    async fn load(
        &self,
        page: &Page,
        url: &str,
        options: &RenderOptions,
    ) -> Result<String, BrowserError> {
        page.execute(EnableParams::default())
            .await
            .map_err(cdp_error)?;
        if !options.blocked_patterns.is_empty() {
            page.execute(SetBlockedUrLsParams::new(options.blocked_patterns.clone()))
                .await
                .map_err(cdp_error)?;
        }

        let mut started = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(cdp_error)?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(cdp_error)?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(cdp_error)?;

        page.goto(url).await.map_err(cdp_error)?;

        let mut inflight = HashSet::new();
        let mut quiet_since: Option<Instant> = None;
        loop {
            tokio::select! {
                Some(event) = started.next() => {
                    inflight.insert(event.request_id.clone());
                }
                Some(event) = finished.next() => {
                    inflight.remove(&event.request_id);
                }
                Some(event) = failed.next() => {
                    inflight.remove(&event.request_id);
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }

            if inflight.len() <= options.max_idle_inflight {
                let since = *quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= options.network_idle {
                    break;
                }
            } else {
                quiet_since = None;
            }
        }

        page.content().await.map_err(cdp_error)
    }
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<String, BrowserError> {
        let page = {
            let browser = self.browser.lock().await;
            browser.new_page("about:blank").await.map_err(cdp_error)?
        };
        let guard = PageGuard { page: Some(page) };

        let result = self.load(guard.page()?, url, options).await;
        guard.close().await;
        result
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            tracing::debug!("Browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        self.handler_task.abort();
    }

    async fn terminate(&self) {
        let mut browser = self.browser.lock().await;
        if let Some(Err(e)) = browser.kill().await {
            tracing::warn!("Failed to kill browser process: {}", e);
        }
        self.handler_task.abort();
    }
}
