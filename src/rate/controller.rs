//! Admission gate for every fetch
//!
//! A fetch needs both a slot in the global semaphore and a token from its
//! host's bucket. The global limit adapts to load: `throttle` halves it and
//! `relax` doubles it back towards the configured value.

use crate::config::CrawlerConfig;
use crate::state::HostState;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A change to the adaptive global limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateEvent {
    Throttled { from: usize, to: usize },
    Relaxed { from: usize, to: usize },
}

impl fmt::Display for RateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throttled { from, to } => {
                write!(f, "global fetch limit reduced from {} to {}", from, to)
            }
            Self::Relaxed { from, to } => {
                write!(f, "global fetch limit restored from {} to {}", from, to)
            }
        }
    }
}

#[derive(Debug)]
struct GlobalLimit {
    configured: usize,
    current: usize,
    /// Permits to retire as they are returned
    pending_reduction: usize,
}

#[derive(Debug)]
struct Inner {
    config: CrawlerConfig,
    global: Arc<Semaphore>,
    limit: Mutex<GlobalLimit>,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl Inner {
    fn limit(&self) -> MutexGuard<'_, GlobalLimit> {
        self.limit.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn hosts(&self) -> MutexGuard<'_, HashMap<String, HostState>> {
        self.hosts.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Per-host token buckets plus an adaptive global concurrency bound
///
/// Owned by a single run; clones share the same state.
#[derive(Debug, Clone)]
pub struct RateController {
    inner: Arc<Inner>,
}

/// Admission to fetch from one host, released on drop
#[derive(Debug)]
pub struct RatePermit {
    host: String,
    slot: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl RatePermit {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let mut limit = self.inner.limit();
        if limit.pending_reduction > 0 {
            limit.pending_reduction -= 1;
            slot.forget();
        }
    }
}

impl RateController {
    pub fn new(config: &CrawlerConfig) -> Self {
        let configured = config.max_concurrency.max(1) as usize;
        Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                global: Arc::new(Semaphore::new(configured)),
                limit: Mutex::new(GlobalLimit {
                    configured,
                    current: configured,
                    pending_reduction: 0,
                }),
                hosts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Waits until both a global slot and a token for `host` are available
    ///
    /// Never fails. The host check and token consumption happen under one
    /// lock acquisition after the global slot is held, so two callers cannot
    /// spend the same token.
    pub async fn acquire(&self, host: &str) -> RatePermit {
        let host = host.to_lowercase();
        loop {
            let wait = {
                let now = Instant::now();
                let mut hosts = self.inner.hosts();
                let state = hosts
                    .entry(host.clone())
                    .or_insert_with(|| HostState::new(&self.inner.config, now));
                state.time_until_ready(&self.inner.config, now)
            };
            if let Some(wait) = wait {
                tracing::trace!("Host {} not ready, waiting {:?}", host, wait);
                tokio::time::sleep(wait).await;
                continue;
            }

            let slot = self.inner.global.clone().acquire_owned().await.ok();

            let granted = {
                let now = Instant::now();
                let mut hosts = self.inner.hosts();
                let state = hosts
                    .entry(host.clone())
                    .or_insert_with(|| HostState::new(&self.inner.config, now));
                state.try_acquire(&self.inner.config, now)
            };

            let permit = RatePermit {
                host: host.clone(),
                slot,
                inner: self.inner.clone(),
            };
            if granted {
                return permit;
            }
            // Another caller took the token while we waited for a slot
            drop(permit);
        }
    }

    /// Applies a robots.txt crawl delay to `host`
    pub fn set_crawl_delay(&self, host: &str, seconds: Option<f64>) {
        let now = Instant::now();
        let mut hosts = self.inner.hosts();
        hosts
            .entry(host.to_lowercase())
            .or_insert_with(|| HostState::new(&self.inner.config, now))
            .set_crawl_delay(seconds);
    }

    /// Halves the global limit (never below 1)
    ///
    /// Idle permits are retired immediately; busy ones as they are released.
    pub fn throttle(&self) -> Option<RateEvent> {
        let mut limit = self.inner.limit();
        let from = limit.current;
        let to = (from / 2).max(1);
        if to == from {
            return None;
        }

        let mut remaining = from - to;
        while remaining > 0 {
            match self.inner.global.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    remaining -= 1;
                }
                Err(_) => break,
            }
        }
        limit.pending_reduction += remaining;
        limit.current = to;

        let event = RateEvent::Throttled { from, to };
        tracing::warn!("{}", event);
        Some(event)
    }

    /// Doubles the global limit back towards the configured value
    pub fn relax(&self) -> Option<RateEvent> {
        let mut limit = self.inner.limit();
        let from = limit.current;
        let to = (from * 2).min(limit.configured);
        if to == from {
            return None;
        }

        let mut added = to - from;
        let cancelled = added.min(limit.pending_reduction);
        limit.pending_reduction -= cancelled;
        added -= cancelled;
        if added > 0 {
            self.inner.global.add_permits(added);
        }
        limit.current = to;

        let event = RateEvent::Relaxed { from, to };
        tracing::info!("{}", event);
        Some(event)
    }

    pub fn current_limit(&self) -> usize {
        self.inner.limit().current
    }

    pub fn configured_limit(&self) -> usize {
        self.inner.limit().configured
    }

    /// Fetches currently holding a global slot
    pub fn in_flight(&self) -> usize {
        let limit = self.inner.limit();
        (limit.current + limit.pending_reduction)
            .saturating_sub(self.inner.global.available_permits())
    }

    /// Permits granted so far for `host`
    pub fn requests_for(&self, host: &str) -> u32 {
        self.inner
            .hosts()
            .get(&host.to_lowercase())
            .map(|s| s.request_count)
            .unwrap_or(0)
    }
}
