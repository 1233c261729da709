use crate::config::CrawlerConfig;
use std::time::{Duration, Instant};

/// Tracks the admission state of a host during crawling
///
/// This structure holds the host's token bucket, the crawl delay taken from
/// its robots.txt and when the last permit was granted.
#[derive(Debug, Clone)]
pub struct HostState {
    /// Tokens currently available (fractional while refilling)
    tokens: f64,

    /// When `tokens` was last brought up to date
    last_refill: Instant,

    /// When the last permit for this host was granted
    pub last_fetch: Option<Instant>,

    /// Minimum spacing between fetches from robots.txt
    pub crawl_delay: Option<Duration>,

    /// Number of permits granted for this host
    pub request_count: u32,
}

impl HostState {
    /// Creates a host with a full bucket
    pub fn new(config: &CrawlerConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst as f64,
            last_refill: now,
            last_fetch: None,
            crawl_delay: None,
            request_count: 0,
        }
    }

    fn refill(&mut self, config: &CrawlerConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * config.requests_per_second).min(config.burst as f64);
        self.last_refill = now;
    }

    /// Tokens available at `now`
    pub fn available_tokens(&mut self, config: &CrawlerConfig, now: Instant) -> f64 {
        self.refill(config, now);
        self.tokens
    }

    /// Calculates the time until a permit could be granted
    ///
    /// # Returns
    ///
    /// * `None` - A token is available and the crawl delay has elapsed
    /// * `Some(duration)` - The longer of the token and crawl-delay waits
    pub fn time_until_ready(&mut self, config: &CrawlerConfig, now: Instant) -> Option<Duration> {
        self.refill(config, now);

        // A rate that is not positive disables the bucket
        let rate = config.requests_per_second;
        let token_wait = if self.tokens >= 1.0 || !(rate.is_finite() && rate > 0.0) {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / rate)
        };

        let delay_wait = match (self.crawl_delay, self.last_fetch) {
            (Some(delay), Some(last)) => delay.saturating_sub(now.saturating_duration_since(last)),
            _ => Duration::ZERO,
        };

        let wait = token_wait.max(delay_wait);
        if wait.is_zero() {
            None
        } else {
            Some(wait)
        }
    }

    /// Takes one token and records the fetch if the host is ready
    ///
    /// Checking and consuming happen under the same `&mut self`, so a caller
    /// holding the host map lock admits at most one request per token.
    pub fn try_acquire(&mut self, config: &CrawlerConfig, now: Instant) -> bool {
        if self.time_until_ready(config, now).is_some() {
            return false;
        }
        self.tokens -= 1.0;
        self.last_fetch = Some(now);
        self.request_count += 1;
        true
    }

    pub fn set_crawl_delay(&mut self, seconds: Option<f64>) {
        self.crawl_delay = seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> CrawlerConfig {
        CrawlerConfig {
            requests_per_second: 2.0,
            burst: 2,
            ..CrawlerConfig::default()
        }
    }

    #[test]
    fn test_new_host_has_full_bucket() {
        let config = create_test_config();
        let now = Instant::now();
        let mut state = HostState::new(&config, now);
        assert_eq!(state.available_tokens(&config, now), 2.0);
        assert!(state.time_until_ready(&config, now).is_none());
    }

    #[test]
    fn test_zero_rate_never_computes_a_wait() {
        let config = CrawlerConfig {
            requests_per_second: 0.0,
            burst: 1,
            ..CrawlerConfig::default()
        };
        let now = Instant::now();
        let mut state = HostState::new(&config, now);

        assert!(state.try_acquire(&config, now));
        assert!(state.time_until_ready(&config, now).is_none());
    }

    #[test]
    fn test_burst_then_wait() {
        let config = create_test_config();
        let now = Instant::now();
        let mut state = HostState::new(&config, now);

        assert!(state.try_acquire(&config, now));
        assert!(state.try_acquire(&config, now));
        assert!(!state.try_acquire(&config, now));

        let wait = state.time_until_ready(&config, now).unwrap();
        assert!(wait <= Duration::from_millis(500));
        assert!(wait >= Duration::from_millis(499));

        assert!(state.try_acquire(&config, now + Duration::from_millis(500)));
        assert_eq!(state.request_count, 3);
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let config = create_test_config();
        let now = Instant::now();
        let mut state = HostState::new(&config, now);
        assert!(state.try_acquire(&config, now));

        let later = now + Duration::from_secs(60);
        assert_eq!(state.available_tokens(&config, later), 2.0);
    }

    #[test]
    fn test_crawl_delay_blocks_until_elapsed() {
        let config = create_test_config();
        let now = Instant::now();
        let mut state = HostState::new(&config, now);
        state.set_crawl_delay(Some(2.0));

        assert!(state.try_acquire(&config, now));
        // A token remains, but the crawl delay has not elapsed
        assert!(!state.try_acquire(&config, now + Duration::from_secs(1)));
        let wait = state
            .time_until_ready(&config, now + Duration::from_secs(1))
            .unwrap();
        assert_eq!(wait, Duration::from_secs(1));

        assert!(state.try_acquire(&config, now + Duration::from_secs(2)));
    }

    #[test]
    fn test_invalid_crawl_delay_ignored() {
        let config = create_test_config();
        let mut state = HostState::new(&config, Instant::now());
        state.set_crawl_delay(Some(-1.0));
        assert!(state.crawl_delay.is_none());
        state.set_crawl_delay(Some(f64::NAN));
        assert!(state.crawl_delay.is_none());
    }
}
