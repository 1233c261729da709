//! Decides whether a page needs the browser path
//!
//! The HTTP response is always fetched first. A page escalates to the
//! browser when it carries a client-side framework marker, when almost none
//! of its HTML is visible text, or when an earlier page on the same host
//! showed that HTTP alone misses content.

use crate::model::FetchMethod;
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

/// Markers left in server HTML by client-rendered frameworks
const FRAMEWORK_MARKERS: &[&str] = &[
    "id=\"__next\"",
    "__NEXT_DATA__",
    "data-reactroot",
    "ng-version",
    "window.__NUXT__",
    "id=\"__nuxt\"",
    "data-v-app",
    "<div id=\"root\"></div>",
    "<div id=\"app\"></div>",
    "__INITIAL_STATE__",
    "ember-application",
    "data-sveltekit",
];

/// Visible text below this fraction of the HTML counts as an empty shell
pub const MIN_TEXT_RATIO: f64 = 0.05;

/// Minimum extra words the browser must find before a host is flagged
const MIN_EXTRA_WORDS: u32 = 25;

/// Why a page was sent to the browser
#[derive(Debug, Clone, PartialEq)]
pub enum SpaSignal {
    FrameworkMarker(&'static str),
    LowTextRatio(f64),
    HostRequiresJs,
}

impl fmt::Display for SpaSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameworkMarker(marker) => write!(f, "framework marker {}", marker),
            Self::LowTextRatio(ratio) => write!(f, "text ratio {:.3}", ratio),
            Self::HostRequiresJs => f.write_str("host previously required JavaScript"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpaDecision {
    pub method: FetchMethod,
    pub signal: Option<SpaSignal>,
}

impl SpaDecision {
    fn http() -> Self {
        Self {
            method: FetchMethod::Http,
            signal: None,
        }
    }

    fn browser(signal: SpaSignal) -> Self {
        Self {
            method: FetchMethod::Browser,
            signal: Some(signal),
        }
    }

    pub fn needs_browser(&self) -> bool {
        self.method == FetchMethod::Browser
    }
}

/// Pure classification over one HTTP response
///
/// # Arguments
///
/// * `html` - The response body
/// * `text_length` - Characters of visible text extracted from `html`
/// * `host_requires_js` - Cached observation for the page's host
pub fn classify(html: &str, text_length: usize, host_requires_js: bool) -> SpaDecision {
    if let Some(marker) = FRAMEWORK_MARKERS.iter().find(|m| html.contains(**m)) {
        return SpaDecision::browser(SpaSignal::FrameworkMarker(*marker));
    }

    if !html.trim().is_empty() {
        let ratio = text_length as f64 / html.len() as f64;
        if ratio < MIN_TEXT_RATIO {
            return SpaDecision::browser(SpaSignal::LowTextRatio(ratio));
        }
    }

    if host_requires_js {
        return SpaDecision::browser(SpaSignal::HostRequiresJs);
    }

    SpaDecision::http()
}

/// SPA classifier with a per-host cache of JavaScript requirements
///
/// Owned by one run.
#[derive(Debug, Default)]
pub struct SpaClassifier {
    js_hosts: Mutex<HashSet<String>>,
}

impl SpaClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host_requires_js(&self, host: &str) -> bool {
        self.js_hosts
            .lock()
            .map(|hosts| hosts.contains(host))
            .unwrap_or(false)
    }

    pub fn classify(&self, host: &str, html: &str, text_length: usize) -> SpaDecision {
        classify(html, text_length, self.host_requires_js(host))
    }

    /// Compares what the browser extracted with the HTTP baseline
    ///
    /// Flags the host when the browser found notably more words. Returns
    /// true when this call newly flagged the host.
    pub fn record_browser_result(&self, host: &str, http_words: u32, browser_words: u32) -> bool {
        let threshold = http_words + MIN_EXTRA_WORDS.max(http_words / 5);
        if browser_words < threshold {
            return false;
        }

        let mut hosts = self
            .js_hosts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let inserted = hosts.insert(host.to_string());
        if inserted {
            tracing::debug!(
                "Host {} requires JavaScript ({} -> {} words)",
                host,
                http_words,
                browser_words
            );
        }
        inserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_page(words: usize) -> String {
        format!(
            "<html><body><p>{}</p></body></html>",
            vec!["word"; words].join(" ")
        )
    }

    #[test]
    fn test_plain_page_stays_http() {
        let html = text_page(200);
        let decision = classify(&html, 200 * 5, false);
        assert_eq!(decision.method, FetchMethod::Http);
        assert!(decision.signal.is_none());
    }

    #[test]
    fn test_framework_marker() {
        let html = format!(
            "<html><body><div id=\"__next\">{}</div></body></html>",
            "content ".repeat(100)
        );
        let decision = classify(&html, 800, false);
        assert_eq!(
            decision.signal,
            Some(SpaSignal::FrameworkMarker("id=\"__next\""))
        );
    }

    #[test]
    fn test_low_text_ratio() {
        let html = format!(
            "<html><head><script>{}</script></head><body>hi</body></html>",
            "x".repeat(2000)
        );
        let decision = classify(&html, 2, false);
        assert!(matches!(decision.signal, Some(SpaSignal::LowTextRatio(_))));
    }

    #[test]
    fn test_empty_body_is_not_escalated() {
        assert!(!classify("", 0, false).needs_browser());
    }

    #[test]
    fn test_host_cache_escalates_later_pages() {
        let classifier = SpaClassifier::new();
        let html = text_page(200);

        assert!(!classifier.classify("ex.com", &html, 1000).needs_browser());

        assert!(!classifier.record_browser_result("ex.com", 200, 210));
        assert!(classifier.record_browser_result("ex.com", 10, 400));
        assert!(!classifier.record_browser_result("ex.com", 10, 400));

        let decision = classifier.classify("ex.com", &html, 1000);
        assert_eq!(decision.signal, Some(SpaSignal::HostRequiresJs));
        assert!(!classifier.classify("other.com", &html, 1000).needs_browser());
    }
}
