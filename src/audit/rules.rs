//! Rule catalogue
//!
//! Rules are a static table of plain function values. Each check looks at
//! one page fact and returns at most one outcome; severity depends only on
//! the fact's fields.

use crate::model::{Evidence, PageFact, Severity};
use crate::url::host_of;
use std::fmt;

pub const TITLE_MAX_CHARS: usize = 60;
pub const TITLE_MIN_CHARS: usize = 10;
pub const DESCRIPTION_MAX_CHARS: usize = 160;
/// Below this many words a page is thin
pub const THIN_CONTENT_WORDS: u32 = 300;
/// Below this many words thin content is High rather than Medium
pub const VERY_THIN_CONTENT_WORDS: u32 = 100;
pub const MIN_TEXT_DENSITY: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleCategory {
    Content,
    Metadata,
    Indexability,
    Technical,
    International,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Metadata => "metadata",
            Self::Indexability => "indexability",
            Self::Technical => "technical",
            Self::International => "international",
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a rule reports when it fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub severity: Severity,
    pub evidence: Evidence,
}

pub type RuleCheck = fn(&PageFact) -> Option<RuleOutcome>;

/// One registered rule
#[derive(Debug, Clone, Copy)]
pub struct RuleDef {
    pub id: &'static str,
    pub version: u32,
    pub category: RuleCategory,
    pub description: &'static str,
    /// Findings carry a suggested remediation value
    pub auto_fixable: bool,
    pub check: RuleCheck,
}

fn outcome(
    severity: Severity,
    field: &str,
    observed: impl Into<String>,
    rationale: &str,
    suggested_fix: Option<String>,
) -> Option<RuleOutcome> {
    Some(RuleOutcome {
        severity,
        evidence: Evidence {
            field: field.to_string(),
            observed: observed.into(),
            rationale: rationale.to_string(),
            suggested_fix,
        },
    })
}

/// Content rules only make sense for pages that returned HTML
fn html_page(fact: &PageFact) -> Option<&PageFact> {
    fact.is_html_success().then_some(fact)
}

fn title_missing(fact: &PageFact) -> Option<RuleOutcome> {
    let blank = fact.title.as_deref().map(str::trim).unwrap_or("").is_empty();
    if !blank {
        return None;
    }
    outcome(
        Severity::Critical,
        "title",
        fact.title.clone().unwrap_or_default(),
        "Pages without a title show a generic label in search results",
        None,
    )
}

fn title_too_long(fact: &PageFact) -> Option<RuleOutcome> {
    let title = fact.title.as_deref()?.trim();
    let chars = title.chars().count();
    if chars <= TITLE_MAX_CHARS {
        return None;
    }
    outcome(
        Severity::Medium,
        "title",
        title,
        "Titles longer than 60 characters are truncated in search results",
        None,
    )
}

fn title_too_short(fact: &PageFact) -> Option<RuleOutcome> {
    let title = fact.title.as_deref()?.trim();
    let chars = title.chars().count();
    if chars == 0 || chars >= TITLE_MIN_CHARS {
        return None;
    }
    outcome(
        Severity::Low,
        "title",
        title,
        "Very short titles rarely describe the page",
        None,
    )
}

fn description_missing(fact: &PageFact) -> Option<RuleOutcome> {
    let fact = html_page(fact)?;
    let present = fact
        .meta_content("description")
        .map(|d| !d.trim().is_empty())
        .unwrap_or(false);
    if present {
        return None;
    }
    outcome(
        Severity::High,
        "meta.description",
        "",
        "Search engines fall back to arbitrary page text without a description",
        None,
    )
}

fn description_too_long(fact: &PageFact) -> Option<RuleOutcome> {
    let description = html_page(fact)?.meta_content("description")?.trim();
    if description.chars().count() <= DESCRIPTION_MAX_CHARS {
        return None;
    }
    let shortened: String = description
        .chars()
        .take(DESCRIPTION_MAX_CHARS - 3)
        .collect::<String>()
        .trim_end()
        .to_string();
    outcome(
        Severity::Low,
        "meta.description",
        description,
        "Descriptions longer than 160 characters are cut off",
        Some(format!("{}...", shortened)),
    )
}

fn h1_count(fact: &PageFact) -> usize {
    fact.headings.iter().filter(|h| h.level == 1).count()
}

fn h1_missing(fact: &PageFact) -> Option<RuleOutcome> {
    let fact = html_page(fact)?;
    if h1_count(fact) > 0 {
        return None;
    }
    outcome(
        Severity::Medium,
        "headings",
        "0 h1",
        "A single h1 states the page topic",
        None,
    )
}

fn h1_multiple(fact: &PageFact) -> Option<RuleOutcome> {
    let count = h1_count(html_page(fact)?);
    if count <= 1 {
        return None;
    }
    outcome(
        Severity::Low,
        "headings",
        format!("{} h1", count),
        "Several h1 headings blur the page topic",
        None,
    )
}

fn thin_content(fact: &PageFact) -> Option<RuleOutcome> {
    let fact = html_page(fact)?;
    if fact.word_count >= THIN_CONTENT_WORDS {
        return None;
    }
    let severity = if fact.word_count < VERY_THIN_CONTENT_WORDS {
        Severity::High
    } else {
        Severity::Medium
    };
    outcome(
        severity,
        "word_count",
        fact.word_count.to_string(),
        "Pages with little text rank poorly",
        None,
    )
}

fn low_text_density(fact: &PageFact) -> Option<RuleOutcome> {
    let fact = html_page(fact)?;
    if fact.text_density >= MIN_TEXT_DENSITY {
        return None;
    }
    outcome(
        Severity::Low,
        "text_density",
        format!("{:.3}", fact.text_density),
        "Most of the page weight is markup rather than text",
        None,
    )
}

fn canonical_missing(fact: &PageFact) -> Option<RuleOutcome> {
    let fact = html_page(fact)?;
    if fact.canonical.is_some() {
        return None;
    }
    outcome(
        Severity::Medium,
        "canonical",
        "",
        "Without a canonical link duplicate URLs compete with each other",
        Some(fact.url.clone()),
    )
}

fn canonical_cross_host(fact: &PageFact) -> Option<RuleOutcome> {
    let canonical = html_page(fact)?.canonical.as_deref()?;
    let canonical_host = host_of(canonical)?;
    if canonical_host == fact.host {
        return None;
    }
    outcome(
        Severity::High,
        "canonical",
        canonical,
        "The canonical link hands this page's ranking to another host",
        None,
    )
}

fn http_error(fact: &PageFact) -> Option<RuleOutcome> {
    match (fact.status_code, fact.fetch_error.as_deref()) {
        (Some(code), _) if code >= 500 => outcome(
            Severity::Critical,
            "status_code",
            code.to_string(),
            "Server errors keep the page out of the index",
            None,
        ),
        (Some(code), _) if code >= 400 => outcome(
            Severity::High,
            "status_code",
            code.to_string(),
            "Client errors on internal URLs waste crawl budget",
            None,
        ),
        (_, Some(error)) => outcome(
            Severity::High,
            "fetch_error",
            error,
            "The page could not be fetched",
            None,
        ),
        _ => None,
    }
}

fn render_timeout(fact: &PageFact) -> Option<RuleOutcome> {
    if !fact.render_timeout {
        return None;
    }
    outcome(
        Severity::Medium,
        "render_timeout",
        "true",
        "The page did not finish rendering in the browser",
        None,
    )
}

fn noindex(fact: &PageFact) -> Option<RuleOutcome> {
    let robots = html_page(fact)?.meta_content("robots")?;
    if !robots.to_ascii_lowercase().contains("noindex") {
        return None;
    }
    outcome(
        Severity::High,
        "meta.robots",
        robots,
        "The page asks search engines not to index it",
        None,
    )
}

fn viewport_missing(fact: &PageFact) -> Option<RuleOutcome> {
    let fact = html_page(fact)?;
    if fact.meta_content("viewport").is_some() {
        return None;
    }
    outcome(
        Severity::Medium,
        "meta.viewport",
        "",
        "Pages without a viewport are not mobile friendly",
        Some("width=device-width, initial-scale=1".to_string()),
    )
}

fn hreflang_missing_self(fact: &PageFact) -> Option<RuleOutcome> {
    let fact = html_page(fact)?;
    if fact.hreflang.is_empty() {
        return None;
    }
    let url = fact.url.trim_end_matches('/');
    if fact
        .hreflang
        .iter()
        .any(|alt| alt.href.trim_end_matches('/') == url)
    {
        return None;
    }
    let langs: Vec<&str> = fact.hreflang.iter().map(|alt| alt.lang.as_str()).collect();
    outcome(
        Severity::Low,
        "hreflang",
        langs.join(","),
        "Alternate-language sets should include the page itself",
        None,
    )
}

/// Every rule, in evaluation order
pub static RULES: &[RuleDef] = &[
    RuleDef {
        id: "title.missing",
        version: 1,
        category: RuleCategory::Metadata,
        description: "Page has no title",
        auto_fixable: false,
        check: title_missing,
    },
    RuleDef {
        id: "title.too_long",
        version: 1,
        category: RuleCategory::Metadata,
        description: "Title longer than 60 characters",
        auto_fixable: false,
        check: title_too_long,
    },
    RuleDef {
        id: "title.too_short",
        version: 1,
        category: RuleCategory::Metadata,
        description: "Title shorter than 10 characters",
        auto_fixable: false,
        check: title_too_short,
    },
    RuleDef {
        id: "meta_description.missing",
        version: 1,
        category: RuleCategory::Metadata,
        description: "Page has no meta description",
        auto_fixable: false,
        check: description_missing,
    },
    RuleDef {
        id: "meta_description.too_long",
        version: 1,
        category: RuleCategory::Metadata,
        description: "Meta description longer than 160 characters",
        auto_fixable: true,
        check: description_too_long,
    },
    RuleDef {
        id: "h1.missing",
        version: 1,
        category: RuleCategory::Content,
        description: "Page has no h1",
        auto_fixable: false,
        check: h1_missing,
    },
    RuleDef {
        id: "h1.multiple",
        version: 1,
        category: RuleCategory::Content,
        description: "Page has more than one h1",
        auto_fixable: false,
        check: h1_multiple,
    },
    RuleDef {
        id: "content.thin",
        version: 1,
        category: RuleCategory::Content,
        description: "Fewer than 300 words of visible text",
        auto_fixable: false,
        check: thin_content,
    },
    RuleDef {
        id: "content.low_text_density",
        version: 1,
        category: RuleCategory::Content,
        description: "Visible text is under 10% of the HTML",
        auto_fixable: false,
        check: low_text_density,
    },
    RuleDef {
        id: "canonical.missing",
        version: 1,
        category: RuleCategory::Indexability,
        description: "Page has no canonical link",
        auto_fixable: true,
        check: canonical_missing,
    },
    RuleDef {
        id: "canonical.cross_host",
        version: 1,
        category: RuleCategory::Indexability,
        description: "Canonical link points to another host",
        auto_fixable: false,
        check: canonical_cross_host,
    },
    RuleDef {
        id: "indexability.noindex",
        version: 1,
        category: RuleCategory::Indexability,
        description: "Page is marked noindex",
        auto_fixable: false,
        check: noindex,
    },
    RuleDef {
        id: "status.http_error",
        version: 1,
        category: RuleCategory::Technical,
        description: "Page returned an error or could not be fetched",
        auto_fixable: false,
        check: http_error,
    },
    RuleDef {
        id: "render.timeout",
        version: 1,
        category: RuleCategory::Technical,
        description: "Browser rendering timed out",
        auto_fixable: false,
        check: render_timeout,
    },
    RuleDef {
        id: "viewport.missing",
        version: 1,
        category: RuleCategory::Technical,
        description: "Page has no viewport meta tag",
        auto_fixable: true,
        check: viewport_missing,
    },
    RuleDef {
        id: "hreflang.missing_self",
        version: 1,
        category: RuleCategory::International,
        description: "Hreflang set does not reference the page itself",
        auto_fixable: false,
        check: hreflang_missing_self,
    },
];

pub fn rule_by_id(id: &str) -> Option<&'static RuleDef> {
    RULES.iter().find(|rule| rule.id == id)
}

/// Rules whose category is in `categories`
pub fn rules_in(categories: &[RuleCategory]) -> Vec<&'static RuleDef> {
    RULES
        .iter()
        .filter(|rule| categories.contains(&rule.category))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Heading, Hreflang};
    use std::collections::HashSet;

    fn healthy_fact() -> PageFact {
        let mut fact = PageFact::empty(1, "https://ex.com/about", "ex.com", 1);
        fact.status_code = Some(200);
        fact.content_type = Some("text/html; charset=utf-8".to_string());
        fact.title = Some("About Example Company".to_string());
        fact.meta
            .insert("description".to_string(), "Who we are.".to_string());
        fact.meta.insert(
            "viewport".to_string(),
            "width=device-width, initial-scale=1".to_string(),
        );
        fact.headings = vec![Heading {
            level: 1,
            text: "About".to_string(),
        }];
        fact.canonical = Some("https://ex.com/about".to_string());
        fact.word_count = 450;
        fact.text_density = 0.4;
        fact
    }

    fn fired(fact: &PageFact) -> Vec<&'static str> {
        RULES
            .iter()
            .filter(|rule| (rule.check)(fact).is_some())
            .map(|rule| rule.id)
            .collect()
    }

    #[test]
    fn test_rule_ids_are_unique() {
        let ids: HashSet<_> = RULES.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), RULES.len());
    }

    #[test]
    fn test_healthy_page_has_no_findings() {
        assert!(fired(&healthy_fact()).is_empty());
    }

    #[test]
    fn test_missing_title_is_always_critical() {
        let mut variants = Vec::new();

        let mut fact = healthy_fact();
        fact.title = None;
        variants.push(fact.clone());

        fact.title = Some("   ".to_string());
        variants.push(fact.clone());

        fact.status_code = Some(404);
        fact.word_count = 0;
        fact.render_timeout = true;
        variants.push(fact.clone());

        let mut failed = PageFact::empty(1, "https://ex.com/x", "ex.com", 0);
        failed.fetch_error = Some("connection reset".to_string());
        variants.push(failed);

        let rule = rule_by_id("title.missing").unwrap();
        for fact in variants {
            let outcome = (rule.check)(&fact).unwrap();
            assert_eq!(outcome.severity, Severity::Critical);
            assert_eq!(outcome.evidence.field, "title");
        }
    }

    #[test]
    fn test_thin_content_severity_depends_on_word_count() {
        let rule = rule_by_id("content.thin").unwrap();
        let mut fact = healthy_fact();

        fact.word_count = 50;
        assert_eq!((rule.check)(&fact).unwrap().severity, Severity::High);
        fact.word_count = 200;
        assert_eq!((rule.check)(&fact).unwrap().severity, Severity::Medium);
        fact.word_count = 300;
        assert!((rule.check)(&fact).is_none());
    }

    #[test]
    fn test_canonical_missing_suggests_page_url() {
        let mut fact = healthy_fact();
        fact.canonical = None;
        let rule = rule_by_id("canonical.missing").unwrap();
        assert!(rule.auto_fixable);
        assert_eq!(
            (rule.check)(&fact).unwrap().evidence.suggested_fix.as_deref(),
            Some("https://ex.com/about")
        );
    }

    #[test]
    fn test_cross_host_canonical() {
        let mut fact = healthy_fact();
        fact.canonical = Some("https://other.org/about".to_string());
        assert!(fired(&fact).contains(&"canonical.cross_host"));
    }

    #[test]
    fn test_http_error_severity() {
        let rule = rule_by_id("status.http_error").unwrap();
        let mut fact = healthy_fact();
        fact.status_code = Some(503);
        assert_eq!((rule.check)(&fact).unwrap().severity, Severity::Critical);
        fact.status_code = Some(404);
        assert_eq!((rule.check)(&fact).unwrap().severity, Severity::High);
    }

    #[test]
    fn test_content_rules_skip_error_pages() {
        let mut fact = healthy_fact();
        fact.status_code = Some(404);
        fact.word_count = 0;
        fact.canonical = None;
        assert_eq!(fired(&fact), vec!["status.http_error"]);
    }

    #[test]
    fn test_long_description_suggestion_fits() {
        let mut fact = healthy_fact();
        fact.meta.insert("description".to_string(), "word ".repeat(60));
        let outcome = (rule_by_id("meta_description.too_long").unwrap().check)(&fact).unwrap();
        let fix = outcome.evidence.suggested_fix.unwrap();
        assert!(fix.chars().count() <= DESCRIPTION_MAX_CHARS);
        assert!(fix.ends_with("..."));
    }

    #[test]
    fn test_hreflang_without_self_reference() {
        let mut fact = healthy_fact();
        fact.hreflang = vec![Hreflang {
            lang: "de".to_string(),
            href: "https://ex.com/de/about".to_string(),
        }];
        assert!(fired(&fact).contains(&"hreflang.missing_self"));

        fact.hreflang.push(Hreflang {
            lang: "en".to_string(),
            href: "https://ex.com/about".to_string(),
        });
        assert!(!fired(&fact).contains(&"hreflang.missing_self"));
    }

    #[test]
    fn test_rules_in_category() {
        let international = rules_in(&[RuleCategory::International]);
        assert_eq!(international.len(), 1);
        assert_eq!(international[0].id, "hreflang.missing_self");
    }
}
