//! HTML parser for extracting page facts and links
//!
//! This module handles parsing HTML content to extract:
//! - Links to follow (from `<a>` tags)
//! - Title, meta tags, headings, canonical and hreflang alternates
//! - Visible text statistics (word count and text density)

use crate::model::{Heading, Hreflang};
use scraper::node::Node;
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use url::Url;

/// Elements whose text is never rendered as page content
const NON_VISIBLE_ELEMENTS: &[&str] = &["head", "script", "style", "noscript", "template", "svg"];

/// Extracted information from an HTML page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPage {
    /// The page title (from `<title>`)
    pub title: Option<String>,

    /// Meta tags keyed by lowercased `name` or `property`
    pub meta: BTreeMap<String, String>,

    /// Headings in document order
    pub headings: Vec<Heading>,

    /// Absolute canonical URL
    pub canonical: Option<String>,

    /// Alternate-language links (absolute)
    pub hreflang: Vec<Hreflang>,

    /// All followable links found on the page (absolute URLs)
    pub links: Vec<String>,

    /// Words of visible body text
    pub word_count: u32,

    /// Characters of visible body text (whitespace collapsed)
    pub text_length: usize,

    /// `text_length / html length`, 0.0 for an empty document
    pub text_density: f64,
}

/// Parses HTML content and extracts facts and links
///
/// # Link Extraction Rules
///
/// **Include:**
/// - `<a href="...">` tags anywhere in the document
///
/// **Exclude:**
/// - `<a href="..." download>`
/// - `javascript:`, `mailto:`, `tel:` links
/// - Data URIs and fragment-only anchors
///
/// # Example
///
/// ```
/// use seo_auditor::crawler::parse_html;
/// use url::Url;
///
/// let html = r#"<html><head><title>Test</title></head><body><a href="/page">Link</a></body></html>"#;
/// let base_url = Url::parse("https://example.com/").unwrap();
/// let parsed = parse_html(html, &base_url);
/// assert_eq!(parsed.title, Some("Test".to_string()));
/// assert_eq!(parsed.links, vec!["https://example.com/page".to_string()]);
/// ```
pub fn parse_html(html: &str, base_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);

    let text = visible_text(&document);
    let text_length = text.chars().count();
    let text_density = if html.is_empty() {
        0.0
    } else {
        text_length as f64 / html.len() as f64
    };

    ParsedPage {
        title: extract_title(&document),
        meta: extract_meta(&document),
        headings: extract_headings(&document),
        canonical: extract_canonical(&document, base_url),
        hreflang: extract_hreflang(&document, base_url),
        links: extract_links(&document, base_url),
        word_count: text.split_whitespace().count() as u32,
        text_length,
        text_density,
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// Extracts the page title from the HTML document
fn extract_title(document: &Html) -> Option<String> {
    let title_selector = selector("title")?;

    document
        .select(&title_selector)
        .next()
        .map(|element| collapse_whitespace(&element.text().collect::<String>()))
        .filter(|s| !s.is_empty())
}

fn extract_meta(document: &Html) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    let Some(meta_selector) = selector("meta[content]") else {
        return meta;
    };

    for element in document.select(&meta_selector) {
        let attrs = element.value();
        let key = attrs.attr("name").or_else(|| attrs.attr("property"));
        if let (Some(key), Some(content)) = (key, attrs.attr("content")) {
            // First occurrence wins, as browsers do
            meta.entry(key.trim().to_lowercase())
                .or_insert_with(|| content.trim().to_string());
        }
    }

    meta
}

fn extract_headings(document: &Html) -> Vec<Heading> {
    let Some(heading_selector) = selector("h1, h2, h3, h4, h5, h6") else {
        return Vec::new();
    };

    document
        .select(&heading_selector)
        .filter_map(|element| {
            let level = element.value().name().strip_prefix('h')?.parse::<u8>().ok()?;
            Some(Heading {
                level,
                text: collapse_whitespace(&element.text().collect::<String>()),
            })
        })
        .collect()
}

fn has_rel(rel: Option<&str>, wanted: &str) -> bool {
    rel.map(|r| r.split_whitespace().any(|t| t.eq_ignore_ascii_case(wanted)))
        .unwrap_or(false)
}

fn extract_canonical(document: &Html, base_url: &Url) -> Option<String> {
    let link_selector = selector("link[rel][href]")?;

    document
        .select(&link_selector)
        .filter(|element| has_rel(element.value().attr("rel"), "canonical"))
        .find_map(|element| resolve_link(element.value().attr("href")?, base_url))
}

fn extract_hreflang(document: &Html, base_url: &Url) -> Vec<Hreflang> {
    let Some(link_selector) = selector("link[rel][hreflang][href]") else {
        return Vec::new();
    };

    document
        .select(&link_selector)
        .filter(|element| has_rel(element.value().attr("rel"), "alternate"))
        .filter_map(|element| {
            let lang = element.value().attr("hreflang")?.trim().to_lowercase();
            let href = resolve_link(element.value().attr("href")?, base_url)?;
            Some(Hreflang { lang, href })
        })
        .collect()
}

/// Extracts all valid links from the HTML document
fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let Some(a_selector) = selector("a[href]") else {
        return Vec::new();
    };

    document
        .select(&a_selector)
        .filter(|element| element.value().attr("download").is_none())
        .filter_map(|element| resolve_link(element.value().attr("href")?, base_url))
        .collect()
}

/// Text a reader would see: body text nodes outside scripts, styles and templates
fn visible_text(document: &Html) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| match ancestor.value() {
            Node::Element(element) => NON_VISIBLE_ELEMENTS.contains(&element.name()),
            _ => false,
        });
        if !hidden {
            parts.push(&**text);
        }
    }

    collapse_whitespace(&parts.join(" "))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves a link href to an absolute URL and validates it
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - Invalid URLs
/// - Non-HTTP(S) URLs after resolution
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lowered.starts_with(scheme))
    {
        return None;
    }

    let absolute_url = base_url.join(href).ok()?;
    if absolute_url.scheme() == "http" || absolute_url.scheme() == "https" {
        Some(absolute_url.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_url() -> Url {
        Url::parse("https://example.com/page").unwrap()
    }

    #[test]
    fn test_extract_title_with_whitespace() {
        let html = r#"<html><head><title>  Test
            Page  </title></head><body></body></html>"#;
        let parsed = parse_html(html, &base_url());
        assert_eq!(parsed.title, Some("Test Page".to_string()));
    }

    #[test]
    fn test_empty_title_is_none() {
        let html = r#"<html><head><title>   </title></head><body></body></html>"#;
        assert_eq!(parse_html(html, &base_url()).title, None);
    }

    #[test]
    fn test_extract_meta() {
        let html = r#"<html><head>
            <meta name="Description" content=" A page ">
            <meta property="og:title" content="OG">
            <meta name="robots" content="noindex, follow">
            <meta name="description" content="second">
            <meta charset="utf-8">
        </head><body></body></html>"#;
        let parsed = parse_html(html, &base_url());
        assert_eq!(parsed.meta.get("description"), Some(&"A page".to_string()));
        assert_eq!(parsed.meta.get("og:title"), Some(&"OG".to_string()));
        assert_eq!(parsed.meta.get("robots"), Some(&"noindex, follow".to_string()));
        assert_eq!(parsed.meta.len(), 3);
    }

    #[test]
    fn test_extract_headings_in_order() {
        let html = r#"<html><body><h2>Sub</h2><h1>Main</h1><h3> Deep </h3></body></html>"#;
        let parsed = parse_html(html, &base_url());
        let levels: Vec<u8> = parsed.headings.iter().map(|h| h.level).collect();
        assert_eq!(levels, vec![2, 1, 3]);
        assert_eq!(parsed.headings[2].text, "Deep");
    }

    #[test]
    fn test_extract_canonical_and_hreflang() {
        let html = r#"<html><head>
            <link rel="Canonical" href="/canonical">
            <link rel="alternate" hreflang="en" href="https://example.com/en">
            <link rel="alternate" hreflang="DE" href="/de">
            <link rel="stylesheet" href="/style.css">
        </head><body></body></html>"#;
        let parsed = parse_html(html, &base_url());
        assert_eq!(
            parsed.canonical,
            Some("https://example.com/canonical".to_string())
        );
        assert_eq!(parsed.hreflang.len(), 2);
        assert_eq!(parsed.hreflang[1].lang, "de");
        assert_eq!(parsed.hreflang[1].href, "https://example.com/de");
        assert!(parsed.links.is_empty());
    }

    #[test]
    fn test_visible_text_excludes_scripts() {
        let html = r#"<html><head><title>Ignored words</title><style>.a{}</style></head>
            <body><p>one two</p><script>var x = "three four";</script>
            <noscript>enable js</noscript><div>three</div></body></html>"#;
        let parsed = parse_html(html, &base_url());
        assert_eq!(parsed.word_count, 3);
        assert_eq!(parsed.text_length, "one two three".len());
        assert!(parsed.text_density > 0.0 && parsed.text_density < 1.0);
    }

    #[test]
    fn test_empty_document_density() {
        let parsed = parse_html("", &base_url());
        assert_eq!(parsed.word_count, 0);
        assert_eq!(parsed.text_density, 0.0);
    }

    #[test]
    fn test_extract_relative_links() {
        let html = r#"<html><body><a href="/other">A</a><a href="sibling">B</a></body></html>"#;
        let parsed = parse_html(html, &base_url());
        assert_eq!(
            parsed.links,
            vec![
                "https://example.com/other".to_string(),
                "https://example.com/sibling".to_string()
            ]
        );
    }

    #[test]
    fn test_skip_non_navigational_links() {
        let html = r##"<html><body>
            <a href="javascript:void(0)">js</a>
            <a href="MAILTO:test@example.com">mail</a>
            <a href="tel:+1234567890">call</a>
            <a href="data:text/html,x">data</a>
            <a href="#section">jump</a>
            <a href="/file.pdf" download>download</a>
            <a href="ftp://example.com/x">ftp</a>
            <a href="/valid" rel="nofollow">valid</a>
        </body></html>"##;
        let parsed = parse_html(html, &base_url());
        assert_eq!(parsed.links, vec!["https://example.com/valid".to_string()]);
    }
}
