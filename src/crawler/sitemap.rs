//! Sitemap seeding
//!
//! A `<urlset>` sitemap yields its `<loc>` entries as seeds. A
//! `<sitemapindex>` is followed one level deep; nested indexes are ignored.

use crate::AuditorError;
use reqwest::Client;
use scraper::{Html, Selector};

/// Extracts `<loc>` values from sitemap XML
pub fn parse_locs(xml: &str) -> Vec<String> {
    let document = Html::parse_document(xml);
    let Ok(loc_selector) = Selector::parse("loc") else {
        return Vec::new();
    };

    document
        .select(&loc_selector)
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|loc| !loc.is_empty())
        .collect()
}

pub fn is_sitemap_index(xml: &str) -> bool {
    xml.contains("<sitemapindex")
}

async fn fetch_text(client: &Client, url: &str) -> Result<String, AuditorError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AuditorError::SeedResolution(format!("{}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AuditorError::SeedResolution(format!(
            "{} returned HTTP {}",
            url,
            status.as_u16()
        )));
    }

    response
        .text()
        .await
        .map_err(|e| AuditorError::SeedResolution(format!("{}: {}", url, e)))
}

/// Resolves a sitemap URL to its page URLs
///
/// The top-level sitemap must be reachable. Child sitemaps of an index that
/// fail to load are skipped with a warning.
pub async fn resolve_sitemap(client: &Client, url: &str) -> Result<Vec<String>, AuditorError> {
    let body = fetch_text(client, url).await?;

    if !is_sitemap_index(&body) {
        return Ok(parse_locs(&body));
    }

    let mut pages = Vec::new();
    for child in parse_locs(&body) {
        match fetch_text(client, &child).await {
            Ok(child_body) if is_sitemap_index(&child_body) => {
                tracing::warn!("Ignoring nested sitemap index {}", child);
            }
            Ok(child_body) => pages.extend(parse_locs(&child_body)),
            Err(e) => tracing::warn!("Skipping child sitemap: {}", e),
        }
    }

    tracing::info!("Sitemap {} resolved to {} URLs", url, pages.len());
    Ok(pages)
}
