//! URL handling module
//!
//! This module provides URL normalization, host extraction and the
//! project site scope used to decide what counts as "same domain".

mod domain;
mod normalize;

pub use domain::{extract_host, host_of, site_root, SiteScope};
pub use normalize::normalize_url;

use url::Url;

/// True for the root page of a host (path `/`, no query)
pub fn is_homepage(url: &str) -> bool {
    Url::parse(url)
        .map(|u| u.path() == "/" && u.query().is_none())
        .unwrap_or(false)
}
