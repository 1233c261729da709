use url::Url;

/// Extracts the host from a URL, lowercased
///
/// # Examples
///
/// ```
/// use url::Url;
/// use seo_auditor::url::extract_host;
///
/// let url = Url::parse("https://EXAMPLE.COM/path").unwrap();
/// assert_eq!(extract_host(&url), Some("example.com".to_string()));
/// ```
pub fn extract_host(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Extracts the host from a URL string, if it parses
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok().as_ref().and_then(extract_host)
}

/// Strips a leading `www.` label
pub fn site_root(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// The set of sites a project crawls, derived from its seeds
///
/// Each root is a host with any `www.` prefix removed. A host belongs to a
/// root when it equals the root or is a subdomain of it. Two URLs are on the
/// same domain when their hosts resolve to the same root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteScope {
    roots: Vec<String>,
}

impl SiteScope {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut roots: Vec<String> = hosts
            .into_iter()
            .map(|h| site_root(&h.as_ref().to_lowercase()).to_string())
            .filter(|h| !h.is_empty())
            .collect();
        roots.sort();
        roots.dedup();
        Self { roots }
    }

    /// Builds a scope from seed URLs, skipping any that fail to parse
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Self {
        Self::new(urls.iter().filter_map(|u| host_of(u.as_ref())))
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// The most specific root covering `host`
    pub fn root_for(&self, host: &str) -> Option<&str> {
        let host = site_root(host);
        self.roots
            .iter()
            .filter(|root| host == root.as_str() || host.ends_with(&format!(".{}", root)))
            .max_by_key(|root| root.len())
            .map(String::as_str)
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.root_for(host).is_some()
    }

    pub fn contains_url(&self, url: &str) -> bool {
        host_of(url)
            .map(|h| self.contains_host(&h))
            .unwrap_or(false)
    }

    /// True when both URLs fall under the same root
    pub fn same_domain(&self, a: &str, b: &str) -> bool {
        match (host_of(a), host_of(b)) {
            (Some(ha), Some(hb)) => match (self.root_for(&ha), self.root_for(&hb)) {
                (Some(ra), Some(rb)) => ra == rb,
                _ => false,
            },
            _ => false,
        }
    }
}
