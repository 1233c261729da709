use crate::UrlError;
use url::Url;

/// List of tracking query parameters to remove during normalization
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "mc_eid",
];

/// Normalizes a URL so that equivalent spellings collapse to one key
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed or not HTTP(S)
/// 2. Lowercase the host
/// 3. Normalize path:
///    - Remove dot segments (. and ..) and empty segments
///    - Remove trailing slash (except for root /)
///    - Empty path becomes /
/// 4. Remove fragment (everything after #)
/// 5. Remove tracking query parameters
/// 6. Sort remaining query parameters and re-encode them
/// 7. Remove empty query string (trailing ?)
///
/// The result is a fixed point: normalizing it again yields the same URL.
///
/// # Examples
///
/// ```
/// use seo_auditor::url::normalize_url;
///
/// let url = normalize_url("https://EXAMPLE.COM/page/#top").unwrap();
/// assert_eq!(url.as_str(), "https://example.com/page");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(format!(
            "Only HTTP and HTTPS schemes are supported, got: {}",
            url.scheme()
        )));
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => {
            let normalized_host = host.to_lowercase();
            url.set_host(Some(&normalized_host))
                .map_err(|e| UrlError::Malformed(format!("Failed to set host: {}", e)))?;
        }
        _ => return Err(UrlError::MissingDomain),
    }

    let normalized_path = normalize_path(url.path());
    url.set_path(&normalized_path);

    url.set_fragment(None);

    if url.query().is_some() {
        let params = filter_and_sort_query_params(&url);
        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    // Credentials never identify a distinct page
    let _ = url.set_username("");
    let _ = url.set_password(None);

    Ok(url)
}

/// Normalizes a URL path by removing dot segments and trailing slashes
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return "/".to_string();
    }

    format!("/{}", segments.join("/"))
}

/// Filters out tracking parameters and sorts remaining query parameters
fn filter_and_sort_query_params(url: &Url) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    params.sort();
    params
}

fn is_tracking_param(key: &str) -> bool {
    TRACKING_PARAMS.contains(&key) || key.starts_with("utm_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_idempotent(input: &str) {
        let once = normalize_url(input).unwrap();
        let twice = normalize_url(once.as_str()).unwrap();
        assert_eq!(once, twice, "normalization of {} is not idempotent", input);
    }

    #[test]
    fn test_scheme_is_preserved() {
        let result = normalize_url("http://example.com/page").unwrap();
        assert_eq!(result.as_str(), "http://example.com/page");
    }

    #[test]
    fn test_remove_trailing_slash() {
        let result = normalize_url("https://example.com/page/").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_keep_root_slash() {
        let result = normalize_url("https://example.com/").unwrap();
        assert_eq!(result.as_str(), "https://example.com/");
    }

    #[test]
    fn test_empty_path_becomes_root() {
        let result = normalize_url("https://example.com").unwrap();
        assert_eq!(result.as_str(), "https://example.com/");
    }

    #[test]
    fn test_remove_fragment() {
        let result = normalize_url("https://example.com/page#section").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_lowercase_host_keeps_path_case() {
        let result = normalize_url("https://EXAMPLE.COM/Page").unwrap();
        assert_eq!(result.as_str(), "https://example.com/Page");
    }

    #[test]
    fn test_www_is_kept() {
        let result = normalize_url("https://WWW.example.com/").unwrap();
        assert_eq!(result.as_str(), "https://www.example.com/");
    }

    #[test]
    fn test_remove_tracking_params() {
        let result = normalize_url("https://example.com/page?utm_source=twitter").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_sort_query_params() {
        let result = normalize_url("https://example.com/page?b=2&a=1").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page?a=1&b=2");
    }

    #[test]
    fn test_mixed_query_params() {
        let result = normalize_url(
            "https://example.com/page?keep=yes&utm_medium=email&another=value&fbclid=123",
        )
        .unwrap();
        assert_eq!(
            result.as_str(),
            "https://example.com/page?another=value&keep=yes"
        );
    }

    #[test]
    fn test_normalize_path_with_dots() {
        let result = normalize_url("https://example.com/a/../b/./c").unwrap();
        assert_eq!(result.as_str(), "https://example.com/b/c");
    }

    #[test]
    fn test_multiple_slashes() {
        let result = normalize_url("https://example.com///path//to///page").unwrap();
        assert_eq!(result.as_str(), "https://example.com/path/to/page");
    }

    #[test]
    fn test_strips_credentials() {
        let result = normalize_url("https://user:pw@example.com/x").unwrap();
        assert_eq!(result.as_str(), "https://example.com/x");
    }

    #[test]
    fn test_invalid_scheme() {
        let result = normalize_url("ftp://example.com/page");
        assert!(matches!(result.unwrap_err(), UrlError::InvalidScheme(_)));
    }

    #[test]
    fn test_malformed_url() {
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for input in [
            "https://example.com",
            "HTTP://Example.COM:80/a/b/../c/?z=1&a=2#frag",
            "https://example.com/page?q=a%26b&x=hello%20world",
            "https://example.com/search?q=a+b&empty",
            "https://example.com/%7Euser/",
            "https://example.com/a//b/./",
            "https://example.com/?utm_source=x&fbclid=y",
            "https://example.com/caf%C3%A9?name=%C3%A9t%C3%A9",
        ] {
            assert_idempotent(input);
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_segment() -> impl Strategy<Value = String> {
            prop_oneof![
                "[a-zA-Z0-9._~-]{0,8}",
                Just(".".to_string()),
                Just("..".to_string()),
                Just("%20".to_string()),
                Just("caf%C3%A9".to_string()),
            ]
        }

        fn arb_param() -> impl Strategy<Value = String> {
            (
                prop_oneof!["[a-z]{1,5}", "utm_[a-z]{1,5}", Just("fbclid".to_string())],
                "[a-z0-9 +]{0,5}",
            )
                .prop_map(|(key, value)| format!("{}={}", key, value))
        }

        fn arb_url() -> impl Strategy<Value = String> {
            (
                prop_oneof!["http", "https", "HTTPS"],
                "[a-zA-Z]{1,10}\\.(com|org)",
                prop_oneof![Just(""), Just(":80"), Just(":443"), Just(":8080")],
                prop::collection::vec(arb_segment(), 0..6),
                any::<bool>(),
                prop::collection::vec(arb_param(), 0..4),
                prop::option::of("[a-z]{0,6}"),
            )
                .prop_map(|(scheme, host, port, segments, trailing, params, fragment)| {
                    let mut url = format!("{}://{}{}/{}", scheme, host, port, segments.join("/"));
                    if trailing {
                        url.push('/');
                    }
                    if !params.is_empty() {
                        url.push('?');
                        url.push_str(&params.join("&"));
                    }
                    if let Some(fragment) = fragment {
                        url.push('#');
                        url.push_str(&fragment);
                    }
                    url
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            #[test]
            fn normalization_is_a_fixed_point(input in arb_url()) {
                let once = normalize_url(&input).unwrap();
                let twice = normalize_url(once.as_str()).unwrap();
                prop_assert_eq!(once, twice);
            }

            #[test]
            fn normalized_urls_drop_tracking_and_fragments(input in arb_url()) {
                let url = normalize_url(&input).unwrap();
                prop_assert!(url.fragment().is_none());
                prop_assert!(url.query_pairs().all(|(key, _)| !is_tracking_param(&key)));
                prop_assert!(url.path() == "/" || !url.path().ends_with('/'));
            }
        }
    }
}
