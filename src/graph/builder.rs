//! Internal link graph
//!
//! Candidate links reported by the fetcher are filtered here: both ends must
//! fall under the same site root and self-links are dropped. Repeat
//! observations of an edge only move its `last_seen`.

use crate::model::{LinkEdge, LinkStat, RunId};
use crate::url::{is_homepage, normalize_url, SiteScope};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Why a candidate edge was not kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRejection {
    Invalid,
    CrossDomain,
    SelfLink,
}

/// Accumulates the link graph of one run
#[derive(Debug, Clone)]
pub struct LinkGraphBuilder {
    run_id: RunId,
    scope: SiteScope,
    pages: BTreeSet<String>,
    edges: BTreeMap<(String, String), LinkEdge>,
}

impl LinkGraphBuilder {
    pub fn new(run_id: RunId, scope: SiteScope) -> Self {
        Self {
            run_id,
            scope,
            pages: BTreeSet::new(),
            edges: BTreeMap::new(),
        }
    }

    /// Registers a fetched page so it appears in degree and orphan reports
    pub fn add_page(&mut self, url: &str) {
        if let Ok(normalized) = normalize_url(url) {
            self.pages.insert(normalized.to_string());
        }
    }

    /// Offers a candidate link
    ///
    /// # Returns
    ///
    /// The edge as it now stands (with merged first/last seen), or the
    /// reason it was rejected
    pub fn observe(
        &mut self,
        src: &str,
        dst: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<LinkEdge, EdgeRejection> {
        let (Ok(src), Ok(dst)) = (normalize_url(src), normalize_url(dst)) else {
            return Err(EdgeRejection::Invalid);
        };
        let (src, dst) = (src.to_string(), dst.to_string());

        if src == dst {
            return Err(EdgeRejection::SelfLink);
        }
        if !self.scope.same_domain(&src, &dst) {
            return Err(EdgeRejection::CrossDomain);
        }

        self.pages.insert(src.clone());
        self.pages.insert(dst.clone());

        let edge = self
            .edges
            .entry((src.clone(), dst.clone()))
            .and_modify(|edge| {
                edge.first_seen = edge.first_seen.min(seen_at);
                edge.last_seen = edge.last_seen.max(seen_at);
            })
            .or_insert_with(|| LinkEdge {
                run_id: self.run_id,
                src,
                dst,
                first_seen: seen_at,
                last_seen: seen_at,
            });
        Ok(edge.clone())
    }

    /// Loads stored edges, keeping their timestamps
    pub fn add_edge(&mut self, edge: &LinkEdge) -> Result<LinkEdge, EdgeRejection> {
        self.observe(&edge.src, &edge.dst, edge.first_seen)?;
        self.observe(&edge.src, &edge.dst, edge.last_seen)
    }

    pub fn build(self) -> LinkGraph {
        LinkGraph {
            pages: self.pages,
            edges: self.edges.into_values().collect(),
        }
    }
}

/// A finished link graph
#[derive(Debug, Clone, Default)]
pub struct LinkGraph {
    pages: BTreeSet<String>,
    /// Ordered by (src, dst)
    edges: Vec<LinkEdge>,
}

impl LinkGraph {
    pub fn edges(&self) -> &[LinkEdge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn pages(&self) -> impl Iterator<Item = &str> {
        self.pages.iter().map(String::as_str)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Inbound/outbound degree of every page, ordered by URL
    ///
    /// A page is orphaned when nothing links to it and it is not a homepage.
    pub fn link_stats(&self) -> Vec<LinkStat> {
        let mut degrees: BTreeMap<&str, (u32, u32)> =
            self.pages.iter().map(|p| (p.as_str(), (0, 0))).collect();

        for edge in &self.edges {
            degrees.entry(edge.src.as_str()).or_default().1 += 1;
            degrees.entry(edge.dst.as_str()).or_default().0 += 1;
        }

        degrees
            .into_iter()
            .map(|(url, (inbound, outbound))| LinkStat {
                url: url.to_string(),
                inbound,
                outbound,
                orphan: inbound == 0 && !is_homepage(url),
            })
            .collect()
    }

    pub fn orphans(&self) -> Vec<String> {
        self.link_stats()
            .into_iter()
            .filter(|stat| stat.orphan)
            .map(|stat| stat.url)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn builder() -> LinkGraphBuilder {
        LinkGraphBuilder::new(1, SiteScope::new(["ex.com"]))
    }

    fn stat<'a>(stats: &'a [LinkStat], url: &str) -> &'a LinkStat {
        stats.iter().find(|s| s.url == url).unwrap()
    }

    #[test]
    fn test_homepage_and_child_scenario() {
        let mut builder = builder();
        builder.add_page("https://ex.com/");
        builder.add_page("https://ex.com/a");
        builder
            .observe("https://ex.com/", "https://ex.com/a", Utc::now())
            .unwrap();

        let graph = builder.build();
        let stats = graph.link_stats();

        let home = stat(&stats, "https://ex.com/");
        assert_eq!(home.inbound, 0);
        assert!(!home.orphan);

        let child = stat(&stats, "https://ex.com/a");
        assert_eq!(child.inbound, 1);
        assert_eq!(child.outbound, 0);
        assert!(!child.orphan);
        assert!(graph.orphans().is_empty());
    }

    #[test]
    fn test_unlinked_page_is_orphan() {
        let mut builder = builder();
        builder.add_page("https://ex.com/");
        builder.add_page("https://ex.com/lonely");
        assert_eq!(builder.build().orphans(), vec!["https://ex.com/lonely"]);
    }

    #[test]
    fn test_rejects_self_and_cross_domain_links() {
        let mut builder = builder();
        let now = Utc::now();
        assert_eq!(
            builder.observe("https://ex.com/a", "https://ex.com/a#top", now),
            Err(EdgeRejection::SelfLink)
        );
        assert_eq!(
            builder.observe("https://ex.com/a", "https://other.org/", now),
            Err(EdgeRejection::CrossDomain)
        );
        assert_eq!(
            builder.observe("https://ex.com/a", "javascript:void(0)", now),
            Err(EdgeRejection::Invalid)
        );
        assert!(builder
            .observe("https://ex.com/a", "https://blog.ex.com/", now)
            .is_ok());

        for edge in builder.build().edges() {
            assert_ne!(edge.src, edge.dst);
        }
    }

    #[test]
    fn test_repeat_observation_moves_last_seen() {
        let mut builder = builder();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);

        builder.observe("https://ex.com/", "https://ex.com/a", t1).unwrap();
        let edge = builder
            .observe("https://ex.com/", "https://ex.com/a/", t0)
            .unwrap();

        assert_eq!(edge.first_seen, t0);
        assert_eq!(edge.last_seen, t1);
        assert_eq!(builder.build().edge_count(), 1);
    }
}
