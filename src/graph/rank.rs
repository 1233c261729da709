//! PageRank over the internal link graph
//!
//! Large graphs are collapsed to a host graph first; each host's score is
//! then split across its pages by their share of the host's internal
//! inbound links.

use crate::graph::builder::LinkGraph;
use crate::model::{RankScore, RankSubject, RunId};
use crate::url::host_of;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

pub const DAMPING: f64 = 0.85;
pub const TOLERANCE: f64 = 1e-6;
pub const MAX_ITERATIONS: u32 = 100;

/// Raw PageRank result, indexed like the input nodes
#[derive(Debug, Clone, PartialEq)]
pub struct PageRank {
    pub scores: Vec<f64>,
    pub iterations_used: u32,
    pub converged: bool,
}

/// Weighted PageRank with dangling-mass redistribution
///
/// # Arguments
///
/// * `node_count` - Number of nodes
/// * `edges` - `(src, dst, weight)` triples over node indexes
///
/// Scores sum to 1. Convergence is reached when the L1 distance between
/// two successive iterations drops below [`TOLERANCE`].
pub fn pagerank(node_count: usize, edges: &[(usize, usize, f64)]) -> PageRank {
    if node_count == 0 {
        return PageRank {
            scores: Vec::new(),
            iterations_used: 0,
            converged: true,
        };
    }

    let n = node_count as f64;
    let mut out_weight = vec![0.0; node_count];
    for &(src, _, weight) in edges {
        out_weight[src] += weight;
    }

    let mut scores = vec![1.0 / n; node_count];
    let mut next = vec![0.0; node_count];

    for iteration in 1..=MAX_ITERATIONS {
        let dangling: f64 = scores
            .iter()
            .zip(&out_weight)
            .filter(|(_, &w)| w == 0.0)
            .map(|(s, _)| s)
            .sum();
        let base = (1.0 - DAMPING) / n + DAMPING * dangling / n;
        next.iter_mut().for_each(|s| *s = base);

        for &(src, dst, weight) in edges {
            next[dst] += DAMPING * scores[src] * weight / out_weight[src];
        }

        let delta: f64 = scores.iter().zip(&next).map(|(a, b)| (a - b).abs()).sum();
        std::mem::swap(&mut scores, &mut next);

        if delta < TOLERANCE {
            return PageRank {
                scores,
                iterations_used: iteration,
                converged: true,
            };
        }
    }

    PageRank {
        scores,
        iterations_used: MAX_ITERATIONS,
        converged: false,
    }
}

/// Scores of one run
#[derive(Debug, Clone)]
pub struct RankOutput {
    /// Per-URL scores, plus per-host scores when aggregated
    pub scores: Vec<RankScore>,
    pub iterations_used: u32,
    pub converged: bool,
    pub host_aggregated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RankComputer {
    host_aggregation_threshold: usize,
}

impl RankComputer {
    pub fn new(host_aggregation_threshold: usize) -> Self {
        Self {
            host_aggregation_threshold,
        }
    }

    /// Ranks every page of `graph`
    ///
    /// Above the host aggregation threshold the per-page scores come from
    /// the host graph and are flagged `host_aggregated`.
    pub fn compute(&self, run_id: RunId, graph: &LinkGraph) -> RankOutput {
        if graph.edge_count() > self.host_aggregation_threshold {
            tracing::warn!(
                "Run {}: {} edges exceed the threshold of {}; ranking hosts and redistributing to pages",
                run_id,
                graph.edge_count(),
                self.host_aggregation_threshold
            );
            return self.compute_host_level(run_id, graph);
        }

        let pages: Vec<&str> = graph.pages().collect();
        let index: HashMap<&str, usize> = pages.iter().enumerate().map(|(i, p)| (*p, i)).collect();
        let edges: Vec<(usize, usize, f64)> = graph
            .edges()
            .iter()
            .filter_map(|e| Some((*index.get(e.src.as_str())?, *index.get(e.dst.as_str())?, 1.0)))
            .collect();

        let result = pagerank(pages.len(), &edges);
        if !result.converged {
            tracing::warn!("Run {}: PageRank did not converge in {} iterations", run_id, MAX_ITERATIONS);
        }

        let computed_at = Utc::now();
        let scores = pages
            .iter()
            .zip(&result.scores)
            .map(|(page, score)| RankScore {
                run_id,
                subject: RankSubject::Url(page.to_string()),
                score: *score,
                iterations_used: result.iterations_used,
                converged: result.converged,
                host_aggregated: false,
                computed_at,
            })
            .collect();

        RankOutput {
            scores,
            iterations_used: result.iterations_used,
            converged: result.converged,
            host_aggregated: false,
        }
    }

    fn compute_host_level(&self, run_id: RunId, graph: &LinkGraph) -> RankOutput {
        let page_hosts: BTreeMap<&str, String> = graph
            .pages()
            .filter_map(|page| Some((page, host_of(page)?)))
            .collect();

        let hosts: Vec<&str> = {
            let mut hosts: Vec<&str> = page_hosts.values().map(String::as_str).collect();
            hosts.sort();
            hosts.dedup();
            hosts
        };
        let host_index: HashMap<&str, usize> =
            hosts.iter().enumerate().map(|(i, h)| (*h, i)).collect();

        let mut host_edges: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        let mut internal_inbound: HashMap<&str, u32> = HashMap::new();

        for edge in graph.edges() {
            let (Some(src_host), Some(dst_host)) = (
                page_hosts.get(edge.src.as_str()),
                page_hosts.get(edge.dst.as_str()),
            ) else {
                continue;
            };
            if src_host == dst_host {
                *internal_inbound.entry(edge.dst.as_str()).or_default() += 1;
            } else if let (Some(&s), Some(&d)) = (
                host_index.get(src_host.as_str()),
                host_index.get(dst_host.as_str()),
            ) {
                *host_edges.entry((s, d)).or_default() += 1.0;
            }
        }

        let edges: Vec<(usize, usize, f64)> =
            host_edges.into_iter().map(|((s, d), w)| (s, d, w)).collect();
        let result = pagerank(hosts.len(), &edges);

        let mut host_totals: HashMap<&str, (u32, u32)> = HashMap::new();
        for (page, host) in &page_hosts {
            let entry = host_totals.entry(host.as_str()).or_default();
            entry.0 += internal_inbound.get(page).copied().unwrap_or(0);
            entry.1 += 1;
        }

        let computed_at = Utc::now();
        let score_for = |subject: RankSubject, score: f64| RankScore {
            run_id,
            subject,
            score,
            iterations_used: result.iterations_used,
            converged: result.converged,
            host_aggregated: true,
            computed_at,
        };

        let mut scores: Vec<RankScore> = hosts
            .iter()
            .zip(&result.scores)
            .map(|(host, score)| score_for(RankSubject::Host(host.to_string()), *score))
            .collect();

        for (page, host) in &page_hosts {
            let host_score = host_index
                .get(host.as_str())
                .map(|&i| result.scores[i])
                .unwrap_or(0.0);
            let (total_inbound, page_count) =
                host_totals.get(host.as_str()).copied().unwrap_or((0, 1));
            // Hosts with no internal links split evenly
            let share = if total_inbound == 0 {
                1.0 / f64::from(page_count.max(1))
            } else {
                f64::from(internal_inbound.get(page).copied().unwrap_or(0))
                    / f64::from(total_inbound)
            };
            scores.push(score_for(RankSubject::Url(page.to_string()), host_score * share));
        }

        RankOutput {
            scores,
            iterations_used: result.iterations_used,
            converged: result.converged,
            host_aggregated: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LinkGraphBuilder;
    use crate::url::SiteScope;

    fn graph(links: &[(&str, &str)]) -> LinkGraph {
        let mut builder = LinkGraphBuilder::new(1, SiteScope::new(["ex.com"]));
        for (src, dst) in links {
            builder.observe(src, dst, Utc::now()).unwrap();
        }
        builder.build()
    }

    fn url_score(output: &RankOutput, url: &str) -> f64 {
        output
            .scores
            .iter()
            .find(|s| s.subject == RankSubject::Url(url.to_string()))
            .unwrap()
            .score
    }

    #[test]
    fn test_cycle_is_uniform() {
        let result = pagerank(3, &[(0, 1, 1.0), (1, 2, 1.0), (2, 0, 1.0)]);
        assert!(result.converged);
        for score in &result.scores {
            assert!((score - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_scores_sum_to_one_with_dangling_nodes() {
        let result = pagerank(4, &[(0, 1, 1.0), (0, 2, 1.0), (1, 2, 1.0), (3, 2, 1.0)]);
        let total: f64 = result.scores.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(result.converged);
        assert!(result.iterations_used < MAX_ITERATIONS);
        // Node 2 collects every link
        let best = result
            .scores
            .iter()
            .cloned()
            .fold(f64::MIN, f64::max);
        assert_eq!(best, result.scores[2]);
    }

    #[test]
    fn test_empty_graph() {
        let result = pagerank(0, &[]);
        assert!(result.scores.is_empty());
        assert!(result.converged);
    }

    #[test]
    fn test_page_level_ranks() {
        let graph = graph(&[
            ("https://ex.com/", "https://ex.com/a"),
            ("https://ex.com/b", "https://ex.com/a"),
            ("https://ex.com/a", "https://ex.com/"),
        ]);
        let output = RankComputer::new(100).compute(7, &graph);

        assert!(!output.host_aggregated);
        assert!(output.converged);
        assert_eq!(output.scores.len(), 3);
        assert!(url_score(&output, "https://ex.com/a") > url_score(&output, "https://ex.com/b"));
        assert!(output.scores.iter().all(|s| s.run_id == 7 && !s.host_aggregated));
    }

    #[test]
    fn test_host_aggregation_above_threshold() {
        let graph = graph(&[
            ("https://ex.com/", "https://ex.com/a"),
            ("https://ex.com/", "https://ex.com/b"),
            ("https://ex.com/b", "https://ex.com/a"),
            ("https://ex.com/a", "https://blog.ex.com/"),
            ("https://blog.ex.com/", "https://ex.com/"),
        ]);
        let output = RankComputer::new(2).compute(1, &graph);

        assert!(output.host_aggregated);
        assert!(output.scores.iter().all(|s| s.host_aggregated));

        let hosts: Vec<&RankScore> = output
            .scores
            .iter()
            .filter(|s| matches!(s.subject, RankSubject::Host(_)))
            .collect();
        assert_eq!(hosts.len(), 2);

        // ex.com internal inbound: /a twice, /b once, / never
        let ex_score = hosts
            .iter()
            .find(|s| s.subject == RankSubject::Host("ex.com".to_string()))
            .unwrap()
            .score;
        assert!((url_score(&output, "https://ex.com/a") - ex_score * 2.0 / 3.0).abs() < 1e-9);
        assert!((url_score(&output, "https://ex.com/b") - ex_score / 3.0).abs() < 1e-9);
        assert_eq!(url_score(&output, "https://ex.com/"), 0.0);

        // The only page of a host without internal links takes the host score
        let blog_score = hosts
            .iter()
            .find(|s| s.subject == RankSubject::Host("blog.ex.com".to_string()))
            .unwrap()
            .score;
        assert!((url_score(&output, "https://blog.ex.com/") - blog_score).abs() < 1e-9);
    }
}
