//! Link graph and ranking
//!
//! This module handles:
//! - Filtering candidate links down to same-domain, non-self edges
//! - Inbound/outbound degrees and orphan detection
//! - PageRank, with a host-level fallback for large graphs

mod builder;
mod rank;

pub use builder::{EdgeRejection, LinkGraph, LinkGraphBuilder};
pub use rank::{pagerank, PageRank, RankComputer, RankOutput, DAMPING, MAX_ITERATIONS, TOLERANCE};
