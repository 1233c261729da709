//! Audit rules, evaluation and run-over-run deltas
//!
//! This module handles:
//! - The static rule catalogue, selectable by category
//! - Evaluating rules over page facts with per-rule failure isolation
//! - Classifying findings against the preceding completed run

mod delta;
mod engine;
mod rules;

pub use delta::{classify, summarize, DeltaSummary};
pub use engine::{Evaluation, RuleEngine, RuleError};
pub use rules::{rule_by_id, rules_in, RuleCategory, RuleCheck, RuleDef, RuleOutcome, RULES};
