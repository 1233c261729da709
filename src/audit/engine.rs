//! Rule evaluation
//!
//! The engine runs a selection of rules over page facts. A rule that
//! panics is isolated: its finding for that page is omitted, a rule error
//! is recorded and every other rule and page proceeds.

use crate::audit::rules::{rules_in, RuleCategory, RuleDef, RULES};
use crate::model::{Finding, PageFact, RuleErrorRecord};
use chrono::Utc;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// A single rule failing on a single page
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("rule {rule_id} failed on {url}: {message}")]
    Panicked {
        rule_id: String,
        url: String,
        message: String,
    },
}

impl RuleError {
    pub fn into_record(self, fact: &PageFact) -> RuleErrorRecord {
        match self {
            RuleError::Panicked {
                rule_id,
                url,
                message,
            } => RuleErrorRecord {
                run_id: fact.run_id,
                url,
                rule_id,
                message,
                recorded_at: Utc::now(),
            },
        }
    }
}

/// Findings and rule errors for a set of pages
#[derive(Debug, Default, Clone)]
pub struct Evaluation {
    pub findings: Vec<Finding>,
    pub errors: Vec<RuleErrorRecord>,
}

impl Evaluation {
    fn extend(&mut self, other: Evaluation) {
        self.findings.extend(other.findings);
        self.errors.extend(other.errors);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "rule panicked".to_string()
    }
}

/// Evaluates a fixed rule selection
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<&'static RuleDef>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// Engine with every rule in the catalogue
    pub fn new() -> Self {
        Self {
            rules: RULES.iter().collect(),
        }
    }

    pub fn with_categories(categories: &[RuleCategory]) -> Self {
        Self {
            rules: rules_in(categories),
        }
    }

    pub fn with_rules(rules: Vec<&'static RuleDef>) -> Self {
        Self { rules }
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.id).collect()
    }

    fn run_rule(rule: &RuleDef, fact: &PageFact) -> Result<Option<Finding>, RuleError> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (rule.check)(fact))).map_err(
            |payload| RuleError::Panicked {
                rule_id: rule.id.to_string(),
                url: fact.url.clone(),
                message: panic_message(payload.as_ref()),
            },
        )?;

        Ok(outcome.map(|outcome| Finding {
            run_id: fact.run_id,
            url: fact.url.clone(),
            rule_id: rule.id.to_string(),
            severity: outcome.severity,
            evidence: outcome.evidence,
            auto_fixable: rule.auto_fixable,
            detected_at: Utc::now(),
        }))
    }

    /// Evaluates every selected rule against one page
    pub fn evaluate(&self, fact: &PageFact) -> Evaluation {
        let mut evaluation = Evaluation::default();

        for rule in &self.rules {
            match Self::run_rule(rule, fact) {
                Ok(Some(finding)) => evaluation.findings.push(finding),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("{}", e);
                    evaluation.errors.push(e.into_record(fact));
                }
            }
        }

        evaluation
    }

    /// Evaluates every page of a run
    pub fn evaluate_all(&self, facts: &[PageFact]) -> Evaluation {
        let mut evaluation = Evaluation::default();
        for fact in facts {
            evaluation.extend(self.evaluate(fact));
        }
        tracing::debug!(
            "Evaluated {} rules over {} pages: {} findings, {} errors",
            self.rules.len(),
            facts.len(),
            evaluation.findings.len(),
            evaluation.errors.len()
        );
        evaluation
    }
}
