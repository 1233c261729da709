//! Run-over-run finding deltas
//!
//! Compares the findings of two runs per (url, rule_id). Timestamps and run
//! ids are ignored when deciding whether a finding is unchanged.

use crate::model::{DeltaRecord, DeltaStatus, Finding};
use std::collections::{BTreeMap, BTreeSet};

/// True when two findings for the same key carry the same content
fn same_content(previous: &Finding, current: &Finding) -> bool {
    previous.severity == current.severity
        && previous.evidence == current.evidence
        && previous.auto_fixable == current.auto_fixable
}

fn index(findings: &[Finding]) -> BTreeMap<(&str, &str), &Finding> {
    findings
        .iter()
        .map(|f| ((f.url.as_str(), f.rule_id.as_str()), f))
        .collect()
}

/// Classifies every (url, rule_id) key present in either run
///
/// # Arguments
///
/// * `previous` - Findings of the preceding completed run (empty for a first run)
/// * `current` - Findings of the current run
///
/// # Returns
///
/// One record per key, ordered by (url, rule_id)
pub fn classify(previous: &[Finding], current: &[Finding]) -> Vec<DeltaRecord> {
    let before = index(previous);
    let after = index(current);
    let keys: BTreeSet<(&str, &str)> = before.keys().chain(after.keys()).copied().collect();

    keys.into_iter()
        .map(|key @ (url, rule_id)| {
            let old = before.get(&key).copied();
            let new = after.get(&key).copied();
            let status = match (old, new) {
                (None, Some(_)) => DeltaStatus::Added,
                (Some(_), None) => DeltaStatus::Removed,
                (Some(a), Some(b)) if same_content(a, b) => DeltaStatus::Stable,
                _ => DeltaStatus::Changed,
            };
            DeltaRecord {
                url: url.to_string(),
                rule_id: rule_id.to_string(),
                status,
                previous_severity: old.map(|f| f.severity),
                current_severity: new.map(|f| f.severity),
            }
        })
        .collect()
}

/// Per-status totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub stable: usize,
}

pub fn summarize(deltas: &[DeltaRecord]) -> DeltaSummary {
    let mut summary = DeltaSummary::default();
    for delta in deltas {
        match delta.status {
            DeltaStatus::Added => summary.added += 1,
            DeltaStatus::Removed => summary.removed += 1,
            DeltaStatus::Changed => summary.changed += 1,
            DeltaStatus::Stable => summary.stable += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Evidence, Severity};
    use chrono::{Duration, Utc};

    fn finding(run_id: i64, url: &str, rule_id: &str, severity: Severity, observed: &str) -> Finding {
        Finding {
            run_id,
            url: url.to_string(),
            rule_id: rule_id.to_string(),
            severity,
            evidence: Evidence {
                field: "title".to_string(),
                observed: observed.to_string(),
                rationale: "r".to_string(),
                suggested_fix: None,
            },
            auto_fixable: false,
            detected_at: Utc::now(),
        }
    }

    fn status_of(deltas: &[DeltaRecord], url: &str) -> DeltaStatus {
        deltas.iter().find(|d| d.url == url).unwrap().status
    }

    #[test]
    fn test_all_four_statuses() {
        let previous = vec![
            finding(1, "https://ex.com/removed", "r", Severity::Low, ""),
            finding(1, "https://ex.com/changed", "r", Severity::Low, "a"),
            finding(1, "https://ex.com/stable", "r", Severity::High, "x"),
        ];
        let current = vec![
            finding(2, "https://ex.com/added", "r", Severity::Low, ""),
            finding(2, "https://ex.com/changed", "r", Severity::Medium, "a"),
            finding(2, "https://ex.com/stable", "r", Severity::High, "x"),
        ];

        let deltas = classify(&previous, &current);
        assert_eq!(deltas.len(), 4);
        assert_eq!(status_of(&deltas, "https://ex.com/added"), DeltaStatus::Added);
        assert_eq!(status_of(&deltas, "https://ex.com/removed"), DeltaStatus::Removed);
        assert_eq!(status_of(&deltas, "https://ex.com/changed"), DeltaStatus::Changed);
        assert_eq!(status_of(&deltas, "https://ex.com/stable"), DeltaStatus::Stable);

        let changed = deltas.iter().find(|d| d.status == DeltaStatus::Changed).unwrap();
        assert_eq!(changed.previous_severity, Some(Severity::Low));
        assert_eq!(changed.current_severity, Some(Severity::Medium));
    }

    #[test]
    fn test_evidence_change_is_changed() {
        let previous = vec![finding(1, "https://ex.com/", "r", Severity::Low, "old title")];
        let current = vec![finding(2, "https://ex.com/", "r", Severity::Low, "new title")];
        assert_eq!(classify(&previous, &current)[0].status, DeltaStatus::Changed);
    }

    #[test]
    fn test_timestamps_never_change_the_label() {
        let previous = vec![finding(1, "https://ex.com/", "r", Severity::Low, "x")];
        let mut current = previous.clone();
        current[0].run_id = 2;
        current[0].detected_at = current[0].detected_at + Duration::days(30);

        let deltas = classify(&previous, &current);
        assert_eq!(deltas[0].status, DeltaStatus::Stable);
    }

    #[test]
    fn test_first_run_is_all_added() {
        let current = vec![
            finding(1, "https://ex.com/", "a", Severity::Low, ""),
            finding(1, "https://ex.com/", "b", Severity::Low, ""),
        ];
        let summary = summarize(&classify(&[], &current));
        assert_eq!(summary.added, 2);
        assert_eq!(summary.removed + summary.changed + summary.stable, 0);
    }
}
