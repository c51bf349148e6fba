use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{Finding, ItemStatus, RiskLevel};

/// Score deducted per issue of a given risk level.
fn penalty(risk: RiskLevel) -> u32 {
    match risk {
        RiskLevel::Pass => 0,
        RiskLevel::Low => 5,
        RiskLevel::Medium => 10,
        RiskLevel::High => 25,
        RiskLevel::Critical => 40,
    }
}

/// Aggregate verdict for one item, folded from its findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemVerdict {
    pub status: ItemStatus,
    pub total_resources: usize,
    pub issues_found: usize,
    pub risk_level: RiskLevel,
    pub score: u8,
    pub recommendations: Vec<String>,
}

/// Fold the findings of an item whose checker ran to completion.
///
/// Any HIGH or CRITICAL issue fails the item; lesser issues only warn.
pub fn evaluate(findings: &[Finding]) -> ItemVerdict {
    let issues: Vec<&Finding> = findings.iter().filter(|f| f.is_issue()).collect();

    let risk_level = issues
        .iter()
        .map(|f| f.risk_level)
        .max()
        .unwrap_or(RiskLevel::Pass);

    let status = if issues.is_empty() {
        ItemStatus::Pass
    } else if risk_level >= RiskLevel::High {
        ItemStatus::Fail
    } else {
        ItemStatus::Warning
    };

    let deducted: u32 = issues.iter().map(|f| penalty(f.risk_level)).sum();
    let score = 100_u32.saturating_sub(deducted) as u8;

    ItemVerdict {
        status,
        total_resources: distinct_resources(findings),
        issues_found: issues.len(),
        risk_level,
        score,
        recommendations: recommendations(&issues),
    }
}

/// Verdict for an item that could not be evaluated. A synthetic failure
/// finding, if present, still contributes its risk level and remediation.
pub fn not_checked(findings: &[Finding]) -> ItemVerdict {
    let issues: Vec<&Finding> = findings.iter().filter(|f| f.is_issue()).collect();
    ItemVerdict {
        status: ItemStatus::NotChecked,
        total_resources: distinct_resources(findings),
        issues_found: issues.len(),
        risk_level: issues
            .iter()
            .map(|f| f.risk_level)
            .max()
            .unwrap_or(RiskLevel::Pass),
        score: 0,
        recommendations: recommendations(&issues),
    }
}

fn distinct_resources(findings: &[Finding]) -> usize {
    findings
        .iter()
        .filter(|f| !f.is_synthetic())
        .map(|f| f.resource_id.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

fn recommendations(issues: &[&Finding]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for finding in issues {
        if !finding.recommendation.is_empty() && seen.insert(finding.recommendation.clone()) {
            out.push(finding.recommendation.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_finding(resource: &str, risk: RiskLevel) -> Finding {
        Finding::new(resource, "bucket", risk, "issue", "fix it", "test")
    }

    #[test]
    fn all_pass_scores_full() {
        let verdict = evaluate(&[
            Finding::pass("a", "bucket", "test", "ok"),
            Finding::pass("b", "bucket", "test", "ok"),
        ]);
        assert_eq!(verdict.status, ItemStatus::Pass);
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.total_resources, 2);
        assert_eq!(verdict.issues_found, 0);
        assert!(verdict.recommendations.is_empty());
    }

    #[test]
    fn no_resources_passes() {
        let verdict = evaluate(&[]);
        assert_eq!(verdict.status, ItemStatus::Pass);
        assert_eq!(verdict.total_resources, 0);
    }

    #[test]
    fn medium_issue_warns() {
        let verdict = evaluate(&[
            make_finding("a", RiskLevel::Medium),
            Finding::pass("b", "bucket", "test", "ok"),
        ]);
        assert_eq!(verdict.status, ItemStatus::Warning);
        assert_eq!(verdict.risk_level, RiskLevel::Medium);
        assert_eq!(verdict.score, 90);
        assert_eq!(verdict.issues_found, 1);
    }

    #[test]
    fn high_issue_fails_and_dedupes_recommendations() {
        let verdict = evaluate(&[
            make_finding("a", RiskLevel::High),
            make_finding("b", RiskLevel::Critical),
            make_finding("c", RiskLevel::Critical),
        ]);
        assert_eq!(verdict.status, ItemStatus::Fail);
        assert_eq!(verdict.risk_level, RiskLevel::Critical);
        assert_eq!(verdict.score, 0);
        assert_eq!(verdict.recommendations, vec!["fix it".to_string()]);
    }

    #[test]
    fn not_checked_keeps_synthetic_risk() {
        let verdict = not_checked(&[Finding::inspection_failure("storage", "x", "boom")]);
        assert_eq!(verdict.status, ItemStatus::NotChecked);
        assert_eq!(verdict.risk_level, RiskLevel::High);
        assert_eq!(verdict.total_resources, 0);
        assert_eq!(verdict.issues_found, 1);
    }
}
