use crate::inspect::{Finding, ItemStatus, RiskLevel};
use crate::orchestrator::Inspection;

fn risk_tag(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Critical => "[CRITICAL]",
        RiskLevel::High => "[HIGH]    ",
        RiskLevel::Medium => "[MEDIUM]  ",
        RiskLevel::Low => "[LOW]     ",
        RiskLevel::Pass => "[PASS]    ",
    }
}

/// Render an inspection as plain console output: one block per item, issues
/// sorted by risk (critical first), then the error manifest.
pub fn render(inspection: &Inspection) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "\n  Inspection {} ({}, {})\n",
        inspection.inspection_id, inspection.customer_id, inspection.service_type
    ));
    output.push_str(&format!(
        "  Status: {}  progress {}%\n\n",
        inspection.status, inspection.progress_percent
    ));

    if inspection.results.is_empty() {
        output.push_str("  No items were evaluated.\n\n");
    }

    for result in &inspection.results {
        output.push_str(&format!(
            "  {}/{}: {} (score {}, {} issue(s) across {} resource(s))\n",
            result.service_type,
            result.item_id,
            result.status,
            result.score,
            result.issues_found,
            result.total_resources
        ));

        let mut issues: Vec<&Finding> = result.findings.iter().filter(|f| f.is_issue()).collect();
        issues.sort_by(|a, b| {
            b.risk_level
                .cmp(&a.risk_level)
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        for finding in issues {
            output.push_str(&format!(
                "    {} {} {}\n",
                risk_tag(finding.risk_level),
                finding.resource_id,
                finding.issue
            ));
            output.push_str(&format!("               fix: {}\n", finding.recommendation));
        }
        if result.status == ItemStatus::NotChecked && result.findings.is_empty() {
            output.push_str("    not checked\n");
        }
        output.push('\n');
    }

    if !inspection.failures.is_empty() {
        output.push_str(&format!("  {} failure(s):\n", inspection.failures.len()));
        for failure in &inspection.failures {
            let target = match (&failure.service_type, &failure.item_id) {
                (Some(service), Some(item)) => format!("{service}/{item}"),
                (Some(service), None) => service.to_string(),
                _ => "-".to_string(),
            };
            output.push_str(&format!(
                "    [{}] {}: {}\n",
                failure.phase, target, failure.message
            ));
        }
        output.push('\n');
    }

    output
}
