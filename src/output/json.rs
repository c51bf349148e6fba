use crate::error::Result;
use crate::orchestrator::Inspection;

/// Render an inspection as a JSON report.
pub fn render(inspection: &Inspection) -> Result<String> {
    let json = serde_json::to_string_pretty(inspection)?;
    Ok(json)
}
