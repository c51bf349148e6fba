use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category used by synthetic findings that describe a failed check rather
/// than the audited resource.
pub const INSPECTION_ERROR_CATEGORY: &str = "inspection_error";

/// One discovered issue (or an explicit pass) on one resource.
///
/// `details` is an open bag whose keys are defined per category by the
/// checker that emits it. Only `resource_id` and `risk_level` are read by the
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub resource_id: String,
    pub resource_type: String,
    pub risk_level: RiskLevel,
    pub issue: String,
    pub recommendation: String,
    pub category: String,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Finding {
    pub fn new(
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
        risk_level: RiskLevel,
        issue: impl Into<String>,
        recommendation: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            risk_level,
            issue: issue.into(),
            recommendation: recommendation.into(),
            category: category.into(),
            details: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// A compliant resource.
    pub fn pass(
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
        category: impl Into<String>,
        note: impl Into<String>,
    ) -> Self {
        Self::new(
            resource_id,
            resource_type,
            RiskLevel::Pass,
            note,
            String::new(),
            category,
        )
    }

    /// Synthetic finding recording that `item` could not be evaluated.
    pub fn inspection_failure(service: &str, item: &str, message: &str) -> Self {
        Self::new(
            format!("{service}#{item}"),
            "inspection",
            RiskLevel::High,
            format!("Inspection of '{item}' failed: {message}"),
            format!("Verify the audit role can read {service} configuration, then re-run '{item}'."),
            INSPECTION_ERROR_CATEGORY,
        )
        .with_detail("item", item)
        .with_detail("synthetic", true)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_issue(&self) -> bool {
        self.risk_level != RiskLevel::Pass
    }

    pub fn is_synthetic(&self) -> bool {
        self.category == INSPECTION_ERROR_CATEGORY
    }

    /// Boundary validation of the fields the orchestrator relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.resource_id.trim().is_empty() {
            return Err(format!(
                "finding '{}' has an empty resource id",
                self.issue
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Pass,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_str_lenient(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pass" | "ok" => Some(Self::Pass),
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" | "crit" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Evaluation status of one inspected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pass,
    Fail,
    Warning,
    NotChecked,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Warning => write!(f, "WARNING"),
            Self::NotChecked => write!(f, "NOT_CHECKED"),
        }
    }
}

/// Static description of one inspectable item, used by `list-inspectors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ItemDefinition {
    pub id: &'static str,
    pub title: &'static str,
    pub category: &'static str,
    pub default_risk: RiskLevel,
}
