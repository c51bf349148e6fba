use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuditError, FederationError, Result};
use crate::inspect::ServiceType;
use crate::store::InspectionItemResult;

/// Identifier of one inspection job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InspectionId(Uuid);

impl InspectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InspectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InspectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InspectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Job lifecycle.
///
/// ```text
/// PENDING ──► IN_PROGRESS ──► COMPLETED | PARTIAL | FAILED
///    │                                               ▲
///    └───────────────────────────────────────────────┘
/// ```
///
/// PENDING may fail directly when federation fails. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InspectionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Partial,
}

impl InspectionStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Partial)
    }

    pub const fn can_transition_to(&self, next: InspectionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Failed)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Partial)
                | (Self::InProgress, Self::Failed)
        )
    }
}

impl std::fmt::Display for InspectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Partial => write!(f, "PARTIAL"),
        }
    }
}

/// Which services an inspection covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ServiceScope {
    All,
    Only(ServiceType),
}

impl FromStr for ServiceScope {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            s.parse().map(Self::Only)
        }
    }
}

impl TryFrom<String> for ServiceScope {
    type Error = AuditError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ServiceScope> for String {
    fn from(scope: ServiceScope) -> Self {
        scope.to_string()
    }
}

impl std::fmt::Display for ServiceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Only(service) => write!(f, "{service}"),
        }
    }
}

/// Where in the pipeline an item was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Federation,
    Collection,
    Check,
    Cancelled,
    Expired,
    Commit,
    /// The job task itself died.
    Aborted,
}

impl std::fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Federation => write!(f, "federation"),
            Self::Collection => write!(f, "collection"),
            Self::Check => write!(f, "check"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
            Self::Commit => write!(f, "commit"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// One entry of the error manifest: enough to retry just the failed subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub service_type: Option<ServiceType>,
    pub item_id: Option<String>,
    pub phase: FailurePhase,
    pub message: String,
}

/// Cheap polling view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub status: InspectionStatus,
    pub progress_percent: u8,
    pub current_step: String,
}

/// An inspection job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inspection {
    pub inspection_id: InspectionId,
    pub customer_id: String,
    pub service_type: ServiceScope,
    pub role_identifier: String,
    pub status: InspectionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub selected_items: BTreeSet<String>,
    pub progress_percent: u8,
    pub current_step: String,
    #[serde(default)]
    pub resource_counts: BTreeMap<String, usize>,
    #[serde(default)]
    pub results: Vec<InspectionItemResult>,
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
    pub federation_error: Option<FederationError>,
}

impl Inspection {
    pub fn new(
        customer_id: impl Into<String>,
        service_type: ServiceScope,
        role_identifier: impl Into<String>,
        selected_items: BTreeSet<String>,
    ) -> Self {
        Self {
            inspection_id: InspectionId::new(),
            customer_id: customer_id.into(),
            service_type,
            role_identifier: role_identifier.into(),
            status: InspectionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            selected_items,
            progress_percent: 0,
            current_step: "queued".into(),
            resource_counts: BTreeMap::new(),
            results: Vec::new(),
            failures: Vec::new(),
            federation_error: None,
        }
    }

    /// Move to `next`, stamping the end time on terminal states.
    pub fn transition(&mut self, next: InspectionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AuditError::InvalidTransition {
                id: self.inspection_id.to_string(),
                from: self.status,
                to: next,
            });
        }
        tracing::info!(
            inspection_id = %self.inspection_id,
            from = %self.status,
            to = %next,
            "inspection transition"
        );
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Record progress. Percent never decreases and terminal jobs are frozen.
    /// Returns whether the percent strictly increased.
    pub fn advance(&mut self, percent: u8, step: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let percent = percent.min(100);
        self.current_step = step.into();
        if percent > self.progress_percent {
            self.progress_percent = percent;
            true
        } else {
            false
        }
    }

    pub fn status_view(&self) -> StatusView {
        StatusView {
            status: self.status,
            progress_percent: self.progress_percent,
            current_step: self.current_step.clone(),
        }
    }
}
