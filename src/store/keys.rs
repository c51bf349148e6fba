//! Sort-key scheme of the shared results table.
//!
//! Partition key is always the customer id. Sort keys:
//!
//! - `{service}#{item}#LATEST`: current status of one item
//! - `{service}#{item}#{inspectionId}`: one history entry per run
//! - `INSPECTION#{inspectionId}`: the job record

use crate::inspect::ServiceType;
use crate::orchestrator::job::InspectionId;

pub const LATEST_SUFFIX: &str = "LATEST";
pub const INSPECTION_PREFIX: &str = "INSPECTION#";

pub fn latest(service: ServiceType, item_id: &str) -> String {
    format!("{service}#{item_id}#{LATEST_SUFFIX}")
}

pub fn history(service: ServiceType, item_id: &str, inspection_id: InspectionId) -> String {
    format!("{service}#{item_id}#{inspection_id}")
}

/// Prefix shared by the LATEST and every HISTORY record of one item.
pub fn item_prefix(service: ServiceType, item_id: &str) -> String {
    format!("{service}#{item_id}#")
}

pub fn service_prefix(service: ServiceType) -> String {
    format!("{service}#")
}

pub fn inspection(inspection_id: InspectionId) -> String {
    format!("{INSPECTION_PREFIX}{inspection_id}")
}

pub fn is_latest(sort_key: &str) -> bool {
    sort_key.ends_with(&format!("#{LATEST_SUFFIX}"))
}
