//! cloudaudit: inspection orchestration for cloud accounts.
//!
//! Federates into a customer account, runs per-service inspectors with
//! per-checker fault isolation, tracks each job through
//! `PENDING → IN_PROGRESS → COMPLETED | PARTIAL | FAILED`, keeps a LATEST and
//! a HISTORY view of every item in one key-value table, and streams progress
//! to subscribers.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudaudit::cloud::snapshot::{InventorySnapshot, SnapshotConnector};
//! use cloudaudit::config::Config;
//! use cloudaudit::federation::StaticTrustBroker;
//! use cloudaudit::orchestrator::{InspectionService, StartRequest};
//! use cloudaudit::store::memory::InMemoryTable;
//!
//! # async fn run() -> cloudaudit::error::Result<()> {
//! let service = InspectionService::from_config(
//!     &Config::default(),
//!     Arc::new(StaticTrustBroker::new(chrono::Duration::hours(1))),
//!     Arc::new(SnapshotConnector::new(InventorySnapshot::default())),
//!     Arc::new(InMemoryTable::new()),
//! );
//! let id = service
//!     .start(
//!         "acme",
//!         StartRequest {
//!             service_type: "storage".into(),
//!             role_identifier: "arn:aws:iam::123456789012:role/Audit".into(),
//!             selected_items: vec![],
//!         },
//!     )
//!     .await?;
//! let inspection = service.wait(id).await?;
//! println!("{}: {}", inspection.inspection_id, inspection.status);
//! # Ok(())
//! # }
//! ```

pub mod cloud;
pub mod config;
pub mod error;
pub mod federation;
pub mod inspect;
pub mod orchestrator;
pub mod output;
pub mod progress;
pub mod store;

use error::Result;
use orchestrator::Inspection;
use output::OutputFormat;

pub use orchestrator::{InspectionService, InspectionStatus, StartRequest};

/// Render a finished inspection in the specified format.
pub fn render_report(inspection: &Inspection, format: OutputFormat) -> Result<String> {
    output::render(inspection, format)
}
