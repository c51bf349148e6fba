pub mod builtin;
pub mod finding;
pub mod registry;
pub mod runner;
pub mod scoring;

use std::sync::Arc;

use async_trait::async_trait;

use crate::cloud::{CloudSession, ResourceInventory};
use crate::error::{CheckerError, InspectorError};

pub use finding::{Finding, ItemDefinition, ItemStatus, RiskLevel};
pub use registry::{InspectorRegistry, ServiceType};

/// Everything a checker may look at: the inspector's collected inventory and
/// the live session for follow-up calls.
pub struct CheckInput {
    pub inventory: ResourceInventory,
    pub session: Arc<dyn CloudSession>,
}

/// A checker evaluates one configuration concern and produces findings.
///
/// Checkers hold no state between runs. Each run returns its own findings;
/// nothing is accumulated on the checker itself, so several may run at once.
#[async_trait]
pub trait Checker: Send + Sync {
    /// The item this checker evaluates.
    fn item(&self) -> ItemDefinition;

    /// Evaluate the item against the collected inventory.
    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError>;
}

/// Coordinator for all checkers of one service.
#[async_trait]
pub trait Inspector: Send + Sync {
    fn service_type(&self) -> ServiceType;

    fn version(&self) -> &'static str;

    /// Checkers in their canonical run order.
    fn checkers(&self) -> &[Arc<dyn Checker>];

    /// Collect the raw inventory the checkers evaluate.
    async fn collect(&self, session: &dyn CloudSession) -> Result<ResourceInventory, InspectorError>;

    fn supported_items(&self) -> Vec<ItemDefinition> {
        self.checkers().iter().map(|c| c.item()).collect()
    }

    fn checker(&self, item_id: &str) -> Option<Arc<dyn Checker>> {
        self.checkers()
            .iter()
            .find(|c| c.item().id == item_id)
            .cloned()
    }
}
