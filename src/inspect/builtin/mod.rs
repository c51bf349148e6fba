mod compute;
mod identity;
mod storage;

use std::sync::Arc;

use super::Inspector;

pub use compute::ComputeInspector;
pub use identity::IdentityInspector;
pub use storage::StorageInspector;

/// Returns all built-in inspectors.
pub fn all_inspectors() -> Vec<Arc<dyn Inspector>> {
    vec![
        Arc::new(StorageInspector::new()),
        Arc::new(ComputeInspector::new()),
        Arc::new(IdentityInspector::new()),
    ]
}
