use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{builtin, Inspector, ItemDefinition};
use crate::error::{AuditError, Result};

/// Services this engine knows how to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Storage,
    Compute,
    Identity,
}

impl ServiceType {
    pub const ALL: [ServiceType; 3] = [Self::Storage, Self::Compute, Self::Identity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Compute => "compute",
            Self::Identity => "identity",
        }
    }
}

impl FromStr for ServiceType {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "storage" | "s3" => Ok(Self::Storage),
            "compute" | "ec2" => Ok(Self::Compute),
            "identity" | "iam" => Ok(Self::Identity),
            _ => Err(AuditError::UnsupportedServiceType(s.to_string())),
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry for one registered inspector.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectorInfo {
    pub service_type: ServiceType,
    pub version: &'static str,
    pub items: Vec<ItemDefinition>,
}

/// Mapping from service type to inspector.
///
/// Built once at startup and shared immutably afterwards; registration
/// consumes the registry, so nothing can be added once it is behind an `Arc`.
#[derive(Clone, Default)]
pub struct InspectorRegistry {
    inspectors: BTreeMap<ServiceType, Arc<dyn Inspector>>,
}

impl std::fmt::Debug for InspectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InspectorRegistry")
            .field("services", &self.service_types())
            .finish()
    }
}

impl InspectorRegistry {
    /// Registry with every built-in inspector.
    pub fn builtin() -> Self {
        builtin::all_inspectors()
            .into_iter()
            .fold(Self::default(), Self::register)
    }

    /// Add an inspector, replacing any previous one for the same service.
    pub fn register(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.inspectors.insert(inspector.service_type(), inspector);
        self
    }

    pub fn get(&self, service: ServiceType) -> Result<Arc<dyn Inspector>> {
        self.inspectors
            .get(&service)
            .cloned()
            .ok_or_else(|| AuditError::UnsupportedServiceType(service.to_string()))
    }

    /// Look up by name, rejecting unknown names with a typed error.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Inspector>> {
        self.get(name.parse()?)
    }

    pub fn service_types(&self) -> Vec<ServiceType> {
        self.inspectors.keys().copied().collect()
    }

    pub fn catalog(&self) -> Vec<InspectorInfo> {
        self.inspectors
            .values()
            .map(|inspector| InspectorInfo {
                service_type: inspector.service_type(),
                version: inspector.version(),
                items: inspector.supported_items(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registers_every_service() {
        let registry = InspectorRegistry::builtin();
        assert_eq!(registry.service_types(), ServiceType::ALL.to_vec());
    }

    #[test]
    fn resolves_aliases() {
        let registry = InspectorRegistry::builtin();
        let inspector = registry.resolve("S3").unwrap();
        assert_eq!(inspector.service_type(), ServiceType::Storage);
    }

    #[test]
    fn unknown_service_is_typed_error() {
        let registry = InspectorRegistry::builtin();
        let err = registry.resolve("dns").err().unwrap();
        assert!(matches!(err, AuditError::UnsupportedServiceType(name) if name == "dns"));
    }

    #[test]
    fn empty_registry_rejects_known_service() {
        let registry = InspectorRegistry::default();
        assert!(matches!(
            registry.get(ServiceType::Compute),
            Err(AuditError::UnsupportedServiceType(_))
        ));
    }

    #[test]
    fn catalog_lists_items_in_order() {
        let catalog = InspectorRegistry::builtin().catalog();
        let storage = catalog
            .iter()
            .find(|info| info.service_type == ServiceType::Storage)
            .unwrap();
        let ids: Vec<_> = storage.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["public_access", "encryption", "versioning"]);
    }
}
