use std::sync::Arc;

use async_trait::async_trait;

use crate::cloud::{CloudSession, ResourceInventory};
use crate::error::{CheckerError, InspectorError};
use crate::inspect::{
    CheckInput, Checker, Finding, Inspector, ItemDefinition, RiskLevel, ServiceType,
};

/// Object storage buckets.
pub struct StorageInspector {
    checkers: Vec<Arc<dyn Checker>>,
}

impl StorageInspector {
    pub fn new() -> Self {
        Self {
            checkers: vec![
                Arc::new(PublicAccessChecker),
                Arc::new(EncryptionChecker),
                Arc::new(VersioningChecker),
            ],
        }
    }
}

impl Default for StorageInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Inspector for StorageInspector {
    fn service_type(&self) -> ServiceType {
        ServiceType::Storage
    }

    fn version(&self) -> &'static str {
        "1.0"
    }

    fn checkers(&self) -> &[Arc<dyn Checker>] {
        &self.checkers
    }

    async fn collect(&self, session: &dyn CloudSession) -> Result<ResourceInventory, InspectorError> {
        let buckets = session
            .list_buckets()
            .await
            .map_err(|source| InspectorError::Collection {
                service: ServiceType::Storage.to_string(),
                source,
            })?;
        Ok(ResourceInventory {
            buckets,
            ..Default::default()
        })
    }
}

/// Buckets readable by anonymous principals, via policy or a missing
/// public-access block.
struct PublicAccessChecker;

#[async_trait]
impl Checker for PublicAccessChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: "public_access",
            title: "Bucket public access",
            category: "access_control",
            default_risk: RiskLevel::Critical,
        }
    }

    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        let mut findings = Vec::new();

        for bucket in &input.inventory.buckets {
            let policy_public = input.session.bucket_policy_is_public(&bucket.name).await?;

            let finding = if policy_public {
                Finding::new(
                    &bucket.name,
                    "bucket",
                    RiskLevel::Critical,
                    format!("Bucket '{}' policy grants public access", bucket.name),
                    "Remove anonymous principals from the bucket policy and enable the public access block.",
                    "access_control",
                )
            } else if !bucket.public_access_blocked {
                Finding::new(
                    &bucket.name,
                    "bucket",
                    RiskLevel::Medium,
                    format!("Bucket '{}' has no public access block", bucket.name),
                    "Enable all four public access block settings on the bucket.",
                    "access_control",
                )
            } else {
                Finding::pass(&bucket.name, "bucket", "access_control", "Public access blocked")
            };
            findings.push(finding.with_detail("region", bucket.region.as_str()));
        }

        Ok(findings)
    }
}

struct EncryptionChecker;

#[async_trait]
impl Checker for EncryptionChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: "encryption",
            title: "Default bucket encryption",
            category: "data_protection",
            default_risk: RiskLevel::High,
        }
    }

    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        Ok(input
            .inventory
            .buckets
            .iter()
            .map(|bucket| match &bucket.encryption {
                Some(algorithm) => {
                    Finding::pass(&bucket.name, "bucket", "data_protection", "Encrypted at rest")
                        .with_detail("algorithm", algorithm.as_str())
                }
                None => Finding::new(
                    &bucket.name,
                    "bucket",
                    RiskLevel::High,
                    format!("Bucket '{}' has no default encryption", bucket.name),
                    "Enable default server-side encryption (SSE-S3 or SSE-KMS).",
                    "data_protection",
                ),
            })
            .collect())
    }
}

struct VersioningChecker;

#[async_trait]
impl Checker for VersioningChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: "versioning",
            title: "Bucket versioning",
            category: "resilience",
            default_risk: RiskLevel::Low,
        }
    }

    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        Ok(input
            .inventory
            .buckets
            .iter()
            .map(|bucket| {
                if bucket.versioning_enabled {
                    Finding::pass(&bucket.name, "bucket", "resilience", "Versioning enabled")
                } else {
                    Finding::new(
                        &bucket.name,
                        "bucket",
                        RiskLevel::Low,
                        format!("Bucket '{}' does not keep object versions", bucket.name),
                        "Enable versioning to recover from accidental deletes and overwrites.",
                        "resilience",
                    )
                }
            })
            .collect())
    }
}
