use std::sync::Arc;

use async_trait::async_trait;

use crate::cloud::{CloudSession, ResourceInventory};
use crate::error::{CheckerError, InspectorError};
use crate::inspect::{
    CheckInput, Checker, Finding, Inspector, ItemDefinition, RiskLevel, ServiceType,
};

/// Administrative ports that must never be reachable from the internet.
const SENSITIVE_PORTS: &[(u16, &str)] = &[
    (22, "SSH"),
    (3389, "RDP"),
    (3306, "MySQL"),
    (5432, "PostgreSQL"),
    (6379, "Redis"),
    (9200, "Elasticsearch"),
];

/// Virtual machines and their network exposure.
pub struct ComputeInspector {
    checkers: Vec<Arc<dyn Checker>>,
}

impl ComputeInspector {
    pub fn new() -> Self {
        Self {
            checkers: vec![
                Arc::new(OpenPortsChecker),
                Arc::new(MetadataServiceChecker),
                Arc::new(VolumeEncryptionChecker),
            ],
        }
    }
}

impl Default for ComputeInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Inspector for ComputeInspector {
    fn service_type(&self) -> ServiceType {
        ServiceType::Compute
    }

    fn version(&self) -> &'static str {
        "1.0"
    }

    fn checkers(&self) -> &[Arc<dyn Checker>] {
        &self.checkers
    }

    async fn collect(&self, session: &dyn CloudSession) -> Result<ResourceInventory, InspectorError> {
        let collection = |source| InspectorError::Collection {
            service: ServiceType::Compute.to_string(),
            source,
        };
        let instances = session.list_instances().await.map_err(collection)?;
        let security_groups = session.list_security_groups().await.map_err(collection)?;
        Ok(ResourceInventory {
            instances,
            security_groups,
            ..Default::default()
        })
    }
}

/// World-open ingress on administrative ports.
struct OpenPortsChecker;

#[async_trait]
impl Checker for OpenPortsChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: "open_ports",
            title: "Internet-exposed administrative ports",
            category: "network",
            default_risk: RiskLevel::Critical,
        }
    }

    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        let mut findings = Vec::new();

        for group in &input.inventory.security_groups {
            let exposed: Vec<&str> = SENSITIVE_PORTS
                .iter()
                .filter(|(port, _)| {
                    group
                        .ingress
                        .iter()
                        .any(|rule| rule.is_world_open() && rule.covers(*port))
                })
                .map(|(_, name)| *name)
                .collect();

            if exposed.is_empty() {
                findings.push(Finding::pass(
                    &group.id,
                    "security_group",
                    "network",
                    "No administrative ports open to the internet",
                ));
                continue;
            }

            let risk = if exposed.contains(&"SSH") || exposed.contains(&"RDP") {
                RiskLevel::Critical
            } else {
                RiskLevel::High
            };
            findings.push(
                Finding::new(
                    &group.id,
                    "security_group",
                    risk,
                    format!(
                        "Security group '{}' exposes {} to 0.0.0.0/0",
                        group.name,
                        exposed.join(", ")
                    ),
                    "Restrict ingress to known CIDR ranges or use a bastion/session manager.",
                    "network",
                )
                .with_detail("ports", exposed.join(",")),
            );
        }

        Ok(findings)
    }
}

struct MetadataServiceChecker;

#[async_trait]
impl Checker for MetadataServiceChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: "imds_v2",
            title: "Instance metadata service v2",
            category: "hardening",
            default_risk: RiskLevel::Medium,
        }
    }

    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        Ok(input
            .inventory
            .instances
            .iter()
            .map(|instance| {
                if instance.imds_v2_required {
                    Finding::pass(&instance.id, "instance", "hardening", "IMDSv2 enforced")
                } else {
                    // A public address makes SSRF-to-metadata credential theft reachable.
                    let risk = if instance.public_ip.is_some() {
                        RiskLevel::High
                    } else {
                        RiskLevel::Medium
                    };
                    Finding::new(
                        &instance.id,
                        "instance",
                        risk,
                        format!("Instance '{}' allows IMDSv1", instance.id),
                        "Set HttpTokens=required on the instance metadata options.",
                        "hardening",
                    )
                }
            })
            .collect())
    }
}

struct VolumeEncryptionChecker;

#[async_trait]
impl Checker for VolumeEncryptionChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: "volume_encryption",
            title: "Attached volume encryption",
            category: "data_protection",
            default_risk: RiskLevel::High,
        }
    }

    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        let mut findings = Vec::new();
        for instance in &input.inventory.instances {
            for volume in &instance.volumes {
                findings.push(if volume.encrypted {
                    Finding::pass(&volume.id, "volume", "data_protection", "Volume encrypted")
                } else {
                    Finding::new(
                        &volume.id,
                        "volume",
                        RiskLevel::High,
                        format!(
                            "Volume '{}' on instance '{}' is not encrypted",
                            volume.id, instance.id
                        ),
                        "Snapshot the volume, copy it with encryption enabled, and swap it in.",
                        "data_protection",
                    )
                    .with_detail("instance", instance.id.as_str())
                });
            }
        }
        Ok(findings)
    }
}
