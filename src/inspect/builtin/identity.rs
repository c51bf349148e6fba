use std::sync::Arc;

use async_trait::async_trait;

use crate::cloud::{CloudSession, ResourceInventory};
use crate::error::{CheckerError, InspectorError};
use crate::inspect::{
    CheckInput, Checker, Finding, Inspector, ItemDefinition, RiskLevel, ServiceType,
};

const MAX_KEY_AGE_DAYS: u32 = 90;
const MIN_PASSWORD_LENGTH: u8 = 14;

/// Users, access keys and the account password policy.
pub struct IdentityInspector {
    checkers: Vec<Arc<dyn Checker>>,
}

impl IdentityInspector {
    pub fn new() -> Self {
        Self {
            checkers: vec![
                Arc::new(MfaChecker),
                Arc::new(AccessKeyRotationChecker),
                Arc::new(PasswordPolicyChecker),
            ],
        }
    }
}

impl Default for IdentityInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Inspector for IdentityInspector {
    fn service_type(&self) -> ServiceType {
        ServiceType::Identity
    }

    fn version(&self) -> &'static str {
        "1.0"
    }

    fn checkers(&self) -> &[Arc<dyn Checker>] {
        &self.checkers
    }

    async fn collect(&self, session: &dyn CloudSession) -> Result<ResourceInventory, InspectorError> {
        let collection = |source| InspectorError::Collection {
            service: ServiceType::Identity.to_string(),
            source,
        };
        let users = session.list_users().await.map_err(collection)?;
        let password_policy = session.password_policy().await.map_err(collection)?;
        Ok(ResourceInventory {
            users,
            password_policy,
            ..Default::default()
        })
    }
}

struct MfaChecker;

#[async_trait]
impl Checker for MfaChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: "mfa",
            title: "Console users without MFA",
            category: "authentication",
            default_risk: RiskLevel::High,
        }
    }

    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        Ok(input
            .inventory
            .users
            .iter()
            .filter(|user| user.console_access)
            .map(|user| {
                if user.mfa_enabled {
                    Finding::pass(&user.name, "user", "authentication", "MFA enabled")
                } else {
                    Finding::new(
                        &user.name,
                        "user",
                        RiskLevel::High,
                        format!("User '{}' can sign in to the console without MFA", user.name),
                        "Require an MFA device for every user with a console password.",
                        "authentication",
                    )
                }
            })
            .collect())
    }
}

struct AccessKeyRotationChecker;

#[async_trait]
impl Checker for AccessKeyRotationChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: "access_key_rotation",
            title: "Access key age",
            category: "credentials",
            default_risk: RiskLevel::Medium,
        }
    }

    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        let mut findings = Vec::new();
        for user in &input.inventory.users {
            for key in user.access_keys.iter().filter(|k| k.active) {
                findings.push(if key.age_days > MAX_KEY_AGE_DAYS {
                    Finding::new(
                        &key.id,
                        "access_key",
                        RiskLevel::Medium,
                        format!(
                            "Access key '{}' of user '{}' is {} days old",
                            key.id, user.name, key.age_days
                        ),
                        format!("Rotate access keys at least every {MAX_KEY_AGE_DAYS} days."),
                        "credentials",
                    )
                    .with_detail("user", user.name.as_str())
                    .with_detail("ageDays", key.age_days)
                } else {
                    Finding::pass(&key.id, "access_key", "credentials", "Key recently rotated")
                });
            }
        }
        Ok(findings)
    }
}

struct PasswordPolicyChecker;

#[async_trait]
impl Checker for PasswordPolicyChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: "password_policy",
            title: "Account password policy",
            category: "authentication",
            default_risk: RiskLevel::Medium,
        }
    }

    async fn run(&self, input: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        let Some(policy) = &input.inventory.password_policy else {
            return Ok(vec![Finding::new(
                "account",
                "password_policy",
                RiskLevel::Medium,
                "No account password policy is configured",
                format!("Configure a password policy with at least {MIN_PASSWORD_LENGTH} characters."),
                "authentication",
            )]);
        };

        let mut weaknesses = Vec::new();
        if policy.minimum_length < MIN_PASSWORD_LENGTH {
            weaknesses.push(format!("minimum length {}", policy.minimum_length));
        }
        if !policy.require_symbols {
            weaknesses.push("symbols not required".to_string());
        }
        if !policy.require_numbers {
            weaknesses.push("numbers not required".to_string());
        }

        if weaknesses.is_empty() {
            return Ok(vec![Finding::pass(
                "account",
                "password_policy",
                "authentication",
                "Password policy meets baseline",
            )]);
        }

        Ok(vec![Finding::new(
            "account",
            "password_policy",
            RiskLevel::Low,
            format!("Password policy is weak: {}", weaknesses.join(", ")),
            format!(
                "Require at least {MIN_PASSWORD_LENGTH} characters including symbols and numbers."
            ),
            "authentication",
        )])
    }
}
