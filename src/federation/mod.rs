//! Credential federation: exchange a customer role for short-lived session
//! credentials scoped to one inspection.
//!
//! Role identifiers are validated locally before any broker call. Only
//! transient broker failures are retried, with capped exponential backoff.

pub mod role;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FederationError;

pub use role::RoleIdentifier;

/// Upper bound on the session lifetime requested for one inspection pass.
pub const MAX_SESSION_DURATION: Duration = Duration::from_secs(3600);

/// Short-lived session credentials. Never persisted, never logged.
#[derive(Clone)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiry: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Caller-side context for one federation attempt.
#[derive(Debug, Clone)]
pub struct FederationContext {
    /// Used as the remote session name so the customer's audit trail can
    /// attribute calls to one inspection.
    pub session_name: String,
    pub external_id: Option<String>,
}

/// Fully-formed exchange request handed to the broker.
#[derive(Debug, Clone)]
pub struct FederationRequest {
    pub role: RoleIdentifier,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration: Duration,
}

/// The remote trust-exchange call.
#[async_trait]
pub trait TrustBroker: Send + Sync {
    async fn assume_role(&self, request: &FederationRequest) -> Result<Credential, FederationError>;
}

/// Bounded exponential backoff for transient federation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on one broker call; expiry counts as a transient failure.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based attempt that just failed).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = 2_u32.saturating_pow(exponent);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

pub struct CredentialFederator {
    broker: std::sync::Arc<dyn TrustBroker>,
    retry: RetryPolicy,
    session_duration: Duration,
}

impl std::fmt::Debug for CredentialFederator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialFederator")
            .field("retry", &self.retry)
            .field("session_duration", &self.session_duration)
            .finish_non_exhaustive()
    }
}

impl CredentialFederator {
    pub fn new(
        broker: std::sync::Arc<dyn TrustBroker>,
        retry: RetryPolicy,
        session_duration: Duration,
    ) -> Self {
        Self {
            broker,
            retry,
            session_duration: session_duration.min(MAX_SESSION_DURATION),
        }
    }

    /// Exchange `role_identifier` for session credentials.
    ///
    /// Malformed identifiers fail before any broker call. A credential that is
    /// already expired when issued counts as a transient failure.
    pub async fn federate(
        &self,
        role_identifier: &str,
        context: &FederationContext,
    ) -> Result<Credential, FederationError> {
        let role: RoleIdentifier = role_identifier.parse()?;
        let request = FederationRequest {
            role,
            session_name: context.session_name.clone(),
            external_id: context.external_id.clone(),
            duration: self.session_duration,
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::time::timeout(
                self.retry.attempt_timeout,
                self.broker.assume_role(&request),
            )
            .await
            .unwrap_or_else(|_| {
                Err(FederationError::transient(format!(
                    "trust exchange timed out after {:?}",
                    self.retry.attempt_timeout
                )))
            })
            .and_then(|credential| {
                if credential.is_expired() {
                    Err(FederationError::transient(
                        "issued credential was already expired",
                    ))
                } else {
                    Ok(credential)
                }
            });

            match result {
                Ok(credential) => {
                    tracing::debug!(
                        account = %request.role.account_id,
                        attempt,
                        expiry = %credential.expiry,
                        "federated into customer account"
                    );
                    return Ok(credential);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.backoff_for(attempt);
                    tracing::warn!(
                        account = %request.role.account_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient federation failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        account = %request.role.account_id,
                        attempt,
                        error = %e,
                        "federation failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Broker issuing synthetic credentials without a network call, for offline
/// runs against an inventory snapshot.
#[derive(Debug, Clone)]
pub struct StaticTrustBroker {
    lifetime: chrono::Duration,
}

impl StaticTrustBroker {
    pub fn new(lifetime: chrono::Duration) -> Self {
        Self { lifetime }
    }
}

#[async_trait]
impl TrustBroker for StaticTrustBroker {
    async fn assume_role(&self, request: &FederationRequest) -> Result<Credential, FederationError> {
        let requested = chrono::Duration::from_std(request.duration)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let lifetime = requested.min(self.lifetime);
        Ok(Credential {
            access_key_id: format!("ASIA{}", request.role.account_id),
            secret_access_key: uuid::Uuid::new_v4().simple().to_string(),
            session_token: uuid::Uuid::new_v4().simple().to_string(),
            expiry: Utc::now() + lifetime,
        })
    }
}
