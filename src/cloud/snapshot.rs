use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    Bucket, CloudConnector, CloudSession, IamUser, Instance, PasswordPolicy, SecurityGroup,
};
use crate::error::{CloudError, Result};
use crate::federation::Credential;

/// Offline account inventory, loaded from a JSON export.
///
/// Lets the whole pipeline run without network access: federation is served
/// by a static broker and every session reads from this snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventorySnapshot {
    pub buckets: Vec<Bucket>,
    /// Buckets whose policy grants anonymous access.
    pub public_bucket_policies: BTreeSet<String>,
    pub instances: Vec<Instance>,
    pub security_groups: Vec<SecurityGroup>,
    pub users: Vec<IamUser>,
    pub password_policy: Option<PasswordPolicy>,
}

impl InventorySnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot = serde_json::from_str(&content)?;
        Ok(snapshot)
    }
}

/// Connector handing out sessions over a shared snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotConnector {
    snapshot: Arc<InventorySnapshot>,
}

impl SnapshotConnector {
    pub fn new(snapshot: InventorySnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
        }
    }
}

impl CloudConnector for SnapshotConnector {
    fn connect(&self, credential: &Credential) -> std::result::Result<Arc<dyn CloudSession>, CloudError> {
        if credential.access_key_id.is_empty() {
            return Err(CloudError::AccessDenied {
                operation: "connect".into(),
            });
        }
        Ok(Arc::new(SnapshotSession {
            snapshot: Arc::clone(&self.snapshot),
        }))
    }
}

struct SnapshotSession {
    snapshot: Arc<InventorySnapshot>,
}

#[async_trait]
impl CloudSession for SnapshotSession {
    async fn list_buckets(&self) -> std::result::Result<Vec<Bucket>, CloudError> {
        Ok(self.snapshot.buckets.clone())
    }

    async fn bucket_policy_is_public(&self, bucket: &str) -> std::result::Result<bool, CloudError> {
        Ok(self.snapshot.public_bucket_policies.contains(bucket))
    }

    async fn list_instances(&self) -> std::result::Result<Vec<Instance>, CloudError> {
        Ok(self.snapshot.instances.clone())
    }

    async fn list_security_groups(&self) -> std::result::Result<Vec<SecurityGroup>, CloudError> {
        Ok(self.snapshot.security_groups.clone())
    }

    async fn list_users(&self) -> std::result::Result<Vec<IamUser>, CloudError> {
        Ok(self.snapshot.users.clone())
    }

    async fn password_policy(&self) -> std::result::Result<Option<PasswordPolicy>, CloudError> {
        Ok(self.snapshot.password_policy.clone())
    }
}
