//! Cloud provider surface consumed by inspectors.
//!
//! The control-plane calls themselves live behind [`CloudSession`]; this crate
//! only orchestrates them. A session is opened per inspection from federated
//! credentials through a [`CloudConnector`].

pub mod inventory;
pub mod snapshot;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CloudError;
use crate::federation::Credential;

pub use inventory::{
    AccessKey, Bucket, IamUser, IngressRule, Instance, PasswordPolicy, ResourceInventory,
    SecurityGroup, Volume,
};

/// Read-only view of one customer account, authenticated with session credentials.
#[async_trait]
pub trait CloudSession: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<Bucket>, CloudError>;

    /// Whether the bucket policy grants access to anonymous principals.
    async fn bucket_policy_is_public(&self, bucket: &str) -> Result<bool, CloudError>;

    async fn list_instances(&self) -> Result<Vec<Instance>, CloudError>;

    async fn list_security_groups(&self) -> Result<Vec<SecurityGroup>, CloudError>;

    async fn list_users(&self) -> Result<Vec<IamUser>, CloudError>;

    async fn password_policy(&self) -> Result<Option<PasswordPolicy>, CloudError>;
}

/// Opens a [`CloudSession`] from federated credentials.
pub trait CloudConnector: Send + Sync {
    fn connect(&self, credential: &Credential) -> Result<Arc<dyn CloudSession>, CloudError>;
}
