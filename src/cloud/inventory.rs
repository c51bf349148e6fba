use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw resource inventory collected by one inspector before its checkers run.
///
/// Each inspector fills only the surfaces it owns; the rest stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceInventory {
    pub buckets: Vec<Bucket>,
    pub instances: Vec<Instance>,
    pub security_groups: Vec<SecurityGroup>,
    pub users: Vec<IamUser>,
    pub password_policy: Option<PasswordPolicy>,
}

impl ResourceInventory {
    /// Number of collected resources per resource type.
    pub fn resource_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        let mut add = |kind: &str, n: usize| {
            if n > 0 {
                counts.insert(kind.to_string(), n);
            }
        };
        add("bucket", self.buckets.len());
        add("instance", self.instances.len());
        add("security_group", self.security_groups.len());
        add("user", self.users.len());
        add("password_policy", usize::from(self.password_policy.is_some()));
        counts
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Bucket {
    pub name: String,
    pub region: String,
    /// All four public-access-block flags enabled.
    pub public_access_blocked: bool,
    /// Server-side encryption algorithm, if default encryption is configured.
    pub encryption: Option<String>,
    pub versioning_enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    pub id: String,
    pub region: String,
    pub public_ip: Option<String>,
    /// Instance metadata service requires session tokens (IMDSv2).
    pub imds_v2_required: bool,
    pub volumes: Vec<Volume>,
    pub security_group_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    pub id: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressRule {
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: String,
}

impl IngressRule {
    pub fn is_world_open(&self) -> bool {
        self.cidr == "0.0.0.0/0" || self.cidr == "::/0"
    }

    pub fn covers(&self, port: u16) -> bool {
        self.from_port <= port && port <= self.to_port
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IamUser {
    pub name: String,
    pub console_access: bool,
    pub mfa_enabled: bool,
    pub access_keys: Vec<AccessKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessKey {
    pub id: String,
    pub active: bool,
    pub age_days: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    pub minimum_length: u8,
    pub require_symbols: bool,
    pub require_numbers: bool,
    pub max_age_days: Option<u32>,
}
