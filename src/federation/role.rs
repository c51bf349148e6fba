use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FederationError;

/// Longest role name, path included, accepted by the identity service.
const MAX_ROLE_NAME_LEN: usize = 512;

static ROLE_ARN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^arn:(?P<partition>aws|aws-cn|aws-us-gov):iam::(?P<account>[0-9]{12}):role/(?P<name>[A-Za-z0-9_+=,.@/-]+)$",
    )
    .expect("role ARN pattern is valid")
});

/// A customer role that trusts this service, parsed from its ARN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleIdentifier {
    pub partition: String,
    pub account_id: String,
    /// Role name including any path prefix.
    pub role_name: String,
}

impl FromStr for RoleIdentifier {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = ROLE_ARN
            .captures(s.trim())
            .ok_or_else(|| FederationError::malformed(format!("'{s}' is not a role ARN")))?;
        let role_name = caps["name"].to_string();
        if role_name.len() > MAX_ROLE_NAME_LEN {
            return Err(FederationError::malformed(format!(
                "role name exceeds {MAX_ROLE_NAME_LEN} characters"
            )));
        }
        if role_name.starts_with('/') || role_name.ends_with('/') || role_name.contains("//") {
            return Err(FederationError::malformed(format!(
                "'{s}' has an invalid role path"
            )));
        }
        Ok(Self {
            partition: caps["partition"].to_string(),
            account_id: caps["account"].to_string(),
            role_name,
        })
    }
}

impl std::fmt::Display for RoleIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "arn:{}:iam::{}:role/{}",
            self.partition, self.account_id, self.role_name
        )
    }
}
