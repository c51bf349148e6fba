use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::job::InspectionStatus;

pub type Result<T> = std::result::Result<T, AuditError>;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Inspector error: {0}")]
    Inspector(#[from] InspectorError),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Unsupported service type: {0}")]
    UnsupportedServiceType(String),

    #[error("Unknown item '{item}' for service {service}")]
    UnknownItem { service: String, item: String },

    #[error("Inspection not found: {0}")]
    InspectionNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid transition for inspection {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: InspectionStatus,
        to: InspectionStatus,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AuditError {
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Why a role could not be exchanged for session credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FederationErrorKind {
    /// The role identifier failed syntax validation; no remote call was made.
    Malformed,
    /// The trust relationship refused the exchange.
    Denied,
    /// Network or throttling failure; the only retryable class.
    Transient,
}

impl std::fmt::Display for FederationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed"),
            Self::Denied => write!(f, "denied"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} federation failure: {message}")]
pub struct FederationError {
    pub kind: FederationErrorKind,
    pub message: String,
}

impl FederationError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: FederationErrorKind::Malformed,
            message: message.into(),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            kind: FederationErrorKind::Denied,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FederationErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FederationErrorKind::Transient
    }
}

/// Failure of one cloud control-plane call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("{operation} failed: {message}")]
    Call { operation: String, message: String },

    #[error("{operation} was throttled")]
    Throttled { operation: String },

    #[error("access denied for {operation}")]
    AccessDenied { operation: String },
}

impl CloudError {
    pub fn call(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Call {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// A single checker failed. Never escapes the inspector boundary.
#[derive(Error, Debug, Clone)]
pub enum CheckerError {
    #[error("cloud call failed: {0}")]
    Cloud(#[from] CloudError),

    #[error("checker timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("checker panicked: {0}")]
    Panicked(String),

    #[error("invalid finding: {0}")]
    InvalidFinding(String),

    #[error("{0}")]
    Other(String),
}

/// A whole service's data collection failed. Never escapes the orchestrator.
#[derive(Error, Debug, Clone)]
pub enum InspectorError {
    #[error("data collection failed for {service}: {source}")]
    Collection {
        service: String,
        #[source]
        source: CloudError,
    },

    #[error("data collection for {service} timed out")]
    Timeout { service: String },
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("write failed for {key}: {message}")]
    Write { key: String, message: String },

    #[error("read failed for {key}: {message}")]
    Read { key: String, message: String },

    #[error("record {key} could not be decoded: {message}")]
    Decode { key: String, message: String },

    #[error("lock poisoned")]
    Poisoned,
}

/// Errors on the progress channel. Handshake errors refuse the connection;
/// all others are answered with an error frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("invalid credentials")]
    InvalidToken,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("missing inspectionId")]
    MissingInspectionId,

    #[error("invalid inspectionId: {0}")]
    InvalidInspectionId(String),

    #[error("inspection not found: {0}")]
    UnknownInspection(String),

    #[error("inspection {0} has already finished")]
    InspectionFinished(String),

    #[error("not subscribed to inspection {0}")]
    NotSubscribed(String),
}

impl ProtocolError {
    /// Stable machine-readable code carried in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidToken => "invalid_token",
            Self::Malformed(_) => "malformed_message",
            Self::UnknownType(_) => "unknown_message_type",
            Self::MissingInspectionId => "missing_inspection_id",
            Self::InvalidInspectionId(_) => "invalid_inspection_id",
            Self::UnknownInspection(_) => "unknown_inspection",
            Self::InspectionFinished(_) => "inspection_finished",
            Self::NotSubscribed(_) => "not_subscribed",
        }
    }
}
