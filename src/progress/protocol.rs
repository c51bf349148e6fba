//! Wire protocol of the progress channel.
//!
//! Client frames: `{"type": "subscribe_inspection" | "unsubscribe_inspection",
//! "payload": {"inspectionId": ...}}`. Server frames carry `type` and `data`.
//! A bad frame is answered with an `error` frame; the connection stays open.
//! Authentication happens once, when the channel is opened.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ProgressBroadcaster, ProgressEvent, Subscription, SubscriptionHandle};
use crate::error::ProtocolError;
use crate::orchestrator::job::{InspectionId, InspectionStatus};

pub const SUBSCRIBE: &str = "subscribe_inspection";
pub const UNSUBSCRIBE: &str = "unsubscribe_inspection";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFrame {
    Subscribe(InspectionId),
    Unsubscribe(InspectionId),
}

impl ClientFrame {
    /// Parse a raw text frame into a typed request.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed("frame is not an object".into()))?;
        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing type".into()))?;

        let constructor: fn(InspectionId) -> Self = match kind {
            SUBSCRIBE => Self::Subscribe,
            UNSUBSCRIBE => Self::Unsubscribe,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };

        let raw_id = object
            .get("payload")
            .and_then(|payload| payload.get("inspectionId"))
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or(ProtocolError::MissingInspectionId)?;
        let id = raw_id
            .parse()
            .map_err(|_| ProtocolError::InvalidInspectionId(raw_id.to_string()))?;

        Ok(constructor(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionRef {
    pub inspection_id: InspectionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub code: String,
    pub message: String,
}

impl From<&ProtocolError> for ErrorData {
    fn from(error: &ProtocolError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    SubscriptionConfirmed(InspectionRef),
    UnsubscriptionConfirmed(InspectionRef),
    ProgressUpdate(ProgressEvent),
    Error(ErrorData),
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Identity established by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub customer_id: String,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Principal, ProtocolError>;
}

/// Fixed token table, one customer per token.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, customer_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), customer_id.into());
        self
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Principal, ProtocolError> {
        self.tokens
            .get(token)
            .map(|customer_id| Principal {
                customer_id: customer_id.clone(),
            })
            .ok_or(ProtocolError::InvalidToken)
    }
}

/// Who owns an inspection and where it stands.
pub trait InspectionDirectory: Send + Sync {
    fn owner_and_status(&self, inspection_id: InspectionId) -> Option<(String, InspectionStatus)>;
}

/// Server side of one observer connection.
///
/// Every frame for the client, replies and progress alike, goes through the
/// `outbound` sender given at open. Subscriptions are released when the
/// session is dropped.
pub struct ChannelSession {
    principal: Principal,
    broadcaster: Arc<ProgressBroadcaster>,
    directory: Arc<dyn InspectionDirectory>,
    outbound: mpsc::Sender<ServerFrame>,
    subscriptions: HashMap<InspectionId, SubscriptionHandle>,
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("principal", &self.principal)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl ChannelSession {
    /// Handshake. A missing or rejected token refuses the connection.
    pub fn open(
        token: Option<&str>,
        authenticator: &dyn Authenticator,
        broadcaster: Arc<ProgressBroadcaster>,
        directory: Arc<dyn InspectionDirectory>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Result<Self, ProtocolError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ProtocolError::Unauthenticated)?;
        let principal = authenticator.authenticate(token).map_err(|e| {
            tracing::warn!(error = %e, "progress channel handshake refused");
            e
        })?;
        tracing::debug!(customer = %principal.customer_id, "progress channel opened");

        Ok(Self {
            principal,
            broadcaster,
            directory,
            outbound,
            subscriptions: HashMap::new(),
        })
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn subscribed(&self) -> HashSet<InspectionId> {
        self.subscriptions.keys().copied().collect()
    }

    /// Handle one raw client frame.
    ///
    /// Errors become error frames. Returns `false` once the client side of the
    /// outbound channel is gone.
    pub async fn handle(&mut self, raw: &str) -> bool {
        let (reply, subscription) = match ClientFrame::parse(raw) {
            Ok(ClientFrame::Subscribe(id)) => match self.subscribe(id) {
                Ok(subscription) => (
                    Ok(ServerFrame::SubscriptionConfirmed(InspectionRef { inspection_id: id })),
                    subscription,
                ),
                Err(e) => (Err(e), None),
            },
            Ok(ClientFrame::Unsubscribe(id)) => (self.unsubscribe(id), None),
            Err(e) => (Err(e), None),
        };

        let frame = match reply {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(code = e.code(), error = %e, "rejected client frame");
                ServerFrame::Error(ErrorData::from(&e))
            }
        };

        if self.outbound.send(frame).await.is_err() {
            return false;
        }

        // Forwarding starts only after the confirmation is queued, so the
        // client never sees progress before `subscription_confirmed`. Events
        // published meanwhile wait in the subscription buffer.
        if let Some(subscription) = subscription {
            self.start_forwarding(subscription);
        }
        true
    }

    /// Attach to the topic of `id`. `None` when already subscribed.
    fn subscribe(&mut self, id: InspectionId) -> Result<Option<Subscription>, ProtocolError> {
        if self.subscriptions.contains_key(&id) {
            return Ok(None);
        }

        match self.directory.owner_and_status(id) {
            Some((owner, _)) if owner != self.principal.customer_id => {
                return Err(ProtocolError::UnknownInspection(id.to_string()))
            }
            Some((_, status)) if status.is_terminal() => {
                return Err(ProtocolError::InspectionFinished(id.to_string()))
            }
            Some(_) => {}
            None => return Err(ProtocolError::UnknownInspection(id.to_string())),
        }

        // The topic closes on the terminal transition, which may have
        // happened since the status check.
        let subscription = self
            .broadcaster
            .subscribe(id)
            .map_err(|_| ProtocolError::InspectionFinished(id.to_string()))?;
        self.subscriptions.insert(id, subscription.handle);
        Ok(Some(subscription))
    }

    fn start_forwarding(&self, mut subscription: Subscription) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.events.recv().await {
                if outbound.send(ServerFrame::ProgressUpdate(event)).await.is_err() {
                    break;
                }
            }
        });
    }

    fn unsubscribe(&mut self, id: InspectionId) -> Result<ServerFrame, ProtocolError> {
        let handle = self
            .subscriptions
            .remove(&id)
            .ok_or_else(|| ProtocolError::NotSubscribed(id.to_string()))?;
        self.broadcaster.unsubscribe(&handle);
        Ok(ServerFrame::UnsubscriptionConfirmed(InspectionRef {
            inspection_id: id,
        }))
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        for handle in self.subscriptions.values() {
            self.broadcaster.unsubscribe(handle);
        }
        tracing::debug!(
            customer = %self.principal.customer_id,
            released = self.subscriptions.len(),
            "progress channel closed"
        );
    }
}
