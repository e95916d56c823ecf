//! Inbound event types
//!
//! Two independent families flow into the guard: raw input signals from the
//! user's device (`ActivityKind`) and change notifications pushed by the
//! remote store (`PushPayload`, reduced to `InboundChangeEvent`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Low-level input signal reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    PointerMove,
    PointerDown,
    Click,
    KeyDown,
    TouchStart,
    Scroll,
    /// Any other signal (focus, resize, visibility...). Never evidence of presence.
    #[serde(other)]
    Other,
}

impl ActivityKind {
    /// Whether this signal counts as user presence for the idle clock
    pub fn is_qualifying(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// Kind of row change carried by a push message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Change notification as delivered by the remote store's realtime channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
    /// RFC 3339 commit time, when the store reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
}

impl PushPayload {
    /// The record this change is about: the new row, or the old row for deletes.
    pub fn record(&self) -> Option<&Value> {
        match self.event_type {
            ChangeKind::Delete => self.old.as_ref().or(self.new.as_ref()),
            ChangeKind::Insert | ChangeKind::Update => self.new.as_ref().or(self.old.as_ref()),
        }
    }

    /// Reduce the wire payload to the reconciler's view of it.
    pub fn to_change_event(&self, severity_field: &str) -> InboundChangeEvent {
        let payload = self.record().cloned().unwrap_or(Value::Null);
        let severity_hint = payload
            .get(severity_field)
            .and_then(|v| v.as_str())
            .map(str::to_lowercase);
        InboundChangeEvent {
            entity_kind: self.table.clone(),
            change_kind: self.event_type,
            payload,
            severity_hint,
        }
    }
}

/// Subscription status reported by the transport's handshake callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Subscribed,
    Closed,
    ChannelError,
    TimedOut,
}

impl SubscriptionStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::ChannelError | Self::TimedOut)
    }
}

/// A change event as seen by the reconciler. Consumed immediately, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundChangeEvent {
    pub entity_kind: String,
    pub change_kind: ChangeKind,
    pub payload: Value,
    pub severity_hint: Option<String>,
}

impl InboundChangeEvent {
    /// Primary key of the record, if the payload carries one
    pub fn record_id(&self) -> Option<String> {
        match self.payload.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
