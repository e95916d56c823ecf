//! Push transport abstraction
//!
//! A realtime subscription is just an inbound queue of [`TransportMessage`]s:
//! handshake/status transitions and row changes. The reconciler only ever
//! consumes that queue, so any transport that can fill one will do.
//!
//! [`ChannelHub`] is the in-process transport used by the daemon: the IPC
//! server publishes client-forwarded pushes into it and it routes them to the
//! subscription that owns the channel key, applying the row filter the remote
//! store would apply server-side. Each key has exactly one owner; reopening a
//! key closes the previous subscriber's queue.

use crate::{PushPayload, SubscriptionStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CHANNEL_BUFFER: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Status(SubscriptionStatus),
    Change(PushPayload),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Which changes a subscription wants: one table, optionally one row of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFilter {
    pub table: String,
    pub row: Option<(String, String)>,
}

impl EntityFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            row: None,
        }
    }

    pub fn with_row(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.row = Some((column.into(), value.into()));
        self
    }

    pub fn matches(&self, payload: &PushPayload) -> bool {
        if payload.table != self.table {
            return false;
        }
        let Some((column, expected)) = &self.row else {
            return true;
        };
        let Some(record) = payload.record() else {
            return false;
        };
        match record.get(column) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Number(n)) => n.to_string() == *expected,
            Some(Value::Bool(b)) => b.to_string() == *expected,
            _ => false,
        }
    }
}

impl fmt::Display for EntityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.row {
            Some((column, value)) => write!(f, "{}:{}=eq.{}", self.table, column, value),
            None => write!(f, "{}", self.table),
        }
    }
}

/// Something that can open push subscriptions.
pub trait Transport: Send + Sync {
    /// Open a subscription. The returned queue yields a status message once
    /// the handshake resolves, then changes matching `filter`.
    fn open(
        &self,
        channel_key: &str,
        filter: &EntityFilter,
    ) -> Result<mpsc::Receiver<TransportMessage>, TransportError>;
}

#[derive(Debug)]
struct Route {
    filter: EntityFilter,
    tx: mpsc::Sender<TransportMessage>,
}

/// In-process transport routing pushes to one subscriber per channel key.
#[derive(Debug, Clone, Default)]
pub struct ChannelHub {
    routes: Arc<Mutex<HashMap<String, Route>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a change to the channel's subscriber if it passes the filter.
    /// Returns `true` if the change was delivered.
    pub fn publish(&self, channel_key: &str, payload: PushPayload) -> bool {
        let Ok(mut routes) = self.routes.lock() else {
            return false;
        };
        let Some(route) = routes.get(channel_key) else {
            debug!(%channel_key, "push for unknown channel dropped");
            return false;
        };
        if !route.filter.matches(&payload) {
            debug!(%channel_key, table = %payload.table, "push filtered out");
            return false;
        }
        match route.tx.try_send(TransportMessage::Change(payload)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%channel_key, "subscriber queue full, push dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                routes.remove(channel_key);
                debug!(%channel_key, "subscriber gone, route removed");
                false
            }
        }
    }

    /// Forward a status transition reported by the upstream store.
    pub fn publish_status(&self, channel_key: &str, status: SubscriptionStatus) -> bool {
        let Ok(mut routes) = self.routes.lock() else {
            return false;
        };
        let delivered = match routes.get(channel_key) {
            Some(route) => route.tx.try_send(TransportMessage::Status(status)).is_ok(),
            None => false,
        };
        if status == SubscriptionStatus::Closed || !delivered {
            routes.remove(channel_key);
        }
        delivered
    }

    /// Close a channel: the subscriber sees `CLOSED` and the route is dropped.
    pub fn close(&self, channel_key: &str) {
        self.publish_status(channel_key, SubscriptionStatus::Closed);
    }

    pub fn is_open(&self, channel_key: &str) -> bool {
        self.routes
            .lock()
            .map(|routes| {
                routes
                    .get(channel_key)
                    .is_some_and(|route| !route.tx.is_closed())
            })
            .unwrap_or(false)
    }
}

impl Transport for ChannelHub {
    fn open(
        &self,
        channel_key: &str,
        filter: &EntityFilter,
    ) -> Result<mpsc::Receiver<TransportMessage>, TransportError> {
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| TransportError::Unavailable("channel hub lock poisoned".into()))?;

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        // Local routing has no remote handshake: confirm immediately.
        tx.try_send(TransportMessage::Status(SubscriptionStatus::Subscribed))
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let previous = routes.insert(
            channel_key.to_string(),
            Route {
                filter: filter.clone(),
                tx,
            },
        );
        if let Some(previous) = previous {
            let _ = previous
                .tx
                .try_send(TransportMessage::Status(SubscriptionStatus::Closed));
            info!(%channel_key, %filter, "channel reopened, previous subscriber closed");
        } else {
            info!(%channel_key, %filter, "channel opened");
        }
        Ok(rx)
    }
}
