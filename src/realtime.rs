//! Realtime event reconciler
//!
//! Consumes one push subscription and keeps three facts about it: whether the
//! handshake is confirmed, when the last change landed, and how many changes
//! arrived since the consumer last acknowledged. Inserts whose severity hint
//! is in the alert set produce one [`Alert`] each, never merged.

use crate::config::RealtimeConfig;
use crate::time::commit_time_or_now;
use crate::transport::{EntityFilter, Transport, TransportMessage};
use crate::{ChangeKind, InboundChangeEvent, SubscriptionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// High-priority notice for the user (toast + optional sound)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub channel: String,
    pub entity_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub severity: String,
    pub title: String,
    pub play_sound: bool,
}

impl Alert {
    /// Where the toast's "view" action leads
    pub fn drill_down(&self) -> Option<String> {
        self.record_id
            .as_ref()
            .map(|id| format!("/{}/{}", self.entity_kind, id))
    }
}

/// Side effects requested by a reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Alert(Alert),
    /// Cached queries for this entity kind are out of date
    Invalidate { channel: String, entity_kind: String },
}

/// Consumer-facing view of one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeSnapshot {
    pub is_connected: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub new_updates_count: u64,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    is_connected: bool,
    /// Set by the first `SUBSCRIBED`; a failure before it is permanent
    handshake_done: bool,
    handshake_failed: bool,
    last_update: Option<DateTime<Utc>>,
    unacknowledged: u64,
}

impl SubscriptionState {
    fn snapshot(&self) -> RealtimeSnapshot {
        RealtimeSnapshot {
            is_connected: self.is_connected,
            last_update: self.last_update,
            new_updates_count: self.unacknowledged,
        }
    }

    /// Apply a status transition. Returns `false` when the subscription is dead.
    fn apply_status(&mut self, channel: &str, status: SubscriptionStatus) -> bool {
        match status {
            SubscriptionStatus::Subscribed => {
                self.is_connected = true;
                self.handshake_done = true;
                info!(%channel, "realtime subscribed");
                true
            }
            SubscriptionStatus::Closed => {
                self.is_connected = false;
                info!(%channel, "realtime channel closed");
                true
            }
            failure => {
                self.is_connected = false;
                if self.handshake_done {
                    warn!(%channel, ?failure, "realtime channel failure");
                    true
                } else {
                    warn!(%channel, ?failure, "realtime handshake failed, not retrying");
                    self.handshake_failed = true;
                    false
                }
            }
        }
    }

    fn accept(&mut self, at: DateTime<Utc>) {
        self.unacknowledged += 1;
        self.last_update = Some(at);
    }
}

/// Build the alert for an event, if it warrants one.
fn alert_for(config: &RealtimeConfig, channel: &str, event: &InboundChangeEvent) -> Option<Alert> {
    if event.change_kind != ChangeKind::Insert {
        return None;
    }
    let severity = event.severity_hint.as_deref()?;
    if !config.is_alert_severity(severity) {
        return None;
    }
    let title = ["title", "reference_id"]
        .iter()
        .find_map(|field| event.payload.get(*field).and_then(|v| v.as_str()))
        .unwrap_or(event.entity_kind.as_str())
        .to_string();
    Some(Alert {
        channel: channel.to_string(),
        entity_kind: event.entity_kind.clone(),
        record_id: event.record_id(),
        severity: severity.to_string(),
        title,
        play_sound: config.alert_sound,
    })
}

/// Owns one push subscription. Dropping it tears the subscription down.
#[derive(Debug)]
pub struct RealtimeReconciler {
    channel_key: String,
    state: Arc<Mutex<SubscriptionState>>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeReconciler {
    /// Open a subscription on `transport` and start consuming it.
    ///
    /// Open failures are logged and leave the reconciler permanently
    /// disconnected; the caller decides whether to build a new one.
    pub fn subscribe(
        transport: &dyn Transport,
        channel_key: &str,
        filter: &EntityFilter,
        config: RealtimeConfig,
        notifications: mpsc::Sender<Notification>,
    ) -> Self {
        let state = Arc::new(Mutex::new(SubscriptionState::default()));
        let mut reconciler = Self {
            channel_key: channel_key.to_string(),
            state: Arc::clone(&state),
            task: None,
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(e) => {
                warn!(%channel_key, error = %e, "no async runtime, realtime disabled");
                reconciler.mark_failed();
                return reconciler;
            }
        };

        let rx = match transport.open(channel_key, filter) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(%channel_key, %filter, error = %e, "realtime subscription failed");
                reconciler.mark_failed();
                return reconciler;
            }
        };

        let channel = channel_key.to_string();
        reconciler.task = Some(runtime.spawn(consume(channel, rx, state, config, notifications)));
        reconciler
    }

    fn mark_failed(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.handshake_failed = true;
        }
    }

    pub fn channel_key(&self) -> &str {
        &self.channel_key
    }

    /// Zero the unacknowledged counter. Connection and last update are untouched.
    pub fn clear_new_updates(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.unacknowledged = 0;
        }
    }

    pub fn snapshot(&self) -> RealtimeSnapshot {
        match self.state.lock() {
            Ok(state) => state.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        }
    }

    /// `true` once the subscription can no longer recover on its own
    pub fn has_failed(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.handshake_failed)
            .unwrap_or(true)
    }
}

impl Drop for RealtimeReconciler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Ok(mut state) = self.state.lock() {
            state.is_connected = false;
        }
        debug!(channel = %self.channel_key, "realtime subscription released");
    }
}

async fn consume(
    channel: String,
    mut rx: mpsc::Receiver<TransportMessage>,
    state: Arc<Mutex<SubscriptionState>>,
    config: RealtimeConfig,
    notifications: mpsc::Sender<Notification>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            TransportMessage::Status(status) => {
                let alive = match state.lock() {
                    Ok(mut state) => state.apply_status(&channel, status),
                    Err(_) => false,
                };
                if !alive {
                    return;
                }
            }
            TransportMessage::Change(payload) => {
                let event = payload.to_change_event(&config.severity_field);
                let at = commit_time_or_now(payload.commit_timestamp.as_deref());
                if let Ok(mut state) = state.lock() {
                    state.accept(at);
                    trace!(
                        %channel,
                        entity = %event.entity_kind,
                        kind = ?event.change_kind,
                        unacknowledged = state.unacknowledged,
                        "realtime change"
                    );
                }

                if let Some(alert) = alert_for(&config, &channel, &event) {
                    info!(%channel, severity = %alert.severity, title = %alert.title, "realtime alert");
                    dispatch(&notifications, &channel, Notification::Alert(alert));
                }
                if config.invalidate_on_change {
                    let invalidate = Notification::Invalidate {
                        channel: channel.clone(),
                        entity_kind: event.entity_kind,
                    };
                    dispatch(&notifications, &channel, invalidate);
                }
            }
        }
    }

    // Transport hung up
    if let Ok(mut state) = state.lock() {
        state.is_connected = false;
    }
    debug!(%channel, "realtime stream ended");
}

/// Hand a notification to the guard without waiting on a slow consumer.
fn dispatch(notifications: &mpsc::Sender<Notification>, channel: &str, notification: Notification) {
    match notifications.try_send(notification) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(%channel, "notification queue full, notification dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            trace!(%channel, "no notification consumer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PushPayload;
    use crate::transport::TransportError;
    use serde_json::{Value, json};
    use std::time::Duration;

    /// Transport backed by a queue the test feeds directly.
    struct QueueTransport {
        rx: Mutex<Option<mpsc::Receiver<TransportMessage>>>,
    }

    impl QueueTransport {
        fn new() -> (Self, mpsc::Sender<TransportMessage>) {
            let (tx, rx) = mpsc::channel(64);
            (
                Self {
                    rx: Mutex::new(Some(rx)),
                },
                tx,
            )
        }
    }

    impl Transport for QueueTransport {
        fn open(
            &self,
            channel_key: &str,
            _filter: &EntityFilter,
        ) -> Result<mpsc::Receiver<TransportMessage>, TransportError> {
            self.rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError::Unavailable(format!("{channel_key} already opened")))
        }
    }

    fn change(kind: ChangeKind, record: Value) -> TransportMessage {
        TransportMessage::Change(PushPayload {
            event_type: kind,
            schema: "public".into(),
            table: "incidents".into(),
            new: Some(record),
            old: None,
            commit_timestamp: None,
        })
    }

    fn setup() -> (
        RealtimeReconciler,
        mpsc::Sender<TransportMessage>,
        mpsc::Receiver<Notification>,
    ) {
        let (transport, tx) = QueueTransport::new();
        let (notify_tx, notify_rx) = mpsc::channel(64);
        let reconciler = RealtimeReconciler::subscribe(
            &transport,
            "incident-notifications",
            &EntityFilter::table("incidents"),
            RealtimeConfig {
                invalidate_on_change: false,
                ..RealtimeConfig::default()
            },
            notify_tx,
        );
        (reconciler, tx, notify_rx)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn drain_alerts(rx: &mut mpsc::Receiver<Notification>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        while let Ok(n) = rx.try_recv() {
            if let Notification::Alert(alert) = n {
                alerts.push(alert);
            }
        }
        alerts
    }

    #[tokio::test]
    async fn connects_only_on_confirmed_handshake() {
        let (reconciler, tx, _rx) = setup();
        settle().await;
        assert!(!reconciler.snapshot().is_connected);

        tx.send(TransportMessage::Status(SubscriptionStatus::Subscribed))
            .await
            .unwrap();
        settle().await;
        assert!(reconciler.snapshot().is_connected);

        tx.send(TransportMessage::Status(SubscriptionStatus::Closed))
            .await
            .unwrap();
        settle().await;
        assert!(!reconciler.snapshot().is_connected);
    }

    #[tokio::test]
    async fn insert_critical_then_update_alerts_once() {
        let (reconciler, tx, mut rx) = setup();
        tx.send(TransportMessage::Status(SubscriptionStatus::Subscribed))
            .await
            .unwrap();
        tx.send(change(
            ChangeKind::Insert,
            json!({"id": 9, "severity": "critical", "title": "Gas leak"}),
        ))
        .await
        .unwrap();
        tx.send(change(ChangeKind::Update, json!({"id": 9, "severity": "critical"})))
            .await
            .unwrap();
        settle().await;

        let snap = reconciler.snapshot();
        assert_eq!(snap.new_updates_count, 2);
        assert!(snap.last_update.is_some());

        let alerts = drain_alerts(&mut rx);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, "Gas leak");
        assert_eq!(alerts[0].drill_down().as_deref(), Some("/incidents/9"));
        assert!(alerts[0].play_sound);
    }

    #[tokio::test]
    async fn every_high_severity_insert_alerts() {
        let (reconciler, tx, mut rx) = setup();
        for i in 0..5 {
            tx.send(change(ChangeKind::Insert, json!({"id": i, "severity": "high"})))
                .await
                .unwrap();
        }
        // Identical payloads are still distinct events
        tx.send(change(ChangeKind::Insert, json!({"id": 4, "severity": "high"})))
            .await
            .unwrap();
        settle().await;

        assert_eq!(reconciler.snapshot().new_updates_count, 6);
        assert_eq!(drain_alerts(&mut rx).len(), 6);
    }

    #[tokio::test]
    async fn low_severity_counts_without_alert() {
        let (reconciler, tx, mut rx) = setup();
        tx.send(change(ChangeKind::Insert, json!({"id": 1, "severity": "low"})))
            .await
            .unwrap();
        tx.send(change(ChangeKind::Insert, json!({"id": 2})))
            .await
            .unwrap();
        settle().await;

        assert_eq!(reconciler.snapshot().new_updates_count, 2);
        assert!(drain_alerts(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn clear_new_updates_keeps_connection_and_timestamp() {
        let (reconciler, tx, _rx) = setup();
        tx.send(TransportMessage::Status(SubscriptionStatus::Subscribed))
            .await
            .unwrap();
        tx.send(change(ChangeKind::Insert, json!({"id": 1})))
            .await
            .unwrap();
        settle().await;

        let before = reconciler.snapshot();
        reconciler.clear_new_updates();
        let after = reconciler.snapshot();

        assert_eq!(after.new_updates_count, 0);
        assert_eq!(after.is_connected, before.is_connected);
        assert_eq!(after.last_update, before.last_update);
        assert!(after.is_connected);
    }

    #[tokio::test]
    async fn commit_timestamp_becomes_last_update() {
        let (reconciler, tx, _rx) = setup();
        tx.send(TransportMessage::Change(PushPayload {
            event_type: ChangeKind::Update,
            schema: "public".into(),
            table: "incidents".into(),
            new: Some(json!({"id": 1})),
            old: None,
            commit_timestamp: Some("2026-03-01T08:00:00Z".into()),
        }))
        .await
        .unwrap();
        settle().await;

        let last = reconciler.snapshot().last_update.unwrap();
        assert_eq!(last.to_rfc3339(), "2026-03-01T08:00:00+00:00");
    }

    #[tokio::test]
    async fn handshake_failure_is_permanent() {
        let (reconciler, tx, _rx) = setup();
        tx.send(TransportMessage::Status(SubscriptionStatus::ChannelError))
            .await
            .unwrap();
        settle().await;
        assert!(reconciler.has_failed());

        // The reconciler stopped consuming; a late SUBSCRIBED does not revive it
        let _ = tx
            .send(TransportMessage::Status(SubscriptionStatus::Subscribed))
            .await;
        settle().await;
        assert!(!reconciler.snapshot().is_connected);
    }

    #[tokio::test]
    async fn failure_after_handshake_disconnects_without_giving_up() {
        let (reconciler, tx, _rx) = setup();
        tx.send(TransportMessage::Status(SubscriptionStatus::Subscribed))
            .await
            .unwrap();
        tx.send(TransportMessage::Status(SubscriptionStatus::TimedOut))
            .await
            .unwrap();
        settle().await;
        assert!(!reconciler.snapshot().is_connected);
        assert!(!reconciler.has_failed());

        tx.send(TransportMessage::Status(SubscriptionStatus::Subscribed))
            .await
            .unwrap();
        settle().await;
        assert!(reconciler.snapshot().is_connected);
    }

    #[tokio::test]
    async fn open_failure_leaves_disconnected() {
        let (transport, _tx) = QueueTransport::new();
        let (notify_tx, _notify_rx) = mpsc::channel(64);
        let filter = EntityFilter::table("incidents");
        let _first = RealtimeReconciler::subscribe(
            &transport,
            "a",
            &filter,
            RealtimeConfig::default(),
            notify_tx.clone(),
        );
        let second =
            RealtimeReconciler::subscribe(&transport, "a", &filter, RealtimeConfig::default(), notify_tx);
        assert!(second.has_failed());
        assert!(!second.snapshot().is_connected);
    }

    #[tokio::test]
    async fn invalidation_hint_per_change() {
        let (transport, tx) = QueueTransport::new();
        let (notify_tx, mut notify_rx) = mpsc::channel(64);
        let _reconciler = RealtimeReconciler::subscribe(
            &transport,
            "dashboard",
            &EntityFilter::table("incidents"),
            RealtimeConfig::default(),
            notify_tx,
        );
        tx.send(change(ChangeKind::Delete, json!({"id": 1})))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            notify_rx.try_recv().unwrap(),
            Notification::Invalidate {
                channel: "dashboard".into(),
                entity_kind: "incidents".into(),
            }
        );
    }

    #[tokio::test]
    async fn full_notification_queue_drops_without_stalling() {
        let (transport, tx) = QueueTransport::new();
        let (notify_tx, mut notify_rx) = mpsc::channel(1);
        let reconciler = RealtimeReconciler::subscribe(
            &transport,
            "incident-notifications",
            &EntityFilter::table("incidents"),
            RealtimeConfig {
                invalidate_on_change: false,
                ..RealtimeConfig::default()
            },
            notify_tx,
        );
        tx.send(TransportMessage::Status(SubscriptionStatus::Subscribed))
            .await
            .unwrap();
        for id in 1..=3 {
            tx.send(change(ChangeKind::Insert, json!({"id": id, "severity": "critical"})))
                .await
                .unwrap();
        }
        settle().await;

        // Every change is still counted; only the surplus alerts are shed
        let snap = reconciler.snapshot();
        assert!(snap.is_connected);
        assert_eq!(snap.new_updates_count, 3);
        assert_eq!(drain_alerts(&mut notify_rx).len(), 1);

        tx.send(change(ChangeKind::Insert, json!({"id": 4, "severity": "high"})))
            .await
            .unwrap();
        settle().await;
        assert_eq!(reconciler.snapshot().new_updates_count, 4);
        assert_eq!(drain_alerts(&mut notify_rx).len(), 1);
    }

    #[test]
    fn alert_title_fallbacks() {
        let config = RealtimeConfig::default();
        let event = InboundChangeEvent {
            entity_kind: "incidents".into(),
            change_kind: ChangeKind::Insert,
            payload: json!({"reference_id": "INC-0042"}),
            severity_hint: Some("high".into()),
        };
        let alert = alert_for(&config, "c", &event).unwrap();
        assert_eq!(alert.title, "INC-0042");
        assert!(alert.drill_down().is_none());

        let event = InboundChangeEvent {
            payload: json!({}),
            ..event
        };
        assert_eq!(alert_for(&config, "c", &event).unwrap().title, "incidents");
    }
}
