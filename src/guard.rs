//! Session guard - idle timeout plus realtime alerts for one session
//!
//! The two halves share nothing mutable. The idle timer decides when the
//! session ends; realtime reconcilers decide what the user should be told.
//! A burst of realtime traffic can never reset or extend the idle countdown,
//! and an idle timeout never drops a subscription.

use crate::ActivityKind;
use crate::clock::IdleSnapshot;
use crate::config::{IdleTimerConfig, RealtimeConfig};
use crate::listener::{ActivityListener, InputBus};
use crate::realtime::{Alert, Notification, RealtimeReconciler, RealtimeSnapshot};
use crate::scheduler::{IdleTimer, IdleTimerOptions, TimeoutCallback};
use crate::transport::{EntityFilter, Transport};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pending alerts and invalidations; a reconciler drops new ones when full
const NOTIFICATION_BUFFER: usize = 1024;

pub type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;
pub type InvalidateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Side effects the guard performs on behalf of the host
#[derive(Clone)]
pub struct GuardActions {
    /// Terminal action, e.g. force sign-out
    pub on_timeout: TimeoutCallback,
    /// Toast (and sound) for a high-severity change
    pub on_alert: AlertCallback,
    /// Drop cached queries for an entity kind
    pub on_invalidate: InvalidateCallback,
}

impl GuardActions {
    pub fn new(
        on_timeout: impl Fn() + Send + Sync + 'static,
        on_alert: impl Fn(&Alert) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_timeout: Arc::new(on_timeout),
            on_alert: Arc::new(on_alert),
            on_invalidate: Arc::new(|_| {}),
        }
    }

    pub fn with_invalidate(mut self, on_invalidate: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_invalidate = Arc::new(on_invalidate);
        self
    }
}

impl std::fmt::Debug for GuardActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardActions").finish_non_exhaustive()
    }
}

/// Everything a consumer needs to render the session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardStatus {
    pub idle: IdleSnapshot,
    /// `false` when idle tracking is disabled or degraded
    pub idle_armed: bool,
    /// Idle episodes that ended in the terminal action
    pub terminations: u64,
    pub channels: BTreeMap<String, RealtimeSnapshot>,
}

pub struct SessionGuard {
    idle: IdleTimer,
    idle_config: IdleTimerConfig,
    input: Option<InputBus>,
    listener: Option<ActivityListener>,
    realtime: RealtimeConfig,
    reconcilers: HashMap<String, RealtimeReconciler>,
    notifications: mpsc::Sender<Notification>,
    pump: Option<JoinHandle<()>>,
    on_timeout: TimeoutCallback,
    terminations: Arc<AtomicU64>,
}

impl SessionGuard {
    pub fn new(idle_config: IdleTimerConfig, realtime: RealtimeConfig, actions: GuardActions) -> Self {
        let terminations = Arc::new(AtomicU64::new(0));
        let on_timeout = terminal_action(actions.on_timeout.clone(), Arc::clone(&terminations));
        let idle = IdleTimer::spawn(IdleTimerOptions {
            config: idle_config,
            on_timeout: Arc::clone(&on_timeout),
        });

        let (notifications, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let pump = match tokio::runtime::Handle::try_current() {
            Ok(rt) => Some(rt.spawn(pump_notifications(rx, actions))),
            Err(e) => {
                warn!(error = %e, "no async runtime, realtime alerts disabled");
                None
            }
        };

        Self {
            idle,
            idle_config,
            input: None,
            listener: None,
            realtime,
            reconcilers: HashMap::new(),
            notifications,
            pump,
            on_timeout,
            terminations,
        }
    }

    // -----------------------------------------------------------------------
    // Idle side
    // -----------------------------------------------------------------------

    /// Listen for qualifying input on `bus` until the guard is dropped.
    ///
    /// If the listener cannot be registered, idle tracking is switched off
    /// rather than left to time out a user it cannot see.
    pub fn attach_activity(&mut self, bus: &InputBus) {
        self.input = Some(bus.clone());
        self.listener = None;
        match ActivityListener::attach(bus, self.idle.handle()) {
            Ok(listener) => self.listener = Some(listener),
            Err(e) => self.disable_idle(&e.to_string()),
        }
    }

    /// Fail open: idle tracking becomes a permanent ACTIVE no-op.
    pub fn disable_idle(&mut self, reason: &str) {
        error!(%reason, "idle timeout disabled");
        self.listener = None;
        self.idle_config.enabled = false;
        self.idle = IdleTimer::spawn(IdleTimerOptions {
            config: self.idle_config,
            on_timeout: Arc::clone(&self.on_timeout),
        });
    }

    /// Replace the idle settings. The old timer set is cancelled first and
    /// the countdown restarts from now.
    pub fn reconfigure_idle(&mut self, config: IdleTimerConfig) {
        if config == self.idle_config {
            debug!("idle config unchanged");
            return;
        }
        info!(?config, "idle config changed");
        self.listener = None;
        self.idle_config = config;
        // Assigning drops (and aborts) the previous timer.
        self.idle = IdleTimer::spawn(IdleTimerOptions {
            config,
            on_timeout: Arc::clone(&self.on_timeout),
        });
        if let Some(bus) = self.input.clone() {
            self.attach_activity(&bus);
        }
    }

    pub fn record_activity(&self, kind: ActivityKind) {
        self.idle.record_activity(kind);
    }

    pub fn reset_timer(&self) {
        self.idle.reset_timer();
    }

    pub fn idle_snapshot(&self) -> IdleSnapshot {
        self.idle.snapshot()
    }

    pub fn idle_config(&self) -> &IdleTimerConfig {
        &self.idle_config
    }

    // -----------------------------------------------------------------------
    // Realtime side
    // -----------------------------------------------------------------------

    /// Open (or reopen) the subscription for `channel_key`.
    pub fn subscribe(&mut self, transport: &dyn Transport, channel_key: &str, filter: &EntityFilter) {
        // The old subscription must release its transport handle first.
        if self.reconcilers.remove(channel_key).is_some() {
            debug!(%channel_key, "replacing realtime subscription");
        }
        let reconciler = RealtimeReconciler::subscribe(
            transport,
            channel_key,
            filter,
            self.realtime.clone(),
            self.notifications.clone(),
        );
        self.reconcilers.insert(channel_key.to_string(), reconciler);
    }

    pub fn unsubscribe(&mut self, channel_key: &str) -> bool {
        self.reconcilers.remove(channel_key).is_some()
    }

    /// Clear the unacknowledged counter of one channel.
    pub fn acknowledge(&self, channel_key: &str) -> bool {
        match self.reconcilers.get(channel_key) {
            Some(reconciler) => {
                reconciler.clear_new_updates();
                true
            }
            None => false,
        }
    }

    pub fn acknowledge_all(&self) {
        for reconciler in self.reconcilers.values() {
            reconciler.clear_new_updates();
        }
    }

    pub fn realtime_snapshot(&self, channel_key: &str) -> Option<RealtimeSnapshot> {
        self.reconcilers.get(channel_key).map(|r| r.snapshot())
    }

    pub fn status(&self) -> GuardStatus {
        GuardStatus {
            idle: self.idle.snapshot(),
            idle_armed: self.idle.is_armed(),
            terminations: self.terminations.load(Ordering::SeqCst),
            channels: self
                .reconcilers
                .iter()
                .map(|(key, r)| (key.clone(), r.snapshot()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("idle_config", &self.idle_config)
            .field("channels", &self.reconcilers.len())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn terminal_action(action: TimeoutCallback, terminations: Arc<AtomicU64>) -> TimeoutCallback {
    Arc::new(move || {
        let n = terminations.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(episode = n, "session idle, running terminal action");
        action();
    })
}

async fn pump_notifications(mut rx: mpsc::Receiver<Notification>, actions: GuardActions) {
    while let Some(notification) = rx.recv().await {
        match notification {
            Notification::Alert(alert) => (actions.on_alert)(&alert),
            Notification::Invalidate {
                channel,
                entity_kind,
            } => {
                debug!(%channel, %entity_kind, "invalidate cached queries");
                (actions.on_invalidate)(&entity_kind);
            }
        }
    }
}
