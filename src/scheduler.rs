//! Countdown scheduler - drives the activity clock from timers
//!
//! One driver task per [`IdleTimer`] owns the timers: a single-shot warning
//! timer, a single-shot hard timeout, and a 1 s ticker while the warning
//! countdown is shown. Every reset drops the whole timer set before a new one
//! is armed, so an old deadline can never fire twice.
//!
//! The clock itself lives behind a mutex shared with the synchronous
//! [`IdleHandle`], so `reset_timer()` and snapshots never wait on the task.

use crate::ActivityKind;
use crate::clock::{ActivityClock, IdlePhase, IdleSnapshot};
use crate::config::IdleTimerConfig;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep_until};
use tracing::{debug, error, info, trace};

/// Countdown refresh period while in WARNING
const TICK: Duration = Duration::from_secs(1);

/// Called once per idle episode when the hard timeout elapses
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// Everything needed to start an idle timer
#[derive(Clone)]
pub struct IdleTimerOptions {
    pub config: IdleTimerConfig,
    pub on_timeout: TimeoutCallback,
}

impl IdleTimerOptions {
    pub fn new(config: IdleTimerConfig, on_timeout: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            config,
            on_timeout: Arc::new(on_timeout),
        }
    }
}

impl std::fmt::Debug for IdleTimerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTimerOptions")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Cloneable, synchronous access to a running idle timer
#[derive(Debug, Clone)]
pub struct IdleHandle {
    clock: Arc<Mutex<ActivityClock>>,
    rearm: Arc<Notify>,
    armed: bool,
}

impl IdleHandle {
    /// Explicit acknowledgment: back to ACTIVE from any phase, timers re-armed.
    pub fn reset_timer(&self) {
        if !self.armed {
            return;
        }
        if let Ok(mut clock) = self.clock.lock() {
            clock.reset(Instant::now());
        }
        self.rearm.notify_one();
    }

    /// Passive input. Only resets while ACTIVE.
    pub fn record_activity(&self, kind: ActivityKind) {
        if !self.armed {
            return;
        }
        let reset = match self.clock.lock() {
            Ok(mut clock) => clock.on_qualifying_event(kind, Instant::now()),
            Err(_) => false,
        };
        if reset {
            self.rearm.notify_one();
        }
    }

    pub fn snapshot(&self) -> IdleSnapshot {
        match self.clock.lock() {
            Ok(clock) => clock.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        }
    }

    /// `false` when disabled or degraded to a permanent ACTIVE no-op
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

/// Owns the driver task; dropping it cancels every pending timer.
#[derive(Debug)]
pub struct IdleTimer {
    handle: IdleHandle,
    task: Option<JoinHandle<()>>,
}

impl IdleTimer {
    /// Start the countdown from now.
    ///
    /// Disabled or invalid configurations, and a missing runtime, yield an
    /// inert timer that stays ACTIVE forever. Failures are logged, never raised.
    pub fn spawn(options: IdleTimerOptions) -> Self {
        let IdleTimerOptions { config, on_timeout } = options;

        if !config.enabled {
            debug!("idle timeout disabled");
            return Self::inert(config);
        }
        if let Err(e) = config.validate() {
            error!(error = %e, "invalid idle timeout configuration, idle timeout disabled");
            return Self::inert(config);
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(e) => {
                error!(error = %e, "no async runtime, idle timeout disabled");
                return Self::inert(config);
            }
        };

        let clock = Arc::new(Mutex::new(ActivityClock::new(config, Instant::now())));
        let rearm = Arc::new(Notify::new());
        let task = runtime.spawn(drive(Arc::clone(&clock), Arc::clone(&rearm), on_timeout));

        info!(
            idle_timeout_ms = config.idle_timeout_ms,
            warning_threshold_ms = config.warning_threshold_ms,
            "idle timer armed"
        );

        Self {
            handle: IdleHandle {
                clock,
                rearm,
                armed: true,
            },
            task: Some(task),
        }
    }

    fn inert(config: IdleTimerConfig) -> Self {
        Self {
            handle: IdleHandle {
                clock: Arc::new(Mutex::new(ActivityClock::new(config, Instant::now()))),
                rearm: Arc::new(Notify::new()),
                armed: false,
            },
            task: None,
        }
    }

    pub fn handle(&self) -> IdleHandle {
        self.handle.clone()
    }

    pub fn reset_timer(&self) {
        self.handle.reset_timer();
    }

    pub fn record_activity(&self, kind: ActivityKind) {
        self.handle.record_activity(kind);
    }

    pub fn snapshot(&self) -> IdleSnapshot {
        self.handle.snapshot()
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_armed()
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The armed timer set. Replaced wholesale on every re-arm.
#[derive(Default)]
struct Timers {
    warning: Option<Pin<Box<Sleep>>>,
    timeout: Option<Pin<Box<Sleep>>>,
    tick: Option<Interval>,
}

impl Timers {
    fn arm(clock: &ActivityClock) -> Self {
        match clock.phase() {
            IdlePhase::Active => Self {
                warning: Some(Box::pin(sleep_until(clock.warning_at()))),
                timeout: Some(Box::pin(sleep_until(clock.timeout_at()))),
                tick: None,
            },
            IdlePhase::Warning => {
                let mut timers = Self {
                    warning: None,
                    timeout: Some(Box::pin(sleep_until(clock.timeout_at()))),
                    tick: None,
                };
                timers.start_ticking(Instant::now());
                timers
            }
            IdlePhase::Idle => Self::default(),
        }
    }

    fn start_ticking(&mut self, now: Instant) {
        let mut ticker = interval_at(now + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.tick = Some(ticker);
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn drive(clock: Arc<Mutex<ActivityClock>>, rearm: Arc<Notify>, on_timeout: TimeoutCallback) {
    let mut timers = match clock.lock() {
        Ok(clock) => Timers::arm(&clock),
        Err(_) => return,
    };

    loop {
        tokio::select! {
            biased;

            _ = rearm.notified() => {
                // Drop the old set before arming the new one.
                drop(std::mem::take(&mut timers));
                let Ok(clock) = clock.lock() else { return };
                trace!(phase = ?clock.phase(), "idle timers re-armed");
                timers = Timers::arm(&clock);
            }

            _ = fire(&mut timers.warning) => {
                timers.warning = None;
                let now = Instant::now();
                let Ok(mut clock) = clock.lock() else { return };
                if clock.enter_warning(now) {
                    info!(remaining = clock.snapshot().remaining_time, "idle warning started");
                    timers.start_ticking(now);
                }
            }

            _ = fire(&mut timers.timeout) => {
                timers.timeout = None;
                let expired = match clock.lock() {
                    Ok(mut clock) => clock.expire(Instant::now()),
                    Err(_) => return,
                };
                if expired {
                    timers = Timers::default();
                    info!("idle timeout elapsed");
                    on_timeout();
                }
            }

            _ = tick(&mut timers.tick) => {
                let Ok(mut clock) = clock.lock() else { return };
                clock.refresh_remaining(Instant::now());
                trace!(remaining = clock.snapshot().remaining_time, "idle countdown");
            }
        }
    }
}
