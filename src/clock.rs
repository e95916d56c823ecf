//! Activity clock - the ACTIVE / WARNING / IDLE state machine
//!
//! The clock is pure: every transition takes the current instant as an
//! argument and nothing here sleeps. The scheduler drives it from timers.
//!
//! ```text
//! ACTIVE  --[idle_timeout - warning_threshold elapsed]--> WARNING
//! WARNING --[warning_threshold elapsed further]---------> IDLE
//! WARNING --[explicit reset]----------------------------> ACTIVE
//! IDLE    --[explicit reset]----------------------------> ACTIVE
//! ```
//!
//! Passive activity resets the clock only while ACTIVE. A pointer nudge during
//! the warning countdown does not dismiss it; the user has to acknowledge it.

use crate::ActivityKind;
use crate::config::IdleTimerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdlePhase {
    #[default]
    Active,
    /// Countdown shown, timeout imminent
    Warning,
    /// Timed out. Terminal until an explicit reset.
    Idle,
}

/// What consumers render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleSnapshot {
    pub is_idle: bool,
    pub is_warning: bool,
    /// Seconds left before the timeout
    pub remaining_time: u64,
}

#[derive(Debug, Clone)]
pub struct ActivityClock {
    config: IdleTimerConfig,
    last_activity: Instant,
    phase: IdlePhase,
    remaining_secs: u64,
}

impl ActivityClock {
    pub fn new(config: IdleTimerConfig, now: Instant) -> Self {
        Self {
            config,
            last_activity: now,
            phase: IdlePhase::Active,
            remaining_secs: config.timeout_secs(),
        }
    }

    pub fn config(&self) -> &IdleTimerConfig {
        &self.config
    }

    pub fn phase(&self) -> IdlePhase {
        self.phase
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn warning_at(&self) -> Instant {
        self.last_activity + self.config.warning_offset()
    }

    pub fn timeout_at(&self) -> Instant {
        self.last_activity + self.config.idle_timeout()
    }

    /// Record `now` as the last activity and return to ACTIVE from any phase.
    pub fn reset(&mut self, now: Instant) {
        if self.phase != IdlePhase::Active {
            debug!(from = ?self.phase, "idle clock reset");
        }
        self.last_activity = now;
        self.phase = IdlePhase::Active;
        self.remaining_secs = self.config.timeout_secs();
    }

    /// Handle a passive input signal. Returns `true` if the clock was reset.
    pub fn on_qualifying_event(&mut self, kind: ActivityKind, now: Instant) -> bool {
        if !kind.is_qualifying() {
            return false;
        }
        if self.phase != IdlePhase::Active {
            trace!(?kind, phase = ?self.phase, "activity ignored outside ACTIVE");
            return false;
        }
        self.reset(now);
        true
    }

    /// Enter WARNING if the warning offset has elapsed. Returns `true` on transition.
    pub fn enter_warning(&mut self, now: Instant) -> bool {
        if self.phase != IdlePhase::Active || now < self.warning_at() {
            return false;
        }
        self.phase = IdlePhase::Warning;
        self.refresh_remaining(now);
        debug!(remaining = self.remaining_secs, "idle warning");
        true
    }

    /// Recompute the countdown from the time elapsed since last activity.
    pub fn refresh_remaining(&mut self, now: Instant) {
        if self.phase != IdlePhase::Warning {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_activity);
        self.remaining_secs = remaining_secs(self.config.idle_timeout(), elapsed);
    }

    /// Enter IDLE if the timeout has elapsed. Returns `true` exactly once per episode.
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.phase == IdlePhase::Idle || now < self.timeout_at() {
            return false;
        }
        self.phase = IdlePhase::Idle;
        self.remaining_secs = 0;
        true
    }

    pub fn snapshot(&self) -> IdleSnapshot {
        IdleSnapshot {
            is_idle: self.phase == IdlePhase::Idle,
            is_warning: self.phase == IdlePhase::Warning,
            remaining_time: self.remaining_secs,
        }
    }
}

/// `ceil((timeout - elapsed) / 1s)`, clamped at zero
fn remaining_secs(timeout: Duration, elapsed: Duration) -> u64 {
    let left = timeout.saturating_sub(elapsed).as_millis();
    u64::try_from(left.div_ceil(1000)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn clock() -> (ActivityClock, Instant) {
        let start = Instant::now();
        (ActivityClock::new(IdleTimerConfig::new(1000, 400), start), start)
    }

    #[test]
    fn starts_active_with_full_countdown() {
        let (clock, start) = clock();
        assert_eq!(clock.phase(), IdlePhase::Active);
        assert_eq!(
            clock.snapshot(),
            IdleSnapshot {
                is_idle: false,
                is_warning: false,
                remaining_time: 1,
            }
        );
        assert_eq!(clock.warning_at(), start + ms(600));
        assert_eq!(clock.timeout_at(), start + ms(1000));
    }

    #[test]
    fn warning_only_after_offset() {
        let (mut clock, start) = clock();
        assert!(!clock.enter_warning(start + ms(599)));
        assert!(clock.enter_warning(start + ms(600)));
        assert!(clock.snapshot().is_warning);
        // Already warning
        assert!(!clock.enter_warning(start + ms(700)));
    }

    #[test]
    fn passive_activity_resets_only_while_active() {
        let (mut clock, start) = clock();
        assert!(clock.on_qualifying_event(ActivityKind::PointerMove, start + ms(300)));
        assert_eq!(clock.last_activity(), start + ms(300));

        assert!(clock.enter_warning(start + ms(950)));
        assert!(!clock.on_qualifying_event(ActivityKind::PointerMove, start + ms(960)));
        assert_eq!(clock.phase(), IdlePhase::Warning);
        assert_eq!(clock.last_activity(), start + ms(300));
    }

    #[test]
    fn non_qualifying_signal_ignored() {
        let (mut clock, start) = clock();
        assert!(!clock.on_qualifying_event(ActivityKind::Other, start + ms(100)));
        assert_eq!(clock.last_activity(), start);
    }

    #[test]
    fn expire_fires_once_and_is_terminal() {
        let (mut clock, start) = clock();
        assert!(!clock.expire(start + ms(999)));
        assert!(clock.expire(start + ms(1000)));
        assert!(!clock.expire(start + ms(2000)));

        let snap = clock.snapshot();
        assert!(snap.is_idle);
        assert!(!snap.is_warning);
        assert_eq!(snap.remaining_time, 0);

        // Passive activity cannot leave IDLE
        assert!(!clock.on_qualifying_event(ActivityKind::KeyDown, start + ms(2100)));
        assert!(clock.snapshot().is_idle);
    }

    #[test]
    fn explicit_reset_leaves_warning_and_idle() {
        let (mut clock, start) = clock();
        clock.enter_warning(start + ms(700));
        clock.reset(start + ms(800));
        assert_eq!(clock.phase(), IdlePhase::Active);
        assert_eq!(clock.snapshot().remaining_time, 1);

        clock.expire(start + ms(1800));
        assert!(clock.snapshot().is_idle);
        clock.reset(start + ms(1900));
        assert_eq!(clock.phase(), IdlePhase::Active);
        assert_eq!(clock.timeout_at(), start + ms(2900));
    }

    #[test]
    fn remaining_is_derived_and_clamped() {
        let config = IdleTimerConfig::new(10_000, 5_000);
        let start = Instant::now();
        let mut clock = ActivityClock::new(config, start);
        assert_eq!(clock.snapshot().remaining_time, 10);

        clock.enter_warning(start + ms(5_000));
        assert_eq!(clock.snapshot().remaining_time, 5);
        clock.refresh_remaining(start + ms(6_500));
        assert_eq!(clock.snapshot().remaining_time, 4);
        clock.refresh_remaining(start + ms(9_999));
        assert_eq!(clock.snapshot().remaining_time, 1);
        clock.refresh_remaining(start + ms(12_000));
        assert_eq!(clock.snapshot().remaining_time, 0);
    }

    #[test]
    fn remaining_secs_rounding() {
        assert_eq!(remaining_secs(ms(1000), ms(0)), 1);
        assert_eq!(remaining_secs(ms(1000), ms(1)), 1);
        assert_eq!(remaining_secs(ms(2000), ms(999)), 2);
        assert_eq!(remaining_secs(ms(2000), ms(1000)), 1);
        assert_eq!(remaining_secs(ms(2000), ms(3000)), 0);
    }
}
