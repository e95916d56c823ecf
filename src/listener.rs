//! Input bus and scoped activity listeners
//!
//! Input sources (the IPC server, tests) publish [`ActivityKind`]s on an
//! [`InputBus`]. An [`ActivityListener`] forwards them into one idle timer for
//! as long as it is alive; dropping it detaches.

use crate::ActivityKind;
use crate::scheduler::IdleHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const INPUT_BUFFER: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("no async runtime available to host the activity listener")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Broadcast bus of raw input signals
#[derive(Debug, Clone)]
pub struct InputBus {
    tx: broadcast::Sender<ActivityKind>,
}

impl Default for InputBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(INPUT_BUFFER);
        Self { tx }
    }

    /// Publish a signal. Silently dropped when nobody listens.
    pub fn publish(&self, kind: ActivityKind) {
        let _ = self.tx.send(kind);
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<ActivityKind> {
        self.tx.subscribe()
    }
}

/// Registration of one idle timer on the input bus. Detaches on drop.
#[derive(Debug)]
pub struct ActivityListener {
    task: JoinHandle<()>,
}

impl ActivityListener {
    pub fn attach(bus: &InputBus, idle: IdleHandle) -> Result<Self, ListenerError> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let mut rx = bus.subscribe();
        let task = runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(kind) => idle.record_activity(kind),
                    // Missed signals only mean missed resets; the next one catches up.
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        trace!(skipped = n, "activity listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        debug!("activity listener attached");
        Ok(Self { task })
    }
}

impl Drop for ActivityListener {
    fn drop(&mut self) {
        self.task.abort();
        debug!("activity listener detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdleTimerConfig;
    use crate::scheduler::{IdleTimer, IdleTimerOptions};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn listener_forwards_activity() {
        let bus = InputBus::new();
        let timer = IdleTimer::spawn(IdleTimerOptions::new(IdleTimerConfig::new(1000, 400), || {}));
        let _listener = ActivityListener::attach(&bus, timer.handle()).unwrap();
        assert_eq!(bus.listener_count(), 1);

        sleep(Duration::from_millis(500)).await;
        bus.publish(ActivityKind::Scroll);
        sleep(Duration::from_millis(500)).await;
        // Reset at 500 pushes the warning to 1100
        assert!(!timer.snapshot().is_warning);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_listener_detaches() {
        let bus = InputBus::new();
        let timer = IdleTimer::spawn(IdleTimerOptions::new(IdleTimerConfig::new(1000, 400), || {}));
        let listener = ActivityListener::attach(&bus, timer.handle()).unwrap();
        drop(listener);
        tokio::task::yield_now().await;

        sleep(Duration::from_millis(500)).await;
        bus.publish(ActivityKind::Scroll);
        sleep(Duration::from_millis(200)).await;
        assert!(timer.snapshot().is_warning);
    }

    #[test]
    fn attach_without_runtime_fails() {
        let bus = InputBus::new();
        let timer = IdleTimer::spawn(IdleTimerOptions::new(IdleTimerConfig::default(), || {}));
        assert!(ActivityListener::attach(&bus, timer.handle()).is_err());
    }
}
