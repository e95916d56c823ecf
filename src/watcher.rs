//! Config file hot reload
//!
//! Watches the directory holding `config.json` (editors and atomic saves
//! replace the file rather than writing in place) and re-applies the idle
//! settings to the running guard. Realtime channels are only read at startup.

use crate::config::Config;
use crate::guard::SessionGuard;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Rapid successive writes (temp file + rename) are folded into one reload.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Live config watch. Stops watching when dropped.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path`. Returns `None` (logged) when the platform
    /// watcher cannot be set up; the guard keeps its current settings.
    pub fn spawn(path: PathBuf, guard: Arc<Mutex<SessionGuard>>) -> Option<Self> {
        let rt = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "no async runtime, config hot reload disabled");
                return None;
            }
        };
        let Some(dir) = path.parent().map(Path::to_path_buf) else {
            warn!(path = %path.display(), "config path has no parent, hot reload disabled");
            return None;
        };
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(path = %dir.display(), error = %e, "failed to create config dir");
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let file_name = path.file_name().map(|n| n.to_os_string());
        let mut watcher =
            match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(e) => e,
                    Err(err) => {
                        debug!(error = %err, "config watcher error");
                        return;
                    }
                };
                if matches!(event.kind, notify::EventKind::Access(_)) {
                    return;
                }
                let touches_config = event.paths.is_empty()
                    || event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if touches_config {
                    let _ = tx.send(());
                }
            }) {
                Ok(w) => w,
                Err(e) => {
                    warn!(error = %e, "failed to initialize config watcher");
                    return None;
                }
            };

        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(path = %dir.display(), error = %e, "failed to watch config dir");
            return None;
        }

        info!(path = %path.display(), "watching config");
        let task = rt.spawn(run(path, guard, rx));
        Some(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher").finish_non_exhaustive()
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(path: PathBuf, guard: Arc<Mutex<SessionGuard>>, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(DEBOUNCE).await;
        while rx.try_recv().is_ok() {}
        reload(&path, &guard);
    }
}

/// Read the config file and apply its idle settings. A missing, half
/// written or invalid file leaves the running settings untouched.
pub fn reload(path: &Path, guard: &Mutex<SessionGuard>) -> bool {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "config unreadable, keeping current settings");
            return false;
        }
    };
    let config: Config = match serde_json::from_str(&contents) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, keeping current settings");
            return false;
        }
    };
    if let Err(e) = config.idle.validate() {
        warn!(path = %path.display(), error = %e, "invalid idle config, keeping current settings");
        return false;
    }
    match guard.lock() {
        Ok(mut guard) => {
            guard.reconfigure_idle(config.idle);
            true
        }
        Err(_) => false,
    }
}
