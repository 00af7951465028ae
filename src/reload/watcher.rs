//! File system watcher that reloads rules when the rules file changes.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ConfigStore;
use crate::error::{Result, TurnstileError};

/// Watches a `ConfigStore`'s backing file and reloads it on change.
///
/// The parent directory is watched rather than the file itself, so editors
/// that save by writing a temp file and renaming it over the original are
/// picked up. Only events naming the rules file itself count. Bursts of
/// events collapse into a single reload: at most one reload is queued at a
/// time, and a short debounce lets the burst settle before the file is read.
pub struct ConfigWatcher {
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
    target: PathBuf,
}

impl ConfigWatcher {
    /// Start watching `store`'s file. Must be called within a Tokio runtime.
    pub fn start(store: Arc<ConfigStore>, debounce: Duration) -> Result<Self> {
        let target = watch_target(store.path())?;
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                TurnstileError::Config(format!("{} has no parent directory", target.display()))
            })?;

        // Capacity 1: a full channel means a reload is already pending.
        let (tx, rx) = mpsc::channel::<()>(1);

        let filter = target.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_relevant(&event, &filter) {
                    debug!(kind = ?event.kind, "Rules file changed");
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "Rules file watch error"),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let task = tokio::spawn(coalesce(rx, debounce, move || {
            let store = store.clone();
            async move {
                if let Err(e) = tokio::task::spawn_blocking(move || store.reload()).await {
                    error!(error = %e, "Rules reload task failed");
                }
            }
        }));

        info!(path = %target.display(), "Watching rate limit rules for changes");

        Ok(Self {
            watcher: Some(watcher),
            task,
            target,
        })
    }

    /// The absolute path being watched.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Stop watching and wait for the reload task to finish.
    pub async fn stop(mut self) {
        drop(self.watcher.take());
        self.task.abort();
        let _ = (&mut self.task).await;
        info!(path = %self.target.display(), "Stopped watching rate limit rules");
    }
}

/// Run `reload` once per burst of change signals.
///
/// After the first signal of a burst, waits `debounce` and then discards
/// every signal that arrived meanwhile before reloading. Returns when all
/// senders are gone.
async fn coalesce<F, Fut>(mut rx: mpsc::Receiver<()>, debounce: Duration, mut reload: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    while rx.recv().await.is_some() {
        tokio::time::sleep(debounce).await;
        while rx.try_recv().is_ok() {}
        reload().await;
    }
    debug!("Rules watcher channel closed");
}

/// Absolute path of the rules file, with its directory canonicalized so it
/// compares equal to the paths the OS reports.
fn watch_target(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| TurnstileError::Config(format!("{} is not a file path", path.display())))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok(dir.canonicalize()?.join(file_name))
}

fn is_relevant(event: &Event, target: &Path) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_)
    );
    kind_matches && event.paths.iter().any(|p| p == target)
}
