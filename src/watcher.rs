//! Filesystem watching for auto-ingestion.
//!
//! One recursive `notify` watcher per project root. Raw notifications are
//! debounced per path (a burst of writes to one file collapses into one
//! event) and a file must settle (stable size and mtime) before it is
//! reported, so half-written files are never ingested. Dotfiles, unsupported
//! extensions, and paths deeper than the configured limit are dropped at the
//! source.
//!
//! Watching a root also performs an initial scan so files that existed
//! before the watch started are reported once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use crate::parser;

/// How a watched file came to our attention. `Added` covers initial-scan
/// hits and filesystem creates; consumers use it to skip paths a document
/// already tracks. `Changed` always warrants re-ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Changed,
}

/// A settled file under a watched project root, ready to ingest.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub project_id: String,
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

type DebounceMap = Arc<Mutex<HashMap<PathBuf, (JoinHandle<()>, WatchEventKind)>>>;

struct WatchHandle {
    /// Dropping the watcher releases the OS-level watches.
    _watcher: RecommendedWatcher,
    forwarder: JoinHandle<()>,
    pending: DebounceMap,
}

impl WatchHandle {
    fn stop(self) {
        self.forwarder.abort();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, (task, _)) in pending.drain() {
            task.abort();
        }
    }
}

/// Registry of active per-project watchers.
pub struct WatcherManager {
    config: WatcherConfig,
    watchers: Mutex<HashMap<String, WatchHandle>>,
}

impl WatcherManager {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching a project root. Settled events land on `events`.
    ///
    /// A project has at most one active watch; starting a new one replaces
    /// (stops) any existing watch for that project.
    pub async fn watch_project(
        &self,
        project_id: &str,
        root: &Path,
        events: mpsc::Sender<WatchEvent>,
    ) -> Result<()> {
        if !root.is_dir() {
            return Err(Error::Configuration(format!(
                "watch root {} is not a directory",
                root.display()
            )));
        }
        self.unwatch_project(project_id);

        // notify's callback runs on its own thread; bridge into tokio with a
        // bounded channel. A full channel drops raw events, which is fine:
        // the debounce layer only needs to see one event per burst.
        let (raw_tx, raw_rx) = mpsc::channel::<(PathBuf, WatchEventKind)>(256);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            let kind = match event.kind {
                EventKind::Create(_) => WatchEventKind::Added,
                EventKind::Modify(_) => WatchEventKind::Changed,
                _ => return,
            };
            for path in event.paths {
                if raw_tx.blocking_send((path, kind)).is_err() {
                    return;
                }
            }
        })
        .map_err(|e| Error::Configuration(format!("failed to create watcher: {}", e)))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::Configuration(format!("failed to watch {}: {}", root.display(), e)))?;

        let pending: DebounceMap = Arc::new(Mutex::new(HashMap::new()));
        let forwarder = tokio::spawn(forward_events(
            self.config.clone(),
            project_id.to_string(),
            root.to_path_buf(),
            raw_rx,
            events.clone(),
            Arc::clone(&pending),
        ));

        let handle = WatchHandle {
            _watcher: watcher,
            forwarder,
            pending,
        };
        {
            let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
            watchers.insert(project_id.to_string(), handle);
        }

        initial_scan(project_id, root, self.config.max_depth, events).await;

        info!(project_id, root = %root.display(), "watching project root");
        Ok(())
    }

    /// Stop watching a project. Returns false when no watch was active.
    pub fn unwatch_project(&self, project_id: &str) -> bool {
        let handle = {
            let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
            watchers.remove(project_id)
        };
        match handle {
            Some(handle) => {
                handle.stop();
                info!(project_id, "stopped watching project");
                true
            }
            None => false,
        }
    }

    pub fn active_projects(&self) -> Vec<String> {
        let watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.keys().cloned().collect()
    }

    /// Stop every watch. Used at shutdown.
    pub fn stop_all(&self) {
        let handles: Vec<WatchHandle> = {
            let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
            watchers.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.stop();
        }
    }
}

/// Report every supported file already under the root. Hidden entries below
/// the root are pruned, subtrees included.
async fn initial_scan(
    project_id: &str,
    root: &Path,
    max_depth: usize,
    events: mpsc::Sender<WatchEvent>,
) {
    let mut reported = 0usize;
    for entry in WalkDir::new(root)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !parser::is_hidden_name(e.file_name()))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() || !parser::is_supported_file(entry.path()) {
            continue;
        }
        let event = WatchEvent {
            project_id: project_id.to_string(),
            path: entry.path().to_path_buf(),
            kind: WatchEventKind::Added,
        };
        if events.send(event).await.is_err() {
            return;
        }
        reported += 1;
    }
    debug!(project_id, reported, "initial scan complete");
}

/// Consume raw notifications, debounce per path, and emit settled events.
async fn forward_events(
    config: WatcherConfig,
    project_id: String,
    root: PathBuf,
    mut raw_rx: mpsc::Receiver<(PathBuf, WatchEventKind)>,
    events: mpsc::Sender<WatchEvent>,
    pending: DebounceMap,
) {
    let debounce = Duration::from_millis(config.debounce_ms);
    let settle = Duration::from_millis(config.settle_ms);

    while let Some((path, kind)) = raw_rx.recv().await {
        if !parser::is_supported_file(&path) || hidden_below(&root, &path) {
            continue;
        }
        if depth_below(&root, &path) > config.max_depth {
            debug!(path = %path.display(), "ignoring file beyond depth limit");
            continue;
        }

        // Restart the per-path timer: only the last event of a burst runs.
        // A burst that began with a create stays an add, even though the
        // writes that follow arrive as modifications.
        let kind = {
            let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
            match map.remove(&path) {
                Some((task, prior_kind)) => {
                    task.abort();
                    if prior_kind == WatchEventKind::Added {
                        WatchEventKind::Added
                    } else {
                        kind
                    }
                }
                None => kind,
            }
        };

        let task_path = path.clone();
        let task_project = project_id.clone();
        let task_events = events.clone();
        let task_pending = Arc::clone(&pending);
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if wait_until_settled(&task_path, settle).await {
                let _ = task_events
                    .send(WatchEvent {
                        project_id: task_project,
                        path: task_path.clone(),
                        kind,
                    })
                    .await;
            } else {
                warn!(path = %task_path.display(), "file never settled, skipping");
            }
            let mut map = task_pending.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&task_path);
        });

        let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(path, (task, kind));
    }
}

fn depth_below(root: &Path, path: &Path) -> usize {
    path.strip_prefix(root)
        .map(|rel| rel.components().count())
        .unwrap_or(usize::MAX)
}

/// True when any component below the root is hidden. The root itself may
/// live under hidden ancestors; only the watched subtree is judged.
fn hidden_below(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| rel.components().any(|c| parser::is_hidden_name(c.as_os_str())))
        .unwrap_or(false)
}

/// True once two consecutive stats of the file agree on size and mtime.
/// Gives up after a bounded number of rounds or when the file disappears.
async fn wait_until_settled(path: &Path, settle: Duration) -> bool {
    const MAX_ROUNDS: usize = 20;

    for _ in 0..MAX_ROUNDS {
        let Ok(before) = tokio::fs::metadata(path).await else {
            return false;
        };
        let sig_before = (before.len(), before.modified().ok());

        tokio::time::sleep(settle).await;

        let Ok(after) = tokio::fs::metadata(path).await else {
            return false;
        };
        if (after.len(), after.modified().ok()) == sig_before {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            debounce_ms: 100,
            settle_ms: 50,
            max_depth: 10,
        }
    }

    async fn expect_event(rx: &mut mpsc::Receiver<WatchEvent>) -> WatchEvent {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for watch event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn initial_scan_reports_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("existing.txt"), "hello").unwrap();
        std::fs::write(tmp.path().join(".hidden.txt"), "nope").unwrap();
        std::fs::create_dir(tmp.path().join(".cache")).unwrap();
        std::fs::write(tmp.path().join(".cache/inner.txt"), "nope").unwrap();

        let manager = WatcherManager::new(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        manager.watch_project("p1", tmp.path(), tx).await.unwrap();

        let event = expect_event(&mut rx).await;
        assert_eq!(event.project_id, "p1");
        assert!(event.path.ends_with("existing.txt"));
        assert_eq!(event.kind, WatchEventKind::Added);
        assert!(rx.try_recv().is_err());

        manager.stop_all();
    }

    #[tokio::test]
    async fn reports_new_file_after_settle() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WatcherManager::new(fast_config());
        let (tx, mut rx) = mpsc::channel(16);
        manager.watch_project("p1", tmp.path(), tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(tmp.path().join("new.md"), "# new").unwrap();

        let event = expect_event(&mut rx).await;
        assert!(event.path.ends_with("new.md"));
        assert_eq!(event.kind, WatchEventKind::Added);

        manager.stop_all();
    }

    #[tokio::test]
    async fn duplicate_watch_replaces_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WatcherManager::new(fast_config());
        let (tx, _rx) = mpsc::channel(16);

        manager
            .watch_project("p1", tmp.path(), tx.clone())
            .await
            .unwrap();
        manager.watch_project("p1", tmp.path(), tx).await.unwrap();
        assert_eq!(manager.active_projects(), vec!["p1".to_string()]);

        assert!(manager.unwatch_project("p1"));
        assert!(!manager.unwatch_project("p1"));
    }

    #[tokio::test]
    async fn missing_root_is_rejected() {
        let manager = WatcherManager::new(fast_config());
        let (tx, _rx) = mpsc::channel(16);
        let err = manager
            .watch_project("p1", Path::new("/nonexistent/root"), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn depth_is_relative_to_root() {
        let root = Path::new("/srv/data");
        assert_eq!(depth_below(root, Path::new("/srv/data/a.txt")), 1);
        assert_eq!(depth_below(root, Path::new("/srv/data/x/y/a.txt")), 3);
        assert_eq!(depth_below(root, Path::new("/elsewhere/a.txt")), usize::MAX);
    }

    #[test]
    fn hidden_components_are_relative_to_root() {
        let root = Path::new("/home/u/.config/docs");
        assert!(hidden_below(root, Path::new("/home/u/.config/docs/.cache/a.txt")));
        assert!(hidden_below(root, Path::new("/home/u/.config/docs/x/.y/a.txt")));
        // Hidden ancestors of the root itself do not count.
        assert!(!hidden_below(root, Path::new("/home/u/.config/docs/x/a.txt")));
        assert!(!hidden_below(root, Path::new("/elsewhere/.cache/a.txt")));
    }
}
