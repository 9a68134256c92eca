//! File change notification.
//!
//! Tailer and loader consume a stream of `WatchEvent`s from a `Watcher`.
//! `NotifyWatcher` adapts the OS backend chosen by `notify`; `ManualWatcher`
//! lets tests and embedders inject events directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("failed to start file watcher: {0}")]
    Backend(#[from] notify::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    /// Renamed from or to this path.
    Moved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Source of change events for watched directories.
///
/// Directories are watched non-recursively. Consumers watch the parent of
/// each file they care about, so that rename and re-creation are visible.
pub trait Watcher: Send {
    fn watch(&mut self, dir: &Path) -> Result<(), WatchError>;

    /// Event stream. Closed when the watcher is dropped.
    fn events(&self) -> Receiver<WatchEvent>;
}

/// `Watcher` backed by the platform notification API.
pub struct NotifyWatcher {
    inner: RecommendedWatcher,
    events: Receiver<WatchEvent>,
}

impl NotifyWatcher {
    pub fn new() -> Result<Self, WatchError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => forward(&tx, event),
                Err(e) => warn!(error = %e, "file watcher error"),
            }
        })?;
        Ok(Self { inner, events: rx })
    }
}

impl Watcher for NotifyWatcher {
    fn watch(&mut self, dir: &Path) -> Result<(), WatchError> {
        notify::Watcher::watch(&mut self.inner, dir, RecursiveMode::NonRecursive).map_err(
            |source| WatchError::Watch {
                path: dir.to_path_buf(),
                source,
            },
        )
    }

    fn events(&self) -> Receiver<WatchEvent> {
        self.events.clone()
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Moved),
        // chmod/mtime noise
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        _ => None,
    }
}

fn forward(tx: &Sender<WatchEvent>, event: notify::Event) {
    let Some(kind) = classify(&event.kind) else {
        return;
    };
    trace!(kind = ?event.kind, paths = ?event.paths, "raw notify event");
    for path in event.paths {
        // The receiver is gone only during shutdown.
        let _ = tx.send(WatchEvent { path, kind });
    }
}

/// `Watcher` whose events are injected by hand.
#[derive(Clone)]
pub struct ManualWatcher {
    tx: Sender<WatchEvent>,
    rx: Receiver<WatchEvent>,
    watched: Arc<Mutex<Vec<PathBuf>>>,
}

impl ManualWatcher {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            watched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn emit(&self, path: impl Into<PathBuf>, kind: ChangeKind) {
        let _ = self.tx.send(WatchEvent::new(path, kind));
    }

    /// Directories registered through `watch`, in call order.
    pub fn watched(&self) -> Vec<PathBuf> {
        self.watched.lock().clone()
    }
}

impl Default for ManualWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Watcher for ManualWatcher {
    fn watch(&mut self, dir: &Path) -> Result<(), WatchError> {
        self.watched.lock().push(dir.to_path_buf());
        Ok(())
    }

    fn events(&self) -> Receiver<WatchEvent> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};
    use std::time::Duration;

    #[test]
    fn test_classify_event_kinds() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Deleted)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(ChangeKind::Moved)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            None
        );
        assert_eq!(classify(&EventKind::Any), None);
    }

    #[test]
    fn test_forward_emits_one_event_per_path() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/logs/a.log"), PathBuf::from("/logs/a.log.1")],
            attrs: Default::default(),
        };
        forward(&tx, event);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                WatchEvent::new("/logs/a.log", ChangeKind::Moved),
                WatchEvent::new("/logs/a.log.1", ChangeKind::Moved),
            ]
        );
    }

    #[test]
    fn test_manual_watcher_records_and_emits() {
        let mut watcher = ManualWatcher::new();
        watcher.watch(Path::new("/var/log")).unwrap();
        let events = watcher.events();
        watcher.emit("/var/log/app.log", ChangeKind::Created);
        assert_eq!(watcher.watched(), vec![PathBuf::from("/var/log")]);
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            WatchEvent::new("/var/log/app.log", ChangeKind::Created)
        );
    }

    #[test]
    fn test_notify_watcher_sees_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = NotifyWatcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();
        let events = watcher.events();

        let path = dir.path().join("fresh.log");
        std::fs::write(&path, "hello\n").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while std::time::Instant::now() < deadline && !seen {
            if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
                seen = event.path.file_name() == path.file_name();
            }
        }
        assert!(seen, "no event for {}", path.display());
    }
}
