//! Rotation-aware tailing of a set of log files.
//!
//! Threads:
//! - one dispatcher, owning the `Watcher`, routing events to file workers
//! - one worker per file, polling its `FileTailer` on every wake-up and on a
//!   fixed interval, and sending complete lines on the shared line channel
//!
//! All threads exit when the shutdown channel disconnects. Buffered partial
//! lines are discarded at that point.

mod file;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub use file::{FileIdentity, FileTailer, StartAt};

use crate::line::LogLine;
use crate::watcher::{WatchEvent, Watcher};

/// Default interval between polls of a file without change events.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum TailError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn tailer thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct TailerConfig {
    pub poll_interval: Duration,
    /// Position for files that exist at startup. Files that appear later
    /// are always read from the beginning.
    pub start_at: StartAt,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_at: StartAt::End,
        }
    }
}

/// Running set of file workers plus their event dispatcher.
pub struct Tailer {
    threads: Vec<JoinHandle<()>>,
    files: usize,
}

impl Tailer {
    /// Start tailing `paths`.
    ///
    /// A path that does not exist yet is tailed once it appears. Any other
    /// failure to open a configured path is fatal.
    pub fn start(
        paths: &[PathBuf],
        mut watcher: impl Watcher + 'static,
        lines: Sender<Arc<LogLine>>,
        shutdown: Receiver<()>,
        config: TailerConfig,
    ) -> Result<Self, TailError> {
        let mut tailers = Vec::with_capacity(paths.len());
        for path in paths {
            let tailer = match FileTailer::new(path.clone(), config.start_at) {
                Ok(tailer) => tailer,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "log file does not exist yet, waiting for it");
                    FileTailer::pending(path.clone())
                }
                Err(source) => {
                    return Err(TailError::Open {
                        path: path.clone(),
                        source,
                    });
                }
            };
            tailers.push(tailer);
        }

        let dirs: BTreeSet<PathBuf> = paths.iter().map(|p| parent_dir(p)).collect();
        for dir in &dirs {
            if let Err(e) = watcher.watch(dir) {
                warn!(dir = %dir.display(), error = %e, "cannot watch directory, relying on polling");
            }
        }

        let mut threads = Vec::with_capacity(tailers.len() + 1);
        let mut routes = HashMap::with_capacity(tailers.len());
        for tailer in tailers {
            let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
            routes.insert(route_key(tailer.path()), wake_tx);
            let name = format!(
                "tail-{}",
                tailer.path().file_name().map_or_else(
                    || tailer.path().display().to_string(),
                    |n| n.to_string_lossy().into_owned()
                )
            );
            let lines = lines.clone();
            let shutdown = shutdown.clone();
            let interval = config.poll_interval;
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || run_file(tailer, wake_rx, lines, shutdown, interval))
                .map_err(TailError::Spawn)?;
            threads.push(handle);
        }

        let files = routes.len();
        let events = watcher.events();
        let dispatcher = thread::Builder::new()
            .name("tail-dispatch".to_string())
            .spawn(move || {
                // The watcher lives as long as the dispatcher.
                let _watcher = watcher;
                dispatch(events, routes, shutdown);
            })
            .map_err(TailError::Spawn)?;
        threads.push(dispatcher);

        info!(files, dirs = dirs.len(), "tailer started");
        Ok(Self { threads, files })
    }

    pub fn files(&self) -> usize {
        self.files
    }

    /// Wait for every tailer thread. Call after the shutdown channel has
    /// been disconnected.
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                warn!("tailer thread panicked");
            }
        }
    }
}

/// Read `path` from the beginning to end of file once, including a final
/// unterminated line. Returns the number of lines emitted.
pub fn read_file(path: &Path, emit: impl FnMut(LogLine)) -> Result<u64, TailError> {
    let mut tailer = FileTailer::new(path.to_path_buf(), StartAt::Beginning).map_err(|source| {
        TailError::Open {
            path: path.to_path_buf(),
            source,
        }
    })?;
    tailer.finish(emit).map_err(|source| TailError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf())
}

/// Key under which events for `path` are routed: canonical parent directory
/// joined with the file name, so relative and symlinked paths match what
/// the watcher reports.
fn route_key(path: &Path) -> PathBuf {
    match path.file_name() {
        Some(name) => parent_dir(path).join(name),
        None => path.to_path_buf(),
    }
}

fn dispatch(
    events: Receiver<WatchEvent>,
    routes: HashMap<PathBuf, Sender<()>>,
    shutdown: Receiver<()>,
) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(events) -> event => {
                let Ok(event) = event else { break };
                if let Some(wake) = routes.get(&route_key(&event.path)) {
                    trace!(path = %event.path.display(), kind = ?event.kind, "wake tailer");
                    // A full slot means a wake-up is already pending.
                    let _ = wake.try_send(());
                }
            }
        }
    }
    debug!("tail dispatcher stopped");
}

fn run_file(
    mut tailer: FileTailer,
    wake: Receiver<()>,
    lines: Sender<Arc<LogLine>>,
    shutdown: Receiver<()>,
    interval: Duration,
) {
    let ticker = crossbeam_channel::tick(interval);
    let mut open = true;
    while open {
        match tailer.poll(|line| {
            if lines.send(Arc::new(line)).is_err() {
                open = false;
            }
        }) {
            Ok(0) => {}
            Ok(n) => trace!(path = %tailer.path().display(), lines = n, "read lines"),
            // Retried on the next wake-up or tick.
            Err(e) => warn!(path = %tailer.path().display(), error = %e, "read failed"),
        }
        if !open {
            break;
        }
        // A large backlog is read in budget-sized polls, checking for
        // shutdown in between.
        if tailer.has_backlog() {
            if matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected)) {
                break;
            }
            continue;
        }
        select! {
            recv(shutdown) -> _ => break,
            recv(wake) -> msg => {
                if msg.is_err() {
                    break;
                }
            }
            recv(ticker) -> _ => {}
        }
    }
    debug!(path = %tailer.path().display(), "tailer stopped");
}
