//! Wiring of tailer, loader, fan-out and VMs into a running service.
//!
//! ```text
//! Tailer workers ──lines──▶ fan-out ──per-VM queue──▶ VM threads ──▶ MetricStore
//!                              ▲
//! Loader ─────Attach/Detach────┘
//! ```
//!
//! `Pipeline::shutdown` disconnects the shared shutdown channel, joins the
//! tailers and the loader, then lets the fan-out drain the line channel and
//! every VM queue before it returns.

mod fanout;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::loader::{CompileReport, LoadError, Loader, compile_dir};
use crate::metrics::{MetricStore, Snapshot};
use crate::tailer::{self, DEFAULT_POLL_INTERVAL, StartAt, TailError, Tailer, TailerConfig};
use crate::vm::{QueuePolicy, VmStats};
use crate::watcher::{NotifyWatcher, WatchError, Watcher};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no program directory given")]
    NoProgramDir,
    #[error("no log paths given")]
    NoLogPaths,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Tail(#[from] TailError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub program_dir: Option<PathBuf>,
    pub log_paths: Vec<PathBuf>,
    pub queue_policy: QueuePolicy,
    /// File re-poll and program directory rescan interval.
    pub poll_interval: Duration,
    /// Where to start in log files that exist at startup.
    pub start_at: StartAt,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            program_dir: None,
            log_paths: Vec::new(),
            queue_policy: QueuePolicy::Unbounded,
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_at: StartAt::End,
        }
    }
}

impl PipelineConfig {
    /// Startup checks that are fatal for the whole process.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.program_dir.is_none() {
            return Err(PipelineError::NoProgramDir);
        }
        if self.log_paths.is_empty() {
            return Err(PipelineError::NoLogPaths);
        }
        Ok(())
    }
}

/// Per-program VM statistics collected at shutdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub vms: BTreeMap<String, VmStats>,
}

struct Running {
    shutdown: Sender<()>,
    tailer: Tailer,
    loader: JoinHandle<()>,
    fanout: JoinHandle<BTreeMap<String, VmStats>>,
}

/// A running ingestion pipeline.
pub struct Pipeline {
    store: Arc<MetricStore>,
    running: Mutex<Option<Running>>,
}

impl Pipeline {
    /// Start with platform file watchers.
    pub fn start(config: PipelineConfig, store: Arc<MetricStore>) -> Result<Self, PipelineError> {
        config.validate()?;
        Self::start_with(config, store, NotifyWatcher::new()?, NotifyWatcher::new()?)
    }

    /// Start with the given watchers for log files and for the program
    /// directory.
    pub fn start_with(
        config: PipelineConfig,
        store: Arc<MetricStore>,
        log_watcher: impl Watcher + 'static,
        program_watcher: impl Watcher + 'static,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let program_dir = config.program_dir.clone().ok_or(PipelineError::NoProgramDir)?;

        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let fanout = fanout::spawn(line_rx, control_rx).map_err(|source| PipelineError::Spawn {
            what: "fan-out",
            source,
        })?;

        let mut loader = Loader::new(
            program_dir,
            Arc::clone(&store),
            config.queue_policy,
            control_tx,
        );
        let summary = match loader.load_all() {
            Ok(summary) => summary,
            Err(err) => {
                drop(loader);
                drop(line_tx);
                let _ = fanout.join();
                return Err(err.into());
            }
        };
        info!(
            dir = %loader.dir().display(),
            programs = summary.programs,
            loaded = summary.loaded,
            failed = summary.failed,
            "programs loaded"
        );

        let loader = match loader.spawn(program_watcher, shutdown_rx.clone(), config.poll_interval) {
            Ok(handle) => handle,
            Err(source) => {
                drop(line_tx);
                let _ = fanout.join();
                return Err(PipelineError::Spawn {
                    what: "loader",
                    source,
                });
            }
        };

        let tailer_config = TailerConfig {
            poll_interval: config.poll_interval,
            start_at: config.start_at,
        };
        let tailer = match Tailer::start(
            &config.log_paths,
            log_watcher,
            line_tx,
            shutdown_rx,
            tailer_config,
        ) {
            Ok(tailer) => tailer,
            Err(err) => {
                drop(shutdown_tx);
                let _ = loader.join();
                let _ = fanout.join();
                return Err(err.into());
            }
        };

        Ok(Self {
            store,
            running: Mutex::new(Some(Running {
                shutdown: shutdown_tx,
                tailer,
                loader,
                fanout,
            })),
        })
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop ingestion, drain every queue and stop all workers.
    ///
    /// Returns `None` if the pipeline was already shut down.
    pub fn shutdown(&self) -> Option<ShutdownReport> {
        let running = self.running.lock().take()?;
        info!("pipeline shutting down");

        drop(running.shutdown);
        running.tailer.join();
        if running.loader.join().is_err() {
            warn!("loader thread panicked");
        }
        let vms = match running.fanout.join() {
            Ok(vms) => vms,
            Err(_) => {
                warn!("fan-out thread panicked");
                BTreeMap::new()
            }
        };

        for (name, stats) in &vms {
            info!(
                program = %name,
                lines = stats.lines,
                runtime_errors = stats.runtime_errors,
                dropped = stats.dropped,
                "program stats"
            );
        }
        Some(ShutdownReport { vms })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Result of a one-shot run.
#[derive(Debug, Clone, Serialize)]
pub struct OneShotReport {
    /// Program files found.
    pub programs: usize,
    /// Programs that failed to load.
    pub failures: usize,
    /// Lines read from all files.
    pub lines: u64,
    pub vms: BTreeMap<String, VmStats>,
    pub snapshot: Snapshot,
}

impl OneShotReport {
    /// Every program compiled and loaded.
    pub fn succeeded(&self) -> bool {
        self.failures == 0
    }
}

/// Load every program in `program_dir`, feed each file of `log_paths`
/// from start to end (including a final unterminated line) and return the
/// resulting metrics. VM queues are unbounded, so no line is dropped.
pub fn run_once(
    program_dir: &Path,
    log_paths: &[PathBuf],
    store: Arc<MetricStore>,
) -> Result<OneShotReport, PipelineError> {
    if log_paths.is_empty() {
        return Err(PipelineError::NoLogPaths);
    }

    let (line_tx, line_rx) = crossbeam_channel::unbounded();
    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let fanout = fanout::spawn(line_rx, control_rx).map_err(|source| PipelineError::Spawn {
        what: "fan-out",
        source,
    })?;

    let mut loader = Loader::new(program_dir, Arc::clone(&store), QueuePolicy::Unbounded, control_tx);
    let mut feed = || -> Result<(usize, usize, u64), PipelineError> {
        let summary = loader.load_all()?;
        let mut lines = 0;
        for path in log_paths {
            lines += tailer::read_file(path, |line| {
                let _ = line_tx.send(Arc::new(line));
            })?;
        }
        Ok((summary.programs, summary.failed, lines))
    };
    let fed = feed();

    // Closing both inputs lets the fan-out drain and retire every VM.
    drop(loader);
    drop(line_tx);
    let vms = fanout.join().unwrap_or_else(|_| {
        warn!("fan-out thread panicked");
        BTreeMap::new()
    });

    let (programs, failures, lines) = fed?;
    info!(programs, failures, lines, "one-shot run finished");
    Ok(OneShotReport {
        programs,
        failures,
        lines,
        vms,
        snapshot: store.snapshot(),
    })
}

/// Compile every program in `dir` without running anything.
pub fn compile_only(dir: &Path) -> Result<CompileReport, PipelineError> {
    let report = compile_dir(dir)?;
    info!(
        programs = report.programs.len() + report.failures.len(),
        failures = report.failures.len(),
        "compile-only run finished"
    );
    Ok(report)
}
