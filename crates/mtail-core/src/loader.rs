//! Program directory loader.
//!
//! Owns the set of loaded programs. Each successful (re)compile starts a
//! fresh VM and hands it to the fan-out as `Control::Attach`; attaching
//! under an existing name replaces the old VM. A failed compile or a metric
//! conflict leaves the running program untouched. Removing a program file
//! sends `Control::Detach`; its metrics stay in the store.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use thiserror::Error;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::compiler::{CompileError, Program, compile};
use crate::metrics::{MetricError, MetricStore};
use crate::vm::{self, QueuePolicy, Vm, VmHandle};
use crate::watcher::{ChangeKind, WatchEvent, Watcher};

/// File extension of program files.
pub const PROGRAM_EXTENSION: &str = "mtail";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{name}: {} compile error(s)", .errors.len())]
    Compile {
        name: String,
        errors: Vec<CompileError>,
    },
    #[error("{name}: {source}")]
    Conflict {
        name: String,
        #[source]
        source: MetricError,
    },
    #[error("{name}: source unchanged since it was rejected")]
    Rejected { name: String },
    #[error("{name}: cannot start vm: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Change to the live VM set, applied by the fan-out thread.
pub enum Control {
    /// Add a VM, replacing any VM of the same name.
    Attach(VmHandle),
    /// Stop the VM of this name.
    Detach(String),
}

/// Outcome of scanning the program directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Program files found.
    pub programs: usize,
    /// Programs (re)started by this scan.
    pub loaded: usize,
    /// Programs that failed to compile or to register their metrics.
    pub failed: usize,
}

struct Loaded {
    digest: u64,
    program: Arc<Program>,
}

pub struct Loader {
    dir: PathBuf,
    store: Arc<MetricStore>,
    policy: QueuePolicy,
    control: Sender<Control>,
    loaded: HashMap<String, Loaded>,
    /// Digest of the last rejected source per program, so a periodic rescan
    /// does not report the same failure again.
    rejected: HashMap<String, u64>,
}

impl Loader {
    pub fn new(
        dir: impl Into<PathBuf>,
        store: Arc<MetricStore>,
        policy: QueuePolicy,
        control: Sender<Control>,
    ) -> Self {
        let dir = dir.into();
        let dir = fs::canonicalize(&dir).unwrap_or(dir);
        Self {
            dir,
            store,
            policy,
            control,
            loaded: HashMap::new(),
            rejected: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Currently running version of program `name`.
    pub fn program(&self, name: &str) -> Option<Arc<Program>> {
        self.loaded.get(name).map(|l| Arc::clone(&l.program))
    }

    /// Names of running programs, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load every program in the directory and unload programs whose file
    /// is gone.
    pub fn load_all(&mut self) -> Result<LoadSummary, LoadError> {
        let paths = list_programs(&self.dir).map_err(|source| LoadError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut summary = LoadSummary {
            programs: paths.len(),
            ..LoadSummary::default()
        };
        let mut present = Vec::with_capacity(paths.len());
        for path in &paths {
            present.push(program_name(path));
            match self.load_program(path) {
                Ok(true) => summary.loaded += 1,
                Ok(false) => {}
                Err(LoadError::Io { path, source }) => {
                    warn!(path = %path.display(), error = %source, "cannot read program");
                    summary.failed += 1;
                }
                Err(_) => summary.failed += 1,
            }
        }

        let gone: Vec<String> = self
            .loaded
            .keys()
            .filter(|name| !present.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            self.unload_program(&name);
        }
        self.rejected.retain(|name, _| present.contains(name));
        Ok(summary)
    }

    /// Compile `path` and start it, replacing a running version.
    ///
    /// Returns `Ok(false)` when the source is unchanged since the last
    /// attempt. On any error the running version, if any, keeps running.
    pub fn load_program(&mut self, path: &Path) -> Result<bool, LoadError> {
        let name = program_name(path);
        let source = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let digest = xxh3_64(source.as_bytes());

        if self.loaded.get(&name).is_some_and(|l| l.digest == digest) {
            debug!(program = %name, "program unchanged");
            return Ok(false);
        }
        if self.rejected.get(&name) == Some(&digest) {
            return Err(LoadError::Rejected { name });
        }

        match self.start(&name, &source) {
            Ok(program) => {
                self.rejected.remove(&name);
                let replaced = self
                    .loaded
                    .insert(name.clone(), Loaded { digest, program })
                    .is_some();
                if replaced {
                    info!(program = %name, "program reloaded");
                } else {
                    info!(program = %name, "program loaded");
                }
                Ok(true)
            }
            Err(err) => {
                self.rejected.insert(name.clone(), digest);
                if let LoadError::Compile { errors, .. } = &err {
                    for error in errors {
                        warn!(program = %name, "{error}");
                    }
                }
                let keeping = self.loaded.contains_key(&name);
                warn!(program = %name, error = %err, keeping_previous = keeping, "program rejected");
                Err(err)
            }
        }
    }

    fn start(&self, name: &str, source: &str) -> Result<Arc<Program>, LoadError> {
        let program = compile(name, source).map_err(|errors| LoadError::Compile {
            name: name.to_string(),
            errors,
        })?;
        let program = Arc::new(program);
        let vm = Vm::new(Arc::clone(&program), &self.store).map_err(|source| {
            LoadError::Conflict {
                name: name.to_string(),
                source,
            }
        })?;
        let handle = vm::spawn(vm, self.policy).map_err(|source| LoadError::Spawn {
            name: name.to_string(),
            source,
        })?;
        if self.control.send(Control::Attach(handle)).is_err() {
            debug!(program = %name, "fan-out gone, vm not attached");
        }
        Ok(program)
    }

    /// Stop program `name`. Its metrics are retained.
    pub fn unload_program(&mut self, name: &str) -> bool {
        self.rejected.remove(name);
        if self.loaded.remove(name).is_none() {
            return false;
        }
        info!(program = %name, "program removed");
        let _ = self.control.send(Control::Detach(name.to_string()));
        true
    }

    /// React to a change in the program directory.
    pub fn handle_event(&mut self, event: &WatchEvent) {
        let Some(file_name) = event.path.file_name() else {
            return;
        };
        let path = self.dir.join(file_name);
        if !is_program_file(&path) {
            return;
        }
        match event.kind {
            ChangeKind::Deleted => {
                self.unload_program(&program_name(&path));
            }
            ChangeKind::Created | ChangeKind::Modified | ChangeKind::Moved => {
                if path.is_file() {
                    // Errors are already logged by load_program.
                    let _ = self.load_program(&path);
                } else {
                    self.unload_program(&program_name(&path));
                }
            }
        }
    }

    /// Start the loader thread: directory events plus a periodic rescan,
    /// until `shutdown` disconnects.
    pub fn spawn(
        mut self,
        mut watcher: impl Watcher + 'static,
        shutdown: Receiver<()>,
        rescan: Duration,
    ) -> io::Result<JoinHandle<()>> {
        if let Err(e) = watcher.watch(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "cannot watch program directory, relying on rescans");
        }
        thread::Builder::new()
            .name("loader".to_string())
            .spawn(move || {
                let events = watcher.events();
                let ticker = crossbeam_channel::tick(rescan);
                loop {
                    select! {
                        recv(shutdown) -> _ => break,
                        recv(events) -> event => match event {
                            Ok(event) => self.handle_event(&event),
                            Err(_) => break,
                        },
                        recv(ticker) -> _ => {
                            if let Err(e) = self.load_all() {
                                warn!(error = %e, "program rescan failed");
                            }
                        }
                    }
                }
                debug!("loader stopped");
            })
    }
}

/// Programs compiled by `compile_dir`, with the failures.
#[derive(Debug, Default)]
pub struct CompileReport {
    pub programs: Vec<Program>,
    pub failures: Vec<(String, Vec<CompileError>)>,
}

/// Compile every program in `dir` without starting anything.
pub fn compile_dir(dir: &Path) -> Result<CompileReport, LoadError> {
    let paths = list_programs(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut report = CompileReport::default();
    for path in paths {
        let name = program_name(&path);
        let source = fs::read_to_string(&path).map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;
        match compile(&name, &source) {
            Ok(program) => report.programs.push(program),
            Err(errors) => {
                for error in &errors {
                    warn!(program = %name, "{error}");
                }
                report.failures.push((name, errors));
            }
        }
    }
    Ok(report)
}

fn program_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_program_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'));
    !hidden && path.extension().is_some_and(|ext| ext == PROGRAM_EXTENSION)
}

/// Program files directly inside `dir`, sorted by name.
fn list_programs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_program_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::LogLine;

    struct Harness {
        dir: tempfile::TempDir,
        store: Arc<MetricStore>,
        loader: Loader,
        control: Receiver<Control>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetricStore::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let loader = Loader::new(dir.path(), Arc::clone(&store), QueuePolicy::Unbounded, tx);
        Harness {
            dir,
            store,
            loader,
            control: rx,
        }
    }

    impl Harness {
        fn write(&self, name: &str, source: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, source).unwrap();
            path
        }

        /// Drain control messages: names attached (VMs are fed `lines`, then
        /// retired) and names detached.
        fn drain(&self, lines: &[&str]) -> (Vec<String>, Vec<String>) {
            let mut attached = Vec::new();
            let mut detached = Vec::new();
            for msg in self.control.try_iter() {
                match msg {
                    Control::Attach(mut handle) => {
                        for (i, text) in lines.iter().enumerate() {
                            let line = LogLine::new(*text, Arc::from(Path::new("t.log")), i as u64 + 1);
                            handle.deliver(&Arc::new(line));
                        }
                        attached.push(handle.name().to_string());
                        handle.retire();
                    }
                    Control::Detach(name) => detached.push(name),
                }
            }
            (attached, detached)
        }
    }

    #[test]
    fn test_load_all_counts_and_ignores_other_files() {
        let mut h = harness();
        h.write("good.mtail", "counter a\n/a/ { a++ }");
        h.write("bad.mtail", "counter b\n/b/ { b = }");
        h.write("notes.txt", "not a program");
        h.write(".hidden.mtail", "counter h");

        let summary = h.loader.load_all().unwrap();
        assert_eq!(
            summary,
            LoadSummary {
                programs: 2,
                loaded: 1,
                failed: 1,
            }
        );
        assert_eq!(h.loader.names(), vec!["good.mtail".to_string()]);
        let (attached, _) = h.drain(&[]);
        assert_eq!(attached, vec!["good.mtail"]);
    }

    #[test]
    fn test_deeply_nested_program_does_not_block_siblings() {
        let mut h = harness();
        let deep = format!("gauge g\n/x/ {{ g = {}1{} }}", "(".repeat(10_000), ")".repeat(10_000));
        h.write("deep.mtail", &deep);
        h.write("ok.mtail", "counter ok\n/a/ { ok++ }");

        let summary = h.loader.load_all().unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(h.loader.names(), vec!["ok.mtail".to_string()]);
        h.drain(&["a"]);
        assert_eq!(h.store.snapshot().scalar("ok", &[]), Some(1.0));
    }

    #[test]
    fn test_unchanged_source_is_not_reloaded() {
        let mut h = harness();
        let path = h.write("p.mtail", "counter a\n/a/ { a++ }");
        assert!(h.loader.load_program(&path).unwrap());
        assert!(!h.loader.load_program(&path).unwrap());
        assert_eq!(h.loader.load_all().unwrap().loaded, 0);
        let (attached, _) = h.drain(&[]);
        assert_eq!(attached.len(), 1);
    }

    #[test]
    fn test_bad_edit_keeps_previous_program() {
        let mut h = harness();
        let path = h.write("p.mtail", "counter hits\n/hit/ { hits++ }");
        h.loader.load_program(&path).unwrap();
        let (attached, _) = h.drain(&["hit", "hit"]);
        assert_eq!(attached.len(), 1);
        assert_eq!(h.store.snapshot().scalar("hits", &[]), Some(2.0));

        h.write("p.mtail", "counter hits\n/hit/ { hits++ ");
        let err = h.loader.load_program(&path).unwrap_err();
        assert!(matches!(err, LoadError::Compile { ref errors, .. } if !errors.is_empty()));

        let running = h.loader.program("p.mtail").unwrap();
        assert_eq!(running.source(), "counter hits\n/hit/ { hits++ }");
        let (attached, detached) = h.drain(&[]);
        assert!(attached.is_empty() && detached.is_empty());
        assert_eq!(h.store.snapshot().scalar("hits", &[]), Some(2.0));

        // The same broken source is not re-reported on rescan.
        assert_eq!(h.loader.load_all().unwrap().failed, 1);
    }

    #[test]
    fn test_good_edit_replaces_program() {
        let mut h = harness();
        let path = h.write("p.mtail", "counter a\n/a/ { a++ }");
        h.loader.load_program(&path).unwrap();
        h.write("p.mtail", "counter a\n/b/ { a++ }");
        assert!(h.loader.load_program(&path).unwrap());

        let (attached, _) = h.drain(&["a", "b", "b"]);
        assert_eq!(attached, vec!["p.mtail", "p.mtail"]);
        assert!(h.loader.program("p.mtail").unwrap().source().contains("/b/"));
    }

    #[test]
    fn test_conflicting_program_is_rejected() {
        let mut h = harness();
        let first = h.write("a.mtail", "counter shared\n/x/ { shared++ }");
        let second = h.write("b.mtail", "gauge shared\n/x/ { shared = 1 }");
        h.loader.load_program(&first).unwrap();
        let err = h.loader.load_program(&second).unwrap_err();
        assert!(matches!(err, LoadError::Conflict { .. }));
        assert_eq!(h.loader.names(), vec!["a.mtail".to_string()]);
    }

    #[test]
    fn test_removal_detaches_and_retains_metrics() {
        let mut h = harness();
        let path = h.write("p.mtail", "counter kept\n/k/ { kept++ }");
        h.loader.load_program(&path).unwrap();
        h.drain(&["k"]);

        fs::remove_file(&path).unwrap();
        h.loader.handle_event(&WatchEvent::new(&path, ChangeKind::Deleted));
        let (_, detached) = h.drain(&[]);
        assert_eq!(detached, vec!["p.mtail"]);
        assert!(h.loader.program("p.mtail").is_none());
        assert_eq!(h.store.snapshot().scalar("kept", &[]), Some(1.0));
    }

    #[test]
    fn test_rescan_unloads_vanished_programs() {
        let mut h = harness();
        let path = h.write("p.mtail", "counter a\n/a/ { a++ }");
        h.loader.load_all().unwrap();
        fs::remove_file(&path).unwrap();
        h.loader.load_all().unwrap();
        let (_, detached) = h.drain(&[]);
        assert_eq!(detached, vec!["p.mtail"]);
    }

    #[test]
    fn test_events_for_other_files_are_ignored() {
        let mut h = harness();
        let path = h.write("readme.md", "hi");
        h.loader.handle_event(&WatchEvent::new(path, ChangeKind::Created));
        assert!(h.loader.names().is_empty());
        assert!(h.control.try_recv().is_err());
    }

    #[test]
    fn test_compile_dir_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok.mtail"), "counter a\n/a/ { a++ }").unwrap();
        fs::write(dir.path().join("bad1.mtail"), "counter b\n/b/ { c++ }").unwrap();
        fs::write(dir.path().join("bad2.mtail"), "gauge").unwrap();
        let report = compile_dir(dir.path()).unwrap();
        assert_eq!(report.programs.len(), 1);
        let failed: Vec<&str> = report.failures.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, vec!["bad1.mtail", "bad2.mtail"]);
    }

    #[test]
    fn test_compile_dir_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            compile_dir(&dir.path().join("nope")),
            Err(LoadError::Io { .. })
        ));
    }
}
