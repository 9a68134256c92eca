//! mtaild - extract metrics from application logs.
//!
//! Loads `.mtail` programs from a directory, tails the configured log files
//! and feeds every line to every program. Programs are recompiled and
//! swapped in place when their files change.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use mtail_core::pipeline::{self, ShutdownReport};
use mtail_core::tailer::StartAt;
use mtail_core::{MetricStore, Pipeline, PipelineConfig, PipelineError, QueuePolicy};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("MTAILD_REV"), ")");

/// Extract metrics from application logs.
#[derive(Parser, Debug)]
#[command(name = "mtaild", about = "Extract metrics from application logs", version = VERSION)]
struct Args {
    /// Directory containing `.mtail` programs.
    #[arg(long, value_name = "DIR")]
    progs: Option<PathBuf>,

    /// Log files to tail. Comma separated, may be repeated.
    #[arg(long, value_name = "PATH", value_delimiter = ',')]
    logs: Vec<PathBuf>,

    /// Read every log file to the end once, print the metrics as JSON and exit.
    #[arg(long, conflicts_with_all = ["compile_only", "dump_bytecode"])]
    one_shot: bool,

    /// Compile every program, report errors and exit.
    #[arg(long)]
    compile_only: bool,

    /// Compile every program and print its bytecode.
    #[arg(long)]
    dump_bytecode: bool,

    /// Per-program line queue capacity. Lines beyond it are dropped.
    /// Unbounded when not set.
    #[arg(long, value_name = "LINES")]
    queue_capacity: Option<usize>,

    /// Log file re-poll and program directory rescan interval.
    #[arg(long, default_value = "250", value_name = "MS")]
    poll_interval_ms: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn queue_policy(&self) -> QueuePolicy {
        match self.queue_capacity {
            Some(capacity) => QueuePolicy::Bounded { capacity },
            None => QueuePolicy::Unbounded,
        }
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            program_dir: self.progs.clone(),
            log_paths: self.logs.clone(),
            queue_policy: self.queue_policy(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            start_at: StartAt::End,
        }
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
/// Logs go to stderr; stdout is reserved for one-shot and dump output.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["mtaild", "mtail_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Failure count as a process status, capped at 255.
fn failure_status(failures: usize) -> u8 {
    failures.min(255) as u8
}

fn exit_status(failures: usize) -> ExitCode {
    ExitCode::from(failure_status(failures))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("mtaild {VERSION} starting");

    if args.compile_only || args.dump_bytecode {
        let Some(dir) = args.progs.as_deref() else {
            error!("{}", PipelineError::NoProgramDir);
            return ExitCode::FAILURE;
        };
        return compile_programs(dir, args.dump_bytecode);
    }

    let config = args.pipeline_config();
    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    info!(
        progs = %config.program_dir.as_deref().unwrap_or(Path::new("")).display(),
        logs = config.log_paths.len(),
        queue = ?config.queue_policy,
        poll_ms = config.poll_interval.as_millis() as u64,
        "config"
    );

    if args.one_shot {
        one_shot(&config)
    } else {
        serve(config)
    }
}

fn compile_programs(dir: &Path, dump: bool) -> ExitCode {
    let report = match pipeline::compile_only(dir) {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    for (name, errors) in &report.failures {
        for e in errors {
            eprintln!("{name}:{e}");
        }
    }
    if dump {
        for program in &report.programs {
            println!("{}", program.disassemble());
        }
    }
    info!(
        compiled = report.programs.len(),
        failed = report.failures.len(),
        "programs checked"
    );
    exit_status(report.failures.len())
}

fn one_shot(config: &PipelineConfig) -> ExitCode {
    let Some(dir) = config.program_dir.as_deref() else {
        return ExitCode::FAILURE;
    };
    let store = Arc::new(MetricStore::new());
    let report = match pipeline::run_once(dir, &config.log_paths, store) {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&report.snapshot) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!("failed to render snapshot: {e}");
            return ExitCode::FAILURE;
        }
    }
    if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        exit_status(report.failures)
    }
}

fn serve(config: PipelineConfig) -> ExitCode {
    let store = Arc::new(MetricStore::new());
    let pipeline = match Pipeline::start(config, store) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    info!("Tailing logs");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Shutting down...");
    if let Some(report) = pipeline.shutdown() {
        log_summary(&report, pipeline.snapshot().metrics.len());
    }
    info!("Shutdown complete");
    ExitCode::SUCCESS
}

fn log_summary(report: &ShutdownReport, metrics: usize) {
    let lines: u64 = report.vms.values().map(|s| s.lines).sum();
    let errors: u64 = report.vms.values().map(|s| s.runtime_errors).sum();
    let dropped: u64 = report.vms.values().map(|s| s.dropped).sum();
    info!(
        programs = report.vms.len(),
        metrics,
        lines,
        runtime_errors = errors,
        dropped,
        "summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_are_comma_separated_and_repeatable() {
        let args = Args::parse_from([
            "mtaild",
            "--progs",
            "/etc/mtail",
            "--logs",
            "/var/log/a.log,/var/log/b.log",
            "--logs",
            "/var/log/c.log",
        ]);
        assert_eq!(
            args.logs,
            vec![
                PathBuf::from("/var/log/a.log"),
                PathBuf::from("/var/log/b.log"),
                PathBuf::from("/var/log/c.log"),
            ]
        );
        let config = args.pipeline_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_policy, QueuePolicy::Unbounded);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_queue_capacity_selects_bounded_policy() {
        let args = Args::parse_from(["mtaild", "--queue-capacity", "64", "--poll-interval-ms", "10"]);
        let config = args.pipeline_config();
        assert_eq!(config.queue_policy, QueuePolicy::Bounded { capacity: 64 });
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert!(matches!(config.validate(), Err(PipelineError::NoProgramDir)));
    }

    #[test]
    fn test_one_shot_conflicts_with_compile_only() {
        let result = Args::try_parse_from(["mtaild", "--one-shot", "--compile-only"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_version_names_package_and_revision() {
        assert!(VERSION.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(VERSION.ends_with(')'));
        assert!(!env!("MTAILD_REV").is_empty());
    }

    #[test]
    fn test_failure_status_is_capped() {
        assert_eq!(failure_status(0), 0);
        assert_eq!(failure_status(3), 3);
        assert_eq!(failure_status(1000), 255);
    }

    #[test]
    fn test_compile_only_reports_each_broken_program() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.mtail"), "counter a\n/a/ { a++ }").unwrap();
        std::fs::write(dir.path().join("bad.mtail"), "counter b\n/b/ { c++ }").unwrap();
        let report = pipeline::compile_only(dir.path()).unwrap();
        assert_eq!(failure_status(report.failures.len()), 1);
        assert_eq!(report.programs[0].name(), "ok.mtail");
    }
}
