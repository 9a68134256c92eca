//! mtail-core — extract metrics from growing log files.
//!
//! Provides:
//! - `compiler` — lexer, parser, semantic checks and bytecode generation for
//!   the pattern/action language
//! - `vm` — bytecode interpreter and per-program worker threads
//! - `metrics` — the shared, concurrently updated metric registry
//! - `watcher` — file and directory change notification
//! - `tailer` — rotation-aware line reader for watched files
//! - `loader` — program directory watcher, owns compile/reload/retire
//! - `pipeline` — wires the above into a running service (and one-shot mode)

pub mod compiler;
pub mod line;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod tailer;
pub mod vm;
pub mod watcher;

pub use compiler::{CompileError, Program, compile};
pub use line::LogLine;
pub use metrics::{MetricKind, MetricStore, Snapshot};
pub use pipeline::{OneShotReport, Pipeline, PipelineConfig, PipelineError};
pub use vm::QueuePolicy;
