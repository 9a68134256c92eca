//! Bytecode interpreter.
//!
//! A `Vm` runs one `Program` against one line at a time. Execution is
//! deterministic: the same program and line always produce the same metric
//! updates. Runtime faults never escape `process`; they are logged, counted
//! and abandon only the enclosing fallible region (see `Instruction::Recover`).

mod worker;

use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::compiler::ast::CmpOp;
use crate::compiler::{Instruction, Program};
use crate::line::LogLine;
use crate::metrics::{Metric, MetricError, MetricOp, MetricStore};

pub use worker::{ClosedVm, Delivery, QueuePolicy, VmHandle, spawn};

/// Per-line execution fault.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("capture ${group} (frame {frame}) did not participate in the match")]
    CaptureUnset { frame: usize, group: usize },
    #[error("value {0:?} is not numeric")]
    NotNumeric(String),
    #[error("malformed bytecode at {pc}: {reason}")]
    Bytecode { pc: usize, reason: &'static str },
    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// Operand stack value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Str(String),
    Bool(bool),
    /// Handle to one series, produced by `Fetch`.
    Series { metric: usize, labels: Vec<String> },
}

impl Value {
    fn to_number(&self) -> Result<f64, RuntimeError> {
        match self {
            Value::Number(n) => Ok(*n),
            // `parse` accepts "inf" and "NaN"; neither is a measurement.
            Value::Str(s) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(n),
                _ => Err(RuntimeError::NotNumeric(s.clone())),
            },
            other => Err(RuntimeError::NotNumeric(format!("{other:?}"))),
        }
    }

    /// Text form used for labels and string comparison. Integral numbers
    /// render without a fractional part.
    fn render(&self) -> String {
        match self {
            Value::Number(n) => n.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Series { metric, labels } => format!("m{metric}{labels:?}"),
        }
    }
}

/// Counters kept by a VM over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VmStats {
    pub lines: u64,
    pub runtime_errors: u64,
    /// Lines the bounded queue refused; filled in by `VmHandle::retire`.
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy)]
struct RecoveryPoint {
    target: usize,
    stack: usize,
    frames: usize,
}

/// Interpreter state for one program.
pub struct Vm {
    program: Arc<Program>,
    /// Store handles, indexed like the program's metric table.
    metrics: Vec<Arc<Metric>>,
    stack: Vec<Value>,
    /// Capture frames: byte ranges of each group into the current line.
    frames: Vec<Vec<Option<Range<usize>>>>,
    recovery: Option<RecoveryPoint>,
    stats: VmStats,
}

impl Vm {
    /// Bind `program` to `store`, declaring every metric it uses.
    ///
    /// Fails with `MetricError::Conflict` if another program already owns a
    /// metric of the same name with a different shape.
    pub fn new(program: Arc<Program>, store: &MetricStore) -> Result<Self, MetricError> {
        let metrics = program
            .metrics()
            .iter()
            .map(|spec| store.declare(spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            program,
            metrics,
            stack: Vec::new(),
            frames: Vec::new(),
            recovery: None,
            stats: VmStats::default(),
        })
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    /// Run the program against one line.
    pub fn process(&mut self, line: &LogLine) {
        self.stats.lines += 1;
        self.stack.clear();
        self.frames.clear();
        self.recovery = None;

        let program = Arc::clone(&self.program);
        let code = program.code();
        let mut pc = 0;
        while pc < code.len() {
            match self.step(&program, &code[pc], pc, &line.text) {
                Ok(next) => pc = next,
                Err(err) => {
                    self.stats.runtime_errors += 1;
                    warn!(
                        program = program.name(),
                        source = %line.source.display(),
                        seq = line.seq,
                        pc,
                        error = %err,
                        "runtime error, action abandoned"
                    );
                    let Some(point) = self.recovery.take() else {
                        break;
                    };
                    self.stack.truncate(point.stack);
                    self.frames.truncate(point.frames);
                    pc = point.target;
                }
            }
        }
    }

    fn step(
        &mut self,
        program: &Program,
        instruction: &Instruction,
        pc: usize,
        text: &str,
    ) -> Result<usize, RuntimeError> {
        let next = pc + 1;
        match instruction {
            Instruction::Match(id) => {
                let regex = program.patterns().get(*id).ok_or(RuntimeError::Bytecode {
                    pc,
                    reason: "unknown pattern",
                })?;
                match regex.captures(text) {
                    Some(caps) => {
                        self.frames
                            .push(caps.iter().map(|m| m.map(|m| m.range())).collect());
                        self.stack.push(Value::Bool(true));
                    }
                    None => self.stack.push(Value::Bool(false)),
                }
            }
            Instruction::JumpIfFalse(target) => match self.pop(pc)? {
                Value::Bool(false) => return Ok(*target),
                Value::Bool(true) => {}
                _ => {
                    return Err(RuntimeError::Bytecode {
                        pc,
                        reason: "condition is not a boolean",
                    });
                }
            },
            Instruction::Jump(target) => return Ok(*target),
            Instruction::PopScope => {
                self.frames.pop();
            }
            Instruction::Recover(target) => {
                self.recovery = Some(RecoveryPoint {
                    target: *target,
                    stack: self.stack.len(),
                    frames: self.frames.len(),
                });
            }
            Instruction::PushNumber(n) => self.stack.push(Value::Number(*n)),
            Instruction::PushString(s) => self.stack.push(Value::Str(s.clone())),
            Instruction::PushCapture { frame, group } => {
                let range = self
                    .frames
                    .get(*frame)
                    .and_then(|groups| groups.get(*group))
                    .cloned()
                    .flatten()
                    .ok_or(RuntimeError::CaptureUnset {
                        frame: *frame,
                        group: *group,
                    })?;
                self.stack.push(Value::Str(text[range].to_string()));
            }
            Instruction::Concat(n) => {
                let parts = self.pop_n(*n, pc)?;
                let joined: String = parts.iter().map(Value::render).collect();
                self.stack.push(Value::Str(joined));
            }
            Instruction::Add | Instruction::Sub | Instruction::Mul => {
                let rhs = self.pop(pc)?.to_number()?;
                let lhs = self.pop(pc)?.to_number()?;
                let result = match instruction {
                    Instruction::Add => lhs + rhs,
                    Instruction::Sub => lhs - rhs,
                    _ => lhs * rhs,
                };
                self.stack.push(Value::Number(result));
            }
            Instruction::Neg => {
                let value = self.pop(pc)?.to_number()?;
                self.stack.push(Value::Number(-value));
            }
            Instruction::Compare(op) => {
                let rhs = self.pop(pc)?;
                let lhs = self.pop(pc)?;
                let holds = match (lhs.to_number(), rhs.to_number()) {
                    (Ok(l), Ok(r)) => l.partial_cmp(&r).is_some_and(|ord| op.holds(ord)),
                    _ if matches!(op, CmpOp::Eq | CmpOp::Ne) => {
                        op.holds(lhs.render().cmp(&rhs.render()))
                    }
                    (Err(err), _) | (_, Err(err)) => return Err(err),
                };
                self.stack.push(Value::Bool(holds));
            }
            Instruction::Fetch { metric, labels } => {
                let labels = self
                    .pop_n(*labels, pc)?
                    .iter()
                    .map(Value::render)
                    .collect();
                self.stack.push(Value::Series {
                    metric: *metric,
                    labels,
                });
            }
            Instruction::Apply(op) => {
                let value = match op {
                    MetricOp::Inc => 1.0,
                    _ => self.pop(pc)?.to_number()?,
                };
                let Value::Series { metric, labels } = self.pop(pc)? else {
                    return Err(RuntimeError::Bytecode {
                        pc,
                        reason: "apply without a fetched series",
                    });
                };
                let handle = self.metrics.get(metric).ok_or(RuntimeError::Bytecode {
                    pc,
                    reason: "unknown metric",
                })?;
                handle.record(&labels, *op, value)?;
            }
        }
        Ok(next)
    }

    fn pop(&mut self, pc: usize) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::Bytecode {
            pc,
            reason: "stack underflow",
        })
    }

    fn pop_n(&mut self, n: usize, pc: usize) -> Result<Vec<Value>, RuntimeError> {
        let at = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or(RuntimeError::Bytecode {
                pc,
                reason: "stack underflow",
            })?;
        Ok(self.stack.split_off(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::metrics::ValueSnapshot;
    use std::path::Path;

    fn run(source: &str, lines: &[&str]) -> (MetricStore, VmStats) {
        let store = MetricStore::new();
        let program = Arc::new(compile("test", source).unwrap());
        let mut vm = Vm::new(program, &store).unwrap();
        let path: Arc<Path> = Arc::from(Path::new("/var/log/test.log"));
        for (seq, text) in lines.iter().enumerate() {
            vm.process(&LogLine::new(text.to_string(), Arc::clone(&path), seq as u64));
        }
        let stats = vm.stats();
        (store, stats)
    }

    #[test]
    fn test_counter_counts_matching_lines() {
        let (store, stats) = run("counter foo; /bar/ { foo++ }", &["bar", "baz", "bar"]);
        assert_eq!(store.snapshot().scalar("foo", &[]), Some(2.0));
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.runtime_errors, 0);
    }

    #[test]
    fn test_counter_adds_captured_values() {
        let (store, _) = run(r"counter bytes; /(\d+)/ { bytes += $1 }", &["10", "x", "5"]);
        assert_eq!(store.snapshot().scalar("bytes", &[]), Some(15.0));
    }

    #[test]
    fn test_non_finite_captures_are_runtime_errors() {
        let (store, stats) = run(
            r"counter bytes; /size=(\w+)/ { bytes += $1 }",
            &["size=10", "size=inf", "size=Infinity", "size=NaN", "size=5"],
        );
        assert_eq!(store.snapshot().scalar("bytes", &[]), Some(15.0));
        assert_eq!(stats.runtime_errors, 3);

        let (store, stats) = run(
            r"gauge g; histogram h; /v=(\w+)/ { g += $1; h = $1 }",
            &["v=1", "v=NaN", "v=-inf", "v=2"],
        );
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("g", &[]), Some(3.0));
        let Some(ValueSnapshot::Histogram { count, sum, .. }) = snapshot.value("h", &[]) else {
            panic!("expected histogram");
        };
        assert_eq!((*count, *sum), (2, 3.0));
        assert_eq!(stats.runtime_errors, 4);
    }

    #[test]
    fn test_overflowing_arithmetic_is_not_recorded() {
        let (store, stats) = run(
            r"gauge g; /v=(\d+)/ { g = $1 * 1e300 * 1e300 }",
            &["v=1"],
        );
        assert_eq!(store.snapshot().scalar("g", &[]), None);
        assert_eq!(stats.runtime_errors, 1);
    }

    #[test]
    fn test_all_matching_blocks_fire() {
        let (store, _) = run(
            "counter a\ncounter b\n/x/ { a++ }\n/x/ { b++ }\n/y/ { a++ }",
            &["x", "xy"],
        );
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("a", &[]), Some(3.0));
        assert_eq!(snapshot.scalar("b", &[]), Some(2.0));
    }

    #[test]
    fn test_labels_from_named_and_positional_captures() {
        let (store, _) = run(
            r#"counter requests by method, code
               /^(?P<method>[A-Z]+) \S+ (\d{3})/ { requests[$method, $2]++ }"#,
            &["GET /a 200", "GET /b 200", "POST /c 500", "garbage"],
        );
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("requests", &["GET", "200"]), Some(2.0));
        assert_eq!(snapshot.scalar("requests", &["POST", "500"]), Some(1.0));
        assert_eq!(snapshot.series_count(), 2);
    }

    #[test]
    fn test_gauge_operations_and_numeric_labels() {
        let (store, _) = run(
            r#"gauge temp by sensor
               /sensor=(\d+) t=(\S+)/ {
                 temp[$1 * 1] = $2
                 temp["total"] += $2
                 temp["total"]--
               }"#,
            &["sensor=7 t=20.5", "sensor=7 t=21"],
        );
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("temp", &["7"]), Some(21.0));
        assert_eq!(snapshot.scalar("temp", &["total"]), Some(39.5));
    }

    #[test]
    fn test_histogram_observations() {
        let (store, _) = run(
            r"histogram latency buckets 10, 100
              /took (\d+)ms/ { latency = $1 }",
            &["took 5ms", "took 50ms", "took 500ms"],
        );
        let snapshot = store.snapshot();
        let Some(ValueSnapshot::Histogram { count, sum, .. }) = snapshot.value("latency", &[]) else {
            panic!("expected histogram");
        };
        assert_eq!(*count, 3);
        assert_eq!(*sum, 555.0);
    }

    #[test]
    fn test_nested_blocks_comparison_and_else() {
        let (store, _) = run(
            r#"counter slow
               counter fast
               counter other
               /(?P<ms>\d+)ms/ {
                 $ms > 100 { slow++ } else { fast++ }
               } else {
                 other++
               }"#,
            &["150ms", "20ms", "nothing", "101ms"],
        );
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("slow", &[]), Some(2.0));
        assert_eq!(snapshot.scalar("fast", &[]), Some(1.0));
        assert_eq!(snapshot.scalar("other", &[]), Some(1.0));
    }

    #[test]
    fn test_string_comparison() {
        let (store, _) = run(
            r#"counter hits
               /user=(\w+)/ { $1 == "admin" { hits++ } }"#,
            &["user=admin", "user=bob"],
        );
        assert_eq!(store.snapshot().scalar("hits", &[]), Some(1.0));
    }

    #[test]
    fn test_runtime_fault_abandons_only_that_action() {
        let (store, stats) = run(
            r#"counter bytes
               counter lines
               /size=(\S+)/ {
                 bytes += $1
                 lines++
               }"#,
            &["size=12", "size=abc", "size=3"],
        );
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("bytes", &[]), Some(15.0));
        assert_eq!(snapshot.scalar("lines", &[]), Some(3.0));
        assert_eq!(stats.runtime_errors, 1);
    }

    #[test]
    fn test_unset_optional_group_is_a_fault() {
        let (store, stats) = run(
            r"counter c by x
              counter seen
              /a(b)?/ { c[$1]++; seen++ }",
            &["ab", "a"],
        );
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("c", &["b"]), Some(1.0));
        assert_eq!(snapshot.scalar("seen", &[]), Some(2.0));
        assert_eq!(stats.runtime_errors, 1);
    }

    #[test]
    fn test_negative_runtime_delta_rejected_by_counter() {
        let (store, stats) = run(r"counter c; /(-?\d+)/ { c += $1 }", &["4", "-2"]);
        assert_eq!(store.snapshot().scalar("c", &[]), Some(4.0));
        assert_eq!(stats.runtime_errors, 1);
    }

    #[test]
    fn test_execution_is_deterministic() {
        let source = r"gauge g by k
                       /(\w+)=(\d+)/ { g[$1] += $2 * 2; g[$1]-- }";
        let lines = ["a=1", "b=2", "a=3", "junk"];
        let (first, _) = run(source, &lines);
        let (second, _) = run(source, &lines);
        let values = |store: &MetricStore| {
            let snapshot = store.snapshot();
            (snapshot.scalar("g", &["a"]), snapshot.scalar("g", &["b"]))
        };
        assert_eq!(values(&first), values(&second));
        assert_eq!(values(&first), (Some(6.0), Some(3.0)));
    }

    #[test]
    fn test_conflicting_declaration_fails_vm_creation() {
        let store = MetricStore::new();
        let a = Arc::new(compile("a", "counter shared\n/x/ { shared++ }").unwrap());
        let b = Arc::new(compile("b", "gauge shared\n/x/ { shared = 1 }").unwrap());
        assert!(Vm::new(a, &store).is_ok());
        assert!(matches!(
            Vm::new(b, &store),
            Err(MetricError::Conflict { .. })
        ));
    }
}
