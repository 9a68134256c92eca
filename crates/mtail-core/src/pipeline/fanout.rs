//! Broadcast of lines to every live VM.
//!
//! The fan-out thread exclusively owns the live VM set. Control messages
//! from the loader are applied before each line is delivered, so a program
//! attached before a line was read sees that line.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, select};
use tracing::{debug, info};

use crate::line::LogLine;
use crate::loader::Control;
use crate::vm::{ClosedVm, Delivery, VmHandle, VmStats};

/// Per-program totals once the fan-out has stopped. Stats of replaced VMs
/// are added to their successor's.
pub(crate) type VmTotals = BTreeMap<String, VmStats>;

struct FanOut {
    live: BTreeMap<String, VmHandle>,
    /// Replaced or detached VMs still draining their queues.
    closing: Vec<ClosedVm>,
    totals: VmTotals,
    lines: u64,
}

pub(crate) fn spawn(
    lines: Receiver<Arc<LogLine>>,
    control: Receiver<Control>,
) -> io::Result<JoinHandle<VmTotals>> {
    thread::Builder::new()
        .name("fanout".to_string())
        .spawn(move || run(lines, control))
}

fn run(lines: Receiver<Arc<LogLine>>, control: Receiver<Control>) -> VmTotals {
    let mut fanout = FanOut {
        live: BTreeMap::new(),
        closing: Vec::new(),
        totals: BTreeMap::new(),
        lines: 0,
    };
    let never = crossbeam_channel::never();
    let mut control_open = true;
    loop {
        select! {
            recv(if control_open { &control } else { &never }) -> msg => match msg {
                Ok(msg) => fanout.apply(msg),
                // Loader gone: keep delivering to the VMs we have.
                Err(_) => control_open = false,
            },
            recv(lines) -> line => {
                let Ok(line) = line else { break };
                for msg in control.try_iter() {
                    fanout.apply(msg);
                }
                fanout.deliver(&line);
            }
        }
    }
    for msg in control.try_iter() {
        fanout.apply(msg);
    }
    fanout.finish()
}

impl FanOut {
    fn apply(&mut self, msg: Control) {
        match msg {
            Control::Attach(handle) => {
                let name = handle.name().to_string();
                if let Some(old) = self.live.insert(name.clone(), handle) {
                    debug!(program = %name, "swapping vm");
                    self.closing.push(old.close());
                }
            }
            Control::Detach(name) => {
                if let Some(old) = self.live.remove(&name) {
                    self.closing.push(old.close());
                }
            }
        }
        self.reap();
    }

    fn deliver(&mut self, line: &Arc<LogLine>) {
        self.lines += 1;
        for handle in self.live.values_mut() {
            if handle.deliver(line) == Delivery::Closed {
                debug!(program = %handle.name(), "vm queue closed");
            }
        }
    }

    /// Collect VMs that finished draining.
    fn reap(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) =
            self.closing.drain(..).partition(ClosedVm::is_finished);
        self.closing = pending;
        for vm in done {
            self.record(vm);
        }
    }

    fn record(&mut self, vm: ClosedVm) {
        let name = vm.name().to_string();
        let stats = vm.join();
        let total = self.totals.entry(name).or_default();
        total.lines += stats.lines;
        total.runtime_errors += stats.runtime_errors;
        total.dropped += stats.dropped;
    }

    /// Close every queue and wait for all VMs to drain.
    fn finish(mut self) -> VmTotals {
        let live = std::mem::take(&mut self.live);
        self.closing.extend(live.into_values().map(VmHandle::close));
        for vm in std::mem::take(&mut self.closing) {
            self.record(vm);
        }
        info!(lines = self.lines, programs = self.totals.len(), "fan-out stopped");
        self.totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::metrics::MetricStore;
    use crate::vm::{self, QueuePolicy, Vm};
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn handle(store: &MetricStore, name: &str, source: &str) -> VmHandle {
        let program = Arc::new(compile(name, source).unwrap());
        vm::spawn(Vm::new(program, store).unwrap(), QueuePolicy::Unbounded).unwrap()
    }

    fn line(seq: u64, text: &str) -> Arc<LogLine> {
        Arc::new(LogLine::new(text, Arc::from(Path::new("/tmp/f.log")), seq))
    }

    fn wait_for(store: &MetricStore, metric: &str, value: f64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.snapshot().scalar(metric, &[]) != Some(value) {
            assert!(Instant::now() < deadline, "{metric} never reached {value}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_every_vm_sees_every_line() {
        let store = MetricStore::new();
        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let thread = spawn(line_rx, control_rx).unwrap();

        control_tx
            .send(Control::Attach(handle(&store, "a", "counter a_lines\n/./ { a_lines++ }")))
            .unwrap();
        control_tx
            .send(Control::Attach(handle(&store, "b", "counter b_lines\n/./ { b_lines++ }")))
            .unwrap();
        for seq in 1..=3 {
            line_tx.send(line(seq, "x")).unwrap();
        }
        drop(line_tx);
        drop(control_tx);

        let totals = thread.join().unwrap();
        assert_eq!(totals["a"].lines, 3);
        assert_eq!(totals["b"].lines, 3);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("a_lines", &[]), Some(3.0));
        assert_eq!(snapshot.scalar("b_lines", &[]), Some(3.0));
    }

    #[test]
    fn test_programs_share_metrics_without_losing_updates() {
        let store = MetricStore::new();
        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let thread = spawn(line_rx, control_rx).unwrap();

        let decls = "counter total\ncounter hits by kind\n";
        let counting = format!("{decls}/./ {{ total++; hits[\"all\"]++ }}");
        let summing = format!(r#"{decls}/n=(\d+)/ {{ total += $1; hits["all"]++; hits["n"]++ }}"#);
        control_tx
            .send(Control::Attach(handle(&store, "counting", &counting)))
            .unwrap();
        control_tx
            .send(Control::Attach(handle(&store, "summing", &summing)))
            .unwrap();
        for seq in 1..=10_000 {
            line_tx.send(line(seq, "n=2")).unwrap();
        }
        drop(line_tx);
        drop(control_tx);

        let totals = thread.join().unwrap();
        assert_eq!(totals["counting"].lines, 10_000);
        assert_eq!(totals["summing"].lines, 10_000);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("total", &[]), Some(30_000.0));
        assert_eq!(snapshot.scalar("hits", &["all"]), Some(20_000.0));
        assert_eq!(snapshot.scalar("hits", &["n"]), Some(10_000.0));
    }

    #[test]
    fn test_attach_same_name_swaps_vm() {
        let store = MetricStore::new();
        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let thread = spawn(line_rx, control_rx).unwrap();

        control_tx
            .send(Control::Attach(handle(&store, "p", "counter old\n/./ { old++ }")))
            .unwrap();
        line_tx.send(line(1, "x")).unwrap();
        wait_for(&store, "old", 1.0);
        control_tx
            .send(Control::Attach(handle(&store, "p", "counter new\n/./ { new++ }")))
            .unwrap();
        line_tx.send(line(2, "x")).unwrap();
        line_tx.send(line(3, "x")).unwrap();
        drop(line_tx);
        drop(control_tx);

        let totals = thread.join().unwrap();
        assert_eq!(totals["p"].lines, 3);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scalar("old", &[]), Some(1.0));
        assert_eq!(snapshot.scalar("new", &[]), Some(2.0));
    }

    #[test]
    fn test_detached_vm_stops_receiving() {
        let store = MetricStore::new();
        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let thread = spawn(line_rx, control_rx).unwrap();

        control_tx
            .send(Control::Attach(handle(&store, "p", "counter n\n/./ { n++ }")))
            .unwrap();
        line_tx.send(line(1, "x")).unwrap();
        wait_for(&store, "n", 1.0);
        control_tx.send(Control::Detach("p".to_string())).unwrap();
        line_tx.send(line(2, "x")).unwrap();
        drop(line_tx);
        drop(control_tx);

        thread.join().unwrap();
        assert_eq!(store.snapshot().scalar("n", &[]), Some(1.0));
    }
}
