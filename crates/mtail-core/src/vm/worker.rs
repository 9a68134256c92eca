//! One thread per VM, draining its own line queue.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use super::{Vm, VmStats};
use crate::line::LogLine;

/// Capacity discipline of a VM's inbound queue.
///
/// `Unbounded` never stalls the sender but lets a slow VM grow its backlog
/// without limit. `Bounded` drops the newest line when the queue is full and
/// logs the drop; dropped lines are counted in `VmStats::dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    #[default]
    Unbounded,
    Bounded {
        capacity: usize,
    },
}

impl QueuePolicy {
    fn channel<T>(self) -> (Sender<T>, Receiver<T>) {
        match self {
            QueuePolicy::Unbounded => crossbeam_channel::unbounded(),
            QueuePolicy::Bounded { capacity } => crossbeam_channel::bounded(capacity.max(1)),
        }
    }
}

/// Outcome of handing a line to a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The bounded queue was full; the line was discarded.
    Dropped,
    /// The worker is gone.
    Closed,
}

/// Sending side of a running VM.
pub struct VmHandle {
    name: String,
    sender: Sender<Arc<LogLine>>,
    dropped: u64,
    thread: JoinHandle<VmStats>,
}

/// Start a worker thread for `vm`.
pub fn spawn(vm: Vm, policy: QueuePolicy) -> io::Result<VmHandle> {
    let name = vm.program().name().to_string();
    let (sender, receiver) = policy.channel::<Arc<LogLine>>();
    let thread = thread::Builder::new()
        .name(format!("vm-{name}"))
        .spawn(move || run(vm, receiver))?;
    debug!(program = %name, ?policy, "vm started");
    Ok(VmHandle {
        name,
        sender,
        dropped: 0,
        thread,
    })
}

fn run(mut vm: Vm, receiver: Receiver<Arc<LogLine>>) -> VmStats {
    // Ends once every sender is gone and the queue is drained.
    for line in receiver.iter() {
        vm.process(&line);
    }
    vm.stats()
}

impl VmHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lines queued but not yet processed.
    pub fn backlog(&self) -> usize {
        self.sender.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue `line` without blocking.
    pub fn deliver(&mut self, line: &Arc<LogLine>) -> Delivery {
        match self.sender.try_send(Arc::clone(line)) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                // Log the first drop and then at powers of two.
                if self.dropped.is_power_of_two() {
                    warn!(
                        program = %self.name,
                        dropped = self.dropped,
                        source = %line.source.display(),
                        "vm queue full, dropping lines"
                    );
                }
                Delivery::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Delivery::Closed,
        }
    }

    /// Close the queue. The worker keeps running until the queued lines
    /// are processed.
    pub fn close(self) -> ClosedVm {
        let VmHandle {
            name,
            sender,
            dropped,
            thread,
        } = self;
        drop(sender);
        ClosedVm {
            name,
            dropped,
            thread,
        }
    }

    /// Close the queue, wait for the worker to drain it and return its stats.
    pub fn retire(self) -> VmStats {
        self.close().join()
    }
}

/// A VM whose queue is closed and which is draining its backlog.
pub struct ClosedVm {
    name: String,
    dropped: u64,
    thread: JoinHandle<VmStats>,
}

impl ClosedVm {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> VmStats {
        let mut stats = match self.thread.join() {
            Ok(stats) => stats,
            Err(_) => {
                warn!(program = %self.name, "vm worker panicked");
                VmStats::default()
            }
        };
        stats.dropped = self.dropped;
        debug!(
            program = %self.name,
            lines = stats.lines,
            runtime_errors = stats.runtime_errors,
            dropped = stats.dropped,
            "vm stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::metrics::MetricStore;
    use std::path::Path;
    use std::sync::mpsc;

    fn line(seq: u64, text: &str) -> Arc<LogLine> {
        Arc::new(LogLine::new(text, Arc::from(Path::new("/tmp/app.log")), seq))
    }

    fn vm(store: &MetricStore, source: &str) -> Vm {
        Vm::new(Arc::new(compile("worker", source).unwrap()), store).unwrap()
    }

    #[test]
    fn test_unbounded_queue_processes_everything() {
        let store = MetricStore::new();
        let mut handle = spawn(vm(&store, "counter n; /x/ { n++ }"), QueuePolicy::Unbounded).unwrap();
        for seq in 1..=500 {
            assert_eq!(handle.deliver(&line(seq, "x")), Delivery::Queued);
        }
        let stats = handle.retire();
        assert_eq!(stats.lines, 500);
        assert_eq!(stats.dropped, 0);
        assert_eq!(store.snapshot().scalar("n", &[]), Some(500.0));
    }

    #[test]
    fn test_bounded_queue_drops_when_full() {
        let store = MetricStore::new();
        // The worker thread is blocked until the channel below is released,
        // so nothing is drained while the queue fills up.
        let (release, gate) = mpsc::channel::<()>();
        let (sender, receiver) = crossbeam_channel::bounded::<Arc<LogLine>>(2);
        let worker_vm = vm(&store, "counter n; /x/ { n++ }");
        let thread = thread::spawn(move || {
            let _ = gate.recv();
            run(worker_vm, receiver)
        });
        let mut handle = VmHandle {
            name: "bounded".to_string(),
            sender,
            dropped: 0,
            thread,
        };

        let outcomes: Vec<Delivery> = (1..=5).map(|seq| handle.deliver(&line(seq, "x"))).collect();
        assert_eq!(
            outcomes,
            vec![
                Delivery::Queued,
                Delivery::Queued,
                Delivery::Dropped,
                Delivery::Dropped,
                Delivery::Dropped,
            ]
        );
        assert_eq!(handle.backlog(), 2);

        release.send(()).unwrap();
        let stats = handle.retire();
        assert_eq!(stats.lines, 2);
        assert_eq!(stats.dropped, 3);
        assert_eq!(store.snapshot().scalar("n", &[]), Some(2.0));
    }

    #[test]
    fn test_bounded_policy_builds_bounded_channel() {
        let (sender, _receiver) = QueuePolicy::Bounded { capacity: 3 }.channel::<u8>();
        assert_eq!(sender.capacity(), Some(3));
        let (sender, _receiver) = QueuePolicy::Unbounded.channel::<u8>();
        assert_eq!(sender.capacity(), None);
    }

    #[test]
    fn test_deliver_after_worker_exit_reports_closed() {
        let (sender, receiver) = crossbeam_channel::unbounded::<Arc<LogLine>>();
        drop(receiver);
        let mut handle = VmHandle {
            name: "closed".to_string(),
            sender,
            dropped: 0,
            thread: thread::spawn(VmStats::default),
        };
        assert_eq!(handle.deliver(&line(1, "x")), Delivery::Closed);
        assert_eq!(handle.retire(), VmStats::default());
    }
}
