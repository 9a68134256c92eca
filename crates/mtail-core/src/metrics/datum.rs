//! Metric kinds and the per-series state they update.

use std::fmt;

use serde::Serialize;

/// Default histogram upper bounds, used when a declaration has no `buckets`.
pub const DEFAULT_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Declared type of a metric. Fixed for the metric's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }

    /// Whether `op` is a valid update for this kind.
    pub fn accepts(self, op: MetricOp) -> bool {
        matches!(
            (self, op),
            (MetricKind::Counter, MetricOp::Inc | MetricOp::Add)
                | (MetricKind::Gauge, MetricOp::Inc | MetricOp::Add | MetricOp::Set)
                | (MetricKind::Histogram, MetricOp::Observe)
        )
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific update applied to one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricOp {
    /// Add one.
    Inc,
    /// Add a delta (non-negative for counters).
    Add,
    /// Replace the value (gauges).
    Set,
    /// Record one observation (histograms).
    Observe,
}

impl MetricOp {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricOp::Inc => "inc",
            MetricOp::Add => "add",
            MetricOp::Set => "set",
            MetricOp::Observe => "observe",
        }
    }
}

impl fmt::Display for MetricOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running summary of a histogram series.
///
/// `counts[i]` holds observations in `(bounds[i-1], bounds[i]]`; the final
/// slot is the implicit +Inf bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            counts: vec![0; bounds.len() + 1],
            count: 0,
            sum: 0.0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        let slot = self
            .bounds
            .iter()
            .position(|&upper| value <= upper)
            .unwrap_or(self.bounds.len());
        self.counts[slot] += 1;
        self.count += 1;
        self.sum += value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Cumulative `(upper bound, count)` pairs, excluding +Inf.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.bounds
            .iter()
            .zip(&self.counts)
            .map(|(&upper, &n)| {
                running += n;
                (upper, running)
            })
            .collect()
    }
}

/// Current state of one series.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Counter(f64),
    Gauge(f64),
    Histogram(Histogram),
}

impl Datum {
    pub fn new(kind: MetricKind, buckets: &[f64]) -> Self {
        match kind {
            MetricKind::Counter => Datum::Counter(0.0),
            MetricKind::Gauge => Datum::Gauge(0.0),
            MetricKind::Histogram => Datum::Histogram(Histogram::new(buckets)),
        }
    }

    /// Apply an already validated update.
    pub(super) fn apply(&mut self, op: MetricOp, value: f64) {
        match (self, op) {
            (Datum::Counter(v) | Datum::Gauge(v), MetricOp::Inc) => *v += 1.0,
            (Datum::Counter(v) | Datum::Gauge(v), MetricOp::Add) => *v += value,
            (Datum::Gauge(v), MetricOp::Set) => *v = value,
            (Datum::Histogram(h), MetricOp::Observe) => h.observe(value),
            _ => {}
        }
    }
}
