//! Shared metric registry.
//!
//! One `MetricStore` is created by the host and handed (as `Arc`) to every
//! VM. Locking is layered so that writers to different metrics, and to
//! different series of the same metric, do not contend:
//!
//! ```text
//! MetricStore ── RwLock<HashMap<name, Arc<Metric>>>          (registry)
//!     Metric ─── RwLock<HashMap<label values, Arc<Mutex<Series>>>>
//!         Series ─ Mutex<Datum + last update time>           (one series)
//! ```
//!
//! Writers take the registry and series-map locks for reading only, except
//! when a series is created, and keep the series-map lock while updating.
//! `reset` takes it for writing, so no update lands in a dropped series.
//! Snapshots copy the `Arc` lists first and then visit one series lock at a
//! time.

mod datum;
mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

pub use datum::{DEFAULT_BUCKETS, Datum, Histogram, MetricKind, MetricOp};
pub use snapshot::{BucketSnapshot, MetricSnapshot, SeriesSnapshot, Snapshot, ValueSnapshot};

/// Errors raised when declaring or updating metrics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error(
        "metric `{name}` already declared as {existing}, cannot redeclare as {requested}"
    )]
    Conflict {
        name: String,
        existing: String,
        requested: String,
    },
    #[error("counter `{name}` cannot be changed by {delta}")]
    NegativeDelta { name: String, delta: f64 },
    #[error("metric `{name}` cannot take non-finite value {value}")]
    NonFinite { name: String, value: f64 },
    #[error("{op} is not valid for {kind} `{name}`")]
    KindMismatch {
        name: String,
        kind: MetricKind,
        op: MetricOp,
    },
    #[error("metric `{name}` expects {expected} label values, got {got}")]
    LabelArity {
        name: String,
        expected: usize,
        got: usize,
    },
}

/// Declared shape of a metric: everything except its values.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub name: String,
    pub kind: MetricKind,
    pub labels: Vec<String>,
    /// Upper bounds for histograms; empty for other kinds.
    pub buckets: Vec<f64>,
}

impl MetricSpec {
    fn describe(&self) -> String {
        let mut out = self.kind.to_string();
        if !self.labels.is_empty() {
            out.push_str(" by ");
            out.push_str(&self.labels.join(", "));
        }
        if self.kind == MetricKind::Histogram {
            let bounds: Vec<String> = self.buckets.iter().map(f64::to_string).collect();
            out.push_str(" buckets ");
            out.push_str(&bounds.join(", "));
        }
        out
    }
}

/// One series: the datum and when it last changed.
#[derive(Debug)]
struct Series {
    datum: Datum,
    updated: DateTime<Utc>,
}

impl Series {
    fn apply(&mut self, op: MetricOp, value: f64) {
        self.datum.apply(op, value);
        self.updated = Utc::now();
    }
}

/// A named, typed metric and all of its series.
#[derive(Debug)]
pub struct Metric {
    spec: MetricSpec,
    series: RwLock<HashMap<Vec<String>, Arc<Mutex<Series>>>>,
}

impl Metric {
    fn new(spec: MetricSpec) -> Self {
        Self {
            spec,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn kind(&self) -> MetricKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &MetricSpec {
        &self.spec
    }

    /// Apply `op` with `value` to the series identified by `label_values`.
    ///
    /// The update is validated before the series is created, so a rejected
    /// update never leaves an empty series behind.
    pub fn record(&self, label_values: &[String], op: MetricOp, value: f64) -> Result<(), MetricError> {
        if label_values.len() != self.spec.labels.len() {
            return Err(MetricError::LabelArity {
                name: self.spec.name.clone(),
                expected: self.spec.labels.len(),
                got: label_values.len(),
            });
        }
        if !self.spec.kind.accepts(op) {
            return Err(MetricError::KindMismatch {
                name: self.spec.name.clone(),
                kind: self.spec.kind,
                op,
            });
        }
        // `Inc` carries no value.
        if op != MetricOp::Inc && !value.is_finite() {
            return Err(MetricError::NonFinite {
                name: self.spec.name.clone(),
                value,
            });
        }
        if self.spec.kind == MetricKind::Counter && op == MetricOp::Add && value < 0.0 {
            return Err(MetricError::NegativeDelta {
                name: self.spec.name.clone(),
                delta: value,
            });
        }

        // The series map lock is held across the update so that `reset`
        // cannot drop a series while it is being written.
        {
            let map = self.series.read();
            if let Some(series) = map.get(label_values) {
                series.lock().apply(op, value);
                return Ok(());
            }
        }
        let mut map = self.series.write();
        map.entry(label_values.to_vec())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Series {
                    datum: Datum::new(self.spec.kind, &self.spec.buckets),
                    updated: Utc::now(),
                }))
            })
            .lock()
            .apply(op, value);
        Ok(())
    }

    /// Copy all series, holding each series lock only while copying it.
    pub fn snapshot(&self) -> MetricSnapshot {
        let handles: Vec<(Vec<String>, Arc<Mutex<Series>>)> = self
            .series
            .read()
            .iter()
            .map(|(labels, series)| (labels.clone(), Arc::clone(series)))
            .collect();

        let mut series: Vec<SeriesSnapshot> = handles
            .into_iter()
            .map(|(label_values, handle)| {
                let guard = handle.lock();
                SeriesSnapshot {
                    label_values,
                    value: ValueSnapshot::from(&guard.datum),
                    updated: guard.updated,
                }
            })
            .collect();
        series.sort_by(|a, b| a.label_values.cmp(&b.label_values));

        MetricSnapshot {
            kind: self.spec.kind,
            labels: self.spec.labels.clone(),
            series,
        }
    }

    /// Drop every series.
    pub fn reset(&self) {
        self.series.write().clear();
    }
}

/// Concurrent registry of all metrics, shared by every VM.
#[derive(Debug, Default)]
pub struct MetricStore {
    metrics: RwLock<HashMap<String, Arc<Metric>>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric, or return the existing one if its shape matches.
    ///
    /// Returns `MetricError::Conflict` when the name is taken with a different
    /// kind, label schema or bucket layout.
    pub fn declare(&self, spec: &MetricSpec) -> Result<Arc<Metric>, MetricError> {
        if let Some(existing) = self.metrics.read().get(&spec.name) {
            return check_compatible(existing, spec);
        }
        let mut metrics = self.metrics.write();
        let metric = metrics
            .entry(spec.name.clone())
            .or_insert_with(|| Arc::new(Metric::new(spec.clone())));
        check_compatible(metric, spec)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Metric>> {
        self.metrics.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    /// Clear every series of every metric. Declarations are kept.
    pub fn reset(&self) {
        for metric in self.handles() {
            metric.reset();
        }
    }

    /// Point-in-time copy of the whole registry.
    pub fn snapshot(&self) -> Snapshot {
        let metrics: BTreeMap<String, MetricSnapshot> = self
            .handles()
            .into_iter()
            .map(|metric| (metric.name().to_string(), metric.snapshot()))
            .collect();
        Snapshot {
            taken_at: Utc::now(),
            metrics,
        }
    }

    fn handles(&self) -> Vec<Arc<Metric>> {
        self.metrics.read().values().cloned().collect()
    }
}

fn check_compatible(existing: &Arc<Metric>, spec: &MetricSpec) -> Result<Arc<Metric>, MetricError> {
    if existing.spec() == spec {
        Ok(Arc::clone(existing))
    } else {
        Err(MetricError::Conflict {
            name: spec.name.clone(),
            existing: existing.spec().describe(),
            requested: spec.describe(),
        })
    }
}
