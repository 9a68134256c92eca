//! Point-in-time copies of the metric registry.
//!
//! Snapshots are plain data: they hold no locks and can be serialized with
//! serde for the JSON dump and any exposition format the host renders.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::datum::{Datum, MetricKind};

/// The whole registry: metric name → metric.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub kind: MetricKind,
    /// Label names, in declaration order.
    pub labels: Vec<String>,
    /// Series sorted by label values.
    pub series: Vec<SeriesSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub label_values: Vec<String>,
    pub value: ValueSnapshot,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ValueSnapshot {
    Scalar(f64),
    Histogram {
        count: u64,
        sum: f64,
        /// Cumulative counts per upper bound; the +Inf bucket equals `count`.
        buckets: Vec<BucketSnapshot>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub le: f64,
    pub count: u64,
}

impl From<&Datum> for ValueSnapshot {
    fn from(datum: &Datum) -> Self {
        match datum {
            Datum::Counter(v) | Datum::Gauge(v) => ValueSnapshot::Scalar(*v),
            Datum::Histogram(h) => ValueSnapshot::Histogram {
                count: h.count(),
                sum: h.sum(),
                buckets: h
                    .cumulative()
                    .into_iter()
                    .map(|(le, count)| BucketSnapshot { le, count })
                    .collect(),
            },
        }
    }
}

impl ValueSnapshot {
    /// Scalar value of a counter or gauge; histogram sum otherwise.
    pub fn as_f64(&self) -> f64 {
        match self {
            ValueSnapshot::Scalar(v) => *v,
            ValueSnapshot::Histogram { sum, .. } => *sum,
        }
    }
}

impl Snapshot {
    /// Value of one series, if it has been written.
    pub fn value(&self, name: &str, label_values: &[&str]) -> Option<&ValueSnapshot> {
        self.metrics
            .get(name)?
            .series
            .iter()
            .find(|s| s.label_values.iter().map(String::as_str).eq(label_values.iter().copied()))
            .map(|s| &s.value)
    }

    /// Scalar value of one series, if it has been written.
    pub fn scalar(&self, name: &str, label_values: &[&str]) -> Option<f64> {
        self.value(name, label_values).map(ValueSnapshot::as_f64)
    }

    /// Total number of series across all metrics.
    pub fn series_count(&self) -> usize {
        self.metrics.values().map(|m| m.series.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::datum::Histogram;

    #[test]
    fn test_histogram_serializes_cumulative_buckets() {
        let mut h = Histogram::new(&[1.0, 2.0]);
        h.observe(0.5);
        h.observe(1.5);
        h.observe(9.0);
        let value = ValueSnapshot::from(&Datum::Histogram(h));
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["count"], 3);
        assert_eq!(json["sum"], 11.0);
        assert_eq!(json["buckets"][0]["le"], 1.0);
        assert_eq!(json["buckets"][0]["count"], 1);
        assert_eq!(json["buckets"][1]["count"], 2);
    }

    #[test]
    fn test_scalar_serializes_as_number() {
        let json = serde_json::to_value(ValueSnapshot::Scalar(2.0)).unwrap();
        assert_eq!(json, serde_json::json!(2.0));
    }
}
