//! The long-lived store fed by stream datasources.
//!
//! Observations are keyed by metric type, fully-qualified name and the
//! sorted label-key tuple; each key owns a live cell that accumulates
//! values until the next scrape snapshots it.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::{CollectorError, Result};
use crate::exposition::{Sample, SampleValue};
use crate::labels::{Label, Labels};
use crate::metric::{MetricType, Observation};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    metric_type: MetricType,
    name: String,
    label_names: Vec<String>,
}

#[derive(Debug)]
struct GroupEntry {
    help: String,
    buckets: Vec<f64>,
    series: BTreeMap<Vec<String>, Cell>,
}

#[derive(Debug)]
enum Cell {
    Gauge(f64),
    Counter(f64),
    Histogram {
        counts: Vec<u64>,
        sum: f64,
        count: u64,
    },
}

/// Concurrent accumulation store for push-mode observations.
#[derive(Debug, Default)]
pub struct MetricGroup {
    metrics: Mutex<BTreeMap<GroupKey, GroupEntry>>,
}

impl MetricGroup {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation.
    ///
    /// The cell is created on first sight; later observations with the
    /// same key dispatch to it (gauge set, counter add, histogram
    /// observe).
    ///
    /// # Errors
    ///
    /// Returns an error when a counter would decrease.
    pub fn handle(&self, obs: &Observation) -> Result<()> {
        let label_names = obs.labels.keys();
        let label_values: Vec<String> = obs.labels.iter().map(|l| l.value.clone()).collect();
        let key = GroupKey {
            metric_type: obs.metric_type,
            name: obs.name.clone(),
            label_names,
        };

        let mut metrics = self.metrics.lock();
        let entry = metrics.entry(key).or_insert_with(|| GroupEntry {
            help: obs.help.clone(),
            buckets: obs.buckets.clone(),
            series: BTreeMap::new(),
        });
        match obs.metric_type {
            MetricType::Gauge => {
                entry.series.insert(label_values, Cell::Gauge(obs.value));
            }
            MetricType::Counter => {
                if obs.value < 0.0 {
                    return Err(CollectorError::CounterDecrease(obs.value));
                }
                let cell = entry
                    .series
                    .entry(label_values)
                    .or_insert(Cell::Counter(0.0));
                if let Cell::Counter(total) = cell {
                    *total += obs.value;
                }
            }
            MetricType::Histogram => {
                let bucket_count = entry.buckets.len();
                let cell = entry.series.entry(label_values).or_insert(Cell::Histogram {
                    counts: vec![0; bucket_count],
                    sum: 0.0,
                    count: 0,
                });
                if let Cell::Histogram { counts, sum, count } = cell {
                    for (i, bound) in entry.buckets.iter().enumerate() {
                        if obs.value <= *bound {
                            counts[i] += 1;
                        }
                    }
                    *sum += obs.value;
                    *count += 1;
                }
            }
        }
        Ok(())
    }

    /// Snapshot every cell into exposition samples.
    #[must_use]
    pub fn collect(&self) -> Vec<Sample> {
        let metrics = self.metrics.lock();
        let mut out = Vec::new();
        for (key, entry) in metrics.iter() {
            for (values, cell) in &entry.series {
                let labels = Labels::from_labels(
                    key.label_names
                        .iter()
                        .zip(values)
                        .map(|(n, v)| Label::new(n.clone(), v.clone())),
                );
                let value = match cell {
                    Cell::Gauge(v) | Cell::Counter(v) => SampleValue::Single(*v),
                    Cell::Histogram { counts, sum, count } => SampleValue::Histogram {
                        buckets: entry
                            .buckets
                            .iter()
                            .copied()
                            .zip(counts.iter().copied())
                            .collect(),
                        sum: *sum,
                        count: *count,
                    },
                };
                out.push(Sample {
                    name: key.name.clone(),
                    help: entry.help.clone(),
                    metric_type: key.metric_type,
                    labels,
                    value,
                    timestamp_ms: None,
                });
            }
        }
        out
    }
}
