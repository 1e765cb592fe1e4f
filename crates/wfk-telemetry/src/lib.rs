// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tracing setup and per-run metrics aggregation.
//!
//! Export formats and dashboards live outside the kernel; this crate only
//! initializes the subscriber and aggregates node execution samples into
//! summaries.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

/// Initialize the global tracing subscriber.
///
/// Respects `RUST_LOG`; defaults to `info` for `wfk.*` targets. Safe to
/// call more than once — later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// One node execution observed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSample {
    /// The run the node executed under.
    pub run_id: Uuid,

    /// Node id.
    pub node_id: String,

    /// Node type label (`function`, `http`, …).
    pub kind: String,

    /// Wall-clock execution time in milliseconds.
    pub execution_time_ms: u64,

    /// Queue wait before pickup in milliseconds.
    pub queue_time_ms: u64,

    /// Whether the execution failed.
    pub failed: bool,
}

/// Aggregated statistics across recorded samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Number of samples recorded.
    pub count: usize,

    /// Mean execution time in milliseconds.
    pub mean_execution_ms: f64,

    /// Median (p50) execution time in milliseconds.
    pub p50_execution_ms: f64,

    /// 99th-percentile execution time in milliseconds.
    pub p99_execution_ms: f64,

    /// Total queue wait across all samples in milliseconds.
    pub total_queue_ms: u64,

    /// Failure rate (failed / total).
    pub error_rate: f64,

    /// Per-node-type sample counts (deterministic ordering).
    pub kind_counts: BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Thread-safe collector of [`NodeSample`]s.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    samples: Arc<Mutex<Vec<NodeSample>>>,
}

impl MetricsCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample.
    pub fn record(&self, sample: NodeSample) {
        info!(
            target: "wfk.telemetry",
            run_id = %sample.run_id,
            node = %sample.node_id,
            kind = %sample.kind,
            execution_time_ms = sample.execution_time_ms,
            queue_time_ms = sample.queue_time_ms,
            failed = sample.failed,
            "node execution recorded"
        );
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(sample);
        }
    }

    /// Number of recorded samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.lock().map_or(0, |s| s.len())
    }

    /// `true` when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples recorded for one run.
    #[must_use]
    pub fn for_run(&self, run_id: Uuid) -> Vec<NodeSample> {
        self.samples.lock().map_or_else(
            |_| Vec::new(),
            |s| s.iter().filter(|x| x.run_id == run_id).cloned().collect(),
        )
    }

    /// Aggregate all recorded samples.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let samples = match self.samples.lock() {
            Ok(s) => s.clone(),
            Err(_) => return MetricsSummary::default(),
        };
        if samples.is_empty() {
            return MetricsSummary::default();
        }

        let mut execution: Vec<u64> = samples.iter().map(|s| s.execution_time_ms).collect();
        execution.sort_unstable();
        let count = samples.len();
        let total: u64 = execution.iter().sum();
        let failed = samples.iter().filter(|s| s.failed).count();

        let mut kind_counts = BTreeMap::new();
        for sample in &samples {
            *kind_counts.entry(sample.kind.clone()).or_insert(0) += 1;
        }

        MetricsSummary {
            count,
            mean_execution_ms: total as f64 / count as f64,
            p50_execution_ms: percentile(&execution, 0.50),
            p99_execution_ms: percentile(&execution, 0.99),
            total_queue_ms: samples.iter().map(|s| s.queue_time_ms).sum(),
            error_rate: failed as f64 / count as f64,
            kind_counts,
        }
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1] as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(execution_time_ms: u64, failed: bool) -> NodeSample {
        NodeSample {
            run_id: Uuid::now_v7(),
            node_id: "n".into(),
            kind: "function".into(),
            execution_time_ms,
            queue_time_ms: 5,
            failed,
        }
    }

    #[test]
    fn empty_collector_summarizes_to_zero() {
        let collector = MetricsCollector::new();
        assert!(collector.is_empty());
        assert_eq!(collector.summary(), MetricsSummary::default());
    }

    #[test]
    fn summary_aggregates_percentiles_and_errors() {
        let collector = MetricsCollector::new();
        for ms in [10, 20, 30, 40] {
            collector.record(sample(ms, false));
        }
        collector.record(sample(1000, true));

        let summary = collector.summary();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.p50_execution_ms, 30.0);
        assert_eq!(summary.p99_execution_ms, 1000.0);
        assert_eq!(summary.total_queue_ms, 25);
        assert!((summary.error_rate - 0.2).abs() < f64::EPSILON);
        assert_eq!(summary.kind_counts["function"], 5);
    }

    #[test]
    fn for_run_filters_by_run_id() {
        let collector = MetricsCollector::new();
        let mine = sample(10, false);
        let run_id = mine.run_id;
        collector.record(mine);
        collector.record(sample(20, false));
        assert_eq!(collector.for_run(run_id).len(), 1);
    }
}
