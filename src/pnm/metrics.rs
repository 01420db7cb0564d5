//! Prometheus metrics for the PNM pipeline

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::MetricType;

/// Pipeline counters, shared by every stage
///
/// Rendered as Prometheus text on `/metrics`.
#[derive(Debug)]
pub struct PnmMetrics {
    pub samples_accepted: AtomicU64,
    /// Rejection reason (`PnmError::kind`) -> count
    pub samples_rejected: RwLock<BTreeMap<&'static str, u64>>,
    /// Anomalies by metric type
    pub anomalies: RwLock<BTreeMap<MetricType, u64>>,
    pub hypotheses_shared: AtomicU64,
    pub hypotheses_localized: AtomicU64,
    pub remediation_actions: AtomicU64,
    pub unresolved_faults: AtomicU64,
    pub excluded_anomalies: AtomicU64,
    pub late_anomalies: AtomicU64,
    pub bus_dropped: AtomicU64,
    pub baselines_pruned: AtomicU64,
    pub correlation_window_size: AtomicU64,

    /// Time from admission to baseline update + scoring
    pub ingest_latency: LatencyHistogram,
}

/// Fixed-bucket histogram in microseconds
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // 10us .. 100ms
        let buckets = vec![10, 50, 100, 250, 500, 1_000, 5_000, 10_000, 50_000, 100_000];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value_us: u64) {
        for (i, &boundary) in self.buckets.iter().enumerate() {
            if value_us <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.sum.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self, name: &str) -> String {
        let mut output = String::new();
        let mut cumulative = 0u64;

        for (i, &boundary) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name,
                boundary as f64 / 1_000_000.0,
                cumulative
            ));
        }

        let total = self.count.load(Ordering::Relaxed);
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, total));
        output.push_str(&format!(
            "{}_sum {}\n",
            name,
            self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_count {}\n", name, total));

        output
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the scalar counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub samples_accepted: u64,
    pub samples_rejected: u64,
    pub anomalies: u64,
    pub hypotheses_shared: u64,
    pub hypotheses_localized: u64,
    pub remediation_actions: u64,
    pub unresolved_faults: u64,
    pub excluded_anomalies: u64,
    pub late_anomalies: u64,
    pub bus_dropped: u64,
    pub correlation_window_size: u64,
}

impl PnmMetrics {
    pub fn new() -> Self {
        Self {
            samples_accepted: AtomicU64::new(0),
            samples_rejected: RwLock::new(BTreeMap::new()),
            anomalies: RwLock::new(BTreeMap::new()),
            hypotheses_shared: AtomicU64::new(0),
            hypotheses_localized: AtomicU64::new(0),
            remediation_actions: AtomicU64::new(0),
            unresolved_faults: AtomicU64::new(0),
            excluded_anomalies: AtomicU64::new(0),
            late_anomalies: AtomicU64::new(0),
            bus_dropped: AtomicU64::new(0),
            baselines_pruned: AtomicU64::new(0),
            correlation_window_size: AtomicU64::new(0),
            ingest_latency: LatencyHistogram::new(),
        }
    }

    pub fn record_accepted(&self, latency_us: u64) {
        self.samples_accepted.fetch_add(1, Ordering::Relaxed);
        self.ingest_latency.record(latency_us);
    }

    pub fn record_rejected(&self, kind: &'static str) {
        *self.samples_rejected.write().entry(kind).or_insert(0) += 1;
    }

    pub fn record_anomaly(&self, metric: MetricType) {
        *self.anomalies.write().entry(metric).or_insert(0) += 1;
    }

    pub fn record_hypothesis(&self, localized: bool) {
        if localized {
            self.hypotheses_localized.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hypotheses_shared.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_actions(&self, n: usize) {
        self.remediation_actions.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_unresolved(&self) {
        self.unresolved_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_excluded_anomaly(&self) {
        self.excluded_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_anomaly(&self) {
        self.late_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bus_drop(&self) {
        self.bus_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pruned(&self, n: usize) {
        self.baselines_pruned.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn set_window_size(&self, n: usize) {
        self.correlation_window_size.store(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.read().values().sum(),
            anomalies: self.anomalies.read().values().sum(),
            hypotheses_shared: self.hypotheses_shared.load(Ordering::Relaxed),
            hypotheses_localized: self.hypotheses_localized.load(Ordering::Relaxed),
            remediation_actions: self.remediation_actions.load(Ordering::Relaxed),
            unresolved_faults: self.unresolved_faults.load(Ordering::Relaxed),
            excluded_anomalies: self.excluded_anomalies.load(Ordering::Relaxed),
            late_anomalies: self.late_anomalies.load(Ordering::Relaxed),
            bus_dropped: self.bus_dropped.load(Ordering::Relaxed),
            correlation_window_size: self.correlation_window_size.load(Ordering::Relaxed),
        }
    }

    /// Export all metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP pnm_samples_accepted_total Samples admitted to the baseline store\n");
        output.push_str("# TYPE pnm_samples_accepted_total counter\n");
        output.push_str(&format!(
            "pnm_samples_accepted_total {}\n",
            self.samples_accepted.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP pnm_samples_rejected_total Samples rejected at ingestion\n");
        output.push_str("# TYPE pnm_samples_rejected_total counter\n");
        for (reason, count) in self.samples_rejected.read().iter() {
            output.push_str(&format!(
                "pnm_samples_rejected_total{{reason=\"{}\"}} {}\n",
                reason, count
            ));
        }

        output.push_str("\n# HELP pnm_anomalies_total Anomalies detected\n");
        output.push_str("# TYPE pnm_anomalies_total counter\n");
        for (metric, count) in self.anomalies.read().iter() {
            output.push_str(&format!(
                "pnm_anomalies_total{{metric_type=\"{}\"}} {}\n",
                metric, count
            ));
        }

        output.push_str("\n# HELP pnm_fault_hypotheses_total Fault hypotheses emitted\n");
        output.push_str("# TYPE pnm_fault_hypotheses_total counter\n");
        output.push_str(&format!(
            "pnm_fault_hypotheses_total{{scope=\"shared\"}} {}\n",
            self.hypotheses_shared.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "pnm_fault_hypotheses_total{{scope=\"localized\"}} {}\n",
            self.hypotheses_localized.load(Ordering::Relaxed)
        ));

        let counters = [
            (
                "pnm_remediation_actions_total",
                "Remediation actions suggested",
                &self.remediation_actions,
            ),
            (
                "pnm_unresolved_faults_total",
                "Hypotheses with no matching remediation rule",
                &self.unresolved_faults,
            ),
            (
                "pnm_correlation_excluded_total",
                "Anomalies excluded from correlation after a topology lookup failure",
                &self.excluded_anomalies,
            ),
            (
                "pnm_correlation_late_total",
                "Anomalies that arrived behind the correlation window",
                &self.late_anomalies,
            ),
            (
                "pnm_bus_dropped_total",
                "Events dropped for slow subscribers",
                &self.bus_dropped,
            ),
            (
                "pnm_baselines_pruned_total",
                "Idle baselines pruned",
                &self.baselines_pruned,
            ),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!("\n# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, counter.load(Ordering::Relaxed)));
        }

        output.push_str("\n# HELP pnm_correlation_window_size Anomalies buffered in the correlation window\n");
        output.push_str("# TYPE pnm_correlation_window_size gauge\n");
        output.push_str(&format!(
            "pnm_correlation_window_size {}\n",
            self.correlation_window_size.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP pnm_ingest_latency_seconds Per-sample processing latency\n");
        output.push_str("# TYPE pnm_ingest_latency_seconds histogram\n");
        output.push_str(&self.ingest_latency.to_prometheus("pnm_ingest_latency_seconds"));

        output
    }
}

impl Default for PnmMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets() {
        let hist = LatencyHistogram::new();
        hist.record(5);
        hist.record(700);
        hist.record(1_000_000);

        let output = hist.to_prometheus("lat");
        assert!(output.contains("lat_bucket{le=\"0.00001\"} 1"));
        assert!(output.contains("lat_bucket{le=\"0.001\"} 2"));
        assert!(output.contains("lat_bucket{le=\"+Inf\"} 3"));
        assert_eq!(hist.count(), 3);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = PnmMetrics::new();
        metrics.record_accepted(42);
        metrics.record_rejected("invalid_metric");
        metrics.record_rejected("invalid_metric");
        metrics.record_rejected("unknown_device");
        metrics.record_anomaly(MetricType::Mer);
        metrics.record_hypothesis(false);
        metrics.set_window_size(7);

        let output = metrics.to_prometheus();
        assert!(output.contains("pnm_samples_accepted_total 1"));
        assert!(output.contains("pnm_samples_rejected_total{reason=\"invalid_metric\"} 2"));
        assert!(output.contains("pnm_anomalies_total{metric_type=\"MER\"} 1"));
        assert!(output.contains("pnm_fault_hypotheses_total{scope=\"shared\"} 1"));
        assert!(output.contains("pnm_correlation_window_size 7"));

        let snap = metrics.snapshot();
        assert_eq!(snap.samples_rejected, 3);
        assert_eq!(snap.anomalies, 1);
    }
}
