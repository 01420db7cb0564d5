//! Anomaly Detector
//!
//! Pure scoring of a sample against a baseline snapshot. "No anomaly" is the
//! common case and is returned as `None`, not an error.

use tracing::debug;

use super::baseline::tail_probability;
use super::config::ThresholdTable;
use crate::models::{AnomalyEvent, Baseline, DetectionMode, MetricSample, QualityFlag};

/// Stateless z-score detector with an absolute-delta fallback
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    thresholds: ThresholdTable,
}

impl AnomalyDetector {
    pub fn new(thresholds: ThresholdTable) -> Self {
        Self { thresholds }
    }

    /// Score `sample` against `baseline`, which must be the snapshot taken
    /// before the sample was learned. Never mutates the baseline.
    pub fn score(&self, sample: &MetricSample, baseline: &Baseline) -> Option<AnomalyEvent> {
        if !baseline.is_warm() || sample.quality != QualityFlag::Good {
            return None;
        }
        if baseline.device_id != sample.device_id || baseline.metric_type != sample.metric_type {
            return None;
        }

        let limits = self.thresholds.get(sample.metric_type);
        let delta = sample.value - baseline.mean;
        let sd = baseline.std_dev();

        let (z_score, mode, anomalous) = if sd >= limits.min_std_dev {
            let z = delta / sd;
            (z, DetectionMode::ZScore, z.abs() > limits.z_score)
        } else {
            // Near-zero variance: a z-score would explode on noise, so judge the
            // raw delta and express it in units of the σ floor.
            let z = delta / limits.min_std_dev;
            (z, DetectionMode::AbsoluteDelta, delta.abs() > limits.abs_delta)
        };

        if !anomalous {
            return None;
        }

        let severity = severity(z_score.abs(), limits.z_score);

        debug!(
            device = %sample.device_id,
            metric = %sample.metric_type,
            value = sample.value,
            mean = baseline.mean,
            z = z_score,
            severity,
            "Anomaly scored"
        );

        Some(AnomalyEvent {
            id: AnomalyEvent::stable_id(&sample.device_id, sample.metric_type, sample.timestamp),
            device_id: sample.device_id.clone(),
            metric_type: sample.metric_type,
            observed_value: sample.value,
            baseline_snapshot: baseline.clone(),
            z_score,
            detection_mode: mode,
            severity,
            tail_probability: tail_probability(baseline, sample.value),
            timestamp: sample.timestamp,
        })
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }
}

/// |z| / (|z| + threshold): 0.5 at the threshold, approaching 1 as |z| grows
pub fn severity(abs_z: f64, threshold: f64) -> f64 {
    if !abs_z.is_finite() {
        return 1.0;
    }
    let threshold = threshold.max(f64::EPSILON);
    (abs_z / (abs_z + threshold)).clamp(0.0, 1.0)
}
