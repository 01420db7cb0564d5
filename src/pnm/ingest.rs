//! Metric Ingestor
//!
//! Validates a sample, then hands it to the baseline store and the detector in
//! that order. The detector always sees the baseline snapshot from *before*
//! this sample was learned, so a spike is measured against prior history and
//! not against a baseline it has already pulled toward itself.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use super::baseline::BaselineStore;
use super::config::PnmConfig;
use super::detector::AnomalyDetector;
use super::error::{PnmError, PnmResult};
use super::topology::TopologyIndex;
use crate::models::{AnomalyEvent, Baseline, MetricSample, QualityFlag};

/// What happened to an accepted sample
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// Baseline after learning the sample
    pub baseline: Baseline,
    pub anomaly: Option<AnomalyEvent>,
}

/// Validation + baseline update + scoring for one shard of keys
pub struct MetricIngestor {
    topology: Arc<TopologyIndex>,
    baselines: BaselineStore,
    detector: AnomalyDetector,
    staleness_bound: ChronoDuration,
    max_clock_skew: ChronoDuration,
}

impl MetricIngestor {
    pub fn new(config: &PnmConfig, topology: Arc<TopologyIndex>) -> Self {
        let staleness_bound = ChronoDuration::from_std(config.ingest.staleness_bound)
            .unwrap_or_else(|_| ChronoDuration::minutes(15));
        let max_clock_skew = ChronoDuration::from_std(config.ingest.max_clock_skew)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));

        Self {
            topology,
            baselines: BaselineStore::new(&config.baseline),
            detector: AnomalyDetector::new(config.thresholds.clone()),
            staleness_bound,
            max_clock_skew,
        }
    }

    /// Admit a sample. Rejections leave the baseline untouched.
    pub fn ingest(&mut self, sample: &MetricSample) -> PnmResult<IngestOutcome> {
        if let Err(e) = self.validate(sample) {
            warn!(
                device = %sample.device_id,
                metric = %sample.metric_type,
                reason = e.kind(),
                "Dropping sample: {}",
                e
            );
            return Err(e);
        }

        let update = self.baselines.update(sample);
        let anomaly = update
            .previous
            .as_ref()
            .and_then(|prior| self.detector.score(sample, prior));

        debug!(
            device = %sample.device_id,
            metric = %sample.metric_type,
            count = update.current.sample_count,
            anomalous = anomaly.is_some(),
            "Sample accepted"
        );

        Ok(IngestOutcome {
            baseline: update.current,
            anomaly,
        })
    }

    /// All admission checks, cheapest first
    pub fn validate(&self, sample: &MetricSample) -> PnmResult<()> {
        let limits = self.detector.thresholds().get(sample.metric_type);
        let invalid = |reason: &'static str| PnmError::InvalidMetric {
            metric_type: sample.metric_type,
            value: sample.value,
            reason,
        };

        if sample.quality == QualityFlag::Invalid {
            return Err(invalid("flagged invalid by collector"));
        }
        if sample.value.is_nan() {
            return Err(invalid("value is NaN"));
        }
        if !sample.value.is_finite() {
            return Err(invalid("value is infinite"));
        }
        if !limits.in_range(sample.value) {
            return Err(invalid("outside physical range"));
        }
        // A future reading would become last_updated and make every on-time
        // sample for the key stale
        if sample.timestamp > Utc::now() + self.max_clock_skew {
            return Err(invalid("timestamp in the future"));
        }

        if !self.topology.contains_device(&sample.device_id) {
            return Err(PnmError::UnknownDevice(sample.device_id.clone()));
        }

        if let Some(last_updated) = self.baselines.last_updated(&sample.key()) {
            if sample.timestamp == last_updated {
                return Err(PnmError::DuplicateSample {
                    device_id: sample.device_id.clone(),
                    metric_type: sample.metric_type,
                    timestamp: sample.timestamp,
                });
            }
            if sample.timestamp < last_updated - self.staleness_bound {
                return Err(PnmError::StaleSample {
                    device_id: sample.device_id.clone(),
                    metric_type: sample.metric_type,
                    timestamp: sample.timestamp,
                    last_updated,
                });
            }
        }

        Ok(())
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn baselines_mut(&mut self) -> &mut BaselineStore {
        &mut self.baselines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricType;
    use crate::pnm::topology::tests::sample_document;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn ingestor() -> MetricIngestor {
        let topology = Arc::new(TopologyIndex::from_document(sample_document()).unwrap());
        MetricIngestor::new(&PnmConfig::default(), topology)
    }

    fn loss(value: f64, secs: i64) -> MetricSample {
        MetricSample::new(
            "cm-a",
            MetricType::PacketLoss,
            value,
            t0() + ChronoDuration::seconds(secs),
        )
    }

    #[test]
    fn test_nan_rejected_and_state_unchanged() {
        let mut ing = ingestor();
        ing.ingest(&loss(0.0, 0)).unwrap();
        let before = ing.baselines().peek(&loss(0.0, 0).key()).cloned();

        let err = ing.ingest(&loss(f64::NAN, 60)).unwrap_err();
        assert_eq!(err.kind(), "invalid_metric");
        assert_eq!(ing.baselines().peek(&loss(0.0, 0).key()).cloned(), before);
    }

    #[test]
    fn test_out_of_range_and_invalid_flag() {
        let mut ing = ingestor();
        assert_eq!(ing.ingest(&loss(1.5, 0)).unwrap_err().kind(), "invalid_metric");
        let flagged = loss(0.1, 0).with_quality(QualityFlag::Invalid);
        assert_eq!(ing.ingest(&flagged).unwrap_err().kind(), "invalid_metric");
        assert!(ing.baselines().is_empty());
    }

    #[test]
    fn test_unknown_device_rejected() {
        let mut ing = ingestor();
        let s = MetricSample::new("cm-ghost", MetricType::Mer, 35.0, t0());
        assert_eq!(
            ing.ingest(&s).unwrap_err(),
            PnmError::UnknownDevice("cm-ghost".into())
        );
        assert!(ing.baselines().is_empty());
    }

    #[test]
    fn test_stale_and_duplicate() {
        let mut ing = ingestor();
        ing.ingest(&loss(0.0, 3600)).unwrap();

        // Exact replay is a duplicate
        assert_eq!(ing.ingest(&loss(0.0, 3600)).unwrap_err().kind(), "duplicate_sample");
        // Slightly late but within the 15 minute bound is fine
        ing.ingest(&loss(0.0, 3000)).unwrap();
        // Beyond the bound is stale
        assert_eq!(ing.ingest(&loss(0.0, 100)).unwrap_err().kind(), "stale_sample");

        let count = ing.baselines().peek(&loss(0.0, 0).key()).unwrap().sample_count;
        assert_eq!(count, 2);
    }

    #[test]
    fn test_future_timestamp_rejected_and_key_keeps_learning() {
        let mut ing = ingestor();
        for i in 0..30 {
            ing.ingest(&loss(0.0, i * 60)).unwrap();
        }

        let future = MetricSample::new(
            "cm-a",
            MetricType::PacketLoss,
            0.0,
            Utc::now() + ChronoDuration::days(3650),
        );
        match ing.ingest(&future).unwrap_err() {
            PnmError::InvalidMetric { reason, .. } => assert_eq!(reason, "timestamp in the future"),
            other => panic!("expected InvalidMetric, got {:?}", other),
        }

        let next = ing.ingest(&loss(0.0, 30 * 60)).unwrap();
        assert_eq!(next.baseline.sample_count, 31);
        assert_eq!(next.baseline.last_updated, t0() + ChronoDuration::seconds(30 * 60));

        // Within the allowed skew is fine
        let slightly_ahead = MetricSample::new(
            "cm-b",
            MetricType::PacketLoss,
            0.0,
            Utc::now() + ChronoDuration::minutes(1),
        );
        ing.ingest(&slightly_ahead).unwrap();
    }

    #[test]
    fn test_spike_after_flat_history() {
        let mut ing = ingestor();
        for i in 0..50 {
            assert!(ing.ingest(&loss(0.0, i * 60)).unwrap().anomaly.is_none());
        }
        let outcome = ing.ingest(&loss(0.9, 50 * 60)).unwrap();
        let anomaly = outcome.anomaly.expect("spike should be flagged");

        // Scored against the pre-update baseline
        assert_eq!(anomaly.baseline_snapshot.mean, 0.0);
        assert_eq!(anomaly.baseline_snapshot.sample_count, 50);
        assert!(outcome.baseline.mean > 0.0);
        assert!(anomaly.severity > 0.9);
    }
}
