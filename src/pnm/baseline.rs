//! Baseline Store
//!
//! Exponentially weighted mean/variance per (device, metric). Memory is O(1)
//! per key regardless of history length, and the decay lets the baseline
//! follow slow drift from aging plant.
//!
//! Each store is owned by exactly one pipeline shard, so updates need no
//! locking.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use super::config::BaselineConfig;
use super::error::{PnmError, PnmResult};
use crate::models::{Baseline, MetricKey, MetricSample, MetricType, WindowPolicy};

/// Result of folding one sample into its baseline
#[derive(Debug, Clone)]
pub struct BaselineUpdate {
    /// Baseline as it stood immediately before this sample
    pub previous: Option<Baseline>,
    /// Baseline after learning this sample
    pub current: Baseline,
}

/// Per-shard baseline map
pub struct BaselineStore {
    policy: WindowPolicy,
    baselines: HashMap<MetricKey, Baseline>,
    /// Wall-clock time each key last learned a sample. Idle pruning uses this,
    /// not event time, so backfilled history survives.
    touched_at: HashMap<MetricKey, DateTime<Utc>>,
}

impl BaselineStore {
    pub fn new(config: &BaselineConfig) -> Self {
        Self {
            policy: WindowPolicy {
                decay: config.decay,
                min_warm_samples: config.min_warm_samples,
            },
            baselines: HashMap::new(),
            touched_at: HashMap::new(),
        }
    }

    /// Fold a sample into its baseline and return before/after snapshots.
    ///
    /// `mean' = mean + λ(x - mean)` and
    /// `var' = (1 - λ)(var + λ(x - mean)²)`. The first sample seeds the mean
    /// with zero variance.
    pub fn update(&mut self, sample: &MetricSample) -> BaselineUpdate {
        let key = sample.key();
        let lambda = self.policy.decay;
        self.touched_at.insert(key.clone(), Utc::now());

        match self.baselines.get_mut(&key) {
            Some(baseline) => {
                let previous = baseline.clone();

                let diff = sample.value - baseline.mean;
                let increment = lambda * diff;
                baseline.mean += increment;
                baseline.variance = ((1.0 - lambda) * (baseline.variance + diff * increment)).max(0.0);
                baseline.sample_count = baseline.sample_count.saturating_add(1);
                if sample.timestamp > baseline.last_updated {
                    baseline.last_updated = sample.timestamp;
                }

                BaselineUpdate {
                    previous: Some(previous),
                    current: baseline.clone(),
                }
            }
            None => {
                debug!(key = %key, "Seeding baseline");
                let baseline = Baseline {
                    device_id: sample.device_id.clone(),
                    metric_type: sample.metric_type,
                    mean: sample.value,
                    variance: 0.0,
                    sample_count: 1,
                    last_updated: sample.timestamp,
                    window: self.policy,
                };
                self.baselines.insert(key, baseline.clone());
                BaselineUpdate {
                    previous: None,
                    current: baseline,
                }
            }
        }
    }

    /// Warm baseline for the key, or `NotYetWarm` with the current count
    pub fn get_baseline(&self, device_id: &str, metric_type: MetricType) -> PnmResult<Baseline> {
        let key = MetricKey::new(device_id, metric_type);
        match self.baselines.get(&key) {
            Some(baseline) if baseline.is_warm() => Ok(baseline.clone()),
            other => Err(PnmError::NotYetWarm {
                device_id: device_id.to_string(),
                metric_type,
                sample_count: other.map(|b| b.sample_count).unwrap_or(0),
                required: self.policy.min_warm_samples,
            }),
        }
    }

    /// Baseline regardless of warmth
    pub fn peek(&self, key: &MetricKey) -> Option<&Baseline> {
        self.baselines.get(key)
    }

    pub fn last_updated(&self, key: &MetricKey) -> Option<DateTime<Utc>> {
        self.baselines.get(key).map(|b| b.last_updated)
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    /// Drop baselines that have not learned a sample since the wall-clock
    /// `cutoff`; returns how many went
    pub fn prune_idle(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.baselines.len();
        let touched_at = &self.touched_at;
        self.baselines
            .retain(|key, _| touched_at.get(key).map_or(false, |t| *t >= cutoff));
        let baselines = &self.baselines;
        self.touched_at.retain(|key, _| baselines.contains_key(key));
        before - self.baselines.len()
    }
}

/// Percentile of a baseline under a normal approximation
pub fn percentile(baseline: &Baseline, p: f64) -> f64 {
    let sd = baseline.std_dev();
    if sd <= f64::EPSILON {
        return baseline.mean;
    }
    match Normal::new(baseline.mean, sd) {
        Ok(normal) => normal.inverse_cdf(p.clamp(1e-9, 1.0 - 1e-9)),
        Err(_) => baseline.mean,
    }
}

/// Two-sided tail probability of `value` under the baseline
pub fn tail_probability(baseline: &Baseline, value: f64) -> f64 {
    let sd = baseline.std_dev();
    if sd <= f64::EPSILON {
        return if (value - baseline.mean).abs() <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    match Normal::new(baseline.mean, sd) {
        Ok(normal) => {
            let cdf = normal.cdf(value);
            (2.0 * cdf.min(1.0 - cdf)).clamp(0.0, 1.0)
        }
        Err(_) => 1.0,
    }
}

/// p5 / p50 / p95 band for display
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PercentileBand {
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
}

impl PercentileBand {
    pub fn of(baseline: &Baseline) -> Self {
        Self {
            p5: percentile(baseline, 0.05),
            p50: percentile(baseline, 0.50),
            p95: percentile(baseline, 0.95),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn sample(value: f64, secs: i64) -> MetricSample {
        MetricSample::new("cm-1", MetricType::Mer, value, t0() + Duration::seconds(secs))
    }

    fn store(decay: f64, warm: u64) -> BaselineStore {
        BaselineStore::new(&BaselineConfig {
            decay,
            min_warm_samples: warm,
            ..BaselineConfig::default()
        })
    }

    #[test]
    fn test_first_sample_seeds_mean() {
        let mut store = store(0.1, 3);
        let update = store.update(&sample(35.0, 0));
        assert!(update.previous.is_none());
        assert_eq!(update.current.mean, 35.0);
        assert_eq!(update.current.variance, 0.0);
        assert_eq!(update.current.sample_count, 1);
    }

    #[test]
    fn test_single_step_matches_ewma() {
        let mut store = store(0.1, 1);
        store.update(&sample(30.0, 0));
        store.update(&sample(32.0, 1));
        let before = store.peek(&MetricKey::new("cm-1", MetricType::Mer)).unwrap().clone();

        let update = store.update(&sample(40.0, 2));
        let expected = before.mean + 0.1 * (40.0 - before.mean);
        assert!((update.current.mean - expected).abs() < 1e-12);
        assert_eq!(update.previous.unwrap(), before);
    }

    #[test]
    fn test_geometric_convergence() {
        let mut store = store(0.2, 1);
        store.update(&sample(10.0, 0));
        // |mean - 20| shrinks by (1 - λ) each step: 10 * 0.8^n < 1e-3 for n >= 42
        for i in 1..=42 {
            store.update(&sample(20.0, i));
        }
        let b = store.peek(&MetricKey::new("cm-1", MetricType::Mer)).unwrap();
        assert!((b.mean - 20.0).abs() < 1e-3);
        assert!(b.variance < 0.05);
    }

    #[test]
    fn test_sample_count_monotonic_and_warmup() {
        let mut store = store(0.05, 3);
        let mut last = 0;
        for i in 0..5 {
            let update = store.update(&sample(30.0 + i as f64, i));
            assert!(update.current.sample_count > last);
            last = update.current.sample_count;

            let warm = store.get_baseline("cm-1", MetricType::Mer);
            if i < 2 {
                assert!(matches!(warm, Err(PnmError::NotYetWarm { sample_count, .. }) if sample_count == (i + 1) as u64));
            } else {
                assert!(warm.is_ok());
            }
        }
    }

    #[test]
    fn test_unknown_key_is_not_yet_warm() {
        let store = store(0.05, 3);
        match store.get_baseline("cm-x", MetricType::Noise) {
            Err(PnmError::NotYetWarm { sample_count, required, .. }) => {
                assert_eq!(sample_count, 0);
                assert_eq!(required, 3);
            }
            other => panic!("expected NotYetWarm, got {:?}", other),
        }
    }

    #[test]
    fn test_last_updated_never_moves_back() {
        let mut store = store(0.05, 1);
        store.update(&sample(30.0, 100));
        store.update(&sample(30.0, 50));
        assert_eq!(
            store.last_updated(&MetricKey::new("cm-1", MetricType::Mer)),
            Some(t0() + Duration::seconds(100))
        );
    }

    #[test]
    fn test_prune_idle_uses_wall_clock() {
        let mut store = store(0.05, 1);
        store.update(&sample(30.0, 0));
        store.update(&MetricSample::new("cm-2", MetricType::Mer, 30.0, t0() + Duration::hours(5)));

        // Event time is years old, but both keys learned just now
        assert_eq!(store.prune_idle(Utc::now() - Duration::hours(24)), 0);
        assert_eq!(store.len(), 2);
        assert!(store.touched_at.contains_key(&sample(30.0, 0).key()));

        assert_eq!(store.prune_idle(Utc::now() + Duration::seconds(1)), 2);
        assert!(store.is_empty());
        assert!(store.touched_at.is_empty());
    }

    #[test]
    fn test_percentiles_and_tail() {
        let baseline = Baseline {
            device_id: "cm-1".into(),
            metric_type: MetricType::Mer,
            mean: 36.0,
            variance: 4.0,
            sample_count: 50,
            last_updated: t0(),
            window: WindowPolicy {
                decay: 0.05,
                min_warm_samples: 20,
            },
        };
        let band = PercentileBand::of(&baseline);
        assert!((band.p50 - 36.0).abs() < 1e-6);
        assert!((band.p95 - (36.0 + 1.6449 * 2.0)).abs() < 1e-2);
        assert!(band.p5 < band.p50);

        assert!((tail_probability(&baseline, 36.0) - 1.0).abs() < 1e-9);
        // 3σ two-sided tail ≈ 0.0027
        assert!((tail_probability(&baseline, 42.0) - 0.0027).abs() < 1e-3);
    }
}
