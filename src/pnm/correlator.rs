//! Topology Correlator (fault localizer)
//!
//! Groups anomalies from different devices by the plant elements they share.
//! The window is an arena of anomalies keyed by (event time, arrival seq),
//! with secondary indexes by ancestor node and by device, so eviction walks
//! the front of a `BTreeMap` and grouping is a set lookup per ancestor.
//!
//! The correlator is single-writer: the pipeline runs exactly one task that
//! owns it and feeds it over a bounded queue. Eviction is lazy and happens on
//! every insert, driven by event time rather than a wall-clock timer.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::CorrelationConfig;
use super::metrics::PnmMetrics;
use super::topology::{TopologyIndex, TopologySnapshot};
use crate::models::{AnomalyEvent, FaultHypothesis, FaultScope, TimeWindow};

type EntryKey = (DateTime<Utc>, u64);

struct WindowEntry {
    event: Arc<AnomalyEvent>,
    /// Path as resolved when the anomaly arrived
    path: Arc<[String]>,
}

/// Last hypothesis emitted for a node, used for supersession
#[derive(Debug, Clone)]
struct EmittedRecord {
    lineage_id: Uuid,
    revision: u32,
    last_id: Uuid,
    confidence: f64,
    distinct_devices: usize,
    /// Newest evidence timestamp; once it leaves the window the lineage ends
    last_evidence: DateTime<Utc>,
}

/// Scored grouping under one node
struct Candidate {
    node_id: String,
    scope: FaultScope,
    keys: Vec<EntryKey>,
    distinct_devices: usize,
    confidence: f64,
}

pub struct TopologyCorrelator {
    topology: Arc<TopologyIndex>,
    metrics: Arc<PnmMetrics>,
    window: ChronoDuration,
    min_distinct_devices: usize,
    proximity_decay: f64,
    local_min_anomalies: usize,
    max_clock_skew: ChronoDuration,

    entries: BTreeMap<EntryKey, WindowEntry>,
    by_ancestor: HashMap<String, BTreeSet<EntryKey>>,
    by_device: HashMap<String, BTreeSet<EntryKey>>,
    seen: HashSet<Uuid>,
    next_seq: u64,
    watermark: Option<DateTime<Utc>>,
    emitted: HashMap<String, EmittedRecord>,
}

impl TopologyCorrelator {
    pub fn new(
        config: &CorrelationConfig,
        topology: Arc<TopologyIndex>,
        metrics: Arc<PnmMetrics>,
    ) -> Self {
        let window =
            ChronoDuration::from_std(config.window).unwrap_or_else(|_| ChronoDuration::minutes(5));

        Self {
            topology,
            metrics,
            window,
            min_distinct_devices: config.min_distinct_devices.max(1),
            proximity_decay: config.proximity_decay,
            local_min_anomalies: config.local_min_anomalies,
            max_clock_skew: ChronoDuration::minutes(5),
            entries: BTreeMap::new(),
            by_ancestor: HashMap::new(),
            by_device: HashMap::new(),
            seen: HashSet::new(),
            next_seq: 0,
            watermark: None,
            emitted: HashMap::new(),
        }
    }

    /// Anomalies dated further than `skew` past wall-clock now are dropped
    /// before they can advance the watermark.
    pub fn with_max_clock_skew(mut self, skew: std::time::Duration) -> Self {
        if let Ok(skew) = ChronoDuration::from_std(skew) {
            self.max_clock_skew = skew;
        }
        self
    }

    /// Buffer an anomaly and return a hypothesis if it created or
    /// strengthened one. `None` means "buffered, nothing new to say".
    pub fn correlate(&mut self, event: &AnomalyEvent) -> Option<FaultHypothesis> {
        // Paths are snapshotted per invocation; a concurrent refresh cannot
        // change them underneath this call.
        let snapshot = self.topology.snapshot();
        let path: Arc<[String]> = match snapshot.resolve_path(&event.device_id) {
            Ok(path) => path.to_vec().into(),
            Err(e) => {
                warn!(
                    device = %event.device_id,
                    anomaly = %event.id,
                    "Excluding anomaly from correlation: {}",
                    e
                );
                self.metrics.record_excluded_anomaly();
                return None;
            }
        };

        if self.seen.contains(&event.id) {
            debug!(anomaly = %event.id, "Duplicate anomaly ignored");
            return None;
        }

        if event.timestamp > Utc::now() + self.max_clock_skew {
            warn!(
                device = %event.device_id,
                timestamp = %event.timestamp,
                "Dropping anomaly dated in the future"
            );
            self.metrics.record_late_anomaly();
            return None;
        }

        if let Some(watermark) = self.watermark {
            if event.timestamp < watermark - self.window {
                warn!(
                    device = %event.device_id,
                    timestamp = %event.timestamp,
                    watermark = %watermark,
                    "Dropping late anomaly"
                );
                self.metrics.record_late_anomaly();
                return None;
            }
        }

        self.insert(event, path.clone());
        self.evict();
        self.metrics.set_window_size(self.entries.len());

        let candidate = self
            .best_shared(&path)
            .or_else(|| self.local(&event.device_id))?;

        self.emit(candidate, &snapshot)
    }

    fn insert(&mut self, event: &AnomalyEvent, path: Arc<[String]>) {
        let key = (event.timestamp, self.next_seq);
        self.next_seq += 1;

        for hop in path.iter() {
            self.by_ancestor.entry(hop.clone()).or_default().insert(key);
        }
        self.by_device
            .entry(event.device_id.clone())
            .or_default()
            .insert(key);
        self.seen.insert(event.id);
        self.entries.insert(
            key,
            WindowEntry {
                event: Arc::new(event.clone()),
                path,
            },
        );

        self.watermark = Some(match self.watermark {
            Some(w) if w >= event.timestamp => w,
            _ => event.timestamp,
        });
    }

    /// Drop everything older than `watermark - window`
    fn evict(&mut self) {
        let Some(watermark) = self.watermark else {
            return;
        };
        let cutoff = watermark - self.window;

        while let Some((&key, _)) = self.entries.first_key_value() {
            if key.0 >= cutoff {
                break;
            }
            let Some(entry) = self.entries.remove(&key) else {
                break;
            };
            for hop in entry.path.iter() {
                if let Some(keys) = self.by_ancestor.get_mut(hop) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        self.by_ancestor.remove(hop);
                    }
                }
            }
            if let Some(keys) = self.by_device.get_mut(&entry.event.device_id) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.by_device.remove(&entry.event.device_id);
                }
            }
            self.seen.remove(&entry.event.id);
        }

        self.emitted.retain(|node, record| {
            let live = record.last_evidence >= cutoff;
            if !live {
                debug!(node = %node, lineage = %record.lineage_id, "Hypothesis lineage closed");
            }
            live
        });
    }

    /// Highest-confidence ancestor on `path` with enough distinct devices.
    /// Ties go to the ancestor nearest the devices.
    fn best_shared(&self, path: &[String]) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;

        for node in path {
            let Some(keys) = self.by_ancestor.get(node) else {
                continue;
            };

            // device -> (max severity, hop distance of node on its path)
            let mut per_device: HashMap<&str, (f64, usize)> = HashMap::new();
            for key in keys {
                let Some(entry) = self.entries.get(key) else {
                    continue;
                };
                let hop = entry
                    .path
                    .iter()
                    .position(|h| h == node)
                    .unwrap_or(entry.path.len());
                let slot = per_device
                    .entry(entry.event.device_id.as_str())
                    .or_insert((0.0, hop));
                slot.0 = slot.0.max(entry.event.severity);
                slot.1 = hop;
            }

            let distinct = per_device.len();
            if distinct < self.min_distinct_devices {
                continue;
            }

            let mean_severity =
                per_device.values().map(|(s, _)| *s).sum::<f64>() / distinct as f64;
            let mean_hop =
                per_device.values().map(|(_, h)| *h as f64).sum::<f64>() / distinct as f64;
            let confidence = confidence(distinct, mean_severity, mean_hop, self.proximity_decay);

            let better = match &best {
                None => true,
                Some(b) => confidence > b.confidence + 1e-12,
            };
            if better {
                best = Some(Candidate {
                    node_id: node.clone(),
                    scope: FaultScope::Shared,
                    keys: keys.iter().copied().collect(),
                    distinct_devices: distinct,
                    confidence,
                });
            }
        }

        best
    }

    /// Device-local issue: one device, repeated anomalies, no shared ancestor
    fn local(&self, device_id: &str) -> Option<Candidate> {
        if self.local_min_anomalies == 0 {
            return None;
        }
        let keys = self.by_device.get(device_id)?;
        if keys.len() < self.local_min_anomalies {
            return None;
        }

        let max_severity = keys
            .iter()
            .filter_map(|k| self.entries.get(k))
            .map(|e| e.event.severity)
            .fold(0.0, f64::max);

        Some(Candidate {
            node_id: device_id.to_string(),
            scope: FaultScope::Localized,
            keys: keys.iter().copied().collect(),
            distinct_devices: 1,
            confidence: confidence(1, max_severity, 0.0, self.proximity_decay),
        })
    }

    fn emit(
        &mut self,
        candidate: Candidate,
        snapshot: &TopologySnapshot,
    ) -> Option<FaultHypothesis> {
        let anomalies: Vec<AnomalyEvent> = candidate
            .keys
            .iter()
            .filter_map(|k| self.entries.get(k))
            .map(|e| e.event.as_ref().clone())
            .collect();
        let first = anomalies.first()?;
        let start = anomalies.iter().map(|a| a.timestamp).min()?;
        let end = anomalies.iter().map(|a| a.timestamp).max()?;

        let (lineage_id, revision, supersedes) = match self.emitted.get(&candidate.node_id) {
            Some(prior) => {
                let strengthened = candidate.distinct_devices > prior.distinct_devices
                    || candidate.confidence > prior.confidence + 1e-9;
                if !strengthened {
                    debug!(node = %candidate.node_id, "Evidence added without strengthening hypothesis");
                    return None;
                }
                (prior.lineage_id, prior.revision + 1, Some(prior.last_id))
            }
            None => (
                Uuid::new_v5(&first.id, candidate.node_id.as_bytes()),
                0,
                None,
            ),
        };
        let id = Uuid::new_v5(&lineage_id, &revision.to_be_bytes());

        let hypothesis = FaultHypothesis {
            id,
            lineage_id,
            revision,
            supersedes,
            suspected_node_class: snapshot.node_class(&candidate.node_id),
            suspected_node_id: candidate.node_id.clone(),
            scope: candidate.scope,
            contributing_anomalies: anomalies,
            distinct_devices: candidate.distinct_devices,
            confidence: candidate.confidence,
            time_window: TimeWindow { start, end },
        };

        self.emitted.insert(
            candidate.node_id,
            EmittedRecord {
                lineage_id,
                revision,
                last_id: id,
                confidence: hypothesis.confidence,
                distinct_devices: hypothesis.distinct_devices,
                last_evidence: end,
            },
        );

        info!(
            node = %hypothesis.suspected_node_id,
            class = %hypothesis.suspected_node_class,
            scope = ?hypothesis.scope,
            devices = hypothesis.distinct_devices,
            anomalies = hypothesis.contributing_anomalies.len(),
            confidence = %format!("{:.3}", hypothesis.confidence),
            revision,
            "Fault hypothesis"
        );

        Some(hypothesis)
    }

    /// Anomalies currently buffered
    pub fn window_len(&self) -> usize {
        self.entries.len()
    }

    /// Newest event time seen
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }
}

/// `n/(n+1) · (0.5 + 0.5·severity) · decay^hops`
///
/// Grows with the number of devices and their severity, and shrinks the
/// further the node sits from the devices.
pub fn confidence(distinct_devices: usize, mean_severity: f64, mean_hop: f64, decay: f64) -> f64 {
    let n = distinct_devices as f64;
    let breadth = n / (n + 1.0);
    let strength = 0.5 + 0.5 * mean_severity.clamp(0.0, 1.0);
    let proximity = decay.clamp(0.0, 1.0).powf(mean_hop.max(0.0));
    (breadth * strength * proximity).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Baseline, DetectionMode, DeviceClass, MetricType, WindowPolicy};
    use crate::pnm::topology::tests::sample_document;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn anomaly(device: &str, metric: MetricType, secs: i64, severity: f64) -> AnomalyEvent {
        let ts = t0() + ChronoDuration::seconds(secs);
        AnomalyEvent {
            id: AnomalyEvent::stable_id(device, metric, ts),
            device_id: device.into(),
            metric_type: metric,
            observed_value: 20.0,
            baseline_snapshot: Baseline {
                device_id: device.into(),
                metric_type: metric,
                mean: 36.0,
                variance: 1.0,
                sample_count: 40,
                last_updated: ts,
                window: WindowPolicy {
                    decay: 0.05,
                    min_warm_samples: 20,
                },
            },
            z_score: -16.0,
            detection_mode: DetectionMode::ZScore,
            severity,
            tail_probability: 0.0,
            timestamp: ts,
        }
    }

    fn correlator(config: CorrelationConfig) -> TopologyCorrelator {
        let topology = Arc::new(TopologyIndex::from_document(sample_document()).unwrap());
        TopologyCorrelator::new(&config, topology, Arc::new(PnmMetrics::new()))
    }

    #[test]
    fn test_two_devices_under_amplifier() {
        let mut c = correlator(CorrelationConfig::default());
        assert!(c.correlate(&anomaly("cm-a", MetricType::Mer, 0, 0.8)).is_none());

        let h = c
            .correlate(&anomaly("cm-b", MetricType::Mer, 120, 0.8))
            .expect("shared amplifier should be suspected");
        assert_eq!(h.suspected_node_id, "amp-1");
        assert_eq!(h.suspected_node_class, DeviceClass::Amplifier);
        assert_eq!(h.scope, FaultScope::Shared);
        assert_eq!(h.distinct_devices, 2);
        assert_eq!(h.revision, 0);
        assert!(h.supersedes.is_none());
        assert!((h.confidence - confidence(2, 0.8, 0.0, 0.85)).abs() < 1e-12);
        assert_eq!(h.time_window.span(), ChronoDuration::seconds(120));
    }

    #[test]
    fn test_single_device_never_shared() {
        let mut c = correlator(CorrelationConfig::default());
        for i in 0..20 {
            if let Some(h) = c.correlate(&anomaly("cm-a", MetricType::Noise, i * 10, 0.9)) {
                assert_eq!(h.scope, FaultScope::Localized);
                assert_eq!(h.suspected_node_id, "cm-a");
                assert_eq!(h.distinct_devices, 1);
            }
        }
    }

    #[test]
    fn test_localized_after_threshold() {
        let mut c = correlator(CorrelationConfig::default());
        assert!(c.correlate(&anomaly("cm-c", MetricType::Mer, 0, 0.7)).is_none());
        assert!(c.correlate(&anomaly("cm-c", MetricType::Mer, 10, 0.7)).is_none());
        let h = c.correlate(&anomaly("cm-c", MetricType::Mer, 20, 0.7)).unwrap();
        assert_eq!(h.scope, FaultScope::Localized);
        assert_eq!(h.suspected_node_class, DeviceClass::CableModem);
        assert_eq!(h.contributing_anomalies.len(), 3);
    }

    #[test]
    fn test_localized_disabled() {
        let mut c = correlator(CorrelationConfig {
            local_min_anomalies: 0,
            ..CorrelationConfig::default()
        });
        for i in 0..10 {
            assert!(c.correlate(&anomaly("cm-a", MetricType::Mer, i, 0.9)).is_none());
        }
    }

    #[test]
    fn test_outside_window_not_grouped() {
        let mut c = correlator(CorrelationConfig::default());
        c.correlate(&anomaly("cm-a", MetricType::Mer, 0, 0.8));
        // Six minutes later the first anomaly has been evicted
        assert!(c.correlate(&anomaly("cm-b", MetricType::Mer, 360, 0.8)).is_none());
        assert_eq!(c.window_len(), 1);
    }

    #[test]
    fn test_late_anomaly_dropped() {
        let mut c = correlator(CorrelationConfig::default());
        c.correlate(&anomaly("cm-a", MetricType::Mer, 600, 0.8));
        assert!(c.correlate(&anomaly("cm-b", MetricType::Mer, 0, 0.8)).is_none());
        assert_eq!(c.window_len(), 1);
    }

    #[test]
    fn test_future_anomaly_does_not_advance_watermark() {
        let mut c = correlator(CorrelationConfig::default());
        let mut ahead = anomaly("cm-c", MetricType::Mer, 0, 0.9);
        ahead.timestamp = Utc::now() + ChronoDuration::days(365);
        ahead.id = AnomalyEvent::stable_id("cm-c", MetricType::Mer, ahead.timestamp);

        assert!(c.correlate(&ahead).is_none());
        assert_eq!(c.window_len(), 0);
        assert!(c.watermark().is_none());
        assert_eq!(c.metrics.snapshot().late_anomalies, 1);

        assert!(c.correlate(&anomaly("cm-a", MetricType::Mer, 0, 0.8)).is_none());
        let h = c
            .correlate(&anomaly("cm-b", MetricType::Mer, 60, 0.8))
            .expect("on-time anomalies still correlate");
        assert_eq!(h.suspected_node_id, "amp-1");
    }

    #[test]
    fn test_no_decay_tie_goes_to_nearest_ancestor() {
        let mut c = correlator(CorrelationConfig {
            proximity_decay: 1.0,
            ..CorrelationConfig::default()
        });
        c.correlate(&anomaly("cm-a", MetricType::Mer, 0, 0.8));
        let h = c.correlate(&anomaly("cm-b", MetricType::Mer, 30, 0.8)).unwrap();

        // amp-1, fn-1 and cmts-1 all score the same without decay
        let flat = confidence(2, 0.8, 0.0, 1.0);
        assert!((confidence(2, 0.8, 2.0, 1.0) - flat).abs() < 1e-12);
        assert_eq!(h.suspected_node_id, "amp-1");
        assert_eq!(h.suspected_node_class, DeviceClass::Amplifier);
        assert!((h.confidence - flat).abs() < 1e-12);
    }

    #[test]
    fn test_supersession_on_strengthening() {
        let mut c = correlator(CorrelationConfig::default());
        c.correlate(&anomaly("cm-a", MetricType::Mer, 0, 0.6));
        let first = c.correlate(&anomaly("cm-b", MetricType::Mer, 30, 0.6)).unwrap();

        // Same devices, same severity: evidence only, no re-emission
        assert!(c.correlate(&anomaly("cm-a", MetricType::Mer, 40, 0.6)).is_none());

        let second = c.correlate(&anomaly("cm-b", MetricType::Mer, 60, 0.95)).unwrap();
        assert_eq!(second.suspected_node_id, first.suspected_node_id);
        assert_eq!(second.lineage_id, first.lineage_id);
        assert_eq!(second.revision, 1);
        assert_eq!(second.supersedes, Some(first.id));
        assert!(second.confidence > first.confidence);
    }

    #[test]
    fn test_cross_amplifier_blames_fiber_node() {
        let mut c = correlator(CorrelationConfig::default());
        c.correlate(&anomaly("cm-a", MetricType::Noise, 0, 0.8));
        let h = c.correlate(&anomaly("cm-c", MetricType::Noise, 10, 0.8)).unwrap();
        assert_eq!(h.suspected_node_id, "fn-1");
        assert_eq!(h.suspected_node_class, DeviceClass::FiberNode);
    }

    #[test]
    fn test_unknown_device_excluded() {
        let mut c = correlator(CorrelationConfig::default());
        assert!(c.correlate(&anomaly("ghost", MetricType::Mer, 0, 0.9)).is_none());
        assert_eq!(c.window_len(), 0);
        assert_eq!(c.metrics.snapshot().excluded_anomalies, 1);
    }

    #[test]
    fn test_duplicate_anomaly_ignored() {
        let mut c = correlator(CorrelationConfig::default());
        let a = anomaly("cm-a", MetricType::Mer, 0, 0.8);
        c.correlate(&a);
        c.correlate(&a);
        assert_eq!(c.window_len(), 1);
    }

    #[test]
    fn test_contributing_anomalies_share_ancestor_and_window() {
        let mut c = correlator(CorrelationConfig::default());
        let topology = TopologyIndex::from_document(sample_document()).unwrap();
        let mut hypotheses = Vec::new();
        for (i, device) in ["cm-a", "cm-b", "cm-c", "cm-a", "cm-c", "cm-b"].iter().enumerate() {
            let severity = 0.5 + 0.08 * i as f64;
            if let Some(h) = c.correlate(&anomaly(device, MetricType::Mer, i as i64 * 70, severity)) {
                hypotheses.push(h);
            }
        }
        assert!(!hypotheses.is_empty());
        for h in hypotheses {
            assert!(h.time_window.span() <= ChronoDuration::minutes(5));
            for a in &h.contributing_anomalies {
                let path = topology.resolve_path(&a.device_id).unwrap();
                assert!(path.contains(&h.suspected_node_id));
            }
        }
    }

    #[test]
    fn test_confidence_prefers_breadth_and_proximity() {
        assert!(confidence(3, 0.8, 0.0, 0.85) > confidence(2, 0.8, 0.0, 0.85));
        assert!(confidence(2, 0.8, 0.0, 0.85) > confidence(2, 0.8, 1.0, 0.85));
        assert!(confidence(2, 0.9, 0.0, 0.85) > confidence(2, 0.5, 0.0, 0.85));
        assert!(confidence(100, 1.0, 0.0, 1.0) <= 1.0);
    }
}
