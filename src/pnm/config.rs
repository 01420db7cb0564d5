//! PNM Pipeline Configuration

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{ActionType, DeviceClass, MetricType};

/// Main configuration for the analysis pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PnmConfig {
    /// Baseline learning settings
    #[serde(default)]
    pub baseline: BaselineConfig,

    /// Sample admission and worker sharding
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Per-metric anomaly thresholds and physical ranges
    #[serde(default)]
    pub thresholds: ThresholdTable,

    /// Fault localization window
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Event delivery
    #[serde(default)]
    pub bus: BusConfig,

    /// Topology source and refresh
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Remediation rule overrides
    #[serde(default)]
    pub remediation: RemediationConfig,
}

impl PnmConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment or default path
    pub fn from_env() -> Self {
        let path =
            std::env::var("PNM_CONFIG_PATH").unwrap_or_else(|_| "openpnm.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default pnm config ({}): {:#}", path, e);
            Self::default()
        })
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        let decay = self.baseline.decay;
        if !(decay > 0.0 && decay <= 1.0) {
            bail!("baseline.decay must be in (0, 1], got {}", decay);
        }
        if self.baseline.min_warm_samples == 0 {
            bail!("baseline.min_warm_samples must be at least 1");
        }
        if self.ingest.workers == 0 || self.ingest.queue_capacity == 0 {
            bail!("ingest.workers and ingest.queue_capacity must be non-zero");
        }
        for metric in MetricType::ALL {
            let t = self.thresholds.get(metric);
            if !(t.z_score > 0.0 && t.abs_delta > 0.0 && t.min_std_dev > 0.0) {
                bail!("thresholds for {} must be positive", metric);
            }
            if !(t.min_value < t.max_value) {
                bail!("physical range for {} is empty", metric);
            }
        }
        if self.correlation.min_distinct_devices == 0 {
            bail!("correlation.min_distinct_devices must be at least 1");
        }
        if self.correlation.window.is_zero() {
            bail!("correlation.window must be non-zero");
        }
        let decay = self.correlation.proximity_decay;
        if !(decay > 0.0 && decay <= 1.0) {
            bail!("correlation.proximity_decay must be in (0, 1], got {}", decay);
        }
        if self.correlation.queue_capacity == 0 || self.bus.queue_capacity == 0 {
            bail!("queue capacities must be non-zero");
        }
        if self.topology.refresh_interval.is_zero() {
            bail!("topology.refresh_interval must be non-zero");
        }
        if self.bus.overflow == OverflowPolicy::Backpressure && self.bus.publish_timeout.is_zero() {
            bail!("bus.publish_timeout must be non-zero under backpressure");
        }
        Ok(())
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Baseline calculation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Exponential decay λ per sample
    pub decay: f64,
    /// Samples before a baseline is considered warm
    pub min_warm_samples: u64,
    /// Baselines untouched for this long are dropped
    #[serde(with = "duration_serde")]
    pub idle_ttl: Duration,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            decay: 0.05,          // ~20 sample effective memory
            min_warm_samples: 20,
            idle_ttl: Duration::from_secs(86400), // 24h
        }
    }
}

/// Sample admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Samples older than the key's last update minus this are stale
    #[serde(with = "duration_serde")]
    pub staleness_bound: Duration,
    /// Number of single-owner baseline shards
    pub workers: usize,
    /// Per-shard queue depth
    pub queue_capacity: usize,
    /// Samples and anomalies dated further than this past wall-clock now are
    /// rejected
    #[serde(with = "duration_serde")]
    pub max_clock_skew: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            staleness_bound: Duration::from_secs(900), // 15m
            workers: 4,
            queue_capacity: 1024,
            max_clock_skew: Duration::from_secs(300), // 5m
        }
    }
}

/// Thresholds and physical range for one metric type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    /// |z| above which a sample is anomalous
    pub z_score: f64,
    /// σ below this switches the detector to absolute-delta mode
    pub min_std_dev: f64,
    /// |value - mean| above which a sample is anomalous in absolute-delta mode
    pub abs_delta: f64,
    /// Lowest physically plausible reading
    pub min_value: f64,
    /// Highest physically plausible reading
    pub max_value: f64,
}

impl MetricThresholds {
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min_value && value <= self.max_value
    }
}

/// One entry per metric type so lookups stay exhaustive.
///
/// Deserializes as overrides on top of the defaults: any metric or field left
/// out keeps its default value.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdTable {
    pub signal_level: MetricThresholds,
    pub tx_power: MetricThresholds,
    pub noise: MetricThresholds,
    pub mer: MetricThresholds,
    pub packet_loss: MetricThresholds,
    pub codeword_errors: MetricThresholds,
}

impl ThresholdTable {
    pub fn get(&self, metric: MetricType) -> &MetricThresholds {
        match metric {
            MetricType::SignalLevel => &self.signal_level,
            MetricType::TxPower => &self.tx_power,
            MetricType::Noise => &self.noise,
            MetricType::Mer => &self.mer,
            MetricType::PacketLoss => &self.packet_loss,
            MetricType::CodewordErrors => &self.codeword_errors,
        }
    }

    pub fn get_mut(&mut self, metric: MetricType) -> &mut MetricThresholds {
        match metric {
            MetricType::SignalLevel => &mut self.signal_level,
            MetricType::TxPower => &mut self.tx_power,
            MetricType::Noise => &mut self.noise,
            MetricType::Mer => &mut self.mer,
            MetricType::PacketLoss => &mut self.packet_loss,
            MetricType::CodewordErrors => &mut self.codeword_errors,
        }
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            signal_level: MetricThresholds {
                z_score: 3.0,
                min_std_dev: 0.1,
                abs_delta: 3.0, // dB
                min_value: -40.0,
                max_value: 80.0,
            },
            tx_power: MetricThresholds {
                z_score: 3.0,
                min_std_dev: 0.1,
                abs_delta: 3.0,
                min_value: 0.0,
                max_value: 70.0,
            },
            noise: MetricThresholds {
                z_score: 3.0,
                min_std_dev: 0.1,
                abs_delta: 3.0,
                min_value: -100.0,
                max_value: 40.0,
            },
            mer: MetricThresholds {
                z_score: 3.0,
                min_std_dev: 0.1,
                abs_delta: 2.0,
                min_value: 0.0,
                max_value: 63.5, // max reportable RxMER
            },
            packet_loss: MetricThresholds {
                z_score: 3.0,
                min_std_dev: 0.001,
                abs_delta: 0.01, // 1%
                min_value: 0.0,
                max_value: 1.0,
            },
            codeword_errors: MetricThresholds {
                z_score: 3.0,
                min_std_dev: 0.0001,
                abs_delta: 0.001,
                min_value: 0.0,
                max_value: 1.0,
            },
        }
    }
}

/// Partial thresholds as written in a config file
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ThresholdOverride {
    z_score: Option<f64>,
    min_std_dev: Option<f64>,
    abs_delta: Option<f64>,
    min_value: Option<f64>,
    max_value: Option<f64>,
}

impl ThresholdOverride {
    fn apply(self, target: &mut MetricThresholds) {
        if let Some(v) = self.z_score {
            target.z_score = v;
        }
        if let Some(v) = self.min_std_dev {
            target.min_std_dev = v;
        }
        if let Some(v) = self.abs_delta {
            target.abs_delta = v;
        }
        if let Some(v) = self.min_value {
            target.min_value = v;
        }
        if let Some(v) = self.max_value {
            target.max_value = v;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ThresholdTableOverride {
    signal_level: ThresholdOverride,
    tx_power: ThresholdOverride,
    noise: ThresholdOverride,
    mer: ThresholdOverride,
    packet_loss: ThresholdOverride,
    codeword_errors: ThresholdOverride,
}

impl<'de> Deserialize<'de> for ThresholdTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let overrides = ThresholdTableOverride::deserialize(deserializer)?;
        let mut table = ThresholdTable::default();
        for (metric, patch) in [
            (MetricType::SignalLevel, overrides.signal_level),
            (MetricType::TxPower, overrides.tx_power),
            (MetricType::Noise, overrides.noise),
            (MetricType::Mer, overrides.mer),
            (MetricType::PacketLoss, overrides.packet_loss),
            (MetricType::CodewordErrors, overrides.codeword_errors),
        ] {
            patch.apply(table.get_mut(metric));
        }
        Ok(table)
    }
}

/// Fault localization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Sliding window width (event time)
    #[serde(with = "duration_serde")]
    pub window: Duration,
    /// Distinct devices needed before a shared node is blamed
    pub min_distinct_devices: usize,
    /// Confidence multiplier per hop between devices and the suspected node
    pub proximity_decay: f64,
    /// Anomalies one device needs for a device-local hypothesis (0 = off)
    pub local_min_anomalies: usize,
    /// Anomaly queue depth feeding the correlator task
    pub queue_capacity: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300), // 5m
            min_distinct_devices: 2,
            proximity_decay: 0.85,
            local_min_anomalies: 3,
            queue_capacity: 1024,
        }
    }
}

/// What to do when a subscriber's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room
    DropOldest,
    /// Wait up to `publish_timeout` for room, then drop the new event for that subscriber
    Backpressure,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    #[serde(with = "duration_serde")]
    pub publish_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            overflow: OverflowPolicy::DropOldest,
            publish_timeout: Duration::from_millis(250),
        }
    }
}

/// Topology source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// JSON or TOML topology document
    pub source_path: Option<PathBuf>,
    #[serde(with = "duration_serde")]
    pub refresh_interval: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            source_path: None,
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Extra remediation rules layered over the built-in table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationConfig {
    #[serde(default)]
    pub extra_rules: Vec<RuleConfig>,
}

/// One `(node class, metric) -> ranked actions` rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub node_class: DeviceClass,
    pub metric_type: MetricType,
    pub actions: Vec<ActionType>,
}

// Serde helper for Duration (using milliseconds for simplicity)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        PnmConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PnmConfig = toml::from_str(
            r#"
            [correlation]
            window = 120000
            min_distinct_devices = 3
            proximity_decay = 0.9
            local_min_anomalies = 0
            queue_capacity = 16

            [[remediation.extra_rules]]
            node_class = "CMTS_PORT"
            metric_type = "SIGNAL_LEVEL"
            actions = ["REVIEW_CMTS_PORT_CONFIG"]
            "#,
        )
        .unwrap();

        assert_eq!(config.correlation.window, Duration::from_secs(120));
        assert_eq!(config.correlation.min_distinct_devices, 3);
        assert_eq!(config.baseline.min_warm_samples, 20);
        assert_eq!(config.remediation.extra_rules.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_decay() {
        let mut config = PnmConfig::default();
        config.baseline.decay = 0.0;
        assert!(config.validate().is_err());
        config.baseline.decay = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = PnmConfig::default();
        config.topology.refresh_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = PnmConfig::default();
        config.bus.publish_timeout = Duration::ZERO;
        // Unused under drop-oldest
        config.validate().unwrap();
        config.bus.overflow = OverflowPolicy::Backpressure;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_threshold_override() {
        let config: PnmConfig = toml::from_str(
            r#"
            [thresholds.mer]
            z_score = 4.5

            [ingest]
            workers = 2
            "#,
        )
        .unwrap();

        let mer = config.thresholds.get(MetricType::Mer);
        assert_eq!(mer.z_score, 4.5);
        assert_eq!(mer.abs_delta, 2.0);
        assert_eq!(mer.max_value, 63.5);
        assert_eq!(
            config.thresholds.get(MetricType::PacketLoss),
            ThresholdTable::default().get(MetricType::PacketLoss)
        );
        assert_eq!(config.ingest.workers, 2);
        assert_eq!(config.ingest.max_clock_skew, Duration::from_secs(300));
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openpnm.toml");
        let mut config = PnmConfig::default();
        config.bus.overflow = OverflowPolicy::Backpressure;
        config.save(&path).unwrap();

        let loaded = PnmConfig::load(&path).unwrap();
        assert_eq!(loaded.bus.overflow, OverflowPolicy::Backpressure);
        assert_eq!(loaded.ingest.staleness_bound, Duration::from_secs(900));
    }

    #[test]
    fn test_physical_range() {
        let table = ThresholdTable::default();
        assert!(table.get(MetricType::Mer).in_range(63.5));
        assert!(!table.get(MetricType::PacketLoss).in_range(1.5));
    }
}
