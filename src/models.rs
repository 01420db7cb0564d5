//! Core data model for the PNM analysis pipeline.
//!
//! Every record here is a flat, serde-encodable structure with stable
//! snake_case field names so external consumers can decode events across
//! versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Telemetry metric families understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    /// Downstream receive power (dBmV)
    SignalLevel,
    /// Upstream transmit power (dBmV)
    TxPower,
    /// Noise floor (dBmV)
    Noise,
    /// Modulation error ratio (dB)
    Mer,
    /// Packet loss ratio (0..=1)
    PacketLoss,
    /// Uncorrectable codeword ratio (0..=1)
    CodewordErrors,
}

impl MetricType {
    pub const ALL: [MetricType; 6] = [
        MetricType::SignalLevel,
        MetricType::TxPower,
        MetricType::Noise,
        MetricType::Mer,
        MetricType::PacketLoss,
        MetricType::CodewordErrors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignalLevel => "SIGNAL_LEVEL",
            Self::TxPower => "TX_POWER",
            Self::Noise => "NOISE",
            Self::Mer => "MER",
            Self::PacketLoss => "PACKET_LOSS",
            Self::CodewordErrors => "CODEWORD_ERRORS",
        }
    }

    /// Parse the wire name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.to_uppercase();
        Self::ALL.into_iter().find(|m| m.as_str() == upper)
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collector-assigned quality of a single reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityFlag {
    #[default]
    Good,
    /// Reading is usable for learning but must not raise alarms
    Degraded,
    /// Collector already knows the reading is garbage
    Invalid,
}

/// A single telemetry reading. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub device_id: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub quality: QualityFlag,
}

impl MetricSample {
    pub fn new(
        device_id: impl Into<String>,
        metric_type: MetricType,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            metric_type,
            value,
            timestamp,
            quality: QualityFlag::Good,
        }
    }

    pub fn with_quality(mut self, quality: QualityFlag) -> Self {
        self.quality = quality;
        self
    }

    pub fn key(&self) -> MetricKey {
        MetricKey::new(&self.device_id, self.metric_type)
    }
}

/// (device, metric) routing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub device_id: String,
    pub metric_type: MetricType,
}

impl MetricKey {
    pub fn new(device_id: &str, metric_type: MetricType) -> Self {
        Self {
            device_id: device_id.to_string(),
            metric_type,
        }
    }
}

impl std::fmt::Display for MetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device_id, self.metric_type)
    }
}

/// Classes of plant elements, both subscriber devices and shared infrastructure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceClass {
    CableModem,
    SetTopBox,
    Tap,
    Amplifier,
    FiberNode,
    CmtsPort,
    Unknown,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CableModem => "CABLE_MODEM",
            Self::SetTopBox => "SET_TOP_BOX",
            Self::Tap => "TAP",
            Self::Amplifier => "AMPLIFIER",
            Self::FiberNode => "FIBER_NODE",
            Self::CmtsPort => "CMTS_PORT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscriber device and its upstream path (nearest ancestor first,
/// CMTS port last).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub device_id: String,
    pub upstream_path: Vec<String>,
    pub device_class: DeviceClass,
}

/// Learning policy a baseline was built under
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowPolicy {
    /// Exponential decay λ applied per sample
    pub decay: f64,
    /// Samples required before the baseline is trusted
    pub min_warm_samples: u64,
}

/// Exponentially weighted statistical baseline for one (device, metric).
///
/// Values handed out by the baseline store are snapshots; the store keeps the
/// only mutable copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub device_id: String,
    pub metric_type: MetricType,
    pub mean: f64,
    pub variance: f64,
    pub sample_count: u64,
    pub last_updated: DateTime<Utc>,
    pub window: WindowPolicy,
}

impl Baseline {
    pub fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    pub fn is_warm(&self) -> bool {
        self.sample_count >= self.window.min_warm_samples
    }

    pub fn key(&self) -> MetricKey {
        MetricKey::new(&self.device_id, self.metric_type)
    }
}

/// How an anomaly's deviation was measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// (value - mean) / σ against the baseline
    ZScore,
    /// Baseline variance too small for a z-score; absolute delta used instead
    AbsoluteDelta,
}

/// A scored deviation from a warm baseline. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub device_id: String,
    pub metric_type: MetricType,
    pub observed_value: f64,
    /// Copy of the baseline as it stood before this sample was learned
    pub baseline_snapshot: Baseline,
    pub z_score: f64,
    pub detection_mode: DetectionMode,
    /// Monotonic in |z|, within [0, 1]
    pub severity: f64,
    /// Two-sided tail probability of the observation under the baseline
    pub tail_probability: f64,
    pub timestamp: DateTime<Utc>,
}

impl AnomalyEvent {
    /// Deterministic id so a redelivered anomaly is recognisable downstream
    pub fn stable_id(device_id: &str, metric_type: MetricType, timestamp: DateTime<Utc>) -> Uuid {
        let name = format!(
            "anomaly:{}:{}:{}",
            device_id,
            metric_type.as_str(),
            timestamp.timestamp_nanos_opt().unwrap_or_else(|| timestamp.timestamp_micros())
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

/// Whether a hypothesis blames shared plant or a single device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultScope {
    Shared,
    Localized,
}

/// Closed event-time interval covered by a hypothesis' evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn span(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// Probable fault location inferred from correlated anomalies.
///
/// Terminal once emitted. A strengthened hypothesis for the same node is a new
/// record with the same `lineage_id`, a higher `revision` and `supersedes`
/// pointing at the record it replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultHypothesis {
    pub id: Uuid,
    pub lineage_id: Uuid,
    pub revision: u32,
    pub supersedes: Option<Uuid>,
    pub suspected_node_id: String,
    pub suspected_node_class: DeviceClass,
    pub scope: FaultScope,
    pub contributing_anomalies: Vec<AnomalyEvent>,
    pub distinct_devices: usize,
    pub confidence: f64,
    pub time_window: TimeWindow,
}

impl FaultHypothesis {
    /// Metric carrying the most severity across the evidence. Ties fall to the
    /// more frequent metric, then to enum order.
    pub fn dominant_metric(&self) -> Option<MetricType> {
        let mut weights: std::collections::BTreeMap<MetricType, (f64, usize)> =
            std::collections::BTreeMap::new();
        for anomaly in &self.contributing_anomalies {
            let entry = weights.entry(anomaly.metric_type).or_insert((0.0, 0));
            entry.0 += anomaly.severity;
            entry.1 += 1;
        }

        let mut best: Option<(MetricType, f64, usize)> = None;
        for (metric, (severity, count)) in weights {
            best = match best {
                None => Some((metric, severity, count)),
                Some((_, best_sev, best_count))
                    if severity > best_sev + 1e-12
                        || ((severity - best_sev).abs() <= 1e-12 && count > best_count) =>
                {
                    Some((metric, severity, count))
                }
                keep => keep,
            };
        }
        best.map(|(metric, _, _)| metric)
    }

    pub fn device_ids(&self) -> std::collections::BTreeSet<&str> {
        self.contributing_anomalies
            .iter()
            .map(|a| a.device_id.as_str())
            .collect()
    }
}

/// Suggested remediation, ranked per hypothesis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    InspectAmplifierGainTilt,
    CheckAmplifierPowerSupply,
    LocateIngressSource,
    InspectTapPlate,
    CheckOpticalLevels,
    CheckUpstreamCongestion,
    ReviewCmtsPortConfig,
    InspectDropAndConnectors,
    RebootCustomerEquipment,
    ReplaceCustomerEquipment,
}

impl ActionType {
    pub fn description(&self) -> &'static str {
        match self {
            Self::InspectAmplifierGainTilt => "inspect amplifier gain/tilt",
            Self::CheckAmplifierPowerSupply => "check amplifier power supply",
            Self::LocateIngressSource => "locate ingress noise source",
            Self::InspectTapPlate => "inspect tap faceplate and ports",
            Self::CheckOpticalLevels => "check fiber node optical levels",
            Self::CheckUpstreamCongestion => "check upstream congestion",
            Self::ReviewCmtsPortConfig => "review CMTS port configuration",
            Self::InspectDropAndConnectors => "inspect drop cable and connectors",
            Self::RebootCustomerEquipment => "reboot customer equipment",
            Self::ReplaceCustomerEquipment => "replace customer equipment",
        }
    }
}

/// Remediation hypothesis for a fault. Never executed by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAction {
    pub id: Uuid,
    pub fault_hypothesis_id: Uuid,
    pub action_type: ActionType,
    /// 1 = try first
    pub rank: u32,
    pub rationale: String,
}

/// Everything the pipeline publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PnmEvent {
    Anomaly(AnomalyEvent),
    FaultHypothesis(FaultHypothesis),
    Remediation(RemediationAction),
    /// A hypothesis the rule table had no answer for
    UnresolvedFault {
        fault_hypothesis_id: Uuid,
        suspected_node_id: String,
        node_class: DeviceClass,
        dominant_metric: Option<MetricType>,
        reason: String,
    },
}

impl PnmEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Anomaly(_) => "anomaly",
            Self::FaultHypothesis(_) => "fault_hypothesis",
            Self::Remediation(_) => "remediation",
            Self::UnresolvedFault { .. } => "unresolved_fault",
        }
    }

    /// Stable identifier consumers can deduplicate on
    pub fn event_id(&self) -> Uuid {
        match self {
            Self::Anomaly(a) => a.id,
            Self::FaultHypothesis(h) => h.id,
            Self::Remediation(r) => r.id,
            Self::UnresolvedFault {
                fault_hypothesis_id,
                ..
            } => Uuid::new_v5(fault_hypothesis_id, b"unresolved"),
        }
    }
}

/// Bus delivery wrapper; `seq` is the global publish order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub published_at: DateTime<Utc>,
    pub event: PnmEvent,
}
