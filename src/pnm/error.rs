//! Pipeline error taxonomy
//!
//! None of these are fatal: a rejected sample or an unmatched rule degrades to
//! "no output for this input" while the rest of the network keeps flowing.

use chrono::{DateTime, Utc};

use crate::models::{DeviceClass, MetricType};

#[derive(Debug, Clone, PartialEq)]
pub enum PnmError {
    /// Device is not in the current topology snapshot
    UnknownDevice(String),
    /// Value is NaN, infinite, out of physical range, or flagged invalid
    InvalidMetric {
        metric_type: MetricType,
        value: f64,
        reason: &'static str,
    },
    /// Sample predates the key's last update by more than the staleness bound
    StaleSample {
        device_id: String,
        metric_type: MetricType,
        timestamp: DateTime<Utc>,
        last_updated: DateTime<Utc>,
    },
    /// Sample carries the exact timestamp already learned for its key
    DuplicateSample {
        device_id: String,
        metric_type: MetricType,
        timestamp: DateTime<Utc>,
    },
    /// Baseline has not seen enough samples to be trusted
    NotYetWarm {
        device_id: String,
        metric_type: MetricType,
        sample_count: u64,
        required: u64,
    },
    /// Rule table has no entry for this fault signature
    NoRuleMatched {
        node_class: DeviceClass,
        metric_type: Option<MetricType>,
    },
    /// Pipeline workers are gone (shutdown in progress)
    PipelineClosed,
}

impl PnmError {
    /// Stable machine-readable name, used in API bodies and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownDevice(_) => "unknown_device",
            Self::InvalidMetric { .. } => "invalid_metric",
            Self::StaleSample { .. } => "stale_sample",
            Self::DuplicateSample { .. } => "duplicate_sample",
            Self::NotYetWarm { .. } => "not_yet_warm",
            Self::NoRuleMatched { .. } => "no_rule_matched",
            Self::PipelineClosed => "pipeline_closed",
        }
    }

    /// True for rejections the ingestion interface reports back to collectors
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::UnknownDevice(_)
                | Self::InvalidMetric { .. }
                | Self::StaleSample { .. }
                | Self::DuplicateSample { .. }
        )
    }
}

impl std::fmt::Display for PnmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownDevice(id) => write!(f, "unknown device: {}", id),
            Self::InvalidMetric {
                metric_type,
                value,
                reason,
            } => write!(f, "invalid {} value {}: {}", metric_type, value, reason),
            Self::StaleSample {
                device_id,
                metric_type,
                timestamp,
                last_updated,
            } => write!(
                f,
                "stale sample for {}/{}: {} is older than last update {} minus staleness bound",
                device_id,
                metric_type,
                timestamp.to_rfc3339(),
                last_updated.to_rfc3339()
            ),
            Self::DuplicateSample {
                device_id,
                metric_type,
                timestamp,
            } => write!(
                f,
                "duplicate sample for {}/{} at {}",
                device_id,
                metric_type,
                timestamp.to_rfc3339()
            ),
            Self::NotYetWarm {
                device_id,
                metric_type,
                sample_count,
                required,
            } => write!(
                f,
                "baseline for {}/{} not yet warm ({}/{} samples)",
                device_id, metric_type, sample_count, required
            ),
            Self::NoRuleMatched {
                node_class,
                metric_type,
            } => match metric_type {
                Some(metric) => write!(f, "no remediation rule for {} / {}", node_class, metric),
                None => write!(f, "no remediation rule for {} without evidence", node_class),
            },
            Self::PipelineClosed => write!(f, "pipeline closed"),
        }
    }
}

impl std::error::Error for PnmError {}

pub type PnmResult<T> = Result<T, PnmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_display() {
        let err = PnmError::UnknownDevice("cm-9".into());
        assert_eq!(err.kind(), "unknown_device");
        assert_eq!(err.to_string(), "unknown device: cm-9");
        assert!(err.is_rejection());

        let err = PnmError::NoRuleMatched {
            node_class: DeviceClass::CmtsPort,
            metric_type: Some(MetricType::SignalLevel),
        };
        assert_eq!(err.kind(), "no_rule_matched");
        assert!(!err.is_rejection());
        assert!(err.to_string().contains("CMTS_PORT"));
    }
}
