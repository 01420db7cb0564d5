//! Downstream OFDM RxMER per subcarrier
//!
//! Payload is one byte per subcarrier in quarter-dB steps. `0xFF` marks a
//! subcarrier with no measurement (excluded or unused); everything else is
//! clamped to the maximum reportable 63.5 dB.

use serde::Serialize;

use super::header::{PnmFileType, PnmHeader};
use super::PnmFileError;
use crate::models::{MetricSample, MetricType};

pub const RXMER_NO_MEASUREMENT: u8 = 0xFF;
pub const RXMER_MAX_DB: f64 = 63.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RxMerCapture {
    pub header: PnmHeader,
    /// dB per subcarrier, `None` where the modem reported no measurement
    pub values_db: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RxMerSummary {
    pub subcarriers: usize,
    pub measured: usize,
    pub mean_db: Option<f64>,
    pub min_db: Option<f64>,
    pub max_db: Option<f64>,
}

/// Quarter-dB byte to dB
pub fn rxmer_db(raw: u8) -> Option<f64> {
    if raw == RXMER_NO_MEASUREMENT {
        return None;
    }
    Some((raw as f64 / 4.0).min(RXMER_MAX_DB))
}

impl RxMerCapture {
    pub fn decode(buf: &[u8]) -> Result<Self, PnmFileError> {
        let (header, payload) = PnmHeader::parse(buf)?;
        header.expect_type(PnmFileType::RxMer)?;

        Ok(Self {
            header,
            values_db: payload.iter().map(|&b| rxmer_db(b)).collect(),
        })
    }

    pub fn summary(&self) -> RxMerSummary {
        let measured: Vec<f64> = self.values_db.iter().flatten().copied().collect();
        let (mean_db, min_db, max_db) = if measured.is_empty() {
            (None, None, None)
        } else {
            let sum: f64 = measured.iter().sum();
            (
                Some(sum / measured.len() as f64),
                measured.iter().copied().reduce(f64::min),
                measured.iter().copied().reduce(f64::max),
            )
        };

        RxMerSummary {
            subcarriers: self.values_db.len(),
            measured: measured.len(),
            mean_db,
            min_db,
            max_db,
        }
    }

    /// MER sample at capture time, keyed by the CM MAC unless `device_id` is
    /// given. `None` if no subcarrier was measured.
    pub fn to_sample(&self, device_id: Option<&str>) -> Option<MetricSample> {
        let mean = self.summary().mean_db?;
        let device = device_id
            .map(str::to_string)
            .unwrap_or_else(|| self.header.cm_mac.to_string());
        Some(MetricSample::new(
            device,
            MetricType::Mer,
            mean,
            self.header.capture_time,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnm_file::header::MacAddress;
    use chrono::{TimeZone, Utc};

    fn capture(payload: &[u8]) -> Vec<u8> {
        let header = PnmHeader {
            file_type: PnmFileType::RxMer,
            major_version: 1,
            minor_version: 0,
            capture_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            ds_channel_id: 159,
            cm_mac: MacAddress([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22]),
        };
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_quarter_db_and_no_measurement() {
        assert_eq!(rxmer_db(160), Some(40.0));
        assert_eq!(rxmer_db(0), Some(0.0));
        assert_eq!(rxmer_db(254), Some(63.5));
        assert_eq!(rxmer_db(RXMER_NO_MEASUREMENT), None);
    }

    #[test]
    fn test_summary_skips_unmeasured() {
        let rx = RxMerCapture::decode(&capture(&[160, 0xFF, 168, 152])).unwrap();
        let s = rx.summary();
        assert_eq!(s.subcarriers, 4);
        assert_eq!(s.measured, 3);
        assert_eq!(s.mean_db, Some(40.0));
        assert_eq!(s.min_db, Some(38.0));
        assert_eq!(s.max_db, Some(42.0));
    }

    #[test]
    fn test_to_sample() {
        let rx = RxMerCapture::decode(&capture(&[140, 140])).unwrap();
        let sample = rx.to_sample(None).unwrap();
        assert_eq!(sample.device_id, "AA:BB:CC:00:11:22");
        assert_eq!(sample.metric_type, MetricType::Mer);
        assert_eq!(sample.value, 35.0);
        assert_eq!(sample.timestamp, rx.header.capture_time);

        assert_eq!(rx.to_sample(Some("cm-a")).unwrap().device_id, "cm-a");
    }

    #[test]
    fn test_all_unmeasured_yields_no_sample() {
        let rx = RxMerCapture::decode(&capture(&[0xFF, 0xFF])).unwrap();
        assert!(rx.to_sample(None).is_none());
        assert_eq!(rx.summary().mean_db, None);
    }

    #[test]
    fn test_wrong_file_type() {
        let mut buf = capture(&[100]);
        buf[3] = 2;
        assert!(matches!(
            RxMerCapture::decode(&buf),
            Err(PnmFileError::UnexpectedType { .. })
        ));
    }
}
