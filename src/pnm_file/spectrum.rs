//! Spectrum analyzer amplitude capture
//!
//! Payload after the common header (big-endian):
//! ```text
//! Offset  Size  Field
//! 0       4     channel centre frequency (Hz)
//! 4       4     frequency span (Hz)
//! 8       4     number of bins
//! 12      4     bin spacing (Hz)
//! 16      4     resolution bandwidth (Hz)
//! 20      2*n   amplitude per bin, i16 hundredths of a dBmV
//! ```

use serde::Serialize;

use super::header::PnmHeader;
use super::{ensure_len, read_u32_be, PnmFileError};
use crate::models::{MetricSample, MetricType};

pub const SPECTRUM_FIXED_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumAmplitude {
    pub center_frequency_hz: u32,
    pub frequency_span_hz: u32,
    pub bin_count: u32,
    pub bin_spacing_hz: u32,
    pub resolution_bandwidth_hz: u32,
    pub amplitudes_dbmv: Vec<f64>,
}

impl SpectrumAmplitude {
    /// Decode a bare payload (no PNM header)
    pub fn from_payload(buf: &[u8]) -> Result<Self, PnmFileError> {
        ensure_len(buf, SPECTRUM_FIXED_SIZE)?;

        let bin_count = read_u32_be(buf, 8);
        let bins = &buf[SPECTRUM_FIXED_SIZE..];
        if bins.len() % 2 != 0 || bins.len() / 2 != bin_count as usize {
            return Err(PnmFileError::BinCountMismatch {
                declared: bin_count,
                actual: bins.len() / 2,
            });
        }

        let amplitudes_dbmv = bins
            .chunks_exact(2)
            .map(|c| i16::from_be_bytes([c[0], c[1]]) as f64 / 100.0)
            .collect();

        Ok(Self {
            center_frequency_hz: read_u32_be(buf, 0),
            frequency_span_hz: read_u32_be(buf, 4),
            bin_count,
            bin_spacing_hz: read_u32_be(buf, 12),
            resolution_bandwidth_hz: read_u32_be(buf, 16),
            amplitudes_dbmv,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SPECTRUM_FIXED_SIZE + self.amplitudes_dbmv.len() * 2);
        for field in [
            self.center_frequency_hz,
            self.frequency_span_hz,
            self.amplitudes_dbmv.len() as u32,
            self.bin_spacing_hz,
            self.resolution_bandwidth_hz,
        ] {
            buf.extend_from_slice(&field.to_be_bytes());
        }
        for amp in &self.amplitudes_dbmv {
            let raw = (amp * 100.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            buf.extend_from_slice(&raw.to_be_bytes());
        }
        buf
    }

    pub fn mean_dbmv(&self) -> Option<f64> {
        if self.amplitudes_dbmv.is_empty() {
            return None;
        }
        Some(self.amplitudes_dbmv.iter().sum::<f64>() / self.amplitudes_dbmv.len() as f64)
    }

    /// Frequency of bin `i`, assuming bins are centred on the channel
    pub fn bin_frequency_hz(&self, i: usize) -> f64 {
        let start = self.center_frequency_hz as f64 - self.frequency_span_hz as f64 / 2.0;
        start + i as f64 * self.bin_spacing_hz as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumCapture {
    pub header: PnmHeader,
    pub spectrum: SpectrumAmplitude,
}

impl SpectrumCapture {
    pub fn decode(buf: &[u8]) -> Result<Self, PnmFileError> {
        let (header, payload) = PnmHeader::parse(buf)?;
        Ok(Self {
            header,
            spectrum: SpectrumAmplitude::from_payload(payload)?,
        })
    }

    /// SIGNAL_LEVEL sample from the mean amplitude
    pub fn to_sample(&self, device_id: Option<&str>) -> Option<MetricSample> {
        let mean = self.spectrum.mean_dbmv()?;
        let device = device_id
            .map(str::to_string)
            .unwrap_or_else(|| self.header.cm_mac.to_string());
        Some(MetricSample::new(
            device,
            MetricType::SignalLevel,
            mean,
            self.header.capture_time,
        ))
    }
}
