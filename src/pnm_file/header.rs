//! Common PNM file header
//!
//! Layout (multi-byte fields big-endian):
//! ```text
//! Offset  Size  Field
//! 0       3     magic "PNN"
//! 3       1     file type code
//! 4       1     major version
//! 5       1     minor version
//! 6       4     capture time (epoch seconds)
//! 10      1     downstream channel id
//! 11      6     CM MAC address
//! Total: 17 bytes
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};

use super::{ensure_len, read_u32_be, PnmFileError};

pub const PNM_MAGIC: [u8; 3] = *b"PNN";
pub const PNM_HEADER_SIZE: usize = 17;

/// File type carried in the fourth header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PnmFileType {
    SymbolCapture,
    ChannelEstimate,
    Constellation,
    RxMer,
    FecSummary,
    Histogram,
    UpstreamPreEq,
    UpstreamPreEqLastUpdate,
    Other(u8),
}

impl PnmFileType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::SymbolCapture,
            2 => Self::ChannelEstimate,
            3 => Self::Constellation,
            4 => Self::RxMer,
            5 => Self::FecSummary,
            6 => Self::Histogram,
            7 => Self::UpstreamPreEq,
            8 => Self::UpstreamPreEqLastUpdate,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::SymbolCapture => 1,
            Self::ChannelEstimate => 2,
            Self::Constellation => 3,
            Self::RxMer => 4,
            Self::FecSummary => 5,
            Self::Histogram => 6,
            Self::UpstreamPreEq => 7,
            Self::UpstreamPreEqLastUpdate => 8,
            Self::Other(code) => *code,
        }
    }
}

impl std::fmt::Display for PnmFileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SymbolCapture => f.write_str("symbol capture"),
            Self::ChannelEstimate => f.write_str("channel estimate"),
            Self::Constellation => f.write_str("constellation"),
            Self::RxMer => f.write_str("RxMER"),
            Self::FecSummary => f.write_str("FEC summary"),
            Self::Histogram => f.write_str("histogram"),
            Self::UpstreamPreEq => f.write_str("upstream pre-equalization"),
            Self::UpstreamPreEqLastUpdate => f.write_str("upstream pre-equalization last update"),
            Self::Other(code) => write!(f, "type {}", code),
        }
    }
}

/// Cable modem MAC, rendered `AA:BB:CC:DD:EE:FF`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PnmHeader {
    pub file_type: PnmFileType,
    pub major_version: u8,
    pub minor_version: u8,
    pub capture_time: DateTime<Utc>,
    pub ds_channel_id: u8,
    pub cm_mac: MacAddress,
}

impl PnmHeader {
    /// Parse the header and return it with the remaining payload
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8]), PnmFileError> {
        ensure_len(buf, PNM_HEADER_SIZE)?;

        let magic = [buf[0], buf[1], buf[2]];
        if magic != PNM_MAGIC {
            return Err(PnmFileError::BadMagic(magic));
        }

        let secs = read_u32_be(buf, 6);
        let capture_time = Utc
            .timestamp_opt(secs as i64, 0)
            .single()
            .unwrap_or_default();

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&buf[11..17]);

        let header = Self {
            file_type: PnmFileType::from_code(buf[3]),
            major_version: buf[4],
            minor_version: buf[5],
            capture_time,
            ds_channel_id: buf[10],
            cm_mac: MacAddress(mac),
        };
        Ok((header, &buf[PNM_HEADER_SIZE..]))
    }

    /// Encode back to the 17-byte wire form
    pub fn to_bytes(&self) -> [u8; PNM_HEADER_SIZE] {
        let mut buf = [0u8; PNM_HEADER_SIZE];
        buf[..3].copy_from_slice(&PNM_MAGIC);
        buf[3] = self.file_type.code();
        buf[4] = self.major_version;
        buf[5] = self.minor_version;
        let secs = self.capture_time.timestamp().clamp(0, u32::MAX as i64) as u32;
        buf[6..10].copy_from_slice(&secs.to_be_bytes());
        buf[10] = self.ds_channel_id;
        buf[11..17].copy_from_slice(&self.cm_mac.0);
        buf
    }

    /// Fail unless the header announces `expected`
    pub fn expect_type(&self, expected: PnmFileType) -> Result<(), PnmFileError> {
        if self.file_type != expected {
            return Err(PnmFileError::UnexpectedType {
                expected,
                found: self.file_type,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(type_code: u8) -> Vec<u8> {
        let mut buf = b"PNN".to_vec();
        buf.push(type_code);
        buf.extend_from_slice(&[1, 0]);
        buf.extend_from_slice(&1_709_294_400u32.to_be_bytes());
        buf.push(33);
        buf.extend_from_slice(&[0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E]);
        buf
    }

    #[test]
    fn test_parse_header() {
        let mut buf = header_bytes(4);
        buf.extend_from_slice(&[0xAA, 0xBB]);

        let (header, rest) = PnmHeader::parse(&buf).unwrap();
        assert_eq!(header.file_type, PnmFileType::RxMer);
        assert_eq!(header.major_version, 1);
        assert_eq!(header.ds_channel_id, 33);
        assert_eq!(header.cm_mac.to_string(), "00:1A:2B:3C:4D:5E");
        assert_eq!(header.capture_time.timestamp(), 1_709_294_400);
        assert_eq!(rest, &[0xAA, 0xBB]);
        assert_eq!(header.to_bytes().to_vec(), header_bytes(4));
    }

    #[test]
    fn test_unknown_type_code_kept() {
        let (header, _) = PnmHeader::parse(&header_bytes(42)).unwrap();
        assert_eq!(header.file_type, PnmFileType::Other(42));
        assert!(header.expect_type(PnmFileType::RxMer).is_err());
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let mut buf = header_bytes(4);
        buf[0] = b'X';
        assert_eq!(
            PnmHeader::parse(&buf).unwrap_err(),
            PnmFileError::BadMagic([b'X', b'N', b'N'])
        );
        assert_eq!(
            PnmHeader::parse(&header_bytes(4)[..10]).unwrap_err(),
            PnmFileError::Truncated {
                needed: 17,
                available: 10
            }
        );
    }

    #[test]
    fn test_mac_serializes_as_string() {
        let (header, _) = PnmHeader::parse(&header_bytes(4)).unwrap();
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["cm_mac"], "00:1A:2B:3C:4D:5E");
        assert_eq!(json["file_type"], "RX_MER");
    }
}
