//! PNM capture files
//!
//! Cable modems upload Proactive Network Maintenance measurements as binary
//! files: a fixed 17-byte header followed by a type-specific payload. This
//! module decodes the header, RxMER and spectrum amplitude payloads, and turns
//! them into `MetricSample`s for the pipeline.
//!
//! Collection (SNMP triggers, TFTP upload) happens outside this crate.

pub mod header;
pub mod rxmer;
pub mod spectrum;

pub use header::*;
pub use rxmer::*;
pub use spectrum::*;

/// Errors while decoding a capture file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PnmFileError {
    Truncated { needed: usize, available: usize },
    BadMagic([u8; 3]),
    BinCountMismatch { declared: u32, actual: usize },
    UnexpectedType { expected: PnmFileType, found: PnmFileType },
}

impl std::fmt::Display for PnmFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, available } => write!(
                f,
                "truncated capture: need {} bytes, have {}",
                needed, available
            ),
            Self::BadMagic(m) => write!(
                f,
                "bad magic: {:02X} {:02X} {:02X} (expected \"PNN\")",
                m[0], m[1], m[2]
            ),
            Self::BinCountMismatch { declared, actual } => write!(
                f,
                "bin count mismatch: header declares {}, payload holds {}",
                declared, actual
            ),
            Self::UnexpectedType { expected, found } => {
                write!(f, "expected {} capture, found {}", expected, found)
            }
        }
    }
}

impl std::error::Error for PnmFileError {}

/// Require `needed` bytes in `buf`
pub(crate) fn ensure_len(buf: &[u8], needed: usize) -> Result<(), PnmFileError> {
    if buf.len() < needed {
        return Err(PnmFileError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

pub(crate) fn read_u32_be(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
