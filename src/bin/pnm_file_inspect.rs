//! PNM File Inspection Tool
//!
//! Decodes a PNM capture file uploaded by a cable modem and prints it as JSON,
//! optionally with the `MetricSample` the pipeline would ingest for it.
//!
//! Usage:
//!   cargo run --release --bin pnm_file_inspect -- capture.pnm
//!   cargo run --release --bin pnm_file_inspect -- capture.pnm --kind rxmer --samples --device cm-a
//!   cargo run --release --bin pnm_file_inspect -- spectrum.bin --kind spectrum --bins

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use std::path::PathBuf;

use openpnm_backend::pnm_file::{PnmFileType, PnmHeader, RxMerCapture, SpectrumCapture};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    /// Header only
    Header,
    /// Downstream OFDM RxMER per subcarrier
    Rxmer,
    /// Spectrum analyzer amplitude
    Spectrum,
}

/// Inspect PNM capture files
#[derive(Parser, Debug)]
#[command(name = "pnm_file_inspect")]
#[command(about = "Decode a PNM capture file and print it as JSON")]
struct Cli {
    /// Capture file to decode
    file: PathBuf,

    /// Payload decoder (defaults to the header's file type)
    #[arg(short, long, value_enum)]
    kind: Option<Kind>,

    /// Also print the metric sample derived from the capture
    #[arg(short, long)]
    samples: bool,

    /// Device id for the derived sample (defaults to the CM MAC)
    #[arg(short, long)]
    device: Option<String>,

    /// Include every per-subcarrier / per-bin value
    #[arg(short, long)]
    bins: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let buf = std::fs::read(&cli.file)
        .with_context(|| format!("reading {}", cli.file.display()))?;
    let (header, _) = PnmHeader::parse(&buf).context("decoding PNM header")?;

    let kind = cli.kind.unwrap_or(match header.file_type {
        PnmFileType::RxMer => Kind::Rxmer,
        _ => Kind::Header,
    });

    let output = match kind {
        Kind::Header => json!({
            "file": cli.file.display().to_string(),
            "size_bytes": buf.len(),
            "header": header,
        }),
        Kind::Rxmer => {
            let capture = RxMerCapture::decode(&buf).context("decoding RxMER capture")?;
            let mut out = json!({
                "file": cli.file.display().to_string(),
                "header": capture.header,
                "summary": capture.summary(),
            });
            if cli.bins {
                out["values_db"] = json!(capture.values_db);
            }
            if cli.samples {
                out["sample"] = json!(capture.to_sample(cli.device.as_deref()));
            }
            out
        }
        Kind::Spectrum => {
            let capture = SpectrumCapture::decode(&buf).context("decoding spectrum capture")?;
            let spectrum = &capture.spectrum;
            let mut out = json!({
                "file": cli.file.display().to_string(),
                "header": capture.header,
                "center_frequency_hz": spectrum.center_frequency_hz,
                "frequency_span_hz": spectrum.frequency_span_hz,
                "bin_count": spectrum.bin_count,
                "bin_spacing_hz": spectrum.bin_spacing_hz,
                "resolution_bandwidth_hz": spectrum.resolution_bandwidth_hz,
                "mean_dbmv": spectrum.mean_dbmv(),
            });
            if cli.bins {
                let bins: Vec<_> = spectrum
                    .amplitudes_dbmv
                    .iter()
                    .enumerate()
                    .map(|(i, amp)| json!({ "frequency_hz": spectrum.bin_frequency_hz(i), "dbmv": amp }))
                    .collect();
                out["bins"] = json!(bins);
            }
            if cli.samples {
                out["sample"] = json!(capture.to_sample(cli.device.as_deref()));
            }
            out
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
