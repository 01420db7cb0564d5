//! OpenPNM Backend Library
//!
//! Proactive Network Maintenance analysis core for DOCSIS cable plant:
//! per-device baselines, anomaly scoring, topology-aware fault localization
//! and remediation suggestions.
//!
//! Exposes core modules for use by binaries and tests.

pub mod api;
pub mod models;
pub mod pnm;
pub mod pnm_file;
