//! PNM analysis core
//!
//! Turns per-device telemetry from cable plant into localized fault
//! hypotheses and ranked remediation suggestions.
//!
//! Components:
//! - Topology index: device -> upstream path, swapped atomically on refresh
//! - Metric ingestor: validation, then baseline update, then scoring
//! - Baseline store: exponentially weighted mean/variance per (device, metric)
//! - Anomaly detector: z-score with an absolute-delta fallback
//! - Topology correlator: sliding event-time window grouped by shared ancestor
//! - Remediation advisor: (node class, dominant metric) -> ranked actions
//! - Event bus: ordered fan-out with bounded per-subscriber queues
//!
//! ## Usage
//!
//! ```rust,ignore
//! use openpnm_backend::pnm::{EventBus, PnmConfig, PnmMetrics, PnmPipeline, TopologyIndex};
//!
//! let config = PnmConfig::from_env();
//! let metrics = Arc::new(PnmMetrics::new());
//! let bus = Arc::new(EventBus::new(config.bus.clone(), metrics.clone()));
//! let topology = Arc::new(TopologyIndex::from_document(doc)?);
//! let pipeline = PnmPipeline::start(&config, topology, bus.clone(), metrics);
//!
//! let mut events = bus.subscribe("alerting").await;
//! pipeline.ingest(sample).await?;
//! while let Some(envelope) = events.recv().await {
//!     // envelope.event is an anomaly, fault hypothesis, remediation or
//!     // unresolved fault
//! }
//! ```

pub mod advisor;
pub mod baseline;
pub mod bus;
pub mod config;
pub mod correlator;
pub mod detector;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod topology;

pub use advisor::*;
pub use baseline::*;
pub use bus::*;
pub use config::*;
pub use correlator::*;
pub use detector::*;
pub use error::*;
pub use ingest::*;
pub use metrics::*;
pub use pipeline::*;
pub use topology::*;
