//! HTTP and WebSocket surface
//!
//! - `POST /api/v1/samples` batch ingestion with per-sample verdicts
//! - `GET /api/v1/baselines/:device/:metric` learned baseline and percentile band
//! - `GET /api/v1/topology/:device/path` resolved upstream path
//! - `GET /api/v1/events` WebSocket stream of published events
//! - `GET /metrics` Prometheus text, `GET /health`

pub mod routes;

pub use routes::{create_router, ApiError, ApiState, IngestResponse, SampleResult};
