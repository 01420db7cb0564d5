use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Baseline, DeviceClass, MetricSample, MetricType};
use crate::pnm::{PercentileBand, PnmError, PnmPipeline};

/// Shared application state
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<PnmPipeline>,
}

/// Create the API router
pub fn create_router(pipeline: Arc<PnmPipeline>) -> Router {
    let state = ApiState { pipeline };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/v1/samples", post(post_samples))
        .route("/api/v1/baselines/:device/:metric", get(get_baseline))
        .route("/api/v1/topology/:device/path", get(get_device_path))
        .route("/api/v1/events", get(events_websocket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let snapshot = state.pipeline.topology().snapshot();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        topology_version: snapshot.version(),
        devices: snapshot.device_count(),
        topology_loaded_at: snapshot.loaded_at(),
        subscribers: state.pipeline.bus().subscriber_count().await,
    })
}

async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.pipeline.metrics().to_prometheus(),
    )
}

/// Ingest a batch; each record gets its own accept/reject verdict. Records are
/// decoded one at a time so a malformed entry only rejects itself.
async fn post_samples(
    State(state): State<ApiState>,
    Json(records): Json<Vec<serde_json::Value>>,
) -> Result<Json<IngestResponse>, ApiError> {
    let total = records.len();
    let mut results: Vec<Option<SampleResult>> = Vec::with_capacity(total);
    let mut decoded = Vec::with_capacity(total);
    for (index, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<MetricSample>(record) {
            Ok(sample) => {
                decoded.push((index, sample));
                results.push(None);
            }
            Err(e) => {
                state.pipeline.metrics().record_rejected("invalid_metric");
                results.push(Some(SampleResult {
                    index,
                    status: "rejected",
                    reason: Some("invalid_metric"),
                    message: Some(format!("undecodable sample: {}", e)),
                    anomaly_id: None,
                }));
            }
        }
    }

    let (indices, samples): (Vec<usize>, Vec<MetricSample>) = decoded.into_iter().unzip();
    let outcomes = state.pipeline.ingest_batch(samples).await;

    let mut accepted = 0;
    for (index, outcome) in indices.into_iter().zip(outcomes) {
        let result = match outcome {
            Ok(outcome) => {
                accepted += 1;
                SampleResult {
                    index,
                    status: "accepted",
                    reason: None,
                    message: None,
                    anomaly_id: outcome.anomaly.map(|a| a.id),
                }
            }
            Err(e) if e.is_rejection() => SampleResult {
                index,
                status: "rejected",
                reason: Some(e.kind()),
                message: Some(e.to_string()),
                anomaly_id: None,
            },
            Err(e) => return Err(ApiError::Pnm(e)),
        };
        results[index] = Some(result);
    }

    debug!(total, accepted, "Sample batch ingested");

    Ok(Json(IngestResponse {
        accepted,
        rejected: total - accepted,
        results: results.into_iter().flatten().collect(),
    }))
}

async fn get_baseline(
    State(state): State<ApiState>,
    Path((device, metric)): Path<(String, String)>,
) -> Result<Json<BaselineResponse>, ApiError> {
    let metric_type = MetricType::parse(&metric)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown metric type: {}", metric)))?;

    let baseline = state.pipeline.baseline(&device, metric_type).await?;
    Ok(Json(BaselineResponse {
        std_dev: baseline.std_dev(),
        percentiles: PercentileBand::of(&baseline),
        baseline,
    }))
}

async fn get_device_path(
    State(state): State<ApiState>,
    Path(device): Path<String>,
) -> Result<Json<PathResponse>, ApiError> {
    let snapshot = state.pipeline.topology().snapshot();
    let node = snapshot.device(&device)?;
    Ok(Json(PathResponse {
        device_id: node.device_id.clone(),
        device_class: node.device_class,
        upstream_path: node.upstream_path.clone(),
        topology_version: snapshot.version(),
    }))
}

/// Stream every published event as one JSON text frame
async fn events_websocket(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    let name = format!("ws-{}", Uuid::new_v4());
    let mut events = state.pipeline.bus().subscribe(name.clone()).await;
    info!(subscriber = %name, "Event stream opened");

    loop {
        tokio::select! {
            envelope = events.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                let msg = match serde_json::to_string(envelope.as_ref()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Failed to serialize event {}: {}", envelope.seq, e);
                        continue;
                    }
                };
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!(subscriber = %name, dropped = events.dropped(), "Event stream closed");
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    topology_version: u64,
    devices: usize,
    topology_loaded_at: Option<DateTime<Utc>>,
    subscribers: usize,
}

#[derive(Debug, Serialize)]
pub struct SampleResult {
    pub index: usize,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<SampleResult>,
}

#[derive(Serialize)]
struct BaselineResponse {
    baseline: Baseline,
    std_dev: f64,
    percentiles: PercentileBand,
}

#[derive(Serialize)]
struct PathResponse {
    device_id: String,
    device_class: DeviceClass,
    upstream_path: Vec<String>,
    topology_version: u64,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Pnm(PnmError),
    BadRequest(String),
}

impl From<PnmError> for ApiError {
    fn from(err: PnmError) -> Self {
        ApiError::Pnm(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Pnm(err) => match err {
                PnmError::UnknownDevice(_) => StatusCode::NOT_FOUND,
                PnmError::NotYetWarm { .. } => StatusCode::CONFLICT,
                PnmError::InvalidMetric { .. }
                | PnmError::StaleSample { .. }
                | PnmError::DuplicateSample { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                PnmError::NoRuleMatched { .. } => StatusCode::NOT_FOUND,
                PnmError::PipelineClosed => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::BadRequest(msg) => json!({
                "error": "bad_request",
                "message": msg,
            }),
            ApiError::Pnm(err) => {
                if status.is_server_error() {
                    tracing::error!("Request failed: {}", err);
                }
                let mut body = json!({
                    "error": err.kind(),
                    "message": err.to_string(),
                });
                if let PnmError::NotYetWarm {
                    sample_count,
                    required,
                    ..
                } = err
                {
                    body["sample_count"] = json!(sample_count);
                    body["required"] = json!(required);
                }
                body
            }
        };

        (status, Json(body)).into_response()
    }
}
