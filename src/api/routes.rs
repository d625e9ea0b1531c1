//! API Routes
//!
//! The four public ports of the core: strand ingestion with structured
//! validation responses, filtered queries, a WebSocket subscription feed
//! with tag filtering, and the administrative control endpoint. No
//! unhandled failure ever crosses this boundary.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::errors::CilError;
use crate::models::{Config, Strand, StrandKind, Timeframe, TrackingStatus};
use crate::resonance::ResonanceField;
use crate::store::{StrandFilter, StrandStore};

#[derive(Clone)]
pub struct AppState {
    pub store: StrandStore,
    pub dispatcher: Arc<Dispatcher>,
    pub field: Arc<ResonanceField>,
    pub config: Config,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest_strand))
        .route("/api/strands", get(query_strands))
        .route("/api/strands/:id", get(get_strand))
        .route("/api/health", get(health))
        .route("/api/control/llm", post(control_llm))
        .route("/api/control/thresholds", post(control_thresholds))
        .route("/api/control/resonance-tick", post(control_resonance_tick))
        .route("/api/control/cancel", post(control_cancel))
        .route("/ws", get(subscribe_ws))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

fn error_response(e: CilError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, kind) = match &e {
        CilError::ValidationFailure(_) => (StatusCode::BAD_REQUEST, "validation_failure"),
        CilError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        CilError::ImmutableField(_) => (StatusCode::CONFLICT, "immutable_field"),
        CilError::StoreUnavailable(_) | CilError::ContextUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
        }
        CilError::LlmUnavailable(_) | CilError::LlmTimeout(_) | CilError::LlmMalformed(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "llm_unavailable")
        }
        CilError::InvariantViolation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "invariant_violation"),
        CilError::BoundExceeded { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "bound_exceeded"),
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            kind: kind.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub kind: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub timeframe: Option<String>,
    #[serde(default)]
    pub session_bucket: Option<String>,
    #[serde(default)]
    pub regime: Option<String>,
    pub content: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub id: String,
    pub accepted: bool,
}

/// Accepts `pattern` and `pattern_overview` strands from external
/// analyzers; everything else is produced internally.
pub async fn ingest_strand(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, (StatusCode, Json<ErrorResponse>)> {
    let kind: StrandKind = request.kind.parse().map_err(error_response)?;
    if !matches!(kind, StrandKind::Pattern | StrandKind::PatternOverview) {
        return Err(error_response(CilError::ValidationFailure(format!(
            "ingest accepts pattern and pattern_overview, not {}",
            request.kind
        ))));
    }

    let mut strand = Strand::new(kind);
    if let Some(symbol) = request.symbol {
        strand = strand.with_symbol(symbol);
    }
    if let Some(tf) = request.timeframe {
        let timeframe: Timeframe = tf.parse().map_err(error_response)?;
        strand = strand.with_timeframe(timeframe);
    }
    strand.session_bucket = request.session_bucket;
    strand.regime = request.regime;
    strand.content = request.content;
    for tag in request.tags {
        strand = strand.with_tag(tag);
    }

    let id = state.store.append(&strand).await.map_err(error_response)?;
    debug!(id = %id, kind = %request.kind, "strand ingested");
    Ok(Json(IngestResponse { id, accepted: true }))
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StrandQuery {
    pub kind: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub tag: Option<String>,
    pub braid_level: Option<u32>,
    pub status: Option<String>,
    pub group_signature: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StrandsResponse {
    pub strands: Vec<Strand>,
    pub count: usize,
    pub timestamp: String,
}

pub async fn query_strands(
    Query(params): Query<StrandQuery>,
    State(state): State<AppState>,
) -> Result<Json<StrandsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut filter = StrandFilter::new().limit(params.limit.unwrap_or(100).min(1000));
    if let Some(kind) = params.kind {
        filter = filter.kind(kind.parse().map_err(error_response)?);
    }
    if let Some(symbol) = params.symbol {
        filter = filter.symbol(symbol);
    }
    if let Some(tf) = params.timeframe {
        let timeframe: Timeframe = tf.parse().map_err(error_response)?;
        filter = filter.timeframe(timeframe);
    }
    if let Some(tag) = params.tag {
        filter = filter.tag(tag);
    }
    if let Some(level) = params.braid_level {
        filter = filter.braid_level(level);
    }
    if let Some(status) = params.status {
        let status: TrackingStatus = status.parse().map_err(error_response)?;
        filter = filter.tracking_status(status);
    }
    if let Some(signature) = params.group_signature {
        filter = filter.group_signature(signature);
    }

    let strands = state.store.query(&filter).await.map_err(error_response)?;
    Ok(Json(StrandsResponse {
        count: strands.len(),
        strands,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

pub async fn get_strand(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Strand>, (StatusCode, Json<ErrorResponse>)> {
    let strand = state.store.get(&id).await.map_err(error_response)?;
    Ok(Json(strand))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub theta: f64,
    pub llm_error_rate: f64,
    pub retry_queue_depth: usize,
    pub llm_calls_today: u64,
    pub llm_tokens_today: u64,
}

pub async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    let (calls, tokens) = state
        .store
        .llm_usage_today()
        .await
        .map_err(error_response)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        theta: state.field.snapshot().theta,
        llm_error_rate: state.dispatcher.llm_error_rate(),
        retry_queue_depth: state.dispatcher.retry_depth(),
        llm_calls_today: calls,
        llm_tokens_today: tokens,
    }))
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LlmControlRequest {
    pub enabled: bool,
}

pub async fn control_llm(
    State(state): State<AppState>,
    Json(request): Json<LlmControlRequest>,
) -> Json<Value> {
    state.dispatcher.toggles().set_llm_enabled(request.enabled);
    warn!(enabled = request.enabled, "llm path toggled");
    Json(serde_json::json!({ "llm_enabled": request.enabled }))
}

#[derive(Debug, Deserialize)]
pub struct ThresholdsRequest {
    pub min_braid_size: Option<usize>,
    pub w_res: Option<f64>,
    pub phi_min: Option<f64>,
    pub phi_max: Option<f64>,
    pub rho_min: Option<f64>,
    pub rho_max: Option<f64>,
}

pub async fn control_thresholds(
    State(state): State<AppState>,
    Json(request): Json<ThresholdsRequest>,
) -> Json<Value> {
    if let Some(min) = request.min_braid_size {
        state.dispatcher.braider().set_effective_min_braid_size(min);
    }
    if let Some(w_res) = request.w_res {
        state.dispatcher.toggles().set_w_res(w_res);
    }
    state.dispatcher.toggles().set_resonance_bounds(
        request.phi_min,
        request.phi_max,
        request.rho_min,
        request.rho_max,
    );
    Json(serde_json::json!({ "applied": true }))
}

pub async fn control_resonance_tick(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    let snapshot = state
        .dispatcher
        .force_field_tick()
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub pattern_ids: Vec<String>,
}

/// Group-invalidation propagation: cancels still-active predictions that
/// derive from the named patterns.
pub async fn control_cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    let cancelled = state
        .dispatcher
        .cancel_predictions_for_patterns(&request.pattern_ids)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub tag: Option<String>,
}

/// Long-running feed of new strands, optionally filtered by tag. A
/// downstream decision-maker subscribes with `?tag=cil:plan`.
pub async fn subscribe_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_subscription(socket, state, params.tag))
        .into_response()
}

async fn handle_subscription(mut socket: WebSocket, state: AppState, tag: Option<String>) {
    let mut events = state.store.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(tag) = &tag {
                    if !event.strand.has_tag(tag) {
                        continue;
                    }
                }
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "strand event serialization failed");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break; // client gone
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "subscriber lagged, continuing");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
