// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Reads are served from the copy the feed
// engine publishes into `AppState`; the only writes (context reset, action
// relay) go through channels to the engine and the upstream socket.
//
// CORS is configured permissively; renderers are usually served from another
// origin during development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::engine::context::{IngestCounters, LatestPrice};
use crate::market_data::aggregator::AggregatorStats;
use crate::market_data::candle_store::Candle;
use crate::types::{ContextKey, Interval, MarketType};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/candles", get(candles))
        .route("/api/v1/price", get(latest_price))
        .route("/api/v1/logs", get(logs))
        .route("/api/v1/context", get(get_context).post(reset_context))
        .route("/api/v1/action", post(relay_action))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn error_body(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    uptime_secs: u64,
    upstream_connected: bool,
    /// Milliseconds since the last upstream frame, if any arrived yet.
    last_frame_age_ms: Option<u64>,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let last_frame_at = *state.last_frame_at.read();
    let last_frame_age_ms = last_frame_at.map(|at| at.elapsed().as_millis() as u64);
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        upstream_connected: *state.upstream_connected.read(),
        last_frame_age_ms,
    })
}

// =============================================================================
// Candles & price
// =============================================================================

#[derive(Deserialize)]
struct CandlesQuery {
    /// Return only the newest `limit` candles.
    limit: Option<usize>,
}

#[derive(Serialize)]
struct CandlesResponse {
    context: ContextKey,
    candles: Vec<Candle>,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandlesQuery>,
) -> impl IntoResponse {
    let market = state.market();
    let mut candles = market.candles;
    if let Some(limit) = query.limit {
        let from = candles.len().saturating_sub(limit);
        candles.drain(..from);
    }
    Json(CandlesResponse {
        context: market.context,
        candles,
    })
}

#[derive(Serialize)]
struct PriceResponse {
    context: ContextKey,
    latest_price: Option<LatestPrice>,
}

async fn latest_price(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let market = state.market();
    Json(PriceResponse {
        context: market.context,
        latest_price: market.latest_price,
    })
}

async fn logs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.logs())
}

// =============================================================================
// Context
// =============================================================================

#[derive(Serialize)]
struct ContextResponse {
    context: ContextKey,
    candle_count: usize,
    resync_pending: bool,
    counters: IngestCounters,
    aggregator: AggregatorStats,
}

async fn get_context(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let market = state.market();
    Json(ContextResponse {
        candle_count: market.candles.len(),
        context: market.context,
        resync_pending: market.resync_pending,
        counters: market.counters,
        aggregator: market.aggregator,
    })
}

#[derive(Deserialize)]
struct ContextRequest {
    symbol: String,
    interval: Interval,
    #[serde(default, alias = "marketType")]
    market_type: MarketType,
}

async fn reset_context(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContextRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let symbol = req.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "symbol must not be empty"));
    }

    match state.reset_context(symbol, req.interval, req.market_type).await {
        Ok(key) => {
            info!(context = %key, "context switched via API");
            Ok(Json(key))
        }
        Err(e) => {
            warn!(error = %e, "context switch failed");
            Err(error_body(StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")))
        }
    }
}

// =============================================================================
// Outbound actions
// =============================================================================

async fn relay_action(
    State(state): State<Arc<AppState>>,
    Json(action): Json<serde_json::Value>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let Some(name) = action.get("action").and_then(|a| a.as_str()).map(str::to_owned) else {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "request must carry a string `action` field",
        ));
    };

    state.relay_action(action).map_err(|e| {
        warn!(action = %name, error = %e, "action not relayed");
        error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    info!(action = %name, "action queued for upstream");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": name })),
    ))
}
