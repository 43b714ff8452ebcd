//! HTTP route handlers for the dashboard.
//!
//! All handlers speak JSON. Control actions (status, mode, arm, config) run
//! through `DashboardState` so they are persisted, audited and broadcast.
//! Trade submissions run the gate chain; a rejection is a normal 200
//! response with `accepted: false` and the gate's reason.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::alerts::AlertLevel;
use crate::marketdata::quote_views;
use crate::persistence::DbError;
use crate::population::generation_detail;
use crate::types::{OrderSource, Side, SystemStatus, TradeRequest, TradingMode};

use super::state::{DashboardEvent, DashboardState};

// ============================================================================
// ERROR MAPPING
// ============================================================================

/// Handler-level error that renders as a JSON problem response.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        let status = match &e {
            DbError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

// ============================================================================
// READ HANDLERS
// ============================================================================

/// Liveness probe
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Get dashboard stats as JSON
pub async fn api_stats(
    State(state): State<Arc<DashboardState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.get_stats().await?))
}

/// Get open positions as JSON
pub async fn api_positions(
    State(state): State<Arc<DashboardState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.get_positions()?))
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Get recent orders, newest first
pub async fn api_orders(
    State(state): State<Arc<DashboardState>>,
    Query(query): Query<OrdersQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.get_recent_orders(query.limit.min(500))?))
}

#[derive(Debug, Deserialize)]
pub struct FillsQuery {
    pub order_id: Option<i64>,
}

/// Get fills, optionally for one order
pub async fn api_fills(
    State(state): State<Arc<DashboardState>>,
    Query(query): Query<FillsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.get_fills(query.order_id)?))
}

/// Get cached quotes with staleness flags
pub async fn api_quotes(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    Json(quote_views(&state).await)
}

/// List generations, newest first
pub async fn api_generations(
    State(state): State<Arc<DashboardState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.get_generations()?))
}

/// Full detail view for one generation
pub async fn api_generation_detail(
    State(state): State<Arc<DashboardState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(generation_detail(&state.db, id)?))
}

/// Agents for one generation, best fitness first
pub async fn api_generation_agents(
    State(state): State<Arc<DashboardState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.get_agents(id)?))
}

#[derive(Debug, Deserialize)]
pub struct DecisionsQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

/// Recent decisions for one generation
pub async fn api_generation_decisions(
    State(state): State<Arc<DashboardState>>,
    Path(id): Path<i64>,
    Query(query): Query<DecisionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.get_recent_decisions(id, query.limit.min(500))?))
}

/// Daily realized P&L series with cumulative totals
pub async fn api_pnl(
    State(state): State<Arc<DashboardState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.daily_pnl_series()?))
}

/// Audit trail of control actions
pub async fn api_audit(
    State(state): State<Arc<DashboardState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.get_recent_control_events(100)?))
}

/// Get current risk config as JSON
pub async fn api_config(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let risk = state.risk.read().await;
    Json(risk.clone())
}

// ============================================================================
// CONTROL HANDLERS
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ConfigUpdate {
    pub max_drawdown_pct: Option<f64>,
    pub max_position_usd: Option<f64>,
    pub max_order_qty: Option<f64>,
    pub stale_after_secs: Option<i64>,
    pub arm_window_secs: Option<i64>,
}

/// Apply a partial risk config update. Unset fields keep their current
/// values; everything is clamped on the way in.
pub async fn api_config_update(
    State(state): State<Arc<DashboardState>>,
    Json(update): Json<ConfigUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let mut risk = state.risk.read().await.clone();

    if let Some(v) = update.max_drawdown_pct {
        risk.max_drawdown_pct = v;
    }
    if let Some(v) = update.max_position_usd {
        risk.max_position_usd = v;
    }
    if let Some(v) = update.max_order_qty {
        risk.max_order_qty = v;
    }
    if let Some(v) = update.stale_after_secs {
        risk.stale_after_secs = v;
    }
    if let Some(v) = update.arm_window_secs {
        risk.arm_window_secs = v;
    }

    let applied = state.update_risk(risk).await?;
    Ok(Json(applied))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String, // "running", "paused" or "stopped"
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

/// Change system run state
pub async fn api_status(
    State(state): State<Arc<DashboardState>>,
    Json(request): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(status) = SystemStatus::from_str(&request.status) else {
        return Err(ApiError::bad_request(
            "Invalid status. Use 'running', 'paused' or 'stopped'",
        ));
    };

    state.set_status(status).await?;
    Ok(Json(ControlResponse {
        success: true,
        message: format!("System status set to {}", status),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: String, // "paper" or "live"
}

/// Switch trading mode
pub async fn api_mode(
    State(state): State<Arc<DashboardState>>,
    Json(request): Json<ModeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(mode) = TradingMode::from_str(&request.mode) else {
        return Err(ApiError::bad_request("Invalid mode. Use 'paper' or 'live'"));
    };

    state.set_mode(mode).await?;
    let message = match mode {
        TradingMode::Paper => "Switched to paper trading mode".to_string(),
        TradingMode::Live => {
            "Switched to live trading mode, arm before sending orders".to_string()
        }
    };
    Ok(Json(ControlResponse { success: true, message }))
}

#[derive(Debug, Deserialize)]
pub struct ArmRequest {
    pub seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct ArmResponse {
    pub armed: bool,
    pub armed_until: Option<chrono::DateTime<chrono::Utc>>,
}

/// Open a live-trading arm window
pub async fn api_arm(
    State(state): State<Arc<DashboardState>>,
    Json(request): Json<ArmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.seconds <= 0 {
        return Err(ApiError::bad_request("seconds must be positive"));
    }

    let deadline = state.arm(request.seconds).await?;
    Ok(Json(ArmResponse {
        armed: true,
        armed_until: Some(deadline),
    }))
}

/// Close the arm window immediately
pub async fn api_disarm(
    State(state): State<Arc<DashboardState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.disarm().await?;
    Ok(Json(ArmResponse {
        armed: false,
        armed_until: None,
    }))
}

// ============================================================================
// TRADE SUBMISSION
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TradeSubmission {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub limit_price: Option<f64>,
}

/// Submit a manual trade through the gate chain
pub async fn api_trade(
    State(state): State<Arc<DashboardState>>,
    Json(submission): Json<TradeSubmission>,
) -> Result<Response, ApiError> {
    let Some(side) = Side::from_str(&submission.side) else {
        return Err(ApiError::bad_request("Invalid side. Use 'buy' or 'sell'"));
    };

    let request = TradeRequest {
        symbol: submission.symbol,
        side,
        quantity: submission.quantity,
        limit_price: submission.limit_price,
        source: OrderSource::Manual,
    };

    let snapshot = state.control_snapshot().await;
    match state.executor.submit(&request, &snapshot).await {
        Ok(outcome) => {
            if snapshot.mode.is_live() {
                match &outcome.rejection {
                    None => state.alert(
                        AlertLevel::Warning,
                        format!(
                            "live trade executed: {} {} {}",
                            request.side, request.quantity, request.symbol
                        ),
                    ),
                    Some(rejection) => state.alert(
                        AlertLevel::Warning,
                        format!(
                            "live trade rejected by {} gate: {}",
                            rejection.gate, rejection.reason
                        ),
                    ),
                }
            }
            state.broadcast(DashboardEvent::Trade(outcome.clone()));
            Ok(Json(outcome).into_response())
        }
        Err(e) => Ok((
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "error": format!("{:#}", e) })),
        )
            .into_response()),
    }
}
