//! HTTP server for the dashboard API.
//!
//! Every route is JSON over axum plus one SSE stream; the frontend that
//! consumes them is deployed separately, which is why CORS defaults to
//! wide open. Shuts down cleanly on Ctrl+C or SIGTERM.

use crate::dashboard::handlers::{
    api_arm, api_audit, api_config, api_config_update, api_disarm, api_fills, api_generation_agents,
    api_generation_decisions, api_generation_detail, api_generations, api_mode, api_orders,
    api_pnl, api_positions, api_quotes, api_stats, api_status, api_trade, health,
};
use crate::dashboard::sse::{create_sse_stream, heartbeat_broadcaster, stats_broadcaster};
use crate::dashboard::state::DashboardState;
use axum::{
    extract::State,
    http::{header, Method},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Bind address and CORS settings for the dashboard server.
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub port: u16,
    pub host: String,
    /// Allow any origin. Off only makes sense when a reverse proxy
    /// serves the frontend from the same origin.
    pub enable_cors: bool,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_string(),
            enable_cors: true,
        }
    }
}

impl DashboardConfig {
    /// Read DASHBOARD_HOST / DASHBOARD_PORT / DASHBOARD_CORS, falling
    /// back to the defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = std::env::var("DASHBOARD_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);
        let host = std::env::var("DASHBOARD_HOST").unwrap_or(defaults.host);
        let enable_cors = match std::env::var("DASHBOARD_CORS") {
            Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
            Err(_) => defaults.enable_cors,
        };
        Self {
            port,
            host,
            enable_cors,
        }
    }
}

/// SSE stream endpoint, wired here so the sse module stays handler-free.
async fn api_events(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    create_sse_stream(state)
}

/// Owns the shared state and serves the API until shutdown.
pub struct DashboardServer {
    state: Arc<DashboardState>,
    config: DashboardConfig,
}

impl DashboardServer {
    pub fn new(state: Arc<DashboardState>) -> Self {
        Self::with_config(state, DashboardConfig::default())
    }

    pub fn with_config(state: Arc<DashboardState>, config: DashboardConfig) -> Self {
        Self { state, config }
    }

    fn build_router(&self) -> Router {
        let cors = if self.config.enable_cors {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        } else {
            CorsLayer::new()
        };

        let reads = Router::new()
            .route("/api/stats", get(api_stats))
            .route("/api/positions", get(api_positions))
            .route("/api/orders", get(api_orders))
            .route("/api/fills", get(api_fills))
            .route("/api/quotes", get(api_quotes))
            .route("/api/pnl", get(api_pnl))
            .route("/api/generations", get(api_generations))
            .route("/api/generations/:id", get(api_generation_detail))
            .route("/api/generations/:id/agents", get(api_generation_agents))
            .route("/api/generations/:id/decisions", get(api_generation_decisions))
            .route("/api/audit", get(api_audit))
            .route("/api/events", get(api_events));

        // Control routes mutate state; each one writes an audit row.
        let controls = Router::new()
            .route("/api/config", get(api_config).post(api_config_update))
            .route("/api/status", post(api_status))
            .route("/api/mode", post(api_mode))
            .route("/api/arm", post(api_arm))
            .route("/api/disarm", post(api_disarm))
            .route("/api/trade", post(api_trade));

        reads
            .merge(controls)
            .route("/health", get(health))
            .with_state(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind, spawn the SSE broadcasters, and serve until a shutdown signal.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;

        // One task pushes stats snapshots to SSE clients, the other heartbeats.
        let stats_state = self.state.clone();
        tokio::spawn(async move { stats_broadcaster(stats_state).await });
        let heartbeat_state = self.state.clone();
        tokio::spawn(async move { heartbeat_broadcaster(heartbeat_state).await });

        info!("[DASH] listening on http://{}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("[DASH] server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[DASH] Ctrl+C received, shutting down"),
        _ = terminate => info!("[DASH] SIGTERM received, shutting down"),
    }
}
