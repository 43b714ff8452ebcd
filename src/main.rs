//! Evotrade Dashboard Service
//!
//! Backend for the evolutionary trading dashboard. Serves positions, orders,
//! generation/agent views and safety controls over a JSON API plus SSE, and
//! runs every order through the pre-trade gate chain before execution.
//!
//! ## Architecture
//!
//! - **Gated execution**: symbol, quantity, status, staleness and arm gates
//! - **Paper trading mode** with simulated slippage off cached quotes
//! - **Live mode** behind explicit time-boxed arming, signed exchange requests
//! - **SQLite persistence** for orders, fills, positions, population and audit
//! - **SSE** for quotes, trade outcomes and status changes
//! - **Webhook alerts** for operational events

mod alerts;
mod arming;
mod config;
mod dashboard;
mod exchange;
mod execution;
mod gates;
mod marketdata;
mod paper_trading;
mod persistence;
mod population;
mod types;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use alerts::{AlertLevel, AlertNotifier};
use arming::ArmController;
use config::Config;
use dashboard::server::DashboardConfig;
use dashboard::{DashboardServer, DashboardState};
use exchange::{ExchangeClient, RequestSigner};
use execution::TradeExecutor;
use paper_trading::PaperCapitalTracker;
use persistence::Database;
use types::QuoteBoard;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("evotrade_dash=info".parse().unwrap()),
        )
        .init();

    let cfg = Config::from_env();
    info!("Evotrade Dashboard Service");
    info!("   Mode: {}", cfg.mode);
    info!("   Symbols: {:?}", cfg.symbols);

    // =========================================================================
    // 1. DATABASE
    // =========================================================================
    info!("[DB] Initializing database at: {}", cfg.db_path);
    let db = Arc::new(Database::open(&cfg.db_path).context("open database")?);
    db.initialize().context("run migrations")?;

    // =========================================================================
    // 2. EXCHANGE CLIENT
    // =========================================================================
    let signer = match RequestSigner::from_pem_file(&cfg.exchange_private_key_path) {
        Ok(signer) => {
            info!("[EXCHANGE] signing key loaded");
            Some(signer)
        }
        Err(e) => {
            warn!("[EXCHANGE] no signing key, live trading unavailable: {}", e);
            None
        }
    };
    let exchange = Arc::new(ExchangeClient::new(
        &cfg.exchange_base_url,
        &cfg.exchange_api_key,
        signer,
    ));

    // =========================================================================
    // 3. PAPER CAPITAL / EXECUTOR
    // =========================================================================
    let paper = PaperCapitalTracker::load_or_new(&cfg.paper_state_path, cfg.initial_capital);
    info!("[PAPER] capital: ${:.2}", paper.current_capital());

    let quotes = Arc::new(QuoteBoard::new());
    let executor = Arc::new(TradeExecutor::new(
        db.clone(),
        quotes.clone(),
        exchange.clone(),
        paper,
    ));

    // =========================================================================
    // 4. DASHBOARD STATE / CRASH RECOVERY
    // =========================================================================
    let alerts = Arc::new(AlertNotifier::new(
        cfg.alert_webhook_url.clone(),
        AlertLevel::Info,
    ));

    let arm = Arc::new(ArmController::new());
    let state = DashboardState::new(
        db,
        quotes,
        arm,
        executor,
        cfg.mode,
        cfg.risk.clone(),
        cfg.symbols.clone(),
        Some(alerts.clone()),
    );
    state.recover().await.context("recover control state")?;

    // =========================================================================
    // 5. BACKGROUND TASKS
    // =========================================================================
    let poller = tokio::spawn(marketdata::run_quote_poller(
        exchange,
        state.clone(),
        cfg.poll_interval_secs,
    ));

    if alerts.is_enabled() {
        info!("[ALERT] webhook alerts enabled");
        alerts
            .send(AlertLevel::Info, "evotrade dashboard started")
            .await;
    }

    // =========================================================================
    // 6. SERVE
    // =========================================================================
    let server = DashboardServer::with_config(
        state,
        DashboardConfig {
            port: cfg.port,
            ..DashboardConfig::from_env()
        },
    );

    tokio::select! {
        result = server.run() => {
            result.context("dashboard server")?;
        }
        result = poller => {
            error!("[MARKET] quote poller exited unexpectedly");
            result.context("quote poller task")?;
        }
    }

    if alerts.is_enabled() {
        alerts
            .send(AlertLevel::Warning, "evotrade dashboard shutting down")
            .await;
    }
    info!("Shutdown complete");
    Ok(())
}
