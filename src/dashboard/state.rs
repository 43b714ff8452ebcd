//! Shared application state for the dashboard.
//!
//! One `DashboardState` is built at startup and shared across all handlers
//! and background tasks. Control-plane changes (status, mode, arming, risk
//! config) go through methods here so every change is persisted, audited as
//! a control event, and broadcast to SSE subscribers in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

use crate::alerts::{AlertLevel, AlertNotifier};
use crate::arming::ArmController;
use crate::config::RiskConfig;
use crate::execution::{ControlSnapshot, TradeExecutor, TradeOutcome};
use crate::persistence::{Database, DbResult, StateValue};
use crate::types::{QuoteBoard, QuoteView, SystemStatus, TradingMode};

/// Stats summary for the dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardStats {
    pub current_capital: f64,
    pub high_water_mark: f64,
    pub drawdown_pct: f64,
    pub drawdown_breached: bool,
    pub realized_pnl: f64,
    pub daily_pnl: f64,
    pub open_positions: u32,
    pub orders_filled: i64,
    pub orders_rejected: i64,
    pub orders_failed: i64,
    pub status: SystemStatus,
    pub mode: TradingMode,
    pub armed: bool,
    pub arm_seconds_remaining: i64,
}

/// Event types for SSE broadcasts
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum DashboardEvent {
    #[serde(rename = "stats")]
    Stats(DashboardStats),
    #[serde(rename = "status")]
    Status {
        status: SystemStatus,
        mode: TradingMode,
        armed: bool,
        armed_until: Option<DateTime<Utc>>,
    },
    #[serde(rename = "quote")]
    Quote(QuoteView),
    #[serde(rename = "trade")]
    Trade(TradeOutcome),
    #[serde(rename = "config")]
    Config(RiskConfig),
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: i64 },
}

/// Shared dashboard state
pub struct DashboardState {
    /// Database handle for persistence and audit rows
    pub db: Arc<Database>,

    /// In-memory quote cache fed by the poller
    pub quotes: Arc<QuoteBoard>,

    /// Live-trading arm window
    pub arm: Arc<ArmController>,

    /// Order execution pipeline
    pub executor: Arc<TradeExecutor>,

    /// Current trading mode
    pub trading_mode: RwLock<TradingMode>,

    /// System run state
    pub system_status: RwLock<SystemStatus>,

    /// Runtime-editable risk limits
    pub risk: RwLock<RiskConfig>,

    /// Symbols the gate chain accepts
    pub symbols: Vec<String>,

    /// Broadcast channel for SSE events
    pub event_tx: broadcast::Sender<DashboardEvent>,

    /// Optional webhook notifier for operational alerts
    pub alerts: Option<Arc<AlertNotifier>>,
}

impl DashboardState {
    pub fn new(
        db: Arc<Database>,
        quotes: Arc<QuoteBoard>,
        arm: Arc<ArmController>,
        executor: Arc<TradeExecutor>,
        mode: TradingMode,
        risk: RiskConfig,
        symbols: Vec<String>,
        alerts: Option<Arc<AlertNotifier>>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(1024);

        Arc::new(Self {
            db,
            quotes,
            arm,
            executor,
            trading_mode: RwLock::new(mode),
            system_status: RwLock::new(SystemStatus::Running),
            risk: RwLock::new(risk),
            symbols,
            event_tx,
            alerts,
        })
    }

    /// Fire a webhook alert without blocking the caller. No-op when no
    /// webhook is configured.
    pub fn alert(&self, level: AlertLevel, message: String) {
        if let Some(alerts) = self.alerts.clone() {
            tokio::spawn(async move {
                alerts.send(level, &message).await;
            });
        }
    }

    /// Subscribe to SSE events
    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.event_tx.subscribe()
    }

    /// Broadcast an event to all SSE subscribers
    pub fn broadcast(&self, event: DashboardEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.event_tx.send(event);
    }

    /// Restore status, mode and arm deadline from the database after a
    /// restart.
    pub async fn recover(&self) -> DbResult<()> {
        if let Some(value) = self.db.get_state("system_status")? {
            if let Some(status) = SystemStatus::from_str(&value.as_string()) {
                *self.system_status.write().await = status;
                info!("[STATE] recovered system status: {}", status);
            }
        }

        if let Some(value) = self.db.get_state("trading_mode")? {
            if let Some(mode) = TradingMode::from_str(&value.as_string()) {
                *self.trading_mode.write().await = mode;
                info!("[STATE] recovered trading mode: {}", mode);
            }
        }

        if let Some(deadline) = self.db.get_state("armed_until")?.and_then(|v| v.as_datetime()) {
            let now = Utc::now();
            self.arm.restore(deadline, now);
            if self.arm.is_armed(now) {
                info!("[STATE] recovered open arm window until {}", deadline);
            }
        }

        Ok(())
    }

    /// Build the consistent gate view used for one order submission.
    pub async fn control_snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            status: *self.system_status.read().await,
            mode: *self.trading_mode.read().await,
            armed: self.arm.is_armed(Utc::now()),
            stale_after_secs: self.risk.read().await.stale_after_secs,
            allowed_symbols: self.symbols.clone(),
        }
    }

    /// Change system status. Persists, audits and broadcasts.
    pub async fn set_status(&self, status: SystemStatus) -> DbResult<()> {
        *self.system_status.write().await = status;
        self.db
            .set_state("system_status", &StateValue::String(status.as_str().to_string()))?;
        self.db
            .insert_control_event("status", Some(status.as_str()))?;

        if status == SystemStatus::Stopped {
            error!("[STATE] SYSTEM STOPPED, all trading halted");
            self.alert(
                AlertLevel::Critical,
                "kill switch engaged, all trading halted".to_string(),
            );
        } else {
            info!("[STATE] system status changed to {}", status);
        }

        self.broadcast_status().await;
        Ok(())
    }

    /// Change trading mode. Switching away from live also disarms.
    pub async fn set_mode(&self, mode: TradingMode) -> DbResult<()> {
        *self.trading_mode.write().await = mode;
        if !mode.is_live() {
            self.arm.disarm();
            self.db.delete_state("armed_until")?;
        }

        self.db
            .set_state("trading_mode", &StateValue::String(mode.as_str().to_string()))?;
        self.db.insert_control_event("mode", Some(mode.as_str()))?;
        info!("[STATE] trading mode changed to {}", mode);

        self.broadcast_status().await;
        Ok(())
    }

    /// Open an arm window. The requested length is clamped to the
    /// configured maximum window.
    pub async fn arm(&self, requested_secs: i64) -> DbResult<DateTime<Utc>> {
        let max_window = self.risk.read().await.arm_window_secs;
        let window = requested_secs.clamp(1, max_window);

        let deadline = self.arm.arm(Utc::now(), window);
        self.db
            .set_state("armed_until", &StateValue::DateTime(deadline))?;
        self.db
            .insert_control_event("arm", Some(&format!("window={}s", window)))?;
        info!("[STATE] armed for live trading until {}", deadline);

        self.broadcast_status().await;
        Ok(deadline)
    }

    /// Close the arm window immediately.
    pub async fn disarm(&self) -> DbResult<()> {
        self.arm.disarm();
        self.db.delete_state("armed_until")?;
        self.db.insert_control_event("disarm", None)?;
        info!("[STATE] disarmed");

        self.broadcast_status().await;
        Ok(())
    }

    /// Replace the risk config with a clamped copy of `updated`.
    pub async fn update_risk(&self, updated: RiskConfig) -> DbResult<RiskConfig> {
        let clamped = updated.clamped();
        *self.risk.write().await = clamped.clone();

        let detail = serde_json::to_string(&clamped).unwrap_or_default();
        self.db.insert_control_event("config", Some(&detail))?;
        info!("[STATE] risk config updated: {}", detail);

        self.broadcast(DashboardEvent::Config(clamped.clone()));
        Ok(clamped)
    }

    async fn broadcast_status(&self) {
        self.broadcast(DashboardEvent::Status {
            status: *self.system_status.read().await,
            mode: *self.trading_mode.read().await,
            armed: self.arm.is_armed(Utc::now()),
            armed_until: self.arm.armed_until(),
        });
    }

    /// Assemble the stats summary from capital state and the database.
    pub async fn get_stats(&self) -> DbResult<DashboardStats> {
        let (current_capital, high_water_mark) = self.executor.paper_capital().await;

        let drawdown_pct = if high_water_mark > 0.0 {
            (high_water_mark - current_capital) / high_water_mark * 100.0
        } else {
            0.0
        };
        let max_drawdown_pct = self.risk.read().await.max_drawdown_pct;

        let realized_pnl = self.db.total_realized_pnl()?;
        let daily_pnl = self.executor.paper_daily_pnl().await;
        let open_positions = self.db.get_positions()?.len() as u32;

        let mut orders_filled = 0;
        let mut orders_rejected = 0;
        let mut orders_failed = 0;
        for (status, count) in self.db.order_status_counts()? {
            match status.as_str() {
                "filled" => orders_filled = count,
                "rejected" => orders_rejected = count,
                "failed" => orders_failed = count,
                _ => {}
            }
        }

        let now = Utc::now();
        Ok(DashboardStats {
            current_capital,
            high_water_mark,
            drawdown_pct,
            drawdown_breached: drawdown_pct > max_drawdown_pct,
            realized_pnl,
            daily_pnl,
            open_positions,
            orders_filled,
            orders_rejected,
            orders_failed,
            status: *self.system_status.read().await,
            mode: *self.trading_mode.read().await,
            armed: self.arm.is_armed(now),
            arm_seconds_remaining: self.arm.seconds_remaining(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeClient;
    use crate::paper_trading::PaperCapitalTracker;

    fn test_state(dir: &tempfile::TempDir) -> Arc<DashboardState> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();

        let quotes = Arc::new(QuoteBoard::new());
        let arm = Arc::new(ArmController::new());
        let exchange = Arc::new(ExchangeClient::new("http://127.0.0.1:1", "", None));
        let paper = PaperCapitalTracker::load_or_new(dir.path().join("paper.json"), 10_000.0);
        let executor = Arc::new(TradeExecutor::new(
            db.clone(),
            quotes.clone(),
            exchange,
            paper,
        ));

        DashboardState::new(
            db,
            quotes,
            arm.clone(),
            executor,
            TradingMode::Paper,
            RiskConfig::default(),
            vec!["BTC-USD".to_string()],
            None,
        )
    }

    #[tokio::test]
    async fn test_status_change_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        state.set_status(SystemStatus::Stopped).await.unwrap();
        assert_eq!(*state.system_status.read().await, SystemStatus::Stopped);

        let events = state.db.get_recent_control_events(10).unwrap();
        assert_eq!(events[0].action, "status");
        assert_eq!(events[0].detail.as_deref(), Some("stopped"));

        // Persisted for recovery
        let saved = state.db.get_state("system_status").unwrap().unwrap();
        assert_eq!(saved.as_string(), "stopped");
    }

    #[tokio::test]
    async fn test_arm_clamps_to_configured_window() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        // RiskConfig default arm window is 300s
        state.arm(10_000).await.unwrap();
        assert!(state.arm.seconds_remaining(Utc::now()) <= 300);

        let events = state.db.get_recent_control_events(10).unwrap();
        assert_eq!(events[0].action, "arm");
        assert_eq!(events[0].detail.as_deref(), Some("window=300s"));
    }

    #[tokio::test]
    async fn test_disarm_clears_persisted_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        state.arm(60).await.unwrap();
        assert!(state.db.get_state("armed_until").unwrap().is_some());

        state.disarm().await.unwrap();
        assert!(state.db.get_state("armed_until").unwrap().is_none());
        assert!(!state.arm.is_armed(Utc::now()));
    }

    #[tokio::test]
    async fn test_leaving_live_mode_disarms() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        state.set_mode(TradingMode::Live).await.unwrap();
        state.arm(60).await.unwrap();
        assert!(state.arm.is_armed(Utc::now()));

        state.set_mode(TradingMode::Paper).await.unwrap();
        assert!(!state.arm.is_armed(Utc::now()));
        assert!(state.db.get_state("armed_until").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_restores_control_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        state
            .db
            .set_state("system_status", &StateValue::String("paused".to_string()))
            .unwrap();
        state
            .db
            .set_state("trading_mode", &StateValue::String("live".to_string()))
            .unwrap();
        state
            .db
            .set_state(
                "armed_until",
                &StateValue::DateTime(Utc::now() + chrono::Duration::seconds(120)),
            )
            .unwrap();

        state.recover().await.unwrap();
        assert_eq!(*state.system_status.read().await, SystemStatus::Paused);
        assert_eq!(*state.trading_mode.read().await, TradingMode::Live);
        assert!(state.arm.is_armed(Utc::now()));
    }

    #[tokio::test]
    async fn test_update_risk_clamps_and_audits() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let updated = state
            .update_risk(RiskConfig {
                max_drawdown_pct: 500.0,
                ..RiskConfig::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.max_drawdown_pct, 50.0);

        let events = state.db.get_recent_control_events(10).unwrap();
        assert_eq!(events[0].action, "config");
    }

    #[tokio::test]
    async fn test_stats_reflects_drawdown_breach() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let stats = state.get_stats().await.unwrap();
        assert!(!stats.drawdown_breached);
        assert_eq!(stats.current_capital, 10_000.0);
        assert_eq!(stats.status, SystemStatus::Running);
    }
}
