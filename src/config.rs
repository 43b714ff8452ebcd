//! Environment-driven configuration.
//!
//! Everything is read once at startup in `Config::from_env()`; the risk
//! limits can additionally be edited at runtime through the dashboard, which
//! re-applies the same clamps used here.

use serde::{Deserialize, Serialize};
use std::env;

use crate::types::TradingMode;

/// Runtime-editable risk limits. Every field is clamped to a sane range on
/// the way in, both from env and from dashboard edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Max drawdown from high-water mark before trading halts, in percent.
    pub max_drawdown_pct: f64,
    /// Max notional value of a single position, in USD.
    pub max_position_usd: f64,
    /// Max quantity for a single order.
    pub max_order_qty: f64,
    /// Quotes older than this are considered stale, in seconds.
    pub stale_after_secs: i64,
    /// Length of a live-trading arm window, in seconds.
    pub arm_window_secs: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 10.0,
            max_position_usd: 1000.0,
            max_order_qty: 100.0,
            stale_after_secs: 30,
            arm_window_secs: 300,
        }
    }
}

impl RiskConfig {
    /// Clamp all fields into their allowed ranges. Applied wherever a
    /// RiskConfig enters the system.
    pub fn clamped(mut self) -> Self {
        self.max_drawdown_pct = self.max_drawdown_pct.clamp(1.0, 50.0);
        self.max_position_usd = self.max_position_usd.clamp(10.0, 100_000.0);
        self.max_order_qty = self.max_order_qty.clamp(0.0001, 10_000.0);
        self.stale_after_secs = self.stale_after_secs.clamp(1, 3600);
        self.arm_window_secs = self.arm_window_secs.clamp(10, 3600);
        self
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port for the dashboard server.
    pub port: u16,
    /// Trading mode at startup (ARMED live trading still requires an
    /// explicit arm request at runtime).
    pub mode: TradingMode,
    /// Symbols the system is allowed to trade.
    pub symbols: Vec<String>,
    /// SQLite database path.
    pub db_path: String,
    /// Paper capital state file.
    pub paper_state_path: String,
    /// Market data poll interval in seconds.
    pub poll_interval_secs: u64,
    /// Starting paper capital in USD.
    pub initial_capital: f64,
    /// Exchange REST base URL.
    pub exchange_base_url: String,
    /// Exchange API key id.
    pub exchange_api_key: String,
    /// Path to the PKCS#8 PEM private key used to sign exchange requests.
    pub exchange_private_key_path: String,
    /// Optional webhook URL for operational alerts.
    pub alert_webhook_url: Option<String>,
    /// Runtime-editable risk limits.
    pub risk: RiskConfig,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let symbols = env::var("TRADE_SYMBOLS")
            .unwrap_or_else(|_| "BTC-USD,ETH-USD".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let risk = RiskConfig {
            max_drawdown_pct: env_f64("MAX_DRAWDOWN_PCT", 10.0),
            max_position_usd: env_f64("MAX_POSITION_USD", 1000.0),
            max_order_qty: env_f64("MAX_ORDER_QTY", 100.0),
            stale_after_secs: env_i64("STALE_AFTER_SECS", 30),
            arm_window_secs: env_i64("ARM_WINDOW_SECS", 300),
        }
        .clamped();

        Self {
            port: env::var("DASHBOARD_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            mode: env::var("TRADING_MODE")
                .ok()
                .and_then(|v| TradingMode::from_str(&v))
                .unwrap_or(TradingMode::Paper),
            symbols,
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "evotrade.db".to_string()),
            paper_state_path: env::var("PAPER_STATE_PATH")
                .unwrap_or_else(|_| "paper_capital.json".to_string()),
            poll_interval_secs: env::var("POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            initial_capital: env_f64("INITIAL_CAPITAL", 10_000.0),
            exchange_base_url: env::var("EXCHANGE_BASE_URL")
                .unwrap_or_else(|_| "https://api.exchange.example.com".to_string()),
            exchange_api_key: env::var("EXCHANGE_API_KEY").unwrap_or_default(),
            exchange_private_key_path: env::var("EXCHANGE_PRIVATE_KEY_PATH")
                .unwrap_or_else(|_| "exchange_key.pem".to_string()),
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            risk,
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
