//! Core shared types for the evotrade dashboard service.
//!
//! Everything here is plain data passed between the market-data poller, the
//! trade gate chain, the executors, and the dashboard handlers. Prices and
//! sizes are f64 dollars; timestamps are UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

// ============================================================================
// TRADING MODE / SYSTEM STATUS
// ============================================================================

/// Trading mode (paper vs live)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "paper" => Some(TradingMode::Paper),
            "live" => Some(TradingMode::Live),
            _ => None,
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        matches!(self, TradingMode::Live)
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Overall system run state. `Paused` and `Stopped` both block order
/// placement; `Stopped` is the kill switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    #[default]
    Running,
    Paused,
    Stopped,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStatus::Running => "running",
            SystemStatus::Paused => "paused",
            SystemStatus::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(SystemStatus::Running),
            "paused" => Some(SystemStatus::Paused),
            "stopped" => Some(SystemStatus::Stopped),
            _ => None,
        }
    }

    /// Whether order placement is allowed in this state.
    #[inline]
    pub fn allows_trading(&self) -> bool {
        matches!(self, SystemStatus::Running)
    }
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ORDER PRIMITIVES
// ============================================================================

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an order came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSource {
    Agent,
    Manual,
}

impl OrderSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSource::Agent => "agent",
            OrderSource::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "agent" => Some(OrderSource::Agent),
            "manual" => Some(OrderSource::Manual),
            _ => None,
        }
    }
}

/// A trade request as submitted through the dashboard or by an agent,
/// before any gate has looked at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    /// Optional limit price; market order when absent.
    pub limit_price: Option<f64>,
    pub source: OrderSource,
}

// ============================================================================
// QUOTES
// ============================================================================

/// Snapshot of upstream market data for one symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    /// When this snapshot was fetched from the exchange.
    pub fetched_at: DateTime<Utc>,
}

impl Quote {
    #[inline]
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Age-based staleness check against a threshold in seconds.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after_secs: i64) -> bool {
        (now - self.fetched_at).num_seconds() > stale_after_secs
    }
}

/// Shared in-memory quote cache, written by the market-data poller and read
/// by the gate chain and the dashboard handlers.
#[derive(Debug, Default)]
pub struct QuoteBoard {
    quotes: RwLock<HashMap<String, Quote>>,
}

impl QuoteBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, quote: Quote) {
        let mut quotes = self.quotes.write().expect("quote board lock poisoned");
        quotes.insert(symbol.to_string(), quote);
    }

    pub fn get(&self, symbol: &str) -> Option<Quote> {
        let quotes = self.quotes.read().expect("quote board lock poisoned");
        quotes.get(symbol).copied()
    }

    /// Snapshot of all quotes with their staleness flags. Symbols in
    /// `expected` that have never been fetched appear with empty prices and
    /// `stale: true`.
    pub fn snapshot(
        &self,
        expected: &[String],
        now: DateTime<Utc>,
        stale_after_secs: i64,
    ) -> Vec<QuoteView> {
        let quotes = self.quotes.read().expect("quote board lock poisoned");
        let mut views: Vec<QuoteView> = quotes
            .iter()
            .map(|(symbol, q)| QuoteView {
                symbol: symbol.clone(),
                bid: Some(q.bid),
                ask: Some(q.ask),
                last: Some(q.last),
                fetched_at: Some(q.fetched_at),
                stale: q.is_stale(now, stale_after_secs),
            })
            .collect();

        for symbol in expected {
            if !quotes.contains_key(symbol) {
                views.push(QuoteView {
                    symbol: symbol.clone(),
                    bid: None,
                    ask: None,
                    last: None,
                    fetched_at: None,
                    stale: true,
                });
            }
        }

        views.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        views
    }
}

/// Quote plus derived staleness flag, as served to the dashboard. Prices
/// are absent for a symbol that has never been fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteView {
    pub symbol: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

/// Normalize a user-supplied symbol for allow-list comparison.
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_mode_round_trip() {
        assert_eq!(TradingMode::from_str("LIVE"), Some(TradingMode::Live));
        assert_eq!(TradingMode::from_str("paper"), Some(TradingMode::Paper));
        assert_eq!(TradingMode::from_str("dry"), None);
        assert!(!TradingMode::Paper.is_live());
    }

    #[test]
    fn test_status_allows_trading() {
        assert!(SystemStatus::Running.allows_trading());
        assert!(!SystemStatus::Paused.allows_trading());
        assert!(!SystemStatus::Stopped.allows_trading());
    }

    #[test]
    fn test_quote_staleness() {
        let now = Utc::now();
        let quote = Quote {
            bid: 99.0,
            ask: 101.0,
            last: 100.0,
            fetched_at: now - Duration::seconds(10),
        };
        assert!(!quote.is_stale(now, 15));
        assert!(quote.is_stale(now, 5));
        assert!((quote.mid() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_quote_board_snapshot() {
        let board = QuoteBoard::new();
        let now = Utc::now();
        board.update(
            "BTC-USD",
            Quote { bid: 1.0, ask: 2.0, last: 1.5, fetched_at: now },
        );
        board.update(
            "ETH-USD",
            Quote { bid: 1.0, ask: 2.0, last: 1.5, fetched_at: now - Duration::seconds(120) },
        );

        let expected = vec![
            "BTC-USD".to_string(),
            "ETH-USD".to_string(),
            "SOL-USD".to_string(),
        ];
        let views = board.snapshot(&expected, now, 30);
        assert_eq!(views.len(), 3);
        // Sorted by symbol
        assert_eq!(views[0].symbol, "BTC-USD");
        assert!(!views[0].stale);
        assert!(views[1].stale);
        // Never fetched, so stale with no prices
        assert_eq!(views[2].symbol, "SOL-USD");
        assert!(views[2].stale);
        assert!(views[2].bid.is_none());
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("  btc-usd "), "BTC-USD");
    }
}
