//! Order execution pipeline.
//!
//! Every trade request is persisted first, then run through the gate chain.
//! Rejected orders keep their gate and reason on the order row. Accepted
//! orders route by mode: paper orders fill locally against the cached quote
//! with simulated slippage, live orders go to the exchange signed. Either
//! way the fill lands in the fills table and folds into positions.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::exchange::ExchangeClient;
use crate::gates::{check_order, GateContext, GateRejection};
use crate::paper_trading::{simulate_fill, PaperCapitalTracker, SimulationConfig};
use crate::persistence::{Database, NewOrder, StateValue};
use crate::types::{normalize_symbol, QuoteBoard, SystemStatus, TradeRequest, TradingMode};

/// Control-plane snapshot taken at submission time, so one order is gated
/// against one consistent view of the system.
#[derive(Debug, Clone)]
pub struct ControlSnapshot {
    pub status: SystemStatus,
    pub mode: TradingMode,
    pub armed: bool,
    pub stale_after_secs: i64,
    pub allowed_symbols: Vec<String>,
}

/// Fill details reported back to the submitter
#[derive(Debug, Clone, serde::Serialize)]
pub struct FillSummary {
    pub price: f64,
    pub quantity: f64,
    pub simulated: bool,
    pub exchange_id: Option<String>,
}

/// What happened to a submitted trade
#[derive(Debug, Clone, serde::Serialize)]
pub struct TradeOutcome {
    pub order_id: i64,
    pub accepted: bool,
    /// Inlined into the response body as `gate` and `reason`.
    #[serde(flatten)]
    pub rejection: Option<GateRejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<FillSummary>,
}

/// Routes accepted orders to the paper simulator or the live exchange.
pub struct TradeExecutor {
    db: Arc<Database>,
    quotes: Arc<QuoteBoard>,
    exchange: Arc<ExchangeClient>,
    paper: Mutex<PaperCapitalTracker>,
    sim: SimulationConfig,
}

impl TradeExecutor {
    pub fn new(
        db: Arc<Database>,
        quotes: Arc<QuoteBoard>,
        exchange: Arc<ExchangeClient>,
        paper: PaperCapitalTracker,
    ) -> Self {
        Self {
            db,
            quotes,
            exchange,
            paper: Mutex::new(paper),
            sim: SimulationConfig::default(),
        }
    }

    /// Persist, gate and execute one trade request. A gate rejection is a
    /// normal outcome; an error means the order passed the gates but could
    /// not be executed (it is marked failed in the database).
    pub async fn submit(
        &self,
        request: &TradeRequest,
        ctx: &ControlSnapshot,
    ) -> Result<TradeOutcome> {
        let symbol = normalize_symbol(&request.symbol);

        let order_id = self
            .db
            .insert_order(&NewOrder {
                symbol: symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                limit_price: request.limit_price,
                mode: ctx.mode,
                source: request.source,
            })
            .context("persist incoming order")?;

        if let Err(rejection) = self.run_gates(request, ctx) {
            self.db
                .mark_order_rejected(order_id, &rejection.reason)
                .context("record gate rejection")?;
            self.db.insert_control_event(
                "trade_rejected",
                Some(&format!(
                    "order={} {} gate: {}",
                    order_id, rejection.gate, rejection.reason
                )),
            )?;
            info!(
                "[EXEC] order {} rejected by {} gate: {}",
                order_id, rejection.gate, rejection.reason
            );
            return Ok(TradeOutcome {
                order_id,
                accepted: false,
                rejection: Some(rejection),
                fill: None,
            });
        }

        let fill = match ctx.mode {
            TradingMode::Paper => self.execute_paper(order_id, request, &symbol).await,
            TradingMode::Live => self.execute_live(order_id, request, &symbol).await,
        };

        match fill {
            Ok(fill) => {
                self.db.insert_control_event(
                    "trade_submitted",
                    Some(&format!(
                        "order={} {} {} {} @ {:.4}",
                        order_id, request.side, fill.quantity, symbol, fill.price
                    )),
                )?;
                info!(
                    "[EXEC] order {} filled {} {} @ {:.4} ({})",
                    order_id,
                    request.side,
                    symbol,
                    fill.price,
                    if fill.simulated { "paper" } else { "live" }
                );
                Ok(TradeOutcome {
                    order_id,
                    accepted: true,
                    rejection: None,
                    fill: Some(fill),
                })
            }
            Err(e) => {
                warn!("[EXEC] order {} failed: {:#}", order_id, e);
                self.db.mark_order_failed(order_id, &format!("{:#}", e))?;
                self.db.insert_control_event(
                    "trade_failed",
                    Some(&format!("order={} {:#}", order_id, e)),
                )?;
                Err(e)
            }
        }
    }

    fn run_gates(&self, request: &TradeRequest, ctx: &ControlSnapshot) -> Result<(), GateRejection> {
        let lookup = |symbol: &str| self.quotes.get(symbol);
        let gate_ctx = GateContext {
            allowed_symbols: &ctx.allowed_symbols,
            status: ctx.status,
            mode: ctx.mode,
            armed: ctx.armed,
            stale_after_secs: ctx.stale_after_secs,
            now: Utc::now(),
            quote_lookup: &lookup,
        };
        check_order(request, &gate_ctx)
    }

    async fn execute_paper(
        &self,
        order_id: i64,
        request: &TradeRequest,
        symbol: &str,
    ) -> Result<FillSummary> {
        // The staleness gate guarantees a fresh quote exists
        let quote = self
            .quotes
            .get(symbol)
            .context("quote disappeared between gate and fill")?;

        let fill = simulate_fill(request.side, request.quantity, &quote, &self.sim);

        self.db
            .insert_fill(order_id, fill.quantity, fill.price, true)
            .context("persist simulated fill")?;
        self.db.mark_order_filled(order_id, None)?;

        let mut paper = self.paper.lock().await;
        paper.apply_fill(request.side, fill.quantity, fill.price);
        paper.save();
        self.db
            .set_state("current_capital", &StateValue::Float(paper.current_capital()))?;
        self.db
            .set_state("high_water_mark", &StateValue::Float(paper.high_water_mark()))?;

        Ok(FillSummary {
            price: fill.price,
            quantity: fill.quantity,
            simulated: true,
            exchange_id: None,
        })
    }

    async fn execute_live(
        &self,
        order_id: i64,
        request: &TradeRequest,
        symbol: &str,
    ) -> Result<FillSummary> {
        let ack = self
            .exchange
            .place_order(symbol, request.side, request.quantity, request.limit_price)
            .await
            .context("place live order")?;

        if !ack_is_executable(&ack.status) {
            anyhow::bail!(
                "exchange did not accept order {}: status {}",
                ack.order_id,
                ack.status
            );
        }

        // When the exchange does not report a fill price, fall back to the
        // quote mid so the position is still tracked.
        let price = match ack.avg_fill_price {
            Some(price) => price,
            None => self
                .quotes
                .get(symbol)
                .map(|q| q.mid())
                .context("no fill price from exchange and no cached quote")?,
        };

        self.db
            .insert_fill(order_id, request.quantity, price, false)?;
        self.db.mark_order_filled(order_id, Some(&ack.order_id))?;

        Ok(FillSummary {
            price,
            quantity: request.quantity,
            simulated: false,
            exchange_id: Some(ack.order_id),
        })
    }

    /// Current paper capital, for the stats endpoint.
    pub async fn paper_capital(&self) -> (f64, f64) {
        let paper = self.paper.lock().await;
        (paper.current_capital(), paper.high_water_mark())
    }

    /// Paper capital change since the start of the UTC day.
    pub async fn paper_daily_pnl(&self) -> f64 {
        self.paper.lock().await.daily_pnl(Utc::now().date_naive())
    }
}

/// An ack that the exchange killed must not be recorded as a fill.
fn ack_is_executable(status: &str) -> bool {
    !matches!(
        status.to_ascii_lowercase().as_str(),
        "rejected" | "cancelled" | "canceled" | "expired" | "failed"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::OrderStatus;
    use crate::types::{OrderSource, Quote, Side};

    fn fixture(dir: &tempfile::TempDir) -> TradeExecutor {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        let quotes = Arc::new(QuoteBoard::new());
        quotes.update(
            "BTC-USD",
            Quote {
                bid: 99.0,
                ask: 101.0,
                last: 100.0,
                fetched_at: Utc::now(),
            },
        );

        let exchange = Arc::new(ExchangeClient::new("http://127.0.0.1:1", "", None));
        let paper = PaperCapitalTracker::load_or_new(dir.path().join("paper.json"), 10_000.0);

        TradeExecutor::new(Arc::new(db), quotes, exchange, paper)
    }

    fn snapshot() -> ControlSnapshot {
        ControlSnapshot {
            status: SystemStatus::Running,
            mode: TradingMode::Paper,
            armed: false,
            stale_after_secs: 30,
            allowed_symbols: vec!["BTC-USD".to_string()],
        }
    }

    fn request(symbol: &str) -> TradeRequest {
        TradeRequest {
            symbol: symbol.to_string(),
            side: Side::Buy,
            quantity: 2.0,
            limit_price: None,
            source: OrderSource::Manual,
        }
    }

    #[tokio::test]
    async fn test_paper_order_fills_and_updates_capital() {
        let dir = tempfile::tempdir().unwrap();
        let exec = fixture(&dir);

        let outcome = exec.submit(&request("BTC-USD"), &snapshot()).await.unwrap();
        assert!(outcome.accepted);

        let fill = outcome.fill.unwrap();
        assert!(fill.simulated);
        // Buy of 2 at ~100 with <=0.5% slippage
        assert!(fill.price >= 100.0 && fill.price <= 100.51);

        let (capital, hwm) = exec.paper_capital().await;
        assert!(capital < 10_000.0);
        assert_eq!(hwm, 10_000.0);

        let positions = exec.db.get_positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 2.0);

        let events = exec.db.get_recent_control_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "trade_submitted");
    }

    #[tokio::test]
    async fn test_rejection_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let exec = fixture(&dir);

        let outcome = exec.submit(&request("DOGE-USD"), &snapshot()).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.rejection.as_ref().unwrap().gate, "symbol");

        let orders = exec.db.get_recent_orders(10).unwrap();
        assert_eq!(orders[0].status, OrderStatus::Rejected);
        assert!(orders[0].reject_reason.as_deref().unwrap().contains("DOGE-USD"));
        assert!(exec.db.get_positions().unwrap().is_empty());

        let events = exec.db.get_recent_control_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "trade_rejected");
        assert!(events[0].detail.as_deref().unwrap().contains("symbol gate"));
    }

    #[tokio::test]
    async fn test_live_without_arm_is_gated() {
        let dir = tempfile::tempdir().unwrap();
        let exec = fixture(&dir);

        let mut ctx = snapshot();
        ctx.mode = TradingMode::Live;

        let outcome = exec.submit(&request("BTC-USD"), &ctx).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.rejection.unwrap().gate, "arm");
    }

    #[tokio::test]
    async fn test_paused_system_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let exec = fixture(&dir);

        let mut ctx = snapshot();
        ctx.status = SystemStatus::Paused;

        let outcome = exec.submit(&request("BTC-USD"), &ctx).await.unwrap();
        assert_eq!(outcome.rejection.unwrap().gate, "status");
    }

    #[test]
    fn test_rejection_serializes_flat() {
        let outcome = TradeOutcome {
            order_id: 7,
            accepted: false,
            rejection: Some(GateRejection {
                gate: "symbol",
                reason: "UNKNOWN-USD is not in the allow-list".to_string(),
            }),
            fill: None,
        };

        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["accepted"], false);
        assert_eq!(v["gate"], "symbol");
        assert!(v["reason"].as_str().unwrap().contains("allow-list"));
        assert!(v.get("rejection").is_none());
    }

    #[test]
    fn test_dead_ack_statuses_are_not_fills() {
        assert!(ack_is_executable("filled"));
        assert!(ack_is_executable("open"));
        assert!(!ack_is_executable("rejected"));
        assert!(!ack_is_executable("Cancelled"));
        assert!(!ack_is_executable("EXPIRED"));
    }
}
