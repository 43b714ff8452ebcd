//! Market data polling.
//!
//! A single background task fetches quotes for every configured symbol on a
//! fixed interval, writes them into the shared `QuoteBoard` and pushes a
//! quote event to SSE subscribers. Fetch failures for one symbol never stop
//! the loop; the quote just ages until the staleness gate starts rejecting
//! orders for it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::alerts::AlertLevel;
use crate::dashboard::state::{DashboardEvent, DashboardState};
use crate::exchange::ExchangeClient;
use crate::types::QuoteView;

/// Poll quotes forever. Spawned as a background task at startup.
pub async fn run_quote_poller(
    exchange: Arc<ExchangeClient>,
    state: Arc<DashboardState>,
    interval_secs: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        ticker.tick().await;

        for symbol in &state.symbols {
            match exchange.get_quote(symbol).await {
                Ok(quote) => {
                    state.quotes.update(symbol, quote);
                    debug!("[MARKET] {} mid={:.4}", symbol, quote.mid());

                    state.broadcast(DashboardEvent::Quote(QuoteView {
                        symbol: symbol.clone(),
                        bid: Some(quote.bid),
                        ask: Some(quote.ask),
                        last: Some(quote.last),
                        fetched_at: Some(quote.fetched_at),
                        stale: false,
                    }));
                }
                Err(e) => {
                    warn!("[MARKET] quote fetch failed for {}: {}", symbol, e);
                    state.alert(
                        AlertLevel::Warning,
                        format!("quote fetch failed for {}, data going stale: {}", symbol, e),
                    );
                }
            }
        }
    }
}

/// Snapshot of the quote board with staleness flags, as served by the
/// quotes endpoint. Allow-listed symbols with no data yet show as stale.
pub async fn quote_views(state: &DashboardState) -> Vec<QuoteView> {
    let stale_after = state.risk.read().await.stale_after_secs;
    state.quotes.snapshot(&state.symbols, Utc::now(), stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arming::ArmController;
    use crate::config::RiskConfig;
    use crate::execution::TradeExecutor;
    use crate::paper_trading::PaperCapitalTracker;
    use crate::persistence::Database;
    use crate::types::{Quote, QuoteBoard, TradingMode};

    #[tokio::test]
    async fn test_quote_views_flag_stale_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();

        let quotes = Arc::new(QuoteBoard::new());
        let exchange = Arc::new(ExchangeClient::new("http://127.0.0.1:1", "", None));
        let paper = PaperCapitalTracker::load_or_new(dir.path().join("p.json"), 1_000.0);
        let executor = Arc::new(TradeExecutor::new(
            db.clone(),
            quotes.clone(),
            exchange,
            paper,
        ));
        let state = DashboardState::new(
            db,
            quotes.clone(),
            Arc::new(ArmController::new()),
            executor,
            TradingMode::Paper,
            RiskConfig::default(),
            vec![
                "BTC-USD".to_string(),
                "ETH-USD".to_string(),
                "SOL-USD".to_string(),
            ],
            None,
        );

        quotes.update(
            "BTC-USD",
            Quote {
                bid: 1.0,
                ask: 2.0,
                last: 1.5,
                fetched_at: Utc::now(),
            },
        );
        quotes.update(
            "ETH-USD",
            Quote {
                bid: 1.0,
                ask: 2.0,
                last: 1.5,
                fetched_at: Utc::now() - chrono::Duration::seconds(300),
            },
        );

        let views = quote_views(&state).await;
        assert_eq!(views.len(), 3);
        assert!(!views[0].stale);
        assert!(views[1].stale);
        // Configured but never fetched
        assert_eq!(views[2].symbol, "SOL-USD");
        assert!(views[2].stale);
        assert!(views[2].fetched_at.is_none());
    }
}
