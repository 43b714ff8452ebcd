//! Server-Sent Events stream pushing live updates to dashboard clients.
//!
//! Clients connect to `/api/events` and receive an initial snapshot (stats
//! and status), then every event the system broadcasts: quotes, trades,
//! status changes and config edits. Periodic broadcasters cover clients
//! that miss events.

use crate::dashboard::state::{DashboardEvent, DashboardState};
use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

fn event_name(event: &DashboardEvent) -> &'static str {
    match event {
        DashboardEvent::Stats(_) => "stats",
        DashboardEvent::Status { .. } => "status",
        DashboardEvent::Quote(_) => "quote",
        DashboardEvent::Trade(_) => "trade",
        DashboardEvent::Config(_) => "config",
        DashboardEvent::Heartbeat { .. } => "heartbeat",
    }
}

/// Build the per-client SSE response for `/api/events`.
pub fn create_sse_stream(
    state: Arc<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.subscribe();

    let stream = stream! {
        // New clients get a stats and status snapshot up front
        if let Ok(stats) = state.get_stats().await {
            if let Ok(json) = serde_json::to_string(&stats) {
                yield Ok(Event::default().event("stats").data(json));
            }
        }

        let status_event = DashboardEvent::Status {
            status: *state.system_status.read().await,
            mode: *state.trading_mode.read().await,
            armed: state.arm.is_armed(Utc::now()),
            armed_until: state.arm.armed_until(),
        };
        if let Ok(json) = serde_json::to_string(&status_event) {
            yield Ok(Event::default().event("status").data(json));
        }

        // Then relay everything off the broadcast channel
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let name = event_name(&event);
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            debug!("[SSE] sending {} event", name);
                            yield Ok(Event::default().event(name).data(json));
                        }
                        Err(e) => {
                            warn!("[SSE] event serialization failed: {}", e);
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // Slow consumer, skip the missed events and keep going
                    warn!("[SSE] client lagged, {} events dropped", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("[SSE] broadcast channel closed, ending stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Pushes a fresh stats snapshot to all connected clients every few seconds.
pub async fn stats_broadcaster(state: Arc<DashboardState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));

    loop {
        interval.tick().await;

        match state.get_stats().await {
            Ok(stats) => state.broadcast(DashboardEvent::Stats(stats)),
            Err(e) => warn!("stats broadcast skipped: {}", e),
        }
    }
}

/// Background task that sends heartbeat events so clients can detect a
/// wedged stream even when nothing else is happening.
pub async fn heartbeat_broadcaster(state: Arc<DashboardState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    loop {
        interval.tick().await;
        state.broadcast(DashboardEvent::Heartbeat {
            timestamp: Utc::now().timestamp(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arming::ArmController;
    use crate::config::RiskConfig;
    use crate::exchange::ExchangeClient;
    use crate::execution::TradeExecutor;
    use crate::paper_trading::PaperCapitalTracker;
    use crate::persistence::Database;
    use crate::types::{QuoteBoard, TradingMode};

    fn test_state(dir: &tempfile::TempDir) -> Arc<DashboardState> {
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

        DashboardState::new(
            db,
            quotes,
            Arc::new(ArmController::new()),
            executor,
            TradingMode::Paper,
            RiskConfig::default(),
            vec!["BTC-USD".to_string()],
            None,
        )
    }

    #[tokio::test]
    async fn test_sse_stream_creation() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let _sse = create_sse_stream(state);
        // Constructing the stream must not panic with an empty board
    }

    #[tokio::test]
    async fn test_event_names() {
        assert_eq!(
            event_name(&DashboardEvent::Heartbeat { timestamp: 0 }),
            "heartbeat"
        );
        assert_eq!(
            event_name(&DashboardEvent::Config(RiskConfig::default())),
            "config"
        );
    }
}
