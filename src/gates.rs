//! Pre-trade gate chain.
//!
//! Every order, whether submitted by an operator or an agent, passes through
//! the same ordered gates before any executor sees it:
//!
//! 1. symbol    - must be on the configured allow-list
//! 2. quantity  - must be a positive finite number
//! 3. status    - system must be running (not paused or stopped)
//! 4. staleness - a fresh quote must exist for the symbol
//! 5. arm       - live mode requires an open arm window
//!
//! The first failing gate wins and later gates never run. In particular the
//! quote lookup only happens inside the staleness gate, so an unlisted
//! symbol is rejected without touching market data.

use chrono::{DateTime, Utc};

use crate::types::{normalize_symbol, Quote, SystemStatus, TradeRequest, TradingMode};

/// Why an order was turned away, and by which gate.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GateRejection {
    pub gate: &'static str,
    pub reason: String,
}

impl GateRejection {
    fn new(gate: &'static str, reason: impl Into<String>) -> Self {
        Self {
            gate,
            reason: reason.into(),
        }
    }
}

/// Everything the gates need to evaluate one order. The quote lookup is a
/// closure so the staleness gate is the only place market data is read.
pub struct GateContext<'a> {
    pub allowed_symbols: &'a [String],
    pub status: SystemStatus,
    pub mode: TradingMode,
    pub armed: bool,
    pub stale_after_secs: i64,
    pub now: DateTime<Utc>,
    pub quote_lookup: &'a dyn Fn(&str) -> Option<Quote>,
}

/// Run the gate chain. Returns the rejection from the first gate that
/// fails, or Ok when every gate passes.
pub fn check_order(request: &TradeRequest, ctx: &GateContext) -> Result<(), GateRejection> {
    let symbol = normalize_symbol(&request.symbol);

    // 1. symbol allow-list
    if !ctx.allowed_symbols.iter().any(|s| s == &symbol) {
        return Err(GateRejection::new(
            "symbol",
            format!("unknown symbol: {}", symbol),
        ));
    }

    // 2. quantity sanity
    if !request.quantity.is_finite() || request.quantity <= 0.0 {
        return Err(GateRejection::new(
            "quantity",
            format!("quantity must be positive, got {}", request.quantity),
        ));
    }

    // 3. system status
    if !ctx.status.allows_trading() {
        return Err(GateRejection::new(
            "status",
            format!("system is {}", ctx.status),
        ));
    }

    // 4. market data freshness
    match (ctx.quote_lookup)(&symbol) {
        None => {
            return Err(GateRejection::new(
                "staleness",
                format!("no market data for {}", symbol),
            ));
        }
        Some(quote) if quote.is_stale(ctx.now, ctx.stale_after_secs) => {
            return Err(GateRejection::new(
                "staleness",
                format!(
                    "market data stale: {} last fetched {}",
                    symbol, quote.fetched_at
                ),
            ));
        }
        Some(_) => {}
    }

    // 5. live arming
    if ctx.mode.is_live() && !ctx.armed {
        return Err(GateRejection::new(
            "arm",
            "live trading requires an open arm window",
        ));
    }

    Ok(())
}
