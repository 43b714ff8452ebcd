//! Simulated order execution for paper mode.
//!
//! Paper mode mirrors the live execution path but fills orders locally off
//! the cached quote, applying random slippage in the [0%, 0.5%] range. A
//! capital tracker keeps running paper capital, a high-water mark and
//! drawdown, persisted as JSON so restarts continue where they left off.

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::{Quote, Side};

// ============================================================================
// SIMULATED FILLS
// ============================================================================

/// Configuration for simulated fill behavior
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Minimum slippage fraction (0.0 = 0%)
    pub min_slippage: f64,
    /// Maximum slippage fraction (0.005 = 0.5%)
    pub max_slippage: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_slippage: 0.0,
            max_slippage: 0.005,
        }
    }
}

/// Result of a simulated fill
#[derive(Debug, Clone)]
pub struct SimulatedFill {
    /// Fill price after slippage
    pub price: f64,
    pub quantity: f64,
    pub slippage_applied: f64,
    pub filled_at: DateTime<Utc>,
}

/// Simulate a fill off the quote mid-price with random slippage. Buys pay
/// slightly more, sells receive slightly less.
pub fn simulate_fill(
    side: Side,
    quantity: f64,
    quote: &Quote,
    config: &SimulationConfig,
) -> SimulatedFill {
    let mut rng = rand::thread_rng();

    let base_price = quote.mid();
    let slippage = rng.gen_range(config.min_slippage..=config.max_slippage);

    let price = match side {
        Side::Buy => base_price * (1.0 + slippage),
        Side::Sell => base_price * (1.0 - slippage),
    };

    SimulatedFill {
        price,
        quantity,
        slippage_applied: slippage,
        filled_at: Utc::now(),
    }
}

// ============================================================================
// PAPER CAPITAL TRACKING
// ============================================================================

/// Persistent paper capital state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperCapitalState {
    pub initial_capital: f64,
    pub current_capital: f64,
    pub high_water_mark: f64,
    pub fills: u64,
    /// UTC day the daily P&L baseline belongs to
    pub day: NaiveDate,
    /// Capital at the start of `day`
    pub day_start_capital: f64,
    pub updated_at: DateTime<Utc>,
}

impl PaperCapitalState {
    fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            current_capital: initial_capital,
            high_water_mark: initial_capital,
            fills: 0,
            day: Utc::now().date_naive(),
            day_start_capital: initial_capital,
            updated_at: Utc::now(),
        }
    }
}

/// Tracks simulated capital across fills, saved to a JSON file.
#[derive(Debug)]
pub struct PaperCapitalTracker {
    state: PaperCapitalState,
    path: PathBuf,
}

impl PaperCapitalTracker {
    /// Load state from disk, or start fresh with the given capital. A state
    /// file that fails to parse is discarded with a warning rather than
    /// aborting startup.
    pub fn load_or_new<P: AsRef<Path>>(path: P, initial_capital: f64) -> Self {
        let path = path.as_ref().to_path_buf();

        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<PaperCapitalState>(&contents) {
                Ok(state) => {
                    info!(
                        "[PAPER] restored capital state: ${:.2} over {} fills",
                        state.current_capital, state.fills
                    );
                    state
                }
                Err(e) => {
                    warn!("[PAPER] unreadable state file {:?}, starting fresh: {}", path, e);
                    PaperCapitalState::new(initial_capital)
                }
            },
            Err(_) => PaperCapitalState::new(initial_capital),
        };

        Self { state, path }
    }

    /// Apply a fill's cash flow: buys spend capital, sells return it.
    pub fn apply_fill(&mut self, side: Side, quantity: f64, price: f64) {
        self.roll_day(Utc::now().date_naive());

        let notional = quantity * price;
        match side {
            Side::Buy => self.state.current_capital -= notional,
            Side::Sell => self.state.current_capital += notional,
        }

        if self.state.current_capital > self.state.high_water_mark {
            self.state.high_water_mark = self.state.current_capital;
        }
        self.state.fills += 1;
        self.state.updated_at = Utc::now();
    }

    /// Reset the daily P&L baseline when the UTC day has changed.
    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.state.day {
            self.state.day = today;
            self.state.day_start_capital = self.state.current_capital;
        }
    }

    /// Capital change since the start of `today`. A baseline left over from
    /// an earlier day counts as zero; the stored baseline only rolls when
    /// the next fill arrives.
    pub fn daily_pnl(&self, today: NaiveDate) -> f64 {
        if today != self.state.day {
            return 0.0;
        }
        self.state.current_capital - self.state.day_start_capital
    }

    /// Drawdown from the high-water mark, in percent.
    pub fn drawdown_pct(&self) -> f64 {
        if self.state.high_water_mark <= 0.0 {
            return 0.0;
        }
        ((self.state.high_water_mark - self.state.current_capital)
            / self.state.high_water_mark)
            * 100.0
    }

    pub fn current_capital(&self) -> f64 {
        self.state.current_capital
    }

    pub fn high_water_mark(&self) -> f64 {
        self.state.high_water_mark
    }

    pub fn fills(&self) -> u64 {
        self.state.fills
    }

    /// Write the state file. Best effort; an unwritable path is logged.
    pub fn save(&self) {
        match serde_json::to_string_pretty(&self.state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!("[PAPER] failed to save state to {:?}: {}", self.path, e);
                }
            }
            Err(e) => warn!("[PAPER] failed to serialize state: {}", e),
        }
    }
}
