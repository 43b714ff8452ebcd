//! SQLite persistence layer for the evotrade dashboard.
//!
//! This module provides:
//! - Database initialization and schema migration
//! - CRUD operations for generations, agents, decisions, orders, fills,
//!   positions and control events
//! - Key-value system state (status, mode, capital, arm deadline)
//! - Aggregation queries backing the dashboard views
//!
//! # Example
//! ```rust,ignore
//! use evotrade_dash::persistence::Database;
//!
//! let db = Database::open("./evotrade.db")?;
//! db.initialize()?;
//!
//! let positions = db.get_positions()?;
//! ```

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::types::{OrderSource, Side, TradingMode};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during database operations
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;

// ============================================================================
// RECORD TYPES
// ============================================================================

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "filled" => Some(OrderStatus::Filled),
            "rejected" => Some(OrderStatus::Rejected),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

/// Order data for insertion
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub mode: TradingMode,
    pub source: OrderSource,
}

/// Complete order record from database
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderRecord {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub mode: TradingMode,
    pub source: OrderSource,
    pub status: OrderStatus,
    pub reject_reason: Option<String>,
    pub exchange_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fill record from database
#[derive(Debug, Clone, serde::Serialize)]
pub struct FillRecord {
    pub id: i64,
    pub order_id: i64,
    pub quantity: f64,
    pub price: f64,
    pub simulated: bool,
    /// Realized P&L this fill contributed when it reduced a position.
    pub realized_delta: f64,
    pub filled_at: DateTime<Utc>,
}

/// Net position per symbol. Quantity is signed (negative when short).
#[derive(Debug, Clone, serde::Serialize)]
pub struct PositionRecord {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub updated_at: DateTime<Utc>,
}

/// One generation of the evolutionary population
#[derive(Debug, Clone, serde::Serialize)]
pub struct GenerationRecord {
    pub id: i64,
    pub label: String,
    pub population_size: i64,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Agent within a generation
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentRecord {
    pub id: i64,
    pub generation_id: i64,
    pub name: String,
    pub genome_hash: String,
    pub fitness: f64,
    pub wins: i64,
    pub losses: i64,
    pub status: String,
}

/// Agent decision for insertion
#[derive(Debug, Clone)]
pub struct NewDecision {
    pub agent_id: i64,
    pub generation_id: i64,
    pub symbol: String,
    pub action: String,
}

/// Decision record from database
#[derive(Debug, Clone, serde::Serialize)]
pub struct DecisionRecord {
    pub id: i64,
    pub agent_id: i64,
    pub generation_id: i64,
    pub symbol: String,
    pub action: String,
    pub created_at: DateTime<Utc>,
}

/// Audit row for a control action (arm, disarm, status, mode, config)
#[derive(Debug, Clone, serde::Serialize)]
pub struct ControlEvent {
    pub id: i64,
    pub action: String,
    pub actor: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Decision counts per action for one generation
#[derive(Debug, Clone, serde::Serialize)]
pub struct DecisionTally {
    pub action: String,
    pub count: i64,
}

/// Decision activity in one hour bucket. `cumulative` is a running total
/// over buckets sorted by hour, so it never decreases.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HourBucket {
    pub hour: String,
    pub count: i64,
    pub cumulative: i64,
}

/// Realized P&L in one day bucket, with a running cumulative total over
/// buckets sorted ascending by day.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DayBucket {
    pub day: String,
    pub realized_pnl: f64,
    pub cumulative: f64,
}

/// Fitness summary across a generation's agents
#[derive(Debug, Clone, serde::Serialize)]
pub struct FitnessSummary {
    pub generation_id: i64,
    pub best_fitness: Option<f64>,
    pub mean_fitness: Option<f64>,
    pub alive: i64,
    pub culled: i64,
}

/// System state value types
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
}

impl StateValue {
    /// Convert to string representation for storage
    pub fn to_db_string(&self) -> String {
        match self {
            StateValue::String(s) => s.clone(),
            StateValue::Int(i) => i.to_string(),
            StateValue::Float(f) => f.to_string(),
            StateValue::Bool(b) => b.to_string(),
            StateValue::DateTime(dt) => dt.to_rfc3339(),
        }
    }

    /// Get the type name for the value_type column
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::String(_) => "string",
            StateValue::Int(_) => "int",
            StateValue::Float(_) => "float",
            StateValue::Bool(_) => "bool",
            StateValue::DateTime(_) => "datetime",
        }
    }

    /// Parse from database string and type
    pub fn from_db(value: &str, type_name: &str) -> Option<Self> {
        match type_name {
            "string" => Some(StateValue::String(value.to_string())),
            "int" => value.parse().ok().map(StateValue::Int),
            "float" => value.parse().ok().map(StateValue::Float),
            "bool" => value.parse().ok().map(StateValue::Bool),
            "datetime" => DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| StateValue::DateTime(dt.with_timezone(&Utc))),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            StateValue::Float(f) => Some(*f),
            StateValue::Int(i) => Some(*i as f64),
            StateValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            StateValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_string(&self) -> String {
        self.to_db_string()
    }
}

// ============================================================================
// DATABASE IMPLEMENTATION
// ============================================================================

/// Thread-safe database handle
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Initialize the database schema from the migration file
    pub fn initialize(&self) -> DbResult<()> {
        let schema = include_str!("../migrations/001_initial.sql");
        let conn = self.lock()?;
        conn.execute_batch(schema)?;
        Ok(())
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DbError::InvalidData("connection lock poisoned".to_string()))
    }

    // ========================================================================
    // ORDER OPERATIONS
    // ========================================================================

    /// Insert a new pending order, returning its id
    pub fn insert_order(&self, order: &NewOrder) -> DbResult<i64> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO orders (symbol, side, quantity, limit_price, mode, source, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
            params![
                order.symbol,
                order.side.as_str(),
                order.quantity,
                order.limit_price,
                order.mode.as_str(),
                order.source.as_str(),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Mark an order filled, recording the exchange id when one exists
    pub fn mark_order_filled(&self, order_id: i64, exchange_id: Option<&str>) -> DbResult<()> {
        let conn = self.lock()?;

        let rows = conn.execute(
            "UPDATE orders SET status = 'filled', exchange_id = ?1 WHERE id = ?2",
            params![exchange_id, order_id],
        )?;

        if rows == 0 {
            return Err(DbError::NotFound(format!("Order not found: {}", order_id)));
        }
        Ok(())
    }

    /// Mark an order rejected with the gate's reason
    pub fn mark_order_rejected(&self, order_id: i64, reason: &str) -> DbResult<()> {
        let conn = self.lock()?;

        let rows = conn.execute(
            "UPDATE orders SET status = 'rejected', reject_reason = ?1 WHERE id = ?2",
            params![reason, order_id],
        )?;

        if rows == 0 {
            return Err(DbError::NotFound(format!("Order not found: {}", order_id)));
        }
        Ok(())
    }

    /// Mark an order failed (passed the gates but did not execute)
    pub fn mark_order_failed(&self, order_id: i64, reason: &str) -> DbResult<()> {
        let conn = self.lock()?;

        let rows = conn.execute(
            "UPDATE orders SET status = 'failed', reject_reason = ?1 WHERE id = ?2",
            params![reason, order_id],
        )?;

        if rows == 0 {
            return Err(DbError::NotFound(format!("Order not found: {}", order_id)));
        }
        Ok(())
    }

    /// Get the most recent orders, newest first
    pub fn get_recent_orders(&self, limit: u32) -> DbResult<Vec<OrderRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, symbol, side, quantity, limit_price, mode, source, status,
                    reject_reason, exchange_id, created_at
             FROM orders ORDER BY id DESC LIMIT ?1",
        )?;

        let orders = stmt
            .query_map([limit], |row| Self::row_to_order(row))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(orders)
    }

    /// Record a fill and fold it into the per-symbol position
    pub fn insert_fill(
        &self,
        order_id: i64,
        quantity: f64,
        price: f64,
        simulated: bool,
    ) -> DbResult<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (symbol, side): (String, String) = tx.query_row(
            "SELECT symbol, side FROM orders WHERE id = ?1",
            [order_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let signed_qty = if side == "sell" { -quantity } else { quantity };

        let existing: Option<(f64, f64, f64)> = tx
            .query_row(
                "SELECT quantity, avg_price, realized_pnl FROM positions WHERE symbol = ?1",
                [&symbol],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let old_pnl = existing.map(|(_, _, pnl)| pnl).unwrap_or(0.0);
        let (new_qty, new_avg, new_pnl) = match existing {
            Some((qty, avg, pnl)) => apply_fill(qty, avg, pnl, signed_qty, price),
            None => (signed_qty, price, 0.0),
        };

        tx.execute(
            "INSERT INTO fills (order_id, quantity, price, simulated, realized_delta)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![order_id, quantity, price, simulated, new_pnl - old_pnl],
        )?;
        let fill_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO positions (symbol, quantity, avg_price, realized_pnl, updated_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
             ON CONFLICT(symbol) DO UPDATE SET
                quantity = excluded.quantity,
                avg_price = excluded.avg_price,
                realized_pnl = excluded.realized_pnl,
                updated_at = excluded.updated_at",
            params![symbol, new_qty, new_avg, new_pnl],
        )?;

        tx.commit()?;
        Ok(fill_id)
    }

    /// Get fills, optionally scoped to one order
    pub fn get_fills(&self, order_id: Option<i64>) -> DbResult<Vec<FillRecord>> {
        let conn = self.lock()?;

        let map_row = |row: &Row| -> rusqlite::Result<FillRecord> {
            Ok(FillRecord {
                id: row.get(0)?,
                order_id: row.get(1)?,
                quantity: row.get(2)?,
                price: row.get(3)?,
                simulated: row.get(4)?,
                realized_delta: row.get(5)?,
                filled_at: parse_ts(row, 6)?,
            })
        };

        let fills = match order_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, order_id, quantity, price, simulated, realized_delta, filled_at
                     FROM fills WHERE order_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map([id], map_row)?.collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, order_id, quantity, price, simulated, realized_delta, filled_at
                     FROM fills ORDER BY id DESC LIMIT 200",
                )?;
                let rows = stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        Ok(fills)
    }

    /// Get all positions with non-zero quantity
    pub fn get_positions(&self) -> DbResult<Vec<PositionRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT symbol, quantity, avg_price, realized_pnl, updated_at
             FROM positions WHERE quantity != 0 ORDER BY symbol",
        )?;

        let positions = stmt
            .query_map([], |row| {
                Ok(PositionRecord {
                    symbol: row.get(0)?,
                    quantity: row.get(1)?,
                    avg_price: row.get(2)?,
                    realized_pnl: row.get(3)?,
                    updated_at: parse_ts(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(positions)
    }

    // ========================================================================
    // POPULATION OPERATIONS
    // ========================================================================

    /// Insert a new generation, returning its id
    pub fn insert_generation(&self, label: &str, population_size: i64) -> DbResult<i64> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO generations (label, population_size, status) VALUES (?1, ?2, 'active')",
            params![label, population_size],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Mark a generation completed
    pub fn complete_generation(&self, generation_id: i64) -> DbResult<()> {
        let conn = self.lock()?;

        let rows = conn.execute(
            "UPDATE generations
             SET status = 'completed', ended_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?1",
            [generation_id],
        )?;

        if rows == 0 {
            return Err(DbError::NotFound(format!(
                "Generation not found: {}",
                generation_id
            )));
        }
        Ok(())
    }

    /// Get generations, newest first
    pub fn get_generations(&self) -> DbResult<Vec<GenerationRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, label, population_size, status, started_at, ended_at
             FROM generations ORDER BY id DESC",
        )?;

        let generations = stmt
            .query_map([], |row| {
                Ok(GenerationRecord {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    population_size: row.get(2)?,
                    status: row.get(3)?,
                    started_at: parse_ts(row, 4)?,
                    ended_at: parse_opt_ts(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(generations)
    }

    /// Insert or update an agent keyed by (generation, name)
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_agent(
        &self,
        generation_id: i64,
        name: &str,
        genome_hash: &str,
        fitness: f64,
        wins: i64,
        losses: i64,
        status: &str,
    ) -> DbResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO agents (generation_id, name, genome_hash, fitness, wins, losses, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(generation_id, name) DO UPDATE SET
                genome_hash = excluded.genome_hash,
                fitness = excluded.fitness,
                wins = excluded.wins,
                losses = excluded.losses,
                status = excluded.status",
            params![generation_id, name, genome_hash, fitness, wins, losses, status],
        )?;

        Ok(())
    }

    /// Get agents for a generation, best fitness first
    pub fn get_agents(&self, generation_id: i64) -> DbResult<Vec<AgentRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, generation_id, name, genome_hash, fitness, wins, losses, status
             FROM agents WHERE generation_id = ?1 ORDER BY fitness DESC",
        )?;

        let agents = stmt
            .query_map([generation_id], |row| {
                Ok(AgentRecord {
                    id: row.get(0)?,
                    generation_id: row.get(1)?,
                    name: row.get(2)?,
                    genome_hash: row.get(3)?,
                    fitness: row.get(4)?,
                    wins: row.get(5)?,
                    losses: row.get(6)?,
                    status: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(agents)
    }

    /// Record an agent decision
    pub fn insert_decision(&self, decision: &NewDecision) -> DbResult<i64> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO decisions (agent_id, generation_id, symbol, action)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                decision.agent_id,
                decision.generation_id,
                decision.symbol,
                decision.action,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent decisions for a generation, newest first
    pub fn get_recent_decisions(
        &self,
        generation_id: i64,
        limit: u32,
    ) -> DbResult<Vec<DecisionRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, agent_id, generation_id, symbol, action, created_at
             FROM decisions WHERE generation_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;

        let decisions = stmt
            .query_map(params![generation_id, limit], |row| {
                Ok(DecisionRecord {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    generation_id: row.get(2)?,
                    symbol: row.get(3)?,
                    action: row.get(4)?,
                    created_at: parse_ts(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(decisions)
    }

    // ========================================================================
    // AGGREGATIONS
    // ========================================================================

    /// Decision counts grouped by action for one generation
    pub fn decision_tallies(&self, generation_id: i64) -> DbResult<Vec<DecisionTally>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT action, COUNT(*) FROM decisions
             WHERE generation_id = ?1 GROUP BY action ORDER BY action",
        )?;

        let tallies = stmt
            .query_map([generation_id], |row| {
                Ok(DecisionTally {
                    action: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(tallies)
    }

    /// Decision counts per hour bucket with a running cumulative total.
    /// Buckets are sorted ascending by hour; the cumulative column never
    /// decreases.
    pub fn hourly_decision_counts(&self, generation_id: i64) -> DbResult<Vec<HourBucket>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT strftime('%Y-%m-%dT%H:00Z', created_at) AS hour, COUNT(*)
             FROM decisions WHERE generation_id = ?1
             GROUP BY hour ORDER BY hour",
        )?;

        let raw = stmt
            .query_map([generation_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(cumulate_buckets(raw))
    }

    /// Fitness summary for one generation
    pub fn fitness_summary(&self, generation_id: i64) -> DbResult<FitnessSummary> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT MAX(fitness), AVG(fitness),
                    COALESCE(SUM(status = 'alive'), 0),
                    COALESCE(SUM(status = 'culled'), 0)
             FROM agents WHERE generation_id = ?1",
            [generation_id],
            |row| {
                Ok(FitnessSummary {
                    generation_id,
                    best_fitness: row.get(0)?,
                    mean_fitness: row.get(1)?,
                    alive: row.get(2)?,
                    culled: row.get(3)?,
                })
            },
        )
        .map_err(DbError::from)
    }

    /// Order counts by status, for the stats endpoint
    pub fn order_status_counts(&self) -> DbResult<Vec<(String, i64)>> {
        let conn = self.lock()?;

        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM orders GROUP BY status ORDER BY status")?;

        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(counts)
    }

    /// Realized P&L per day with a running cumulative total, oldest first
    pub fn daily_pnl_series(&self) -> DbResult<Vec<DayBucket>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT date(filled_at) AS day, SUM(realized_delta)
             FROM fills GROUP BY day ORDER BY day",
        )?;

        let raw = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut total = 0.0;
        Ok(raw
            .into_iter()
            .map(|(day, realized_pnl)| {
                total += realized_pnl;
                DayBucket {
                    day,
                    realized_pnl,
                    cumulative: total,
                }
            })
            .collect())
    }

    /// Total realized P&L across all positions
    pub fn total_realized_pnl(&self) -> DbResult<f64> {
        let conn = self.lock()?;

        let pnl: f64 = conn.query_row(
            "SELECT COALESCE(SUM(realized_pnl), 0.0) FROM positions",
            [],
            |row| row.get(0),
        )?;

        Ok(pnl)
    }

    // ========================================================================
    // CONTROL EVENTS
    // ========================================================================

    /// Append an audit row for a control action
    pub fn insert_control_event(&self, action: &str, detail: Option<&str>) -> DbResult<i64> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO control_events (action, detail) VALUES (?1, ?2)",
            params![action, detail],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent control events, newest first
    pub fn get_recent_control_events(&self, limit: u32) -> DbResult<Vec<ControlEvent>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, action, actor, detail, created_at
             FROM control_events ORDER BY id DESC LIMIT ?1",
        )?;

        let events = stmt
            .query_map([limit], |row| {
                Ok(ControlEvent {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    actor: row.get(2)?,
                    detail: row.get(3)?,
                    created_at: parse_ts(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    // ========================================================================
    // SYSTEM STATE
    // ========================================================================

    /// Set a system state value
    pub fn set_state(&self, key: &str, value: &StateValue) -> DbResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO system_state (key, value, value_type, updated_at)
             VALUES (?1, ?2, ?3, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                value_type = excluded.value_type,
                updated_at = excluded.updated_at",
            params![key, value.to_db_string(), value.type_name()],
        )?;

        Ok(())
    }

    /// Get a system state value
    pub fn get_state(&self, key: &str) -> DbResult<Option<StateValue>> {
        let conn = self.lock()?;

        let result: Option<(String, String)> = conn
            .query_row(
                "SELECT value, value_type FROM system_state WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(result.and_then(|(value, ty)| StateValue::from_db(&value, &ty)))
    }

    /// Delete a system state value
    pub fn delete_state(&self, key: &str) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM system_state WHERE key = ?1", [key])?;
        Ok(())
    }

    // ========================================================================
    // ROW MAPPERS
    // ========================================================================

    fn row_to_order(row: &Row) -> rusqlite::Result<OrderRecord> {
        let side_str: String = row.get(2)?;
        let mode_str: String = row.get(5)?;
        let source_str: String = row.get(6)?;
        let status_str: String = row.get(7)?;

        Ok(OrderRecord {
            id: row.get(0)?,
            symbol: row.get(1)?,
            side: Side::from_str(&side_str).unwrap_or(Side::Buy),
            quantity: row.get(3)?,
            limit_price: row.get(4)?,
            mode: TradingMode::from_str(&mode_str).unwrap_or(TradingMode::Paper),
            source: OrderSource::from_str(&source_str).unwrap_or(OrderSource::Manual),
            status: OrderStatus::from_str(&status_str).unwrap_or(OrderStatus::Pending),
            reject_reason: row.get(8)?,
            exchange_id: row.get(9)?,
            created_at: parse_ts(row, 10)?,
        })
    }
}

/// Fold a signed fill into an existing position, returning the new
/// (quantity, avg_price, realized_pnl). Increasing a position moves the
/// average price; reducing it realizes P&L against the average.
fn apply_fill(
    qty: f64,
    avg: f64,
    pnl: f64,
    signed_fill_qty: f64,
    fill_price: f64,
) -> (f64, f64, f64) {
    let new_qty = qty + signed_fill_qty;

    if qty == 0.0 || qty.signum() == signed_fill_qty.signum() {
        // Same direction: weighted average entry
        let new_avg = (qty.abs() * avg + signed_fill_qty.abs() * fill_price)
            / (qty.abs() + signed_fill_qty.abs());
        (new_qty, new_avg, pnl)
    } else if signed_fill_qty.abs() <= qty.abs() {
        // Reduce or flat: realize against the average entry
        let closed = signed_fill_qty.abs();
        let realized = (fill_price - avg) * closed * qty.signum();
        let new_avg = if new_qty == 0.0 { 0.0 } else { avg };
        (new_qty, new_avg, pnl + realized)
    } else {
        // Flip: close out fully, remainder opens at the fill price
        let realized = (fill_price - avg) * qty.abs() * qty.signum();
        (new_qty, fill_price, pnl + realized)
    }
}

fn cumulate_buckets(raw: Vec<(String, i64)>) -> Vec<HourBucket> {
    let mut total = 0;
    raw.into_iter()
        .map(|(hour, count)| {
            total += count;
            HourBucket {
                hour,
                count,
                cumulative: total,
            }
        })
        .collect()
}

fn parse_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn sample_order(symbol: &str) -> NewOrder {
        NewOrder {
            symbol: symbol.to_string(),
            side: Side::Buy,
            quantity: 2.0,
            limit_price: None,
            mode: TradingMode::Paper,
            source: OrderSource::Manual,
        }
    }

    #[test]
    fn test_order_lifecycle() {
        let db = test_db();

        let id = db.insert_order(&sample_order("BTC-USD")).unwrap();
        db.mark_order_filled(id, None).unwrap();

        let orders = db.get_recent_orders(10).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Filled);
        assert_eq!(orders[0].symbol, "BTC-USD");
    }

    #[test]
    fn test_rejected_order_keeps_reason() {
        let db = test_db();

        let id = db.insert_order(&sample_order("BTC-USD")).unwrap();
        db.mark_order_rejected(id, "market data stale").unwrap();

        let orders = db.get_recent_orders(10).unwrap();
        assert_eq!(orders[0].status, OrderStatus::Rejected);
        assert_eq!(orders[0].reject_reason.as_deref(), Some("market data stale"));
    }

    #[test]
    fn test_fill_builds_position() {
        let db = test_db();

        let id = db.insert_order(&sample_order("ETH-USD")).unwrap();
        db.insert_fill(id, 2.0, 100.0, true).unwrap();

        let positions = db.get_positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 2.0);
        assert_eq!(positions[0].avg_price, 100.0);

        // Second buy at a higher price moves the average
        let id2 = db.insert_order(&sample_order("ETH-USD")).unwrap();
        db.insert_fill(id2, 2.0, 110.0, true).unwrap();

        let positions = db.get_positions().unwrap();
        assert_eq!(positions[0].quantity, 4.0);
        assert!((positions[0].avg_price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn test_sell_realizes_pnl() {
        let db = test_db();

        let buy = db.insert_order(&sample_order("ETH-USD")).unwrap();
        db.insert_fill(buy, 2.0, 100.0, true).unwrap();

        let mut sell = sample_order("ETH-USD");
        sell.side = Side::Sell;
        sell.quantity = 1.0;
        let sell_id = db.insert_order(&sell).unwrap();
        db.insert_fill(sell_id, 1.0, 120.0, true).unwrap();

        let positions = db.get_positions().unwrap();
        assert_eq!(positions[0].quantity, 1.0);
        assert!((positions[0].realized_pnl - 20.0).abs() < 1e-9);
        assert!((db.total_realized_pnl().unwrap() - 20.0).abs() < 1e-9);

        // The opening buy realizes nothing, the reducing sell realizes 20
        let fills = db.get_fills(Some(sell_id)).unwrap();
        assert!((fills[0].realized_delta - 20.0).abs() < 1e-9);

        // Unscoped listing returns both fills, newest first
        let all = db.get_fills(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].order_id, sell_id);

        // Both fills land today, so one day bucket
        let series = db.daily_pnl_series().unwrap();
        assert_eq!(series.len(), 1);
        assert!((series[0].realized_pnl - 20.0).abs() < 1e-9);
        assert!((series[0].cumulative - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_fill_flip() {
        // Long 2 @ 100, sell 3 @ 110: realize 20, short 1 @ 110
        let (qty, avg, pnl) = apply_fill(2.0, 100.0, 0.0, -3.0, 110.0);
        assert!((qty - (-1.0)).abs() < 1e-9);
        assert!((avg - 110.0).abs() < 1e-9);
        assert!((pnl - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_generation_and_agents() {
        let db = test_db();

        let gen_id = db.insert_generation("gen-1", 10).unwrap();
        db.upsert_agent(gen_id, "agent-0", "abc123", 1.5, 3, 1, "alive").unwrap();
        db.upsert_agent(gen_id, "agent-1", "def456", 0.2, 0, 4, "culled").unwrap();
        // Upsert updates in place
        db.upsert_agent(gen_id, "agent-0", "abc123", 2.5, 4, 1, "alive").unwrap();

        let agents = db.get_agents(gen_id).unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].name, "agent-0");
        assert_eq!(agents[0].fitness, 2.5);

        let summary = db.fitness_summary(gen_id).unwrap();
        assert_eq!(summary.best_fitness, Some(2.5));
        assert_eq!(summary.alive, 1);
        assert_eq!(summary.culled, 1);

        db.complete_generation(gen_id).unwrap();
        let generations = db.get_generations().unwrap();
        assert_eq!(generations[0].status, "completed");
        assert!(generations[0].ended_at.is_some());
    }

    #[test]
    fn test_decision_tallies() {
        let db = test_db();

        let gen_id = db.insert_generation("gen-1", 4).unwrap();
        db.upsert_agent(gen_id, "a", "h", 0.0, 0, 0, "alive").unwrap();
        let agent_id = db.get_agents(gen_id).unwrap()[0].id;

        for action in ["buy", "buy", "hold", "sell", "hold", "hold"] {
            db.insert_decision(&NewDecision {
                agent_id,
                generation_id: gen_id,
                symbol: "BTC-USD".to_string(),
                action: action.to_string(),
            })
            .unwrap();
        }

        let tallies = db.decision_tallies(gen_id).unwrap();
        assert_eq!(tallies.len(), 3);
        assert_eq!(tallies[0].action, "buy");
        assert_eq!(tallies[0].count, 2);
        assert_eq!(tallies[1].action, "hold");
        assert_eq!(tallies[1].count, 3);
    }

    #[test]
    fn test_cumulative_hour_buckets_monotonic() {
        let raw = vec![
            ("2026-08-30T01:00Z".to_string(), 3),
            ("2026-08-30T03:00Z".to_string(), 1),
            ("2026-08-30T07:00Z".to_string(), 5),
        ];

        let buckets = cumulate_buckets(raw);
        assert_eq!(buckets[0].cumulative, 3);
        assert_eq!(buckets[1].cumulative, 4);
        assert_eq!(buckets[2].cumulative, 9);

        for pair in buckets.windows(2) {
            assert!(pair[1].cumulative >= pair[0].cumulative);
            assert!(pair[1].hour > pair[0].hour);
        }
    }

    #[test]
    fn test_hourly_counts_from_db() {
        let db = test_db();

        let gen_id = db.insert_generation("gen-1", 1).unwrap();
        db.upsert_agent(gen_id, "a", "h", 0.0, 0, 0, "alive").unwrap();
        let agent_id = db.get_agents(gen_id).unwrap()[0].id;

        for _ in 0..4 {
            db.insert_decision(&NewDecision {
                agent_id,
                generation_id: gen_id,
                symbol: "BTC-USD".to_string(),
                action: "hold".to_string(),
            })
            .unwrap();
        }

        // All inserted within the same hour, so one bucket
        let buckets = db.hourly_decision_counts(gen_id).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 4);
        assert_eq!(buckets[0].cumulative, 4);
    }

    #[test]
    fn test_control_events() {
        let db = test_db();

        db.insert_control_event("arm", Some("window=300s")).unwrap();
        db.insert_control_event("disarm", None).unwrap();

        let events = db.get_recent_control_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "disarm");
        assert_eq!(events[1].detail.as_deref(), Some("window=300s"));
        assert_eq!(events[1].actor, "dashboard");
    }

    #[test]
    fn test_state_round_trip() {
        let db = test_db();

        db.set_state("armed_until", &StateValue::DateTime(Utc::now())).unwrap();
        let value = db.get_state("armed_until").unwrap().unwrap();
        assert!(value.as_datetime().is_some());

        db.set_state("current_capital", &StateValue::Float(9876.5)).unwrap();
        let value = db.get_state("current_capital").unwrap().unwrap();
        assert_eq!(value.as_float(), Some(9876.5));

        db.delete_state("armed_until").unwrap();
        assert!(db.get_state("armed_until").unwrap().is_none());

        // Seeded by the migration
        let status = db.get_state("system_status").unwrap().unwrap();
        assert_eq!(status.as_string(), "running");
    }
}
