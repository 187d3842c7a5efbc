//! SQLite persistence for the grid engine.
//!
//! Persists what a restart needs as a hint:
//! - Ladder geometry (anchor, step), center slot and cycle counter
//! - Position cost basis, realized PnL and trade statistics
//! - Grid levels with their client order ids
//! - The action log
//!
//! Persisted state never overrides the exchange. Startup reconciliation
//! verifies every restored level against live orders.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::exchange::Side;
use crate::strategy::{
    ActionKind, ActionRecord, GridLevel, LevelStatus, Position, TradeStats,
};

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Action log rows kept after pruning.
const MAX_ACTION_ROWS: i64 = 10_000;

/// Engine state saved after every cycle.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub anchor: Decimal,
    pub step: Decimal,
    pub center: Option<i64>,
    pub cycle: u64,
    pub position: Position,
    pub levels: Vec<GridLevel>,
    pub last_saved: DateTime<Utc>,
}

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

fn decimal(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap_or_default()
}

fn timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl PersistenceManager {
    /// Open the database, creating the schema when needed.
    ///
    /// A database written by a newer schema version is refused rather than
    /// overwritten.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", path);
        Ok(manager)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            bail!(
                "database schema version {} is newer than supported version {}",
                version,
                SCHEMA_VERSION
            );
        }

        self.conn.execute_batch(
            r#"
            -- Ladder geometry and engine counters (singleton row)
            CREATE TABLE IF NOT EXISTS engine_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                anchor TEXT NOT NULL,
                step TEXT NOT NULL,
                center INTEGER,
                cycle INTEGER NOT NULL,
                last_saved TEXT NOT NULL
            );

            -- Position and trade statistics (singleton row)
            CREATE TABLE IF NOT EXISTS position (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                quantity TEXT NOT NULL,
                average_cost TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                round_trips INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                gross_profit TEXT NOT NULL,
                gross_loss TEXT NOT NULL
            );

            -- Grid levels keyed by slot
            CREATE TABLE IF NOT EXISTS grid_levels (
                slot INTEGER PRIMARY KEY,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                filled_quantity TEXT NOT NULL,
                status TEXT NOT NULL,
                order_id INTEGER,
                client_order_id TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                retry_after_cycle INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Action log
            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                cycle INTEGER NOT NULL,
                kind TEXT NOT NULL,
                slot INTEGER,
                side TEXT,
                price TEXT,
                quantity TEXT,
                detail TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actions_timestamp ON actions(timestamp);
            "#,
        )?;
        self.conn
            .execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Save engine state, position and ladder in one transaction.
    pub fn save_state(&self, state: &PersistedState) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO engine_state (id, anchor, step, center, cycle, last_saved)
            VALUES (1, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                anchor = ?1,
                step = ?2,
                center = ?3,
                cycle = ?4,
                last_saved = ?5
            "#,
            params![
                state.anchor.to_string(),
                state.step.to_string(),
                state.center,
                state.cycle,
                state.last_saved.to_rfc3339(),
            ],
        )?;

        let position = &state.position;
        tx.execute(
            r#"
            INSERT INTO position (id, quantity, average_cost, realized_pnl, round_trips, wins,
                                  gross_profit, gross_loss)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                quantity = ?1,
                average_cost = ?2,
                realized_pnl = ?3,
                round_trips = ?4,
                wins = ?5,
                gross_profit = ?6,
                gross_loss = ?7
            "#,
            params![
                position.quantity.to_string(),
                position.average_cost.to_string(),
                position.realized_pnl.to_string(),
                position.stats.round_trips,
                position.stats.wins,
                position.stats.gross_profit.to_string(),
                position.stats.gross_loss.to_string(),
            ],
        )?;

        // Clear and reinsert levels
        tx.execute("DELETE FROM grid_levels", [])?;
        for level in &state.levels {
            tx.execute(
                r#"
                INSERT INTO grid_levels (slot, side, price, quantity, filled_quantity, status,
                                         order_id, client_order_id, attempts, retry_after_cycle,
                                         updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    level.slot,
                    level.side.as_str(),
                    level.price.to_string(),
                    level.quantity.to_string(),
                    level.filled_quantity.to_string(),
                    level.status.as_str(),
                    level.order_id,
                    level.client_order_id,
                    level.attempts,
                    level.retry_after_cycle,
                    level.updated_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            cycle = state.cycle,
            levels = state.levels.len(),
            "State saved to database"
        );
        Ok(())
    }

    /// Load the saved state, if any.
    pub fn load_state(&self) -> Result<Option<PersistedState>> {
        let state_row: Option<(String, String, Option<i64>, u64, String)> = self
            .conn
            .query_row(
                "SELECT anchor, step, center, cycle, last_saved FROM engine_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        let Some((anchor, step, center, cycle, last_saved)) = state_row else {
            return Ok(None);
        };

        let position = self
            .conn
            .query_row(
                r#"
                SELECT quantity, average_cost, realized_pnl, round_trips, wins,
                       gross_profit, gross_loss
                FROM position WHERE id = 1
                "#,
                [],
                |row| {
                    Ok(Position {
                        quantity: decimal(&row.get::<_, String>(0)?),
                        average_cost: decimal(&row.get::<_, String>(1)?),
                        realized_pnl: decimal(&row.get::<_, String>(2)?),
                        stats: TradeStats {
                            round_trips: row.get(3)?,
                            wins: row.get(4)?,
                            gross_profit: decimal(&row.get::<_, String>(5)?),
                            gross_loss: decimal(&row.get::<_, String>(6)?),
                        },
                        ..Default::default()
                    })
                },
            )
            .optional()?
            .unwrap_or_default();

        let mut stmt = self.conn.prepare(
            r#"
            SELECT slot, side, price, quantity, filled_quantity, status, order_id,
                   client_order_id, attempts, retry_after_cycle, updated_at
            FROM grid_levels ORDER BY slot
            "#,
        )?;

        let levels: Vec<GridLevel> = stmt
            .query_map([], |row| {
                let side: String = row.get(1)?;
                let status: String = row.get(5)?;
                Ok((
                    side,
                    status,
                    GridLevel {
                        slot: row.get(0)?,
                        side: Side::Buy,
                        price: decimal(&row.get::<_, String>(2)?),
                        quantity: decimal(&row.get::<_, String>(3)?),
                        filled_quantity: decimal(&row.get::<_, String>(4)?),
                        status: LevelStatus::Pending,
                        order_id: row.get(6)?,
                        client_order_id: row.get(7)?,
                        attempts: row.get(8)?,
                        retry_after_cycle: row.get(9)?,
                        updated_at: timestamp(&row.get::<_, String>(10)?),
                    },
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(side, status, mut level)| {
                match (Side::parse(&side), LevelStatus::parse(&status)) {
                    (Some(side), Some(status)) => {
                        level.side = side;
                        level.status = status;
                        Some(level)
                    }
                    _ => {
                        warn!(slot = level.slot, %side, %status, "Skipping unreadable grid level");
                        None
                    }
                }
            })
            .collect();

        let state = PersistedState {
            anchor: decimal(&anchor),
            step: decimal(&step),
            center,
            cycle,
            position,
            levels,
            last_saved: timestamp(&last_saved),
        };

        info!(
            anchor = %state.anchor,
            cycle = state.cycle,
            levels = state.levels.len(),
            last_saved = %state.last_saved,
            "Loaded state from database"
        );

        Ok(Some(state))
    }

    /// Append actions to the log and prune old rows.
    pub fn record_actions(&self, actions: &[ActionRecord]) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for action in actions {
            tx.execute(
                r#"
                INSERT INTO actions (timestamp, cycle, kind, slot, side, price, quantity, detail)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    action.timestamp.to_rfc3339(),
                    action.cycle,
                    action.kind.as_str(),
                    action.slot,
                    action.side.map(|s| s.as_str()),
                    action.price.map(|p| p.to_string()),
                    action.quantity.map(|q| q.to_string()),
                    action.detail,
                ],
            )?;
        }
        tx.execute(
            "DELETE FROM actions WHERE id <= (SELECT MAX(id) FROM actions) - ?1",
            params![MAX_ACTION_ROWS],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Most recent actions, oldest first.
    pub fn recent_actions(&self, limit: usize) -> Result<Vec<ActionRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, cycle, kind, slot, side, price, quantity, detail
            FROM actions
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let mut actions: Vec<ActionRecord> = stmt
            .query_map([limit as i64], |row| {
                let kind: String = row.get(2)?;
                let side: Option<String> = row.get(4)?;
                let price: Option<String> = row.get(5)?;
                let quantity: Option<String> = row.get(6)?;
                Ok((
                    kind,
                    ActionRecord {
                        timestamp: timestamp(&row.get::<_, String>(0)?),
                        cycle: row.get(1)?,
                        kind: ActionKind::Placed,
                        slot: row.get(3)?,
                        side: side.as_deref().and_then(Side::parse),
                        price: price.as_deref().map(decimal),
                        quantity: quantity.as_deref().map(decimal),
                        detail: row.get(7)?,
                    },
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(kind, mut action)| {
                action.kind = ActionKind::parse(&kind)?;
                Some(action)
            })
            .collect();

        actions.reverse();
        Ok(actions)
    }
}
