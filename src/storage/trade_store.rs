//! Append-only fill persistence (embedded SQLite, one file per strategy).
//!
//! The engine writes exactly one row per observed terminal fill and one per
//! positive partial-fill delta. A sink failure is the engine's problem to
//! log, never to stall on — all write paths here return quickly.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub strategy_id: i64,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub pnl: Option<f64>,
    pub grid_index: i32,
    pub related_order_id: Option<String>,
    pub raw_order_info: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn amount(&self) -> f64 {
        self.price * self.quantity
    }
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id INTEGER NOT NULL,
    order_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price REAL NOT NULL,
    quantity REAL NOT NULL,
    amount REAL NOT NULL,
    fee REAL NOT NULL,
    pnl REAL,
    grid_index INTEGER NOT NULL,
    related_order_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
CREATE INDEX IF NOT EXISTS idx_trades_order_id ON trades(order_id);
"#;

pub struct TradeStore {
    conn: Mutex<Connection>,
    strategy_id: i64,
}

impl TradeStore {
    pub fn open(path: impl AsRef<Path>, strategy_id: i64) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open trade store at {}", path.as_ref().display()))?;
        conn.execute_batch(SCHEMA_SQL).context("apply trade schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            strategy_id,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(strategy_id: i64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            strategy_id,
        })
    }

    /// Append a fill. Duplicate submissions of the same fill (same order,
    /// side and quantity, typically from a retried tick) return the existing
    /// row id instead of inserting twice.
    pub fn save(&self, trade: &TradeRecord) -> Result<i64> {
        let conn = self.conn.lock();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM trades
                 WHERE strategy_id = ?1 AND order_id = ?2 AND side = ?3
                   AND ABS(quantity - ?4) < 1e-12",
                params![self.strategy_id, trade.order_id, trade.side, trade.quantity],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            debug!(order_id = %trade.order_id, id, "duplicate trade submission ignored");
            return Ok(id);
        }

        let raw_json = match &trade.raw_order_info {
            Some(value) => {
                Self::ensure_raw_order_info_column(&conn)?;
                Some(serde_json::to_string(value)?)
            }
            None => None,
        };

        if raw_json.is_some() {
            conn.execute(
                "INSERT INTO trades
                 (strategy_id, order_id, symbol, side, price, quantity, amount, fee, pnl,
                  grid_index, related_order_id, raw_order_info, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    self.strategy_id,
                    trade.order_id,
                    trade.symbol,
                    trade.side,
                    trade.price,
                    trade.quantity,
                    trade.amount(),
                    trade.fee,
                    trade.pnl,
                    trade.grid_index,
                    trade.related_order_id,
                    raw_json,
                    trade.created_at.to_rfc3339(),
                ],
            )?;
        } else {
            conn.execute(
                "INSERT INTO trades
                 (strategy_id, order_id, symbol, side, price, quantity, amount, fee, pnl,
                  grid_index, related_order_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    self.strategy_id,
                    trade.order_id,
                    trade.symbol,
                    trade.side,
                    trade.price,
                    trade.quantity,
                    trade.amount(),
                    trade.fee,
                    trade.pnl,
                    trade.grid_index,
                    trade.related_order_id,
                    trade.created_at.to_rfc3339(),
                ],
            )?;
        }

        Ok(conn.last_insert_rowid())
    }

    /// Buy-side record for an order id, if any.
    pub fn get_buy_trade(&self, order_id: &str) -> Result<Option<TradeRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, strategy_id, order_id, symbol, side, price, quantity, fee, pnl,
                        grid_index, related_order_id, created_at
                 FROM trades
                 WHERE strategy_id = ?1 AND order_id = ?2 AND side = 'buy'
                 LIMIT 1",
                params![self.strategy_id, order_id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Realized pnl over the trailing window, from sell-side rows.
    pub fn recent_pnl(&self, symbol: &str, hours: i64) -> Result<f64> {
        let since = (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
        let conn = self.conn.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(pnl), 0) FROM trades
             WHERE strategy_id = ?1 AND symbol = ?2 AND side = 'sell' AND created_at > ?3",
            params![self.strategy_id, symbol, since],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn trade_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE strategy_id = ?1",
            params![self.strategy_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Add the raw_order_info column the first time a caller supplies one;
    /// databases created before the column existed keep working untouched.
    fn ensure_raw_order_info_column(conn: &Connection) -> Result<()> {
        let present: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('trades') WHERE name = 'raw_order_info'",
            [],
            |row| row.get(0),
        )?;
        if present == 0 {
            conn.execute("ALTER TABLE trades ADD COLUMN raw_order_info TEXT", [])?;
        }
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
        let created_at: String = row.get(11)?;
        Ok(TradeRecord {
            id: Some(row.get(0)?),
            strategy_id: row.get(1)?,
            order_id: row.get(2)?,
            symbol: row.get(3)?,
            side: row.get(4)?,
            price: row.get(5)?,
            quantity: row.get(6)?,
            fee: row.get(7)?,
            pnl: row.get(8)?,
            grid_index: row.get(9)?,
            related_order_id: row.get(10)?,
            raw_order_info: None,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}
