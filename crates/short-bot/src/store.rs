//! Durable state: SQLite-backed store for trades and events.
//!
//! Single connection, write-ahead journalling, writes serialised behind a
//! mutex and executed on the blocking pool. The engine is the only writer;
//! read paths exist for reconciliation and the observer.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

use crate::types::{Event, EventKind, ExitKind, Trade, TradeStatus};

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Internal(String),
}

const CREATE_TRADES: &str = "
CREATE TABLE IF NOT EXISTS trades (
    trade_id            TEXT PRIMARY KEY,
    pair                TEXT NOT NULL,
    signal_ts           TEXT NOT NULL,
    signal_json         TEXT NOT NULL,
    entry_order_id      INTEGER,
    entry_price         TEXT,
    entry_qty           TEXT,
    entry_fill_ts       TEXT,
    tp_order_id         INTEGER,
    sl_order_id         INTEGER,
    tp_trigger_price    TEXT,
    sl_trigger_price    TEXT,
    tp_price            TEXT,
    exit_price          TEXT,
    exit_fill_ts        TEXT,
    exit_kind           TEXT,
    pnl_usdt            TEXT,
    pnl_pct             TEXT,
    fees_usdt           TEXT,
    status              TEXT NOT NULL,
    error_message       TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    timeout_triggered   INTEGER NOT NULL DEFAULT 0,
    reconciled          INTEGER NOT NULL DEFAULT 0
)";

const CREATE_EVENTS: &str = "
CREATE TABLE IF NOT EXISTS events (
    event_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id    TEXT,
    kind        TEXT NOT NULL,
    details     TEXT NOT NULL,
    timestamp   TEXT NOT NULL
)";

/// SQLite-backed trade and event store.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (or create) the database, enable WAL and create the schema.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Internal(e.to_string()))?;
                }
            }
            let conn = Connection::open(&path)?;
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))?;
            conn.execute(CREATE_TRADES, [])?;
            conn.execute(CREATE_EVENTS, [])?;
            info!(path = %path.display(), "state store initialised");
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, StoreError> {
            let conn = Connection::open_in_memory()?;
            conn.execute(CREATE_TRADES, [])?;
            conn.execute(CREATE_EVENTS, [])?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?
    }

    /// Upsert a trade by id. Durable once this returns.
    pub async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let t = trade.clone();
        self.with_conn(move |conn| {
            let signal_json = serde_json::to_string(&t.signal)?;
            conn.execute(
                "INSERT OR REPLACE INTO trades (
                    trade_id, pair, signal_ts, signal_json,
                    entry_order_id, entry_price, entry_qty, entry_fill_ts,
                    tp_order_id, sl_order_id, tp_trigger_price, sl_trigger_price, tp_price,
                    exit_price, exit_fill_ts, exit_kind,
                    pnl_usdt, pnl_pct, fees_usdt,
                    status, error_message, created_at, updated_at,
                    timeout_triggered, reconciled
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)",
                params![
                    t.trade_id,
                    t.pair,
                    t.signal_ts,
                    signal_json,
                    t.entry_order_id,
                    dec_opt(&t.entry_price),
                    dec_opt(&t.entry_qty),
                    ts_opt(&t.entry_fill_ts),
                    t.tp_order_id,
                    t.sl_order_id,
                    dec_opt(&t.tp_trigger_price),
                    dec_opt(&t.sl_trigger_price),
                    dec_opt(&t.tp_price),
                    dec_opt(&t.exit_price),
                    ts_opt(&t.exit_fill_ts),
                    t.exit_kind.map(|k| k.as_str().to_string()),
                    dec_opt(&t.pnl_usdt),
                    dec_opt(&t.pnl_pct),
                    dec_opt(&t.fees_usdt),
                    t.status.as_str(),
                    t.error_message,
                    ts(&t.created_at),
                    ts(&t.updated_at),
                    t.timeout_triggered as i64,
                    t.reconciled as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Append an event; returns it with the store-assigned monotonic id.
    pub async fn save_event(&self, event: Event) -> Result<Event, StoreError> {
        self.with_conn(move |conn| {
            let details = serde_json::to_string(&event.details)?;
            conn.execute(
                "INSERT INTO events (trade_id, kind, details, timestamp) VALUES (?1,?2,?3,?4)",
                params![
                    event.trade_id,
                    event.kind.as_str(),
                    details,
                    ts(&event.timestamp)
                ],
            )?;
            let id = conn.last_insert_rowid();
            let mut event = event;
            event.event_id = Some(id);
            Ok(event)
        })
        .await
    }

    /// Trades whose status is not terminal, for startup reconciliation.
    pub async fn load_active_trades(&self) -> Result<Vec<Trade>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM trades WHERE status NOT IN ('closed','not_executed','error')
                 ORDER BY created_at",
            )?;
            collect_trades(&mut stmt, [])
        })
        .await
    }

    /// All trades, newest first.
    pub async fn load_all_trades(&self, limit: usize) -> Result<Vec<Trade>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM trades ORDER BY created_at DESC LIMIT ?1")?;
            collect_trades(&mut stmt, params![limit as i64])
        })
        .await
    }

    /// Terminal trades, most recently touched first.
    pub async fn load_recent_closed(&self, limit: usize) -> Result<Vec<Trade>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM trades WHERE status IN ('closed','not_executed','error')
                 ORDER BY updated_at DESC LIMIT ?1",
            )?;
            collect_trades(&mut stmt, params![limit as i64])
        })
        .await
    }

    pub async fn get_trade(&self, trade_id: &str) -> Result<Option<Trade>, StoreError> {
        let trade_id = trade_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM trades WHERE trade_id = ?1")?;
            let mut trades = collect_trades(&mut stmt, params![trade_id])?;
            Ok(trades.pop())
        })
        .await
    }

    pub async fn get_trade_events(&self, trade_id: &str) -> Result<Vec<Event>, StoreError> {
        let trade_id = trade_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM events WHERE trade_id = ?1 ORDER BY event_id")?;
            collect_events(&mut stmt, params![trade_id])
        })
        .await
    }

    pub async fn get_last_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM events ORDER BY event_id DESC LIMIT ?1")?;
            collect_events(&mut stmt, params![limit as i64])
        })
        .await
    }

    /// Flush the WAL into the main database file.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            // the checkpoint pragma returns a status row
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_opt(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn dec_opt(d: &Option<Decimal>) -> Option<String> {
    d.as_ref().map(|d| d.to_string())
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn parse_dec(s: Option<String>) -> Option<Decimal> {
    s.and_then(|s| s.parse().ok())
}

fn collect_trades<P: rusqlite::Params>(
    stmt: &mut rusqlite::Statement<'_>,
    params: P,
) -> Result<Vec<Trade>, StoreError> {
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_trade(row)?);
    }
    Ok(out)
}

fn collect_events<P: rusqlite::Params>(
    stmt: &mut rusqlite::Statement<'_>,
    params: P,
) -> Result<Vec<Event>, StoreError> {
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_event(row)?);
    }
    Ok(out)
}

fn row_to_trade(row: &Row<'_>) -> Result<Trade, StoreError> {
    let signal_json: String = row.get("signal_json")?;
    let status_raw: String = row.get("status")?;
    let exit_kind_raw: Option<String> = row.get("exit_kind")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Trade {
        trade_id: row.get("trade_id")?,
        pair: row.get("pair")?,
        signal_ts: row.get("signal_ts")?,
        signal: serde_json::from_str(&signal_json)?,
        entry_order_id: row.get("entry_order_id")?,
        entry_price: parse_dec(row.get("entry_price")?),
        entry_qty: parse_dec(row.get("entry_qty")?),
        entry_fill_ts: parse_ts(row.get("entry_fill_ts")?),
        tp_order_id: row.get("tp_order_id")?,
        sl_order_id: row.get("sl_order_id")?,
        tp_trigger_price: parse_dec(row.get("tp_trigger_price")?),
        sl_trigger_price: parse_dec(row.get("sl_trigger_price")?),
        tp_price: parse_dec(row.get("tp_price")?),
        exit_price: parse_dec(row.get("exit_price")?),
        exit_fill_ts: parse_ts(row.get("exit_fill_ts")?),
        exit_kind: exit_kind_raw.as_deref().and_then(ExitKind::parse),
        pnl_usdt: parse_dec(row.get("pnl_usdt")?),
        pnl_pct: parse_dec(row.get("pnl_pct")?),
        fees_usdt: parse_dec(row.get("fees_usdt")?),
        status: TradeStatus::parse(&status_raw).unwrap_or(TradeStatus::Error),
        error_message: row.get("error_message")?,
        created_at: parse_ts(Some(created_at)).unwrap_or_else(Utc::now),
        updated_at: parse_ts(Some(updated_at)).unwrap_or_else(Utc::now),
        timeout_triggered: row.get::<_, i64>("timeout_triggered")? != 0,
        reconciled: row.get::<_, i64>("reconciled")? != 0,
    })
}

fn row_to_event(row: &Row<'_>) -> Result<Event, StoreError> {
    let kind_raw: String = row.get("kind")?;
    let details_raw: String = row.get("details")?;
    let timestamp: String = row.get("timestamp")?;
    Ok(Event {
        event_id: row.get("event_id")?,
        trade_id: row.get("trade_id")?,
        kind: EventKind::parse(&kind_raw).unwrap_or(EventKind::Error),
        details: serde_json::from_str(&details_raw)?,
        timestamp: parse_ts(Some(timestamp)).unwrap_or_else(Utc::now),
    })
}
