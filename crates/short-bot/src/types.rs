//! Domain types for the trade lifecycle engine.
//!
//! A `Signal` spawns a `Trade`; the trade walks the status machine
//!
//! ```text
//! SIGNAL_RECEIVED -> OPENING -> { NOT_EXECUTED | OPEN }
//! OPEN -> CLOSING -> { CLOSED | ERROR }
//! ```
//!
//! and every transition emits an `Event` that is persisted and broadcast.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a trade. `NotExecuted`, `Closed` and `Error` are
/// terminal; the engine drops terminal trades from its live map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    SignalReceived,
    Opening,
    NotExecuted,
    Open,
    Closing,
    Closed,
    Error,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::SignalReceived => "signal_received",
            TradeStatus::Opening => "opening",
            TradeStatus::NotExecuted => "not_executed",
            TradeStatus::Open => "open",
            TradeStatus::Closing => "closing",
            TradeStatus::Closed => "closed",
            TradeStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal_received" => Some(TradeStatus::SignalReceived),
            "opening" => Some(TradeStatus::Opening),
            "not_executed" => Some(TradeStatus::NotExecuted),
            "open" => Some(TradeStatus::Open),
            "closing" => Some(TradeStatus::Closing),
            "closed" => Some(TradeStatus::Closed),
            "error" => Some(TradeStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::NotExecuted | TradeStatus::Closed | TradeStatus::Error
        )
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a position reached its exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    Tp,
    Sl,
    Timeout,
    Manual,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::Tp => "tp",
            ExitKind::Sl => "sl",
            ExitKind::Timeout => "timeout",
            ExitKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tp" => Some(ExitKind::Tp),
            "sl" => Some(ExitKind::Sl),
            "timeout" => Some(ExitKind::Timeout),
            "manual" => Some(ExitKind::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of audit events emitted by the engine and supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Signal,
    EntrySent,
    EntryFill,
    TpPlaced,
    SlPlaced,
    TpFill,
    SlFill,
    SlTriggered,
    Timeout,
    Cancel,
    Error,
    WsConnect,
    WsDisconnect,
    Startup,
    Shutdown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Signal => "signal",
            EventKind::EntrySent => "entry_sent",
            EventKind::EntryFill => "entry_fill",
            EventKind::TpPlaced => "tp_placed",
            EventKind::SlPlaced => "sl_placed",
            EventKind::TpFill => "tp_fill",
            EventKind::SlFill => "sl_fill",
            EventKind::SlTriggered => "sl_triggered",
            EventKind::Timeout => "timeout",
            EventKind::Cancel => "cancel",
            EventKind::Error => "error",
            EventKind::WsConnect => "ws_connect",
            EventKind::WsDisconnect => "ws_disconnect",
            EventKind::Startup => "startup",
            EventKind::Shutdown => "shutdown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal" => Some(EventKind::Signal),
            "entry_sent" => Some(EventKind::EntrySent),
            "entry_fill" => Some(EventKind::EntryFill),
            "tp_placed" => Some(EventKind::TpPlaced),
            "sl_placed" => Some(EventKind::SlPlaced),
            "tp_fill" => Some(EventKind::TpFill),
            "sl_fill" => Some(EventKind::SlFill),
            "sl_triggered" => Some(EventKind::SlTriggered),
            "timeout" => Some(EventKind::Timeout),
            "cancel" => Some(EventKind::Cancel),
            "error" => Some(EventKind::Error),
            "ws_connect" => Some(EventKind::WsConnect),
            "ws_disconnect" => Some(EventKind::WsDisconnect),
            "startup" => Some(EventKind::Startup),
            "shutdown" => Some(EventKind::Shutdown),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trading signal read from the selection file.
///
/// Immutable once created; the spawning trade embeds a full copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Wall-clock timestamp string from the source file (`YYYY/MM/DD HH:MM:SS`, UTC).
    pub source_ts: String,
    pub pair: String,
    /// Rank of the pair in the source selection (1 = best).
    pub rank: u32,
    /// Close-price snapshot at signal time.
    pub close: Decimal,
    pub momentum_1h_pct: f64,
    pub momentum_pct: f64,
    pub vol_ratio: f64,
    pub trades_ratio: f64,
    pub quintile: u32,
    /// When the intake accepted the row.
    pub received_at: DateTime<Utc>,
}

/// A single short trade, from signal to terminal outcome.
#[derive(Debug, Clone)]
pub struct Trade {
    pub trade_id: String,
    pub pair: String,
    /// Source timestamp of the originating signal.
    pub signal_ts: String,
    /// Full snapshot of the originating signal.
    pub signal: Signal,

    // Entry leg
    pub entry_order_id: Option<i64>,
    pub entry_price: Option<Decimal>,
    pub entry_qty: Option<Decimal>,
    pub entry_fill_ts: Option<DateTime<Utc>>,

    // Protective legs (server-side algorithmic orders)
    pub tp_order_id: Option<i64>,
    pub sl_order_id: Option<i64>,
    pub tp_trigger_price: Option<Decimal>,
    pub sl_trigger_price: Option<Decimal>,
    /// Intended TP execution price; the book-matched fill price is unknown
    /// until the fill, so this tracks the trigger level as an approximation.
    pub tp_price: Option<Decimal>,

    // Exit leg
    pub exit_price: Option<Decimal>,
    pub exit_fill_ts: Option<DateTime<Utc>>,
    pub exit_kind: Option<ExitKind>,

    // Result
    pub pnl_usdt: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
    pub fees_usdt: Option<Decimal>,

    pub status: TradeStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the timeout sweeper has claimed this trade, so a slow close
    /// is not re-spawned on the next sweep.
    pub timeout_triggered: bool,
    pub reconciled: bool,
}

impl Trade {
    pub fn new(signal: Signal) -> Self {
        let now = Utc::now();
        Self {
            trade_id: Uuid::new_v4().to_string(),
            pair: signal.pair.clone(),
            signal_ts: signal.source_ts.clone(),
            signal,
            entry_order_id: None,
            entry_price: None,
            entry_qty: None,
            entry_fill_ts: None,
            tp_order_id: None,
            sl_order_id: None,
            tp_trigger_price: None,
            sl_trigger_price: None,
            tp_price: None,
            exit_price: None,
            exit_fill_ts: None,
            exit_kind: None,
            pnl_usdt: None,
            pnl_pct: None,
            fees_usdt: None,
            status: TradeStatus::SignalReceived,
            error_message: None,
            created_at: now,
            updated_at: now,
            timeout_triggered: false,
            reconciled: false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether this trade counts against the open-trade caps.
    pub fn counts_as_open(&self) -> bool {
        matches!(
            self.status,
            TradeStatus::SignalReceived | TradeStatus::Opening | TradeStatus::Open
        )
    }
}

/// Append-only audit record. The store assigns `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Option<i64>,
    pub trade_id: Option<String>,
    pub kind: EventKind,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, trade_id: Option<String>, details: serde_json::Value) -> Self {
        Self {
            event_id: None,
            trade_id,
            kind,
            details,
            timestamp: Utc::now(),
        }
    }
}
