//! Exchange abstraction: the engine never talks HTTP directly.
//!
//! `OrderGateway` is the typed surface over the exchange REST API; the
//! user-data stream lives in [`stream`]. Production implementation is
//! [`binance::BinanceGateway`]; tests substitute their own impl.

pub mod binance;
pub mod stream;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the exchange gateway.
///
/// Transient HTTP conditions (429, 5xx) are retried inside the transport
/// before surfacing; an `Api` error carries the exchange error code verbatim.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("exchange error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed exchange response: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Exchange error code, when this is an API-level rejection.
    pub fn api_code(&self) -> Option<i64> {
        match self {
            GatewayError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Book level a price-matched maker order tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceMatch {
    /// Nearest opposite book level (most aggressive maker placement).
    Opponent,
    /// Fifth opposite book level (conservative first attempt).
    Opponent5,
}

impl PriceMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceMatch::Opponent => "OPPONENT",
            PriceMatch::Opponent5 => "OPPONENT_5",
        }
    }
}

impl std::fmt::Display for PriceMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-pair exchange trading rules, cached after first fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

/// Acknowledgement of a regular order placement.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub status: String,
    /// Average fill price when the exchange reports one (market orders).
    pub avg_price: Option<Decimal>,
}

/// Acknowledgement of an algorithmic (conditional) order placement.
#[derive(Debug, Clone)]
pub struct AlgoAck {
    pub order_id: i64,
    pub trigger_price: Decimal,
}

/// Outcome of a stop-loss placement. The mark price can cross the trigger
/// during the placement round-trip; that is a handled state, not an error.
#[derive(Debug, Clone)]
pub enum SlOutcome {
    Placed(AlgoAck),
    /// Exchange code -2021: the trigger would fire immediately.
    TriggerAlreadyCrossed,
}

/// Order state as reported by the order-query endpoint.
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub order_id: i64,
    pub status: String,
    pub avg_price: Option<Decimal>,
    pub price: Option<Decimal>,
}

impl OrderInfo {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status.as_str(), "NEW" | "PARTIALLY_FILLED")
    }

    /// Fill price: average when present and non-zero, else the limit price.
    pub fn fill_price(&self) -> Option<Decimal> {
        self.avg_price
            .filter(|p| !p.is_zero())
            .or(self.price.filter(|p| !p.is_zero()))
    }
}

/// An open position reported by the exchange.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
}

/// A fill notification from the user-data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: i64,
    pub symbol: String,
    pub side: String,
    /// Execution kind (`TRADE` for fills).
    pub exec_kind: String,
    /// Order status (`FILLED`, `PARTIALLY_FILLED`, ...).
    pub status: String,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub last_price: Decimal,
}

impl OrderUpdate {
    /// Price to book the fill at: average when known, else last trade price.
    pub fn fill_price(&self) -> Decimal {
        if self.avg_price.is_zero() {
            self.last_price
        } else {
            self.avg_price
        }
    }
}

/// Typed surface over the exchange REST API.
///
/// Every operation may fail with [`GatewayError`]; transient transport
/// failures are retried internally with exponential backoff.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Available quote-currency (USDT) balance.
    async fn balance(&self) -> Result<Decimal, GatewayError>;

    /// Trading rules for a pair (cached).
    async fn exchange_info(&self, pair: &str) -> Result<PairFilters, GatewayError>;

    async fn set_leverage(&self, pair: &str, leverage: u32) -> Result<(), GatewayError>;

    /// Switch the pair to isolated margin. Idempotent: "already set" is success.
    async fn set_margin_type(&self, pair: &str) -> Result<(), GatewayError>;

    async fn best_bid(&self, pair: &str) -> Result<Decimal, GatewayError>;
    async fn best_ask(&self, pair: &str) -> Result<Decimal, GatewayError>;
    async fn mark_price(&self, pair: &str) -> Result<Decimal, GatewayError>;

    /// Largest quantity for `capital_per_trade` at `price` that satisfies the
    /// pair's step, minimum quantity and minimum notional.
    async fn calc_quantity(&self, pair: &str, price: Decimal) -> Result<Decimal, GatewayError>;

    /// Post a maker short anchored at the given book level.
    async fn open_short_maker(
        &self,
        pair: &str,
        qty: Decimal,
        price_match: PriceMatch,
    ) -> Result<OrderAck, GatewayError>;

    /// Taker short fallback.
    async fn open_short_market(&self, pair: &str, qty: Decimal) -> Result<OrderAck, GatewayError>;

    /// Server-side take-profit: trigger at `entry * (1 - tp_pct/100)`,
    /// price-matched to the opposite BBO, reduce-only, against mark price.
    async fn place_tp(
        &self,
        pair: &str,
        qty: Decimal,
        entry_price: Decimal,
    ) -> Result<AlgoAck, GatewayError>;

    /// Server-side stop-market: trigger at `entry * (1 + sl_pct/100)`,
    /// reduce-only, against mark price. Code -2021 is reported as
    /// [`SlOutcome::TriggerAlreadyCrossed`].
    async fn place_sl(
        &self,
        pair: &str,
        qty: Decimal,
        entry_price: Decimal,
    ) -> Result<SlOutcome, GatewayError>;

    async fn close_limit(
        &self,
        pair: &str,
        qty: Decimal,
        price: Decimal,
    ) -> Result<OrderAck, GatewayError>;

    async fn close_bbo(&self, pair: &str, qty: Decimal) -> Result<OrderAck, GatewayError>;

    async fn close_market(&self, pair: &str, qty: Decimal) -> Result<OrderAck, GatewayError>;

    /// Cancel an order. Falls back to the algorithmic-order endpoint on
    /// "unknown order" (-2011); unknown on both endpoints is silent success.
    async fn cancel(&self, pair: &str, order_id: i64) -> Result<(), GatewayError>;

    async fn get_order(&self, pair: &str, order_id: i64) -> Result<OrderInfo, GatewayError>;

    async fn open_orders(&self, pair: &str) -> Result<Vec<OrderInfo>, GatewayError>;

    async fn open_algo_orders(&self, pair: &str) -> Result<Vec<OrderInfo>, GatewayError>;

    /// All open positions (non-zero position amount).
    async fn positions(&self) -> Result<Vec<PositionInfo>, GatewayError>;

    // User-data stream credential lifecycle.
    async fn listen_key(&self) -> Result<String, GatewayError>;
    async fn keepalive_listen_key(&self, key: &str) -> Result<(), GatewayError>;
    async fn close_listen_key(&self, key: &str) -> Result<(), GatewayError>;
}
