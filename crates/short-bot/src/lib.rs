//! Short-side trade lifecycle engine for Binance USD-M futures.
//!
//! The core is a per-trade state machine ([`engine::Engine`]) coordinating
//! signal intake, a maker-entry chase loop, server-side TP/SL protection,
//! user-data fill demultiplexing, a timeout sweeper and startup
//! reconciliation — all persisted through [`store::StateStore`] so every
//! in-flight commitment survives a restart.
//!
//! ## Modules
//!
//! - `config`: TOML configuration with env overrides and validation
//! - `types`: domain records (Trade, Signal, Event) and status enums
//! - `store`: SQLite persistence (WAL) for trades and events
//! - `gateway`: typed exchange surface (REST) and user-data stream
//! - `signals`: signal-file poller with read-once marking
//! - `engine`: the trade lifecycle state machine
//! - `supervisor`: composition and ordered startup/shutdown

pub mod config;
pub mod engine;
pub mod gateway;
pub mod signals;
pub mod store;
pub mod supervisor;
pub mod types;

pub use config::BotConfig;
pub use engine::Engine;
pub use gateway::stream::{FillKind, OrderRegistry, StreamEvent, UserStream};
pub use gateway::{
    AlgoAck, GatewayError, OrderAck, OrderGateway, OrderInfo, OrderUpdate, PairFilters,
    PositionInfo, PriceMatch, SlOutcome,
};
pub use signals::{SignalIntake, SignalError};
pub use store::{StateStore, StoreError};
pub use types::{Event, EventKind, ExitKind, Signal, Trade, TradeStatus};
