//! Shared fixtures: a scriptable mock gateway and engine builders.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use short_bot::config::BotConfig;
use short_bot::engine::Engine;
use short_bot::gateway::stream::OrderRegistry;
use short_bot::gateway::{
    AlgoAck, GatewayError, OrderAck, OrderGateway, OrderInfo, OrderUpdate, PairFilters,
    PositionInfo, PriceMatch, SlOutcome,
};
use short_bot::store::StateStore;
use short_bot::types::Signal;

/// Scriptable in-memory gateway. Orders get sequential ids; behavior is
/// controlled through the public fields.
pub struct MockGateway {
    next_id: AtomicI64,
    pub capital: Decimal,
    pub tp_pct: Decimal,
    pub sl_pct: Decimal,
    pub best_bid: Mutex<Decimal>,
    pub best_ask: Mutex<Decimal>,
    pub mark: Mutex<Decimal>,
    /// Average price reported by market closes.
    pub market_fill_price: Mutex<Decimal>,
    /// When set, `place_sl` reports the trigger as already crossed.
    pub sl_already_crossed: AtomicBool,
    /// `positions()` response.
    pub positions: Mutex<Vec<PositionInfo>>,
    /// `get_order` responses by order id; unknown ids report status NEW.
    pub orders: Mutex<HashMap<i64, OrderInfo>>,
    /// Ids reported by `open_orders` / `open_algo_orders`.
    pub open_order_ids: Mutex<Vec<i64>>,
    /// Every cancelled order id, in call order.
    pub cancelled: Mutex<Vec<i64>>,
    /// Every maker entry: (pair, qty, price_match).
    pub maker_entries: Mutex<Vec<(String, Decimal, String)>>,
    /// Every market entry: (pair, qty, assigned order id).
    pub market_entries: Mutex<Vec<(String, Decimal, i64)>>,
    /// Every market close: (pair, qty).
    pub market_closes: Mutex<Vec<(String, Decimal)>>,
    /// Every limit close: (pair, qty, price).
    pub limit_closes: Mutex<Vec<(String, Decimal, Decimal)>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            capital: dec!(10),
            tp_pct: dec!(15),
            sl_pct: dec!(60),
            best_bid: Mutex::new(dec!(50000)),
            best_ask: Mutex::new(dec!(50001)),
            mark: Mutex::new(dec!(50000)),
            market_fill_price: Mutex::new(dec!(50000)),
            sl_already_crossed: AtomicBool::new(false),
            positions: Mutex::new(Vec::new()),
            orders: Mutex::new(HashMap::new()),
            open_order_ids: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            maker_entries: Mutex::new(Vec::new()),
            market_entries: Mutex::new(Vec::new()),
            market_closes: Mutex::new(Vec::new()),
            limit_closes: Mutex::new(Vec::new()),
        })
    }

    fn next_order_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn filters() -> PairFilters {
        PairFilters {
            tick_size: dec!(0.01),
            step_size: dec!(0.0001),
            min_qty: dec!(0.0001),
            min_notional: dec!(5),
        }
    }
}

#[async_trait]
impl OrderGateway for MockGateway {
    async fn balance(&self) -> Result<Decimal, GatewayError> {
        Ok(dec!(1000))
    }

    async fn exchange_info(&self, _pair: &str) -> Result<PairFilters, GatewayError> {
        Ok(Self::filters())
    }

    async fn set_leverage(&self, _pair: &str, _leverage: u32) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn set_margin_type(&self, _pair: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn best_bid(&self, _pair: &str) -> Result<Decimal, GatewayError> {
        Ok(*self.best_bid.lock())
    }

    async fn best_ask(&self, _pair: &str) -> Result<Decimal, GatewayError> {
        Ok(*self.best_ask.lock())
    }

    async fn mark_price(&self, _pair: &str) -> Result<Decimal, GatewayError> {
        Ok(*self.mark.lock())
    }

    async fn calc_quantity(&self, pair: &str, price: Decimal) -> Result<Decimal, GatewayError> {
        let filters = Self::filters();
        let qty = (self.capital / price / filters.step_size).floor() * filters.step_size;
        if qty < filters.min_qty {
            return Err(GatewayError::Config(format!("{pair}: qty below minimum")));
        }
        Ok(qty)
    }

    async fn open_short_maker(
        &self,
        pair: &str,
        qty: Decimal,
        price_match: PriceMatch,
    ) -> Result<OrderAck, GatewayError> {
        self.maker_entries
            .lock()
            .push((pair.to_string(), qty, price_match.as_str().to_string()));
        Ok(OrderAck {
            order_id: self.next_order_id(),
            status: "NEW".to_string(),
            avg_price: None,
        })
    }

    async fn open_short_market(&self, pair: &str, qty: Decimal) -> Result<OrderAck, GatewayError> {
        let order_id = self.next_order_id();
        self.market_entries.lock().push((pair.to_string(), qty, order_id));
        Ok(OrderAck {
            order_id,
            status: "NEW".to_string(),
            avg_price: None,
        })
    }

    async fn place_tp(
        &self,
        _pair: &str,
        _qty: Decimal,
        entry_price: Decimal,
    ) -> Result<AlgoAck, GatewayError> {
        Ok(AlgoAck {
            order_id: self.next_order_id(),
            trigger_price: entry_price * (Decimal::ONE - self.tp_pct / Decimal::ONE_HUNDRED),
        })
    }

    async fn place_sl(
        &self,
        _pair: &str,
        _qty: Decimal,
        entry_price: Decimal,
    ) -> Result<SlOutcome, GatewayError> {
        if self.sl_already_crossed.load(Ordering::SeqCst) {
            return Ok(SlOutcome::TriggerAlreadyCrossed);
        }
        Ok(SlOutcome::Placed(AlgoAck {
            order_id: self.next_order_id(),
            trigger_price: entry_price * (Decimal::ONE + self.sl_pct / Decimal::ONE_HUNDRED),
        }))
    }

    async fn close_limit(
        &self,
        pair: &str,
        qty: Decimal,
        price: Decimal,
    ) -> Result<OrderAck, GatewayError> {
        self.limit_closes.lock().push((pair.to_string(), qty, price));
        Ok(OrderAck {
            order_id: self.next_order_id(),
            status: "NEW".to_string(),
            avg_price: None,
        })
    }

    async fn close_bbo(&self, pair: &str, qty: Decimal) -> Result<OrderAck, GatewayError> {
        self.limit_closes
            .lock()
            .push((pair.to_string(), qty, Decimal::ZERO));
        Ok(OrderAck {
            order_id: self.next_order_id(),
            status: "NEW".to_string(),
            avg_price: None,
        })
    }

    async fn close_market(&self, pair: &str, qty: Decimal) -> Result<OrderAck, GatewayError> {
        self.market_closes.lock().push((pair.to_string(), qty));
        Ok(OrderAck {
            order_id: self.next_order_id(),
            status: "FILLED".to_string(),
            avg_price: Some(*self.market_fill_price.lock()),
        })
    }

    async fn cancel(&self, _pair: &str, order_id: i64) -> Result<(), GatewayError> {
        self.cancelled.lock().push(order_id);
        Ok(())
    }

    async fn get_order(&self, _pair: &str, order_id: i64) -> Result<OrderInfo, GatewayError> {
        Ok(self.orders.lock().get(&order_id).cloned().unwrap_or(OrderInfo {
            order_id,
            status: "NEW".to_string(),
            avg_price: None,
            price: None,
        }))
    }

    async fn open_orders(&self, _pair: &str) -> Result<Vec<OrderInfo>, GatewayError> {
        Ok(self
            .open_order_ids
            .lock()
            .iter()
            .map(|&order_id| OrderInfo {
                order_id,
                status: "NEW".to_string(),
                avg_price: None,
                price: None,
            })
            .collect())
    }

    async fn open_algo_orders(&self, _pair: &str) -> Result<Vec<OrderInfo>, GatewayError> {
        Ok(Vec::new())
    }

    async fn positions(&self) -> Result<Vec<PositionInfo>, GatewayError> {
        Ok(self.positions.lock().clone())
    }

    async fn listen_key(&self) -> Result<String, GatewayError> {
        Ok("test-listen-key".to_string())
    }

    async fn keepalive_listen_key(&self, _key: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn close_listen_key(&self, _key: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

pub fn test_config() -> BotConfig {
    BotConfig::from_toml_str(
        r#"
        [exchange]
        api_key = "test-key"
        api_secret = "test-secret"
        base_url = "https://testnet.binancefuture.com"

        [strategy]
        capital_per_trade = 10.0
        max_open_trades = 10
        tp_pct = 15.0
        sl_pct = 60.0
        timeout_hours = 24.0

        [signals]
        file_path = "signals.csv"

        [store]
        path = "unused.db"
    "#,
    )
    .expect("test config parses")
}

pub async fn make_engine(
    cfg: BotConfig,
    gateway: Arc<MockGateway>,
) -> (Arc<Engine>, StateStore, Arc<OrderRegistry>) {
    let store = StateStore::open_in_memory().await.expect("store opens");
    let registry = Arc::new(OrderRegistry::new());
    let engine = Engine::new(Arc::new(cfg), gateway, store.clone(), Arc::clone(&registry));
    (engine, store, registry)
}

pub fn sig(pair: &str, close: Decimal) -> Signal {
    Signal {
        source_ts: "2025/06/01 12:00:00".to_string(),
        pair: pair.to_string(),
        rank: 1,
        close,
        momentum_1h_pct: 4.2,
        momentum_pct: 9.1,
        vol_ratio: 2.5,
        trades_ratio: 1.8,
        quintile: 2,
        received_at: Utc::now(),
    }
}

pub fn fill(order_id: i64, price: Decimal) -> OrderUpdate {
    OrderUpdate {
        order_id,
        symbol: "BTCUSDT".to_string(),
        side: "SELL".to_string(),
        exec_kind: "TRADE".to_string(),
        status: "FILLED".to_string(),
        qty: Decimal::ZERO,
        avg_price: price,
        last_price: price,
    }
}

/// Poll until `probe` returns Some, advancing paused time via short sleeps.
pub async fn wait_until<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..20_000 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("condition not reached in time");
}
