//! Trade lifecycle engine.
//!
//! ```text
//! SIGNAL_RECEIVED -> OPENING -> { NOT_EXECUTED | OPEN }
//! OPEN -> CLOSING -> { CLOSED | ERROR }
//! ```
//!
//! The engine owns the live trade map and is its only writer. Every mutating
//! path (admission, fill callbacks, timeout close steps, reconciliation)
//! runs to completion under one async mutex, which realises the per-trade
//! single-writer discipline on a multi-threaded runtime. Fill-wait loops
//! poll outside the lock.
//!
//! Flow: a signal admits a trade and spawns an opening task that chases a
//! maker fill; the entry fill places server-side TP and SL; a protection
//! fill closes the trade and cancels its counterpart; a sweeper force-closes
//! positions older than the configured timeout; reconciliation resynchronises
//! store state with the exchange after a restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::gateway::stream::OrderRegistry;
use crate::gateway::{GatewayError, OrderGateway, OrderUpdate, PriceMatch, SlOutcome};
use crate::store::StateStore;
use crate::types::{Event, EventKind, ExitKind, Signal, Trade, TradeStatus};

/// Estimated taker+maker fee rate applied to entry and exit notional.
const FEE_RATE: Decimal = Decimal::from_parts(4, 0, 0, false, 4); // 0.0004

const FILL_POLL: Duration = Duration::from_millis(200);
const CLOSE_POLL: Duration = Duration::from_secs(2);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MARKET_FALLBACK_WAIT: Duration = Duration::from_secs(10);

/// PnL for a short position, all components rounded to 4 decimal places.
///
/// Returns `(pnl_usdt, pnl_pct, fees_usdt)`.
pub(crate) fn compute_pnl(
    entry: Decimal,
    exit: Decimal,
    qty: Decimal,
) -> (Decimal, Decimal, Decimal) {
    let pnl_usdt = ((entry - exit) * qty).round_dp(4);
    let pnl_pct = ((entry - exit) / entry * Decimal::ONE_HUNDRED).round_dp(4);
    let fees = ((entry + exit) * qty * FEE_RATE).round_dp(4);
    (pnl_usdt, pnl_pct, fees)
}

#[derive(Debug, Clone, Copy)]
enum Leg {
    Tp,
    Sl,
}

#[derive(Default)]
struct EngineInner {
    trades: HashMap<String, Trade>,
    by_entry: HashMap<i64, String>,
    by_tp: HashMap<i64, String>,
    by_sl: HashMap<i64, String>,
}

impl EngineInner {
    fn open_count(&self) -> usize {
        self.trades.values().filter(|t| t.counts_as_open()).count()
    }

    fn open_count_for(&self, pair: &str) -> usize {
        self.trades
            .values()
            .filter(|t| t.pair == pair && t.counts_as_open())
            .count()
    }
}

/// The per-trade state machine.
pub struct Engine {
    cfg: Arc<BotConfig>,
    gateway: Arc<dyn OrderGateway>,
    store: StateStore,
    registry: Arc<OrderRegistry>,
    events_tx: broadcast::Sender<Event>,
    shutdown_tx: broadcast::Sender<()>,
    inner: Mutex<EngineInner>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        cfg: Arc<BotConfig>,
        gateway: Arc<dyn OrderGateway>,
        store: StateStore,
        registry: Arc<OrderRegistry>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            cfg,
            gateway,
            store,
            registry,
            events_tx,
            shutdown_tx,
            inner: Mutex::new(EngineInner::default()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to the engine's event broadcast (observer surface).
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Start the timeout sweeper.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.sweep_timeouts().await,
                    _ = shutdown.recv() => return,
                }
            }
        });
        self.tasks.lock().push(handle);
        info!("trade engine started");
    }

    /// Cancel the sweeper and in-flight opening tasks, waiting for each to
    /// finish its cleanup. Live OPEN trades stay protected server-side.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!(open_trades = self.open_count().await, "trade engine stopped");
    }

    pub async fn open_count(&self) -> usize {
        self.inner.lock().await.open_count()
    }

    pub async fn open_count_for(&self, pair: &str) -> usize {
        self.inner.lock().await.open_count_for(pair)
    }

    /// Snapshot of all live (non-terminal) trades.
    pub async fn active_trades(&self) -> Vec<Trade> {
        self.inner
            .lock()
            .await
            .trades
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Snapshot of a single live trade.
    pub async fn trade_snapshot(&self, trade_id: &str) -> Option<Trade> {
        self.inner.lock().await.trades.get(trade_id).cloned()
    }

    // ------------------------------------------------------------------
    // Intake and admission
    // ------------------------------------------------------------------

    /// Admit a signal. Never blocks on the exchange: the opening runs in a
    /// spawned task. Returns the new trade id, or `None` when rejected.
    pub async fn on_signal(self: &Arc<Self>, sig: Signal) -> Option<String> {
        let mut inner = self.inner.lock().await;
        if inner.open_count() >= self.cfg.strategy.max_open_trades {
            info!(
                pair = %sig.pair,
                max = self.cfg.strategy.max_open_trades,
                "signal dropped: max_open_trades reached"
            );
            return None;
        }
        if inner.open_count_for(&sig.pair) >= self.cfg.strategy.max_trades_per_pair {
            info!(
                pair = %sig.pair,
                max = self.cfg.strategy.max_trades_per_pair,
                "signal dropped: max_trades_per_pair reached"
            );
            return None;
        }

        let trade = Trade::new(sig.clone());
        let trade_id = trade.trade_id.clone();
        inner.trades.insert(trade_id.clone(), trade);
        if !self.save_or_fail(&mut inner, &trade_id).await {
            return None;
        }
        drop(inner);

        self.emit(
            EventKind::Signal,
            Some(&trade_id),
            json!({
                "pair": sig.pair,
                "rank": sig.rank,
                "close": sig.close,
                "momentum_1h_pct": sig.momentum_1h_pct,
            }),
        )
        .await;
        info!(trade_id = %trade_id, pair = %sig.pair, "trade admitted");

        let engine = Arc::clone(self);
        let id = trade_id.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                // cleanup runs after the signal is observed and cannot be
                // interrupted: the task is signalled, never aborted
                _ = shutdown.recv() => engine.abort_opening(&id).await,
                _ = engine.chase_entry(&id, &sig) => {}
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        Some(trade_id)
    }

    // ------------------------------------------------------------------
    // Entry chase loop
    // ------------------------------------------------------------------

    async fn chase_entry(&self, trade_id: &str, sig: &Signal) {
        {
            let mut inner = self.inner.lock().await;
            let Some(trade) = inner.trades.get_mut(trade_id) else {
                return;
            };
            trade.status = TradeStatus::Opening;
            trade.touch();
            if !self.save_or_fail(&mut inner, trade_id).await {
                return;
            }
        }

        let entry_cfg = &self.cfg.entry;
        for attempt in 1..=entry_cfg.max_chase_attempts {
            // first attempt rests deeper in the book; chases go to the top
            let price_match = if attempt == 1 {
                PriceMatch::Opponent5
            } else {
                PriceMatch::Opponent
            };
            match self.submit_entry(trade_id, sig, price_match, attempt).await {
                Ok(Some(order_id)) => {
                    let filled = self
                        .wait_entry_fill(
                            trade_id,
                            Duration::from_secs(entry_cfg.chase_timeout_seconds),
                        )
                        .await;
                    if filled {
                        return;
                    }
                    info!(
                        trade_id,
                        attempt,
                        timeout_secs = entry_cfg.chase_timeout_seconds,
                        "no fill within chase window"
                    );
                    self.withdraw_entry(trade_id, &sig.pair, order_id).await;
                    if attempt < entry_cfg.max_chase_attempts {
                        tokio::time::sleep(Duration::from_secs(entry_cfg.chase_interval_seconds))
                            .await;
                    }
                }
                Ok(None) => return, // trade reached a terminal state meanwhile
                Err(e) if matches!(e, GatewayError::Config(_)) => {
                    // pair-specific sizing failure: not retryable
                    error!(trade_id, error = %e, "entry rejected by sizing rules");
                    self.emit(
                        EventKind::Error,
                        Some(trade_id),
                        json!({"msg": e.to_string()}),
                    )
                    .await;
                    self.fail_trade(trade_id, e.to_string()).await;
                    return;
                }
                Err(e) => {
                    error!(trade_id, attempt, error = %e, "entry attempt failed");
                    self.emit(
                        EventKind::Error,
                        Some(trade_id),
                        json!({"attempt": attempt, "error": e.to_string()}),
                    )
                    .await;
                    if attempt < entry_cfg.max_chase_attempts {
                        tokio::time::sleep(Duration::from_secs(entry_cfg.chase_interval_seconds))
                            .await;
                    }
                }
            }
        }

        if entry_cfg.market_fallback {
            match self.submit_market_fallback(trade_id, sig).await {
                Ok(Some(order_id)) => {
                    if self.wait_entry_fill(trade_id, MARKET_FALLBACK_WAIT).await {
                        return;
                    }
                    error!(trade_id, "market fallback did not fill");
                    self.registry.unregister(order_id);
                    self.inner.lock().await.by_entry.remove(&order_id);
                }
                Ok(None) => return,
                Err(e) => {
                    error!(trade_id, error = %e, "market fallback failed");
                }
            }
        }

        self.mark_not_executed(trade_id).await;
    }

    async fn submit_entry(
        &self,
        trade_id: &str,
        sig: &Signal,
        price_match: PriceMatch,
        attempt: u32,
    ) -> Result<Option<i64>, GatewayError> {
        // reference price for sizing only; the order itself is book-matched
        let ref_price = self.gateway.best_bid(&sig.pair).await?;
        let qty = self.gateway.calc_quantity(&sig.pair, ref_price).await?;
        let ack = self
            .gateway
            .open_short_maker(&sig.pair, qty, price_match)
            .await?;

        let mut inner = self.inner.lock().await;
        let Some(trade) = inner.trades.get_mut(trade_id) else {
            drop(inner);
            // shutdown cleanup raced the submission; withdraw the stray order
            let _ = self.gateway.cancel(&sig.pair, ack.order_id).await;
            return Ok(None);
        };
        trade.entry_order_id = Some(ack.order_id);
        trade.entry_qty = Some(qty);
        trade.touch();
        if !self.save_or_fail(&mut inner, trade_id).await {
            return Ok(None);
        }
        inner.by_entry.insert(ack.order_id, trade_id.to_string());
        drop(inner);
        self.registry.register_entry(ack.order_id);

        self.emit(
            EventKind::EntrySent,
            Some(trade_id),
            json!({
                "order_id": ack.order_id,
                "price_match": price_match.as_str(),
                "qty": qty,
                "attempt": attempt,
            }),
        )
        .await;
        info!(
            trade_id,
            attempt,
            order_id = ack.order_id,
            %price_match,
            %qty,
            "entry order submitted"
        );
        Ok(Some(ack.order_id))
    }

    async fn submit_market_fallback(
        &self,
        trade_id: &str,
        sig: &Signal,
    ) -> Result<Option<i64>, GatewayError> {
        let ref_price = self.gateway.best_bid(&sig.pair).await?;
        let qty = self.gateway.calc_quantity(&sig.pair, ref_price).await?;
        let ack = self.gateway.open_short_market(&sig.pair, qty).await?;

        let mut inner = self.inner.lock().await;
        let Some(trade) = inner.trades.get_mut(trade_id) else {
            return Ok(None);
        };
        trade.entry_order_id = Some(ack.order_id);
        trade.entry_qty = Some(qty);
        trade.touch();
        if !self.save_or_fail(&mut inner, trade_id).await {
            return Ok(None);
        }
        inner.by_entry.insert(ack.order_id, trade_id.to_string());
        drop(inner);
        self.registry.register_entry(ack.order_id);

        self.emit(
            EventKind::EntrySent,
            Some(trade_id),
            json!({"order_id": ack.order_id, "type": "MARKET", "qty": qty}),
        )
        .await;
        info!(trade_id, order_id = ack.order_id, %qty, "market fallback submitted");
        Ok(Some(ack.order_id))
    }

    /// Poll until the user-data stream transitions the trade, or the window
    /// expires. A final look after the deadline catches a fill that landed
    /// while this loop slept.
    async fn wait_entry_fill(&self, trade_id: &str, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            {
                let inner = self.inner.lock().await;
                match inner.trades.get(trade_id).map(|t| t.status) {
                    Some(TradeStatus::Open | TradeStatus::Closing | TradeStatus::Closed) => {
                        return true
                    }
                    None | Some(TradeStatus::NotExecuted | TradeStatus::Error) => return false,
                    _ => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let inner = self.inner.lock().await;
                return matches!(
                    inner.trades.get(trade_id).map(|t| t.status),
                    Some(TradeStatus::Open | TradeStatus::Closing | TradeStatus::Closed)
                );
            }
            tokio::time::sleep(FILL_POLL).await;
        }
    }

    async fn withdraw_entry(&self, trade_id: &str, pair: &str, order_id: i64) {
        if let Err(e) = self.gateway.cancel(pair, order_id).await {
            // a fill may have raced the cancel; the stream will deliver it
            warn!(trade_id, order_id, error = %e, "entry cancel failed");
        }
        self.registry.unregister(order_id);
        self.inner.lock().await.by_entry.remove(&order_id);
    }

    /// Shutdown cleanup for a half-open trade.
    async fn abort_opening(&self, trade_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(trade) = inner.trades.get(trade_id) else {
            return;
        };
        if !matches!(
            trade.status,
            TradeStatus::Opening | TradeStatus::SignalReceived
        ) {
            return;
        }
        info!(trade_id, "opening cancelled by shutdown");
        let pair = trade.pair.clone();
        let order_id = trade.entry_order_id;

        if let Some(order_id) = order_id {
            if let Err(e) = self.gateway.cancel(&pair, order_id).await {
                warn!(trade_id, order_id, error = %e, "shutdown cancel failed");
            }
            self.registry.unregister(order_id);
            inner.by_entry.remove(&order_id);
        }
        if let Some(trade) = inner.trades.get_mut(trade_id) {
            trade.status = TradeStatus::NotExecuted;
            trade.touch();
            let snapshot = trade.clone();
            if let Err(e) = self.store.save_trade(&snapshot).await {
                error!(trade_id, error = %e, "saving aborted trade failed");
            }
        }
        inner.trades.remove(trade_id);
    }

    async fn mark_not_executed(&self, trade_id: &str) {
        {
            let mut inner = self.inner.lock().await;
            let Some(trade) = inner.trades.get_mut(trade_id) else {
                return;
            };
            if trade.status != TradeStatus::Opening {
                return; // filled while the last wait expired
            }
            warn!(trade_id, "no fill after all attempts; trade not executed");
            trade.status = TradeStatus::NotExecuted;
            trade.touch();
            let _ = self.save_or_fail(&mut inner, trade_id).await;
            inner.trades.remove(trade_id);
        }
        self.emit(
            EventKind::Error,
            Some(trade_id),
            json!({"msg": "no fill after all attempts"}),
        )
        .await;
    }

    // ------------------------------------------------------------------
    // Fill callbacks (user-data stream)
    // ------------------------------------------------------------------

    pub async fn on_entry_fill(&self, update: OrderUpdate) {
        let mut inner = self.inner.lock().await;
        let Some(trade_id) = inner.by_entry.remove(&update.order_id) else {
            warn!(order_id = update.order_id, "entry fill for unknown order");
            return;
        };
        let Some(trade) = inner.trades.get_mut(&trade_id) else {
            return;
        };
        let price = update.fill_price();
        trade.entry_price = Some(price);
        trade.entry_fill_ts = Some(Utc::now());
        trade.status = TradeStatus::Open;
        trade.touch();
        let qty = trade.entry_qty;
        if !self.save_or_fail(&mut inner, &trade_id).await {
            return;
        }
        self.emit(
            EventKind::EntryFill,
            Some(&trade_id),
            json!({"order_id": update.order_id, "price": price, "qty": qty}),
        )
        .await;
        info!(trade_id = %trade_id, %price, "entry filled, position open");

        self.place_protection(&mut inner, &trade_id).await;
    }

    pub async fn on_tp_fill(&self, update: OrderUpdate) {
        self.on_protection_fill(update, ExitKind::Tp).await;
    }

    pub async fn on_sl_fill(&self, update: OrderUpdate) {
        self.on_protection_fill(update, ExitKind::Sl).await;
    }

    async fn on_protection_fill(&self, update: OrderUpdate, kind: ExitKind) {
        let mut inner = self.inner.lock().await;
        let removed = match kind {
            ExitKind::Tp => inner.by_tp.remove(&update.order_id),
            _ => inner.by_sl.remove(&update.order_id),
        };
        let Some(trade_id) = removed else {
            return; // late or duplicate callback: no state change
        };
        let Some(trade) = inner.trades.get_mut(&trade_id) else {
            return;
        };
        if !matches!(trade.status, TradeStatus::Open | TradeStatus::Closing) {
            return;
        }
        let price = update.fill_price();
        trade.status = TradeStatus::Closing;
        trade.exit_price = Some(price);
        trade.exit_fill_ts = Some(Utc::now());
        trade.exit_kind = Some(kind);
        trade.touch();
        if !self.save_or_fail(&mut inner, &trade_id).await {
            return;
        }
        let (event_kind, counterpart) = match kind {
            ExitKind::Tp => (EventKind::TpFill, Leg::Sl),
            _ => (EventKind::SlFill, Leg::Tp),
        };
        self.emit(
            event_kind,
            Some(&trade_id),
            json!({"order_id": update.order_id, "price": price}),
        )
        .await;
        match kind {
            ExitKind::Tp => info!(trade_id = %trade_id, %price, "take-profit filled"),
            _ => warn!(trade_id = %trade_id, %price, "stop-loss filled"),
        }

        self.cancel_counterpart(&mut inner, &trade_id, counterpart)
            .await;
        self.finalize_close(&mut inner, &trade_id).await;
    }

    // ------------------------------------------------------------------
    // Protection placement
    // ------------------------------------------------------------------

    async fn place_protection(&self, inner: &mut EngineInner, trade_id: &str) {
        self.place_one_tp(inner, trade_id).await;
        self.place_one_sl(inner, trade_id).await;
    }

    async fn place_one_tp(&self, inner: &mut EngineInner, trade_id: &str) {
        let Some((pair, qty, entry)) = entry_leg(inner, trade_id) else {
            return;
        };
        match self.gateway.place_tp(&pair, qty, entry).await {
            Ok(ack) => {
                if let Some(trade) = inner.trades.get_mut(trade_id) {
                    trade.tp_order_id = Some(ack.order_id);
                    trade.tp_trigger_price = Some(ack.trigger_price);
                    trade.tp_price = Some(ack.trigger_price);
                    trade.touch();
                }
                inner.by_tp.insert(ack.order_id, trade_id.to_string());
                self.registry.register_tp(ack.order_id);
                if !self.save_or_fail(inner, trade_id).await {
                    return;
                }
                self.emit(
                    EventKind::TpPlaced,
                    Some(trade_id),
                    json!({"order_id": ack.order_id, "trigger_price": ack.trigger_price}),
                )
                .await;
                info!(
                    trade_id,
                    order_id = ack.order_id,
                    trigger = %ack.trigger_price,
                    "take-profit placed"
                );
            }
            Err(e) => {
                // position stays open; operator sees the alert on the event
                // stream and whatever protection did succeed stays live
                error!(trade_id, error = %e, "take-profit placement failed");
                self.emit(
                    EventKind::Error,
                    Some(trade_id),
                    json!({"msg": format!("take-profit placement failed: {e}")}),
                )
                .await;
            }
        }
    }

    async fn place_one_sl(&self, inner: &mut EngineInner, trade_id: &str) {
        let Some((pair, qty, entry)) = entry_leg(inner, trade_id) else {
            return;
        };
        match self.gateway.place_sl(&pair, qty, entry).await {
            Ok(SlOutcome::Placed(ack)) => {
                if let Some(trade) = inner.trades.get_mut(trade_id) {
                    trade.sl_order_id = Some(ack.order_id);
                    trade.sl_trigger_price = Some(ack.trigger_price);
                    trade.touch();
                }
                inner.by_sl.insert(ack.order_id, trade_id.to_string());
                self.registry.register_sl(ack.order_id);
                if !self.save_or_fail(inner, trade_id).await {
                    return;
                }
                self.emit(
                    EventKind::SlPlaced,
                    Some(trade_id),
                    json!({"order_id": ack.order_id, "trigger_price": ack.trigger_price}),
                )
                .await;
                info!(
                    trade_id,
                    order_id = ack.order_id,
                    trigger = %ack.trigger_price,
                    "stop-loss placed"
                );
            }
            Ok(SlOutcome::TriggerAlreadyCrossed) => {
                // mark price ran past the trigger during the round-trip:
                // the stop would fire instantly, so close at market now
                warn!(trade_id, pair = %pair, "stop trigger already crossed; closing at market");
                self.emit(
                    EventKind::SlTriggered,
                    Some(trade_id),
                    json!({"msg": "stop trigger crossed during placement"}),
                )
                .await;
                match self.gateway.close_market(&pair, qty).await {
                    Ok(ack) => {
                        let exit_price = ack.avg_price.unwrap_or(Decimal::ZERO);
                        if exit_price.is_zero() {
                            warn!(trade_id, "market close reported no average price");
                        }
                        if let Some(trade) = inner.trades.get_mut(trade_id) {
                            trade.status = TradeStatus::Closing;
                            trade.exit_price = Some(exit_price);
                            trade.exit_fill_ts = Some(Utc::now());
                            trade.exit_kind = Some(ExitKind::Sl);
                            trade.touch();
                        }
                        if !self.save_or_fail(inner, trade_id).await {
                            return;
                        }
                        self.cancel_counterpart(inner, trade_id, Leg::Tp).await;
                        self.finalize_close(inner, trade_id).await;
                    }
                    Err(e) => {
                        error!(trade_id, error = %e, "market close after crossed stop failed");
                        self.emit(
                            EventKind::Error,
                            Some(trade_id),
                            json!({"msg": format!("market close after crossed stop failed: {e}")}),
                        )
                        .await;
                    }
                }
            }
            Err(e) => {
                error!(trade_id, error = %e, "stop-loss placement failed");
                self.emit(
                    EventKind::Error,
                    Some(trade_id),
                    json!({"msg": format!("stop-loss placement failed: {e}")}),
                )
                .await;
            }
        }
    }

    async fn cancel_counterpart(&self, inner: &mut EngineInner, trade_id: &str, leg: Leg) {
        let Some(trade) = inner.trades.get(trade_id) else {
            return;
        };
        let pair = trade.pair.clone();
        let order_id = match leg {
            Leg::Tp => trade.tp_order_id,
            Leg::Sl => trade.sl_order_id,
        };
        let Some(order_id) = order_id else {
            return;
        };
        if let Err(e) = self.gateway.cancel(&pair, order_id).await {
            warn!(trade_id, order_id, error = %e, "counterpart cancel failed");
        }
        match leg {
            Leg::Tp => inner.by_tp.remove(&order_id),
            Leg::Sl => inner.by_sl.remove(&order_id),
        };
        self.registry.unregister(order_id);
        debug!(trade_id, order_id, "counterpart protection cancelled");
    }

    /// Compute PnL, persist the terminal state and drop the trade from the
    /// live map.
    async fn finalize_close(&self, inner: &mut EngineInner, trade_id: &str) {
        let Some(trade) = inner.trades.get_mut(trade_id) else {
            return;
        };
        if let (Some(entry), Some(exit), Some(qty)) =
            (trade.entry_price, trade.exit_price, trade.entry_qty)
        {
            if entry > Decimal::ZERO && exit > Decimal::ZERO && qty > Decimal::ZERO {
                let (pnl_usdt, pnl_pct, fees) = compute_pnl(entry, exit, qty);
                trade.pnl_usdt = Some(pnl_usdt);
                trade.pnl_pct = Some(pnl_pct);
                trade.fees_usdt = Some(fees);
            }
        }
        trade.status = TradeStatus::Closed;
        trade.touch();
        let pair = trade.pair.clone();
        let exit_kind = trade.exit_kind;
        let pnl = trade.pnl_usdt;
        let _ = self.save_or_fail(inner, trade_id).await;
        inner.trades.remove(trade_id);
        info!(
            trade_id,
            pair = %pair,
            exit_kind = ?exit_kind,
            pnl_usdt = ?pnl,
            "trade closed"
        );
    }

    /// Terminal error path for a single trade.
    async fn fail_trade(&self, trade_id: &str, message: String) {
        let mut inner = self.inner.lock().await;
        if let Some(trade) = inner.trades.get_mut(trade_id) {
            trade.status = TradeStatus::Error;
            trade.error_message = Some(message);
            trade.touch();
            let snapshot = trade.clone();
            if let Err(e) = self.store.save_trade(&snapshot).await {
                error!(trade_id, error = %e, "saving errored trade failed");
            }
        }
        inner.trades.remove(trade_id);
    }

    // ------------------------------------------------------------------
    // Timeout sweeper
    // ------------------------------------------------------------------

    async fn sweep_timeouts(self: &Arc<Self>) {
        let max_age = chrono::Duration::seconds((self.cfg.strategy.timeout_hours * 3600.0) as i64);
        let now = Utc::now();
        let mut due = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for trade in inner.trades.values_mut() {
                if trade.status != TradeStatus::Open || trade.timeout_triggered {
                    continue;
                }
                let Some(fill_ts) = trade.entry_fill_ts else {
                    continue;
                };
                if now - fill_ts < max_age {
                    continue;
                }
                trade.timeout_triggered = true;
                trade.touch();
                due.push((trade.trade_id.clone(), fill_ts));
            }
            for (trade_id, _) in &due {
                let _ = self.save_or_fail(&mut inner, trade_id).await;
            }
        }
        for (trade_id, fill_ts) in due {
            info!(trade_id = %trade_id, open_since = %fill_ts, "trade timed out");
            self.emit(
                EventKind::Timeout,
                Some(&trade_id),
                json!({
                    "open_since": fill_ts.to_rfc3339(),
                    "hours": (now - fill_ts).num_seconds() as f64 / 3600.0,
                }),
            )
            .await;
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.close_by_timeout(&trade_id).await });
        }
    }

    async fn close_by_timeout(&self, trade_id: &str) {
        let (pair, qty) = {
            let mut inner = self.inner.lock().await;
            let Some(trade) = inner.trades.get_mut(trade_id) else {
                return;
            };
            if trade.status != TradeStatus::Open {
                return;
            }
            trade.status = TradeStatus::Closing;
            trade.touch();
            let pair = trade.pair.clone();
            let qty = trade.entry_qty;
            if !self.save_or_fail(&mut inner, trade_id).await {
                return;
            }
            self.cancel_counterpart(&mut inner, trade_id, Leg::Tp).await;
            self.cancel_counterpart(&mut inner, trade_id, Leg::Sl).await;
            (pair, qty)
        };
        let Some(qty) = qty else {
            error!(trade_id, "timed-out trade has no recorded quantity");
            return;
        };

        let order_type = self.cfg.exit.timeout_order_type.as_str();
        if order_type != "MARKET" {
            match self.submit_timeout_close(&pair, qty, order_type).await {
                Ok(ack) => {
                    info!(trade_id, order_id = ack.order_id, order_type, "timeout close submitted");
                    let window = Duration::from_secs(self.cfg.exit.timeout_chase_seconds);
                    if let Some(price) = self.wait_close_fill(&pair, ack.order_id, window).await {
                        self.record_exit_and_close(trade_id, price, ExitKind::Timeout)
                            .await;
                        return;
                    }
                    if let Err(e) = self.gateway.cancel(&pair, ack.order_id).await {
                        warn!(trade_id, error = %e, "timeout close cancel failed");
                    }
                }
                Err(e) => error!(trade_id, error = %e, "timeout close submission failed"),
            }
        }

        if order_type == "MARKET" || self.cfg.exit.timeout_market_fallback {
            match self.gateway.close_market(&pair, qty).await {
                Ok(ack) => {
                    let price = ack.avg_price.unwrap_or(Decimal::ZERO);
                    self.record_exit_and_close(trade_id, price, ExitKind::Timeout)
                        .await;
                }
                Err(e) => {
                    error!(trade_id, error = %e, "timeout market close failed");
                    self.emit(
                        EventKind::Error,
                        Some(trade_id),
                        json!({"msg": format!("timeout close failed: {e}")}),
                    )
                    .await;
                    self.fail_trade(trade_id, format!("timeout close failed: {e}"))
                        .await;
                }
            }
        }
    }

    async fn submit_timeout_close(
        &self,
        pair: &str,
        qty: Decimal,
        order_type: &str,
    ) -> Result<crate::gateway::OrderAck, GatewayError> {
        if order_type == "BBO" {
            self.gateway.close_bbo(pair, qty).await
        } else {
            let ask = self.gateway.best_ask(pair).await?;
            self.gateway.close_limit(pair, qty, ask).await
        }
    }

    /// Poll the order until filled or the window expires; returns the fill
    /// price on success.
    async fn wait_close_fill(
        &self,
        pair: &str,
        order_id: i64,
        window: Duration,
    ) -> Option<Decimal> {
        let deadline = tokio::time::Instant::now() + window;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(CLOSE_POLL).await;
            match self.gateway.get_order(pair, order_id).await {
                Ok(info) if info.is_filled() => return info.fill_price(),
                Ok(_) => {}
                Err(e) => debug!(order_id, error = %e, "close fill poll failed"),
            }
        }
        None
    }

    async fn record_exit_and_close(&self, trade_id: &str, price: Decimal, kind: ExitKind) {
        let mut inner = self.inner.lock().await;
        let Some(trade) = inner.trades.get_mut(trade_id) else {
            return;
        };
        trade.exit_price = Some(price);
        trade.exit_fill_ts = Some(Utc::now());
        trade.exit_kind = Some(kind);
        trade.touch();
        if !self.save_or_fail(&mut inner, trade_id).await {
            return;
        }
        self.finalize_close(&mut inner, trade_id).await;
    }

    // ------------------------------------------------------------------
    // Reconciliation (startup)
    // ------------------------------------------------------------------

    /// Re-synchronise trades loaded from the store with the exchange's
    /// authoritative state.
    pub async fn reconcile(&self, db_trades: Vec<Trade>) {
        if db_trades.is_empty() {
            info!("reconciliation: no active trades in store");
            return;
        }
        info!(count = db_trades.len(), "reconciling trades from store");

        let position_pairs: HashSet<String> = match self.gateway.positions().await {
            Ok(positions) => positions.into_iter().map(|p| p.symbol).collect(),
            Err(e) => {
                error!(error = %e, "reconciliation: positions unavailable");
                HashSet::new()
            }
        };
        info!(?position_pairs, "open positions on exchange");

        let mut inner = self.inner.lock().await;
        let mut open_pairs: HashSet<String> = HashSet::new();

        for trade in db_trades {
            let trade_id = trade.trade_id.clone();
            let status = trade.status;
            inner.trades.insert(trade_id.clone(), trade);
            match status {
                TradeStatus::Open => {
                    self.reconcile_open(&mut inner, &trade_id, &position_pairs)
                        .await;
                }
                TradeStatus::Opening | TradeStatus::SignalReceived => {
                    self.reconcile_opening(&mut inner, &trade_id).await;
                }
                TradeStatus::Closing => {
                    self.reconcile_closing(&mut inner, &trade_id, &position_pairs)
                        .await;
                }
                _ => {}
            }
            if let Some(t) = inner.trades.get(&trade_id) {
                info!(trade_id = %trade_id, pair = %t.pair, status = %t.status, "reconciled");
                if t.status == TradeStatus::Open {
                    open_pairs.insert(t.pair.clone());
                }
            }
        }

        for pair in position_pairs.difference(&open_pairs) {
            warn!(pair = %pair, "exchange position without matching trade; not adopted");
        }
    }

    async fn reconcile_open(
        &self,
        inner: &mut EngineInner,
        trade_id: &str,
        position_pairs: &HashSet<String>,
    ) {
        let Some(trade) = inner.trades.get(trade_id) else {
            return;
        };
        let pair = trade.pair.clone();
        let (tp_id, sl_id) = (trade.tp_order_id, trade.sl_order_id);

        if !position_pairs.contains(&pair) {
            warn!(trade_id, pair = %pair, "open trade without exchange position; closed externally");
            self.finalize_external_close(inner, trade_id, &pair).await;
            self.emit(
                EventKind::Error,
                Some(trade_id),
                json!({"msg": "position closed externally"}),
            )
            .await;
            return;
        }

        let open_ids = self.open_order_ids(&pair).await;

        match tp_id {
            Some(id) if open_ids.contains(&id) => {
                inner.by_tp.insert(id, trade_id.to_string());
                self.registry.register_tp(id);
                info!(trade_id, order_id = id, "take-profit re-registered");
            }
            _ => {
                warn!(trade_id, missing = ?tp_id, "take-profit not live; re-placing");
                self.place_one_tp(inner, trade_id).await;
            }
        }
        // the TP path may have closed the trade (crossed-stop close in
        // place_one_sl does the same); re-check before touching the SL
        if !inner.trades.contains_key(trade_id) {
            return;
        }
        match sl_id {
            Some(id) if open_ids.contains(&id) => {
                inner.by_sl.insert(id, trade_id.to_string());
                self.registry.register_sl(id);
                info!(trade_id, order_id = id, "stop-loss re-registered");
            }
            _ => {
                warn!(trade_id, missing = ?sl_id, "stop-loss not live; re-placing");
                self.place_one_sl(inner, trade_id).await;
            }
        }

        match inner.trades.get_mut(trade_id) {
            Some(trade) => {
                trade.reconciled = true;
                trade.touch();
            }
            None => return,
        }
        let _ = self.save_or_fail(inner, trade_id).await;
    }

    async fn reconcile_opening(&self, inner: &mut EngineInner, trade_id: &str) {
        let Some(trade) = inner.trades.get(trade_id) else {
            return;
        };
        let pair = trade.pair.clone();
        let Some(entry_order_id) = trade.entry_order_id else {
            warn!(trade_id, "opening trade without entry order; not executed");
            self.terminalize(inner, trade_id, TradeStatus::NotExecuted).await;
            return;
        };

        let info = match self.gateway.get_order(&pair, entry_order_id).await {
            Ok(info) => info,
            Err(e) => {
                error!(trade_id, entry_order_id, error = %e, "entry order unqueryable");
                self.terminalize(inner, trade_id, TradeStatus::NotExecuted).await;
                return;
            }
        };

        if info.is_filled() {
            let price = info.fill_price().unwrap_or(Decimal::ZERO);
            info!(trade_id, %price, "entry filled during downtime; promoting to open");
            let qty = {
                let Some(trade) = inner.trades.get_mut(trade_id) else {
                    return;
                };
                trade.entry_price = Some(price);
                if trade.entry_fill_ts.is_none() {
                    trade.entry_fill_ts = Some(Utc::now());
                }
                trade.status = TradeStatus::Open;
                trade.reconciled = true;
                trade.touch();
                trade.entry_qty
            };
            if !self.save_or_fail(inner, trade_id).await {
                return;
            }
            self.emit(
                EventKind::EntryFill,
                Some(trade_id),
                json!({
                    "order_id": entry_order_id,
                    "price": price,
                    "qty": qty,
                    "reconcile": true,
                }),
            )
            .await;
            self.place_protection(inner, trade_id).await;
        } else {
            if info.is_live() {
                if let Err(e) = self.gateway.cancel(&pair, entry_order_id).await {
                    warn!(trade_id, error = %e, "cancelling stale entry failed");
                }
            }
            warn!(trade_id, status = %info.status, "stale entry order; not executed");
            self.terminalize(inner, trade_id, TradeStatus::NotExecuted).await;
        }
    }

    async fn reconcile_closing(
        &self,
        inner: &mut EngineInner,
        trade_id: &str,
        position_pairs: &HashSet<String>,
    ) {
        let Some(trade) = inner.trades.get(trade_id) else {
            return;
        };
        let pair = trade.pair.clone();
        if !position_pairs.contains(&pair) {
            info!(trade_id, pair = %pair, "closing trade already flat on exchange");
            self.finalize_external_close(inner, trade_id, &pair).await;
        } else {
            warn!(trade_id, pair = %pair, "closing trade still has a position; restoring to open");
            {
                let Some(trade) = inner.trades.get_mut(trade_id) else {
                    return;
                };
                trade.status = TradeStatus::Open;
                trade.touch();
            }
            if !self.save_or_fail(inner, trade_id).await {
                return;
            }
            self.reconcile_open(inner, trade_id, position_pairs).await;
        }
    }

    /// Close out a trade whose position no longer exists on the exchange.
    /// The exit price is unknown; the current mark price is the estimate.
    async fn finalize_external_close(
        &self,
        inner: &mut EngineInner,
        trade_id: &str,
        pair: &str,
    ) {
        let mark = self.gateway.mark_price(pair).await.unwrap_or(Decimal::ZERO);
        let Some(trade) = inner.trades.get_mut(trade_id) else {
            return;
        };
        if trade.exit_price.is_none() {
            trade.exit_price = Some(mark);
        }
        if trade.exit_fill_ts.is_none() {
            trade.exit_fill_ts = Some(Utc::now());
        }
        if trade.exit_kind.is_none() {
            trade.exit_kind = Some(ExitKind::Manual);
        }
        trade.touch();
        self.finalize_close(inner, trade_id).await;
    }

    async fn terminalize(&self, inner: &mut EngineInner, trade_id: &str, status: TradeStatus) {
        if let Some(trade) = inner.trades.get_mut(trade_id) {
            trade.status = status;
            trade.touch();
        }
        let _ = self.save_or_fail(inner, trade_id).await;
        inner.trades.remove(trade_id);
    }

    /// Union of regular and algorithmic open order ids for a pair.
    async fn open_order_ids(&self, pair: &str) -> HashSet<i64> {
        let mut ids = HashSet::new();
        match self.gateway.open_orders(pair).await {
            Ok(orders) => ids.extend(orders.iter().map(|o| o.order_id)),
            Err(e) => error!(pair, error = %e, "open orders unavailable"),
        }
        match self.gateway.open_algo_orders(pair).await {
            Ok(orders) => ids.extend(orders.iter().map(|o| o.order_id)),
            Err(e) => debug!(pair, error = %e, "open algo orders unavailable"),
        }
        ids
    }

    // ------------------------------------------------------------------
    // Event emission
    // ------------------------------------------------------------------

    /// Persist an event and broadcast it. Persistence failures never abort
    /// the transition that produced the event.
    pub async fn emit(
        &self,
        kind: EventKind,
        trade_id: Option<&str>,
        details: serde_json::Value,
    ) {
        let event = Event::new(kind, trade_id.map(String::from), details);
        let event = match self.store.save_event(event.clone()).await {
            Ok(saved) => saved,
            Err(e) => {
                debug!(kind = %kind, error = %e, "event not persisted");
                event
            }
        };
        let _ = self.events_tx.send(event);
    }

    async fn save_or_fail(&self, inner: &mut EngineInner, trade_id: &str) -> bool {
        let Some(snapshot) = inner.trades.get(trade_id).cloned() else {
            return false;
        };
        match self.store.save_trade(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                // fail-stop: a trade whose state cannot be persisted must not
                // keep trading
                error!(trade_id, error = %e, "trade save failed; marking errored");
                if let Some(trade) = inner.trades.get_mut(trade_id) {
                    trade.status = TradeStatus::Error;
                    trade.error_message = Some(format!("state save failed: {e}"));
                    trade.touch();
                    let snapshot = trade.clone();
                    let _ = self.store.save_trade(&snapshot).await;
                }
                inner.trades.remove(trade_id);
                false
            }
        }
    }
}

fn entry_leg(inner: &EngineInner, trade_id: &str) -> Option<(String, Decimal, Decimal)> {
    let trade = inner.trades.get(trade_id)?;
    Some((trade.pair.clone(), trade.entry_qty?, trade.entry_price?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn short_pnl_happy_tp() {
        // entry 50000, exit 42500, qty 0.0002: +1.5 USDT, +15%
        let (usdt, pct, fees) = compute_pnl(dec!(50000), dec!(42500), dec!(0.0002));
        assert_eq!(usdt, dec!(1.5));
        assert_eq!(pct, dec!(15));
        assert_eq!(fees, dec!(0.0074));
    }

    #[test]
    fn short_pnl_loss_on_rising_exit() {
        // entry 100, exit 101, qty 0.1: -0.10 USDT
        let (usdt, pct, _) = compute_pnl(dec!(100), dec!(101), dec!(0.1));
        assert_eq!(usdt, dec!(-0.1));
        assert_eq!(pct, dec!(-1));
    }

    #[test]
    fn pnl_rounds_to_four_decimals() {
        let (usdt, pct, fees) = compute_pnl(dec!(3), dec!(2), dec!(0.333333));
        assert_eq!(usdt, dec!(0.3333));
        assert_eq!(pct, dec!(33.3333));
        assert_eq!(fees, dec!(0.0007));
    }

    #[test]
    fn fee_rate_constant_is_four_bps() {
        assert_eq!(FEE_RATE, dec!(0.0004));
    }
}
