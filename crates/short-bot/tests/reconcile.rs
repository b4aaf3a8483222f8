//! Startup reconciliation: store state vs. exchange state after a restart.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;

use common::{make_engine, sig, test_config, MockGateway};
use short_bot::gateway::{OrderInfo, PositionInfo};
use short_bot::types::{EventKind, ExitKind, Trade, TradeStatus};

fn opening_trade(pair: &str, entry_order_id: i64) -> Trade {
    let mut trade = Trade::new(sig(pair, dec!(100)));
    trade.status = TradeStatus::Opening;
    trade.entry_order_id = Some(entry_order_id);
    trade.entry_qty = Some(dec!(0.1));
    trade
}

fn open_trade(pair: &str) -> Trade {
    let mut trade = Trade::new(sig(pair, dec!(100)));
    trade.status = TradeStatus::Open;
    trade.entry_order_id = Some(1);
    trade.entry_price = Some(dec!(100));
    trade.entry_qty = Some(dec!(0.1));
    trade.entry_fill_ts = Some(Utc::now() - ChronoDuration::hours(1));
    trade.tp_order_id = Some(900);
    trade.sl_order_id = Some(901);
    trade.tp_trigger_price = Some(dec!(85));
    trade.sl_trigger_price = Some(dec!(160));
    trade
}

fn position(pair: &str) -> PositionInfo {
    PositionInfo {
        symbol: pair.to_string(),
        position_amt: dec!(-0.1),
        entry_price: dec!(100),
    }
}

#[tokio::test(start_paused = true)]
async fn entry_filled_during_downtime_is_promoted_and_protected() {
    let gateway = MockGateway::new();
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let trade = opening_trade("BTCUSDT", 55);
    store.save_trade(&trade).await.unwrap();
    gateway.orders.lock().insert(
        55,
        OrderInfo {
            order_id: 55,
            status: "FILLED".to_string(),
            avg_price: Some(dec!(200)),
            price: None,
        },
    );

    engine.reconcile(store.load_active_trades().await.unwrap()).await;

    let live = engine.trade_snapshot(&trade.trade_id).await.unwrap();
    assert_eq!(live.status, TradeStatus::Open);
    assert_eq!(live.entry_price, Some(dec!(200)));
    assert!(live.entry_fill_ts.is_some());
    assert!(live.reconciled);
    // protection was placed from the reported average price
    assert_eq!(live.tp_trigger_price, Some(dec!(170)));
    assert_eq!(live.sl_trigger_price, Some(dec!(320)));
    assert!(live.tp_order_id.is_some());
    assert!(live.sl_order_id.is_some());

    let events = store.get_trade_events(&trade.trade_id).await.unwrap();
    let entry_fills: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::EntryFill)
        .collect();
    assert_eq!(entry_fills.len(), 1);
    assert_eq!(entry_fills[0].details["reconcile"], true);
    assert_eq!(entry_fills[0].details["order_id"], 55);
}

#[tokio::test(start_paused = true)]
async fn stale_entry_order_is_cancelled_and_not_executed() {
    let gateway = MockGateway::new();
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let trade = opening_trade("BTCUSDT", 56);
    store.save_trade(&trade).await.unwrap();
    // mock reports NEW for unknown ids: still resting on the book

    engine.reconcile(store.load_active_trades().await.unwrap()).await;

    assert!(engine.trade_snapshot(&trade.trade_id).await.is_none());
    let stored = store.get_trade(&trade.trade_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::NotExecuted);
    assert!(gateway.cancelled.lock().contains(&56));
}

#[tokio::test(start_paused = true)]
async fn opening_trade_without_order_id_is_not_executed() {
    let gateway = MockGateway::new();
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let mut trade = opening_trade("BTCUSDT", 0);
    trade.entry_order_id = None;
    store.save_trade(&trade).await.unwrap();

    engine.reconcile(store.load_active_trades().await.unwrap()).await;

    let stored = store.get_trade(&trade.trade_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::NotExecuted);
}

#[tokio::test(start_paused = true)]
async fn externally_closed_position_terminalizes_as_manual() {
    let gateway = MockGateway::new();
    *gateway.mark.lock() = dec!(120);
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let trade = open_trade("BTCUSDT");
    store.save_trade(&trade).await.unwrap();
    // no exchange position for the pair

    engine.reconcile(store.load_active_trades().await.unwrap()).await;

    assert!(engine.trade_snapshot(&trade.trade_id).await.is_none());
    let stored = store.get_trade(&trade.trade_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::Closed);
    assert_eq!(stored.exit_kind, Some(ExitKind::Manual));
    // exit estimated from the mark price
    assert_eq!(stored.exit_price, Some(dec!(120)));
    assert!(stored.exit_fill_ts.is_some());

    let events = store.get_trade_events(&trade.trade_id).await.unwrap();
    let error_events: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::Error)
        .collect();
    assert_eq!(error_events.len(), 1);
    assert_eq!(
        error_events[0].details["msg"],
        "position closed externally"
    );
}

#[tokio::test(start_paused = true)]
async fn live_protective_orders_are_reregistered_missing_ones_replaced() {
    let gateway = MockGateway::new();
    let (engine, store, registry) = make_engine(test_config(), gateway.clone()).await;

    let trade = open_trade("BTCUSDT");
    store.save_trade(&trade).await.unwrap();
    gateway.positions.lock().push(position("BTCUSDT"));
    // only the SL is still live on the exchange; the TP vanished
    gateway.open_order_ids.lock().push(901);

    engine.reconcile(store.load_active_trades().await.unwrap()).await;

    let live = engine.trade_snapshot(&trade.trade_id).await.unwrap();
    assert_eq!(live.status, TradeStatus::Open);
    assert!(live.reconciled);
    // SL kept its id; TP was re-placed under a fresh one
    assert_eq!(live.sl_order_id, Some(901));
    let new_tp = live.tp_order_id.unwrap();
    assert_ne!(new_tp, 900);

    // both ids are registered with the fill demux
    use short_bot::gateway::stream::FillKind;
    assert_eq!(registry.take(new_tp), Some(FillKind::Tp));
    assert_eq!(registry.take(901), Some(FillKind::Sl));
}

#[tokio::test(start_paused = true)]
async fn closing_trade_with_no_position_finalizes() {
    let gateway = MockGateway::new();
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let mut trade = open_trade("BTCUSDT");
    trade.status = TradeStatus::Closing;
    trade.exit_price = Some(dec!(95));
    trade.exit_kind = Some(ExitKind::Tp);
    store.save_trade(&trade).await.unwrap();

    engine.reconcile(store.load_active_trades().await.unwrap()).await;

    let stored = store.get_trade(&trade.trade_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::Closed);
    // exit leg recorded before the restart is preserved
    assert_eq!(stored.exit_kind, Some(ExitKind::Tp));
    assert_eq!(stored.exit_price, Some(dec!(95)));
    assert_eq!(stored.pnl_usdt, Some(dec!(0.5)));
}

#[tokio::test(start_paused = true)]
async fn closing_trade_with_live_position_is_restored_to_open() {
    let gateway = MockGateway::new();
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let mut trade = open_trade("BTCUSDT");
    trade.status = TradeStatus::Closing;
    store.save_trade(&trade).await.unwrap();
    gateway.positions.lock().push(position("BTCUSDT"));
    gateway.open_order_ids.lock().extend([900, 901]);

    engine.reconcile(store.load_active_trades().await.unwrap()).await;

    let live = engine.trade_snapshot(&trade.trade_id).await.unwrap();
    assert_eq!(live.status, TradeStatus::Open);
    assert_eq!(live.tp_order_id, Some(900));
    assert_eq!(live.sl_order_id, Some(901));
}

/// Crash between any two saves converges to a state matching the exchange.
#[tokio::test(start_paused = true)]
async fn restart_converges_mixed_store_states() {
    let gateway = MockGateway::new();
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    // crashed right after admission: no entry order ever reached the exchange
    let admitted = {
        let mut t = Trade::new(sig("AAAUSDT", dec!(100)));
        t.status = TradeStatus::SignalReceived;
        t
    };
    // crashed mid-chase: order resting, never filled
    let resting = opening_trade("BBBUSDT", 70);
    // crashed after fill: position and protection live on the exchange
    let protected = open_trade("CCCUSDT");

    for t in [&admitted, &resting, &protected] {
        store.save_trade(t).await.unwrap();
    }
    gateway.positions.lock().push(position("CCCUSDT"));
    gateway.open_order_ids.lock().extend([900, 901]);

    engine.reconcile(store.load_active_trades().await.unwrap()).await;

    let admitted_after = store.get_trade(&admitted.trade_id).await.unwrap().unwrap();
    assert_eq!(admitted_after.status, TradeStatus::NotExecuted);
    let resting_after = store.get_trade(&resting.trade_id).await.unwrap().unwrap();
    assert_eq!(resting_after.status, TradeStatus::NotExecuted);
    let protected_after = engine.trade_snapshot(&protected.trade_id).await.unwrap();
    assert_eq!(protected_after.status, TradeStatus::Open);

    // exactly the surviving trade counts against the caps
    assert_eq!(engine.open_count().await, 1);

    // store and memory agree on the survivor
    let stored = store.get_trade(&protected.trade_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::Open);
}
