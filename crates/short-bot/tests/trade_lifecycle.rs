//! End-to-end lifecycle tests against a scriptable mock gateway:
//! admission caps, the happy TP path, the crossed-stop edge case, chase
//! exhaustion, the timeout exit, and fill-replay idempotence.

mod common;

use rust_decimal_macros::dec;

use common::{fill, make_engine, sig, test_config, wait_until, MockGateway};
use short_bot::types::{EventKind, ExitKind, TradeStatus};

#[tokio::test(start_paused = true)]
async fn happy_path_take_profit() {
    let gateway = MockGateway::new();
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let trade_id = engine.on_signal(sig("BTCUSDT", dec!(50000))).await.unwrap();

    // opening task submits the maker entry asynchronously
    let entry_id = wait_until(|| async {
        engine
            .trade_snapshot(&trade_id)
            .await
            .and_then(|t| t.entry_order_id)
    })
    .await;
    assert_eq!(gateway.maker_entries.lock()[0].2, "OPPONENT_5");

    engine.on_entry_fill(fill(entry_id, dec!(50000))).await;

    let trade = engine.trade_snapshot(&trade_id).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Open);
    // capital 10 at 50000 -> 0.0002
    assert_eq!(trade.entry_qty, Some(dec!(0.0002)));
    assert_eq!(trade.entry_price, Some(dec!(50000)));
    assert_eq!(trade.tp_trigger_price, Some(dec!(42500)));
    assert_eq!(trade.sl_trigger_price, Some(dec!(80000)));
    let tp_id = trade.tp_order_id.unwrap();
    let sl_id = trade.sl_order_id.unwrap();

    engine.on_tp_fill(fill(tp_id, dec!(42500))).await;

    // terminal: dropped from the live map, persisted as closed
    assert!(engine.trade_snapshot(&trade_id).await.is_none());
    assert_eq!(engine.open_count().await, 0);
    let stored = store.get_trade(&trade_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::Closed);
    assert_eq!(stored.exit_kind, Some(ExitKind::Tp));
    assert_eq!(stored.exit_price, Some(dec!(42500)));
    assert!(stored.exit_fill_ts.is_some());
    assert_eq!(stored.pnl_usdt, Some(dec!(1.5)));
    assert_eq!(stored.pnl_pct, Some(dec!(15)));

    // the stop-loss counterpart was cancelled
    assert!(gateway.cancelled.lock().contains(&sl_id));

    let kinds: Vec<EventKind> = store
        .get_trade_events(&trade_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Signal,
            EventKind::EntrySent,
            EventKind::EntryFill,
            EventKind::TpPlaced,
            EventKind::SlPlaced,
            EventKind::TpFill,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_trigger_crossed_at_placement_closes_at_market() {
    let gateway = MockGateway::new();
    gateway
        .sl_already_crossed
        .store(true, std::sync::atomic::Ordering::SeqCst);
    *gateway.market_fill_price.lock() = dec!(101);
    *gateway.best_bid.lock() = dec!(100);
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let trade_id = engine.on_signal(sig("BTCUSDT", dec!(100))).await.unwrap();
    let entry_id = wait_until(|| async {
        engine
            .trade_snapshot(&trade_id)
            .await
            .and_then(|t| t.entry_order_id)
    })
    .await;

    engine.on_entry_fill(fill(entry_id, dec!(100))).await;

    // the placement round-trip found the trigger crossed: immediate close
    let stored = store.get_trade(&trade_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::Closed);
    assert_eq!(stored.exit_kind, Some(ExitKind::Sl));
    assert_eq!(stored.exit_price, Some(dec!(101)));
    assert_eq!(gateway.market_closes.lock().len(), 1);

    // the TP that had been placed was cancelled
    let tp_id = stored.tp_order_id.unwrap();
    assert!(gateway.cancelled.lock().contains(&tp_id));

    let kinds: Vec<EventKind> = store
        .get_trade_events(&trade_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&EventKind::SlTriggered));
    assert!(!kinds.contains(&EventKind::SlPlaced));
}

#[tokio::test(start_paused = true)]
async fn chase_exhaustion_without_market_fallback() {
    let gateway = MockGateway::new();
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let trade_id = engine.on_signal(sig("BTCUSDT", dec!(50000))).await.unwrap();

    // never inject a fill: three attempts time out, then NOT_EXECUTED
    let stored = wait_until(|| async {
        store
            .get_trade(&trade_id)
            .await
            .unwrap()
            .filter(|t| t.status.is_terminal())
    })
    .await;
    assert_eq!(stored.status, TradeStatus::NotExecuted);
    assert!(engine.trade_snapshot(&trade_id).await.is_none());

    // first attempt rests at the 5th book level, chases at the top
    let entries = gateway.maker_entries.lock();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].2, "OPPONENT_5");
    assert_eq!(entries[1].2, "OPPONENT");
    assert_eq!(entries[2].2, "OPPONENT");
    drop(entries);
    assert!(gateway.market_entries.lock().is_empty());
    assert_eq!(gateway.cancelled.lock().len(), 3);

    let kinds: Vec<EventKind> = store
        .get_trade_events(&trade_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    let sent = kinds.iter().filter(|k| **k == EventKind::EntrySent).count();
    let errors = kinds.iter().filter(|k| **k == EventKind::Error).count();
    assert_eq!(sent, 3);
    assert_eq!(errors, 1);
}

#[tokio::test(start_paused = true)]
async fn market_fallback_fills_after_chase_exhaustion() {
    let gateway = MockGateway::new();
    let mut cfg = test_config();
    cfg.entry.market_fallback = true;
    let (engine, store, _registry) = make_engine(cfg, gateway.clone()).await;

    let trade_id = engine.on_signal(sig("BTCUSDT", dec!(50000))).await.unwrap();

    // wait for the taker fallback after three maker attempts, and for the
    // engine to have recorded its order id
    let fallback_id = wait_until(|| async {
        let fallback_id = gateway.market_entries.lock().last()?.2;
        engine
            .trade_snapshot(&trade_id)
            .await
            .and_then(|t| t.entry_order_id)
            .filter(|id| *id == fallback_id)
    })
    .await;
    engine.on_entry_fill(fill(fallback_id, dec!(49990))).await;

    let stored = wait_until(|| async {
        store
            .get_trade(&trade_id)
            .await
            .unwrap()
            .filter(|t| t.status == TradeStatus::Open)
    })
    .await;
    assert_eq!(stored.entry_price, Some(dec!(49990)));
    assert_eq!(gateway.maker_entries.lock().len(), 3);
    assert_eq!(gateway.market_entries.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn admission_caps_are_enforced() {
    let gateway = MockGateway::new();
    let mut cfg = test_config();
    cfg.strategy.max_open_trades = 2;
    cfg.strategy.max_trades_per_pair = 1;
    let (engine, _store, _registry) = make_engine(cfg, gateway.clone()).await;

    assert!(engine.on_signal(sig("BTCUSDT", dec!(50000))).await.is_some());
    // second trade on the same pair exceeds the per-pair cap
    assert!(engine.on_signal(sig("BTCUSDT", dec!(50000))).await.is_none());
    assert!(engine.on_signal(sig("ETHUSDT", dec!(3000))).await.is_some());
    // global cap reached
    assert!(engine.on_signal(sig("SOLUSDT", dec!(150))).await.is_none());

    assert_eq!(engine.open_count().await, 2);
    assert_eq!(engine.open_count_for("BTCUSDT").await, 1);
}

#[tokio::test(start_paused = true)]
async fn replayed_fill_for_closed_trade_is_a_noop() {
    let gateway = MockGateway::new();
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    let trade_id = engine.on_signal(sig("BTCUSDT", dec!(50000))).await.unwrap();
    let entry_id = wait_until(|| async {
        engine
            .trade_snapshot(&trade_id)
            .await
            .and_then(|t| t.entry_order_id)
    })
    .await;
    engine.on_entry_fill(fill(entry_id, dec!(50000))).await;
    let tp_id = engine
        .trade_snapshot(&trade_id)
        .await
        .unwrap()
        .tp_order_id
        .unwrap();

    engine.on_tp_fill(fill(tp_id, dec!(42500))).await;
    // duplicate and late callbacks change nothing
    engine.on_tp_fill(fill(tp_id, dec!(40000))).await;
    engine.on_sl_fill(fill(tp_id, dec!(40000))).await;

    let stored = store.get_trade(&trade_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TradeStatus::Closed);
    assert_eq!(stored.exit_price, Some(dec!(42500)));
    let tp_fills = store
        .get_trade_events(&trade_id)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.kind == EventKind::TpFill)
        .count();
    assert_eq!(tp_fills, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_limit_close_falls_back_to_market() {
    use chrono::{Duration as ChronoDuration, Utc};
    use short_bot::types::Trade;

    let gateway = MockGateway::new();
    *gateway.best_ask.lock() = dec!(100.5);
    *gateway.market_fill_price.lock() = dec!(101);
    let (engine, store, _registry) = make_engine(test_config(), gateway.clone()).await;

    // a position opened 25 hours ago, protected by live TP/SL orders
    let mut trade = Trade::new(sig("BTCUSDT", dec!(100)));
    trade.status = TradeStatus::Open;
    trade.entry_order_id = Some(1);
    trade.entry_price = Some(dec!(100));
    trade.entry_qty = Some(dec!(0.1));
    trade.entry_fill_ts = Some(Utc::now() - ChronoDuration::hours(25));
    trade.tp_order_id = Some(900);
    trade.sl_order_id = Some(901);
    store.save_trade(&trade).await.unwrap();

    gateway.positions.lock().push(short_bot::gateway::PositionInfo {
        symbol: "BTCUSDT".to_string(),
        position_amt: dec!(-0.1),
        entry_price: dec!(100),
    });
    gateway.open_order_ids.lock().extend([900, 901]);

    engine.reconcile(store.load_active_trades().await.unwrap()).await;
    assert_eq!(
        engine.trade_snapshot(&trade.trade_id).await.unwrap().status,
        TradeStatus::Open
    );

    // the sweeper picks the trade up on its next tick; the LIMIT close never
    // fills, so the market fallback ends the trade
    engine.start();
    let stored = wait_until(|| async {
        store
            .get_trade(&trade.trade_id)
            .await
            .unwrap()
            .filter(|t| t.status.is_terminal())
    })
    .await;
    engine.stop().await;

    assert_eq!(stored.status, TradeStatus::Closed);
    assert_eq!(stored.exit_kind, Some(ExitKind::Timeout));
    assert_eq!(stored.exit_price, Some(dec!(101)));
    // SHORT entered at 100, bought back at 101, qty 0.1
    assert_eq!(stored.pnl_usdt, Some(dec!(-0.1)));

    // both protective orders were cancelled before the close
    let cancelled = gateway.cancelled.lock();
    assert!(cancelled.contains(&900));
    assert!(cancelled.contains(&901));
    drop(cancelled);
    // one limit attempt at the ask, then one market close
    assert_eq!(gateway.limit_closes.lock().len(), 1);
    assert_eq!(gateway.limit_closes.lock()[0].2, dec!(100.5));
    assert_eq!(gateway.market_closes.lock().len(), 1);

    let kinds: Vec<EventKind> = store
        .get_trade_events(&trade.trade_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&EventKind::Timeout));
}
