//! Composition root: wires the store, gateway, engine, user-data stream and
//! signal intake together, and owns the ordered startup/shutdown sequences.
//!
//! Startup: store -> gateway (credential check) -> engine -> reconcile ->
//! pair setup -> user stream -> sweeper -> signal intake -> STARTUP event.
//!
//! Shutdown runs the stages strictly in order, each completing before the
//! next: intake, engine (opening tasks clean up after themselves), stream,
//! then the SHUTDOWN event and a store flush. Live OPEN trades stay
//! protected server-side by their TP/SL orders.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::BotConfig;
use crate::engine::Engine;
use crate::gateway::binance::BinanceGateway;
use crate::gateway::stream::{FillKind, OrderRegistry, StreamEvent, UserStream};
use crate::gateway::OrderGateway;
use crate::signals::SignalIntake;
use crate::store::StateStore;
use crate::types::{EventKind, Signal};

/// Run the bot until a stop signal arrives.
pub async fn run(cfg: BotConfig) -> Result<()> {
    let cfg = Arc::new(cfg);
    info!(mode = %cfg.strategy.mode, "short-bot starting");

    // Durable state first: nothing else may act before it is writable.
    let store = StateStore::open(cfg.store.path.clone())
        .await
        .context("failed to open state store")?;

    // Gateway; a balance call verifies credentials before anything trades.
    let gateway: Arc<dyn OrderGateway> =
        Arc::new(BinanceGateway::new(&cfg).context("failed to build exchange gateway")?);
    let balance = gateway
        .balance()
        .await
        .context("exchange credential check failed")?;
    info!(%balance, "exchange credentials verified");

    let registry = Arc::new(OrderRegistry::new());
    let engine = Engine::new(
        Arc::clone(&cfg),
        Arc::clone(&gateway),
        store.clone(),
        Arc::clone(&registry),
    );

    // Recover in-flight commitments from the store + exchange order book.
    let active = store
        .load_active_trades()
        .await
        .context("failed to load active trades")?;
    let active_pairs: Vec<String> = {
        let mut seen = HashSet::new();
        active
            .iter()
            .filter(|t| seen.insert(t.pair.clone()))
            .map(|t| t.pair.clone())
            .collect()
    };
    engine.reconcile(active).await;

    // Leverage and isolated margin for every pair we still hold; both calls
    // are idempotent on the exchange side.
    for pair in &active_pairs {
        setup_pair(gateway.as_ref(), pair, cfg.strategy.leverage).await;
    }

    // User-data stream and its dispatch loop.
    let (stream_tx, stream_rx) = mpsc::channel::<StreamEvent>(64);
    let (stream_shutdown_tx, stream_shutdown_rx) = broadcast::channel(1);
    let stream = UserStream::new(
        Arc::clone(&gateway),
        Arc::clone(&registry),
        cfg.exchange.ws_url.clone(),
        stream_tx,
    );
    let stream_handle = tokio::spawn(stream.run(stream_shutdown_rx));
    let dispatch_handle = tokio::spawn(dispatch_stream(Arc::clone(&engine), stream_rx));

    // Timeout sweeper.
    engine.start();

    // Signal intake and its dispatch loop.
    let (signal_tx, signal_rx) = mpsc::channel::<Signal>(16);
    let (intake_shutdown_tx, intake_shutdown_rx) = broadcast::channel(1);
    let intake = SignalIntake::new(&cfg, signal_tx);
    let intake_handle = tokio::spawn(intake.run(intake_shutdown_rx));
    let signal_dispatch_handle = tokio::spawn(dispatch_signals(
        Arc::clone(&engine),
        Arc::clone(&gateway),
        Arc::clone(&cfg),
        signal_rx,
    ));

    engine
        .emit(
            EventKind::Startup,
            None,
            json!({
                "mode": cfg.strategy.mode,
                "max_open_trades": cfg.strategy.max_open_trades,
                "capital_per_trade": cfg.strategy.capital_per_trade,
                "leverage": cfg.strategy.leverage,
                "tp_pct": cfg.strategy.tp_pct,
                "sl_pct": cfg.strategy.sl_pct,
            }),
        )
        .await;
    info!("system ready; waiting for signals");

    wait_for_shutdown().await?;
    info!("stop signal received; shutting down");

    // 1. No new signals.
    let _ = intake_shutdown_tx.send(());
    let _ = intake_handle.await;
    let _ = signal_dispatch_handle.await;

    // 2. Observer surface: external dashboards hold event-broadcast
    //    subscriptions which lapse with the engine below.

    // 3. Engine: sweeper and opening tasks, each cleaning up its own order.
    engine.stop().await;

    // 4. User-data stream (closes its listen key on the way out).
    let _ = stream_shutdown_tx.send(());
    let _ = stream_handle.await;
    let _ = dispatch_handle.await;

    // 5. Gateway transport closes with its last reference.

    // 6. Final event, then flush the journal.
    engine
        .emit(
            EventKind::Shutdown,
            None,
            json!({"open_trades": engine.open_count().await}),
        )
        .await;
    store.flush().await.context("final store flush failed")?;
    info!("shutdown complete");
    Ok(())
}

/// Route classified stream events into the engine, preserving stream order.
async fn dispatch_stream(engine: Arc<Engine>, mut rx: mpsc::Receiver<StreamEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Connected => {
                engine.emit(EventKind::WsConnect, None, json!({})).await;
            }
            StreamEvent::Disconnected { reason } => {
                engine
                    .emit(EventKind::WsDisconnect, None, json!({"reason": reason}))
                    .await;
            }
            StreamEvent::Fill { kind, update } => match kind {
                FillKind::Entry => engine.on_entry_fill(update).await,
                FillKind::Tp => engine.on_tp_fill(update).await,
                FillKind::Sl => engine.on_sl_fill(update).await,
            },
        }
    }
}

/// Configure each pair on first sight, then admit the signal.
async fn dispatch_signals(
    engine: Arc<Engine>,
    gateway: Arc<dyn OrderGateway>,
    cfg: Arc<BotConfig>,
    mut rx: mpsc::Receiver<Signal>,
) {
    let mut configured: HashSet<String> = HashSet::new();
    while let Some(sig) = rx.recv().await {
        if configured.insert(sig.pair.clone()) {
            setup_pair(gateway.as_ref(), &sig.pair, cfg.strategy.leverage).await;
        }
        engine.on_signal(sig).await;
    }
}

/// Isolated margin + leverage for a pair. Failures are warnings: the entry
/// order itself will surface anything fatal.
async fn setup_pair(gateway: &dyn OrderGateway, pair: &str, leverage: u32) {
    if let Err(e) = gateway.set_margin_type(pair).await {
        warn!(pair, error = %e, "set_margin_type failed");
    }
    match gateway.set_leverage(pair, leverage).await {
        Ok(()) => info!(pair, leverage, "leverage configured"),
        Err(e) => warn!(pair, error = %e, "set_leverage failed"),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }

    Ok(())
}
