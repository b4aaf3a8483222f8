//! Binance user-data stream: fill detection for entry, TP and SL orders.
//!
//! The stream connects with a listen key from the gateway, keeps it alive
//! with periodic PUTs, and reconnects with exponential backoff on any drop
//! (regenerating the listen key each time). `ORDER_TRADE_UPDATE` messages
//! whose order id is registered are classified and forwarded to the engine;
//! an id is delivered to at most one callback path and then forgotten.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tracing::{debug, info, warn};

use super::{GatewayError, OrderGateway, OrderUpdate};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Listen keys expire after 60 minutes without a keepalive.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25 * 60);

/// Errors from the user-data stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket connection failed: {0}")]
    Connection(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("connection timeout")]
    Timeout,

    #[error("stream ended unexpectedly")]
    StreamEnded,
}

/// Which leg a registered order id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillKind {
    Entry,
    Tp,
    Sl,
}

/// Events forwarded from the stream to the supervisor's dispatch loop.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    Disconnected { reason: String },
    Fill { kind: FillKind, update: OrderUpdate },
}

/// Shared registry of order ids the stream should watch.
///
/// The engine registers ids when it submits orders and unregisters them on
/// cancellation; the stream removes an id the moment it dispatches its fill.
#[derive(Debug, Default)]
pub struct OrderRegistry {
    entry: DashSet<i64>,
    tp: DashSet<i64>,
    sl: DashSet<i64>,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entry(&self, order_id: i64) {
        self.entry.insert(order_id);
    }

    pub fn register_tp(&self, order_id: i64) {
        self.tp.insert(order_id);
    }

    pub fn register_sl(&self, order_id: i64) {
        self.sl.insert(order_id);
    }

    /// Remove an id from every set.
    pub fn unregister(&self, order_id: i64) {
        self.entry.remove(&order_id);
        self.tp.remove(&order_id);
        self.sl.remove(&order_id);
    }

    /// Classify a filled order id, removing it from its set. An id belongs
    /// to at most one set; subsequent calls return `None`.
    pub fn take(&self, order_id: i64) -> Option<FillKind> {
        if self.entry.remove(&order_id).is_some() {
            return Some(FillKind::Entry);
        }
        if self.tp.remove(&order_id).is_some() {
            return Some(FillKind::Tp);
        }
        if self.sl.remove(&order_id).is_some() {
            return Some(FillKind::Sl);
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct UserDataMessage {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "o")]
    order: Option<RawOrderUpdate>,
}

#[derive(Debug, Deserialize)]
struct RawOrderUpdate {
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S", default)]
    side: String,
    #[serde(rename = "x", default)]
    exec_kind: String,
    #[serde(rename = "X", default)]
    status: String,
    #[serde(rename = "q", default)]
    qty: String,
    #[serde(rename = "ap", default)]
    avg_price: String,
    #[serde(rename = "L", default)]
    last_price: String,
}

impl RawOrderUpdate {
    fn into_update(self) -> OrderUpdate {
        OrderUpdate {
            order_id: self.order_id,
            symbol: self.symbol,
            side: self.side,
            exec_kind: self.exec_kind,
            status: self.status,
            qty: self.qty.parse().unwrap_or(Decimal::ZERO),
            avg_price: self.avg_price.parse().unwrap_or(Decimal::ZERO),
            last_price: self.last_price.parse().unwrap_or(Decimal::ZERO),
        }
    }
}

/// User-data stream reader with automatic reconnection.
pub struct UserStream {
    gateway: Arc<dyn OrderGateway>,
    registry: Arc<OrderRegistry>,
    ws_url: String,
    events: mpsc::Sender<StreamEvent>,
}

impl UserStream {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        registry: Arc<OrderRegistry>,
        ws_url: String,
        events: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self {
            gateway,
            registry,
            ws_url,
            events,
        }
    }

    /// Run until the shutdown signal fires. Reconnects with exponential
    /// backoff, acquiring a fresh listen key each time.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            if shutdown.try_recv().is_ok() {
                info!("user stream: shutdown before connect");
                return;
            }

            match self.run_connection(&mut shutdown).await {
                Ok(()) => {
                    info!("user stream: clean shutdown");
                    return;
                }
                Err(e) => {
                    let _ = self
                        .events
                        .send(StreamEvent::Disconnected {
                            reason: e.to_string(),
                        })
                        .await;
                    warn!(error = %e, delay = ?reconnect_delay, "user stream disconnected, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => {}
                        _ = shutdown.recv() => {
                            info!("user stream: shutdown during reconnect delay");
                            return;
                        }
                    }
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }

    async fn run_connection(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        let listen_key = self.gateway.listen_key().await?;
        let url = format!("{}/ws/{}", self.ws_url, listen_key);
        info!("user stream connecting");

        let (ws_stream, _response) = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await
        {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(StreamError::Connection(e.to_string())),
            Err(_) => return Err(StreamError::Timeout),
        };
        info!("user stream connected");
        let _ = self.events.send(StreamEvent::Connected).await;

        let (mut write, mut read) = ws_stream.split();
        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately; skip it

        let result = loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text).await,
                        Some(Ok(Message::Ping(data))) => {
                            debug!("user stream ping");
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "user stream closed by server");
                            break Err(StreamError::StreamEnded);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(StreamError::WebSocket(e)),
                        None => break Err(StreamError::StreamEnded),
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.gateway.keepalive_listen_key(&listen_key).await {
                        warn!(error = %e, "listen key keepalive failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("user stream: shutdown signal received");
                    break Ok(());
                }
            }
        };

        if let Err(e) = self.gateway.close_listen_key(&listen_key).await {
            debug!(error = %e, "closing listen key failed");
        }
        result
    }

    async fn handle_message(&self, text: &str) {
        let msg: UserDataMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable stream message");
                return;
            }
        };
        if msg.event_type != "ORDER_TRADE_UPDATE" {
            return;
        }
        let Some(raw) = msg.order else {
            return;
        };
        let update = raw.into_update();
        if update.exec_kind != "TRADE" || update.status != "FILLED" {
            return;
        }
        info!(
            order_id = update.order_id,
            symbol = %update.symbol,
            side = %update.side,
            price = %update.fill_price(),
            "order filled"
        );
        match self.registry.take(update.order_id) {
            Some(kind) => {
                if self.events.send(StreamEvent::Fill { kind, update }).await.is_err() {
                    warn!("fill dispatch channel closed");
                }
            }
            None => {
                debug!(order_id = update.order_id, "fill for unregistered order");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_classifies_each_id_once() {
        let registry = OrderRegistry::new();
        registry.register_entry(1);
        registry.register_tp(2);
        registry.register_sl(3);

        assert_eq!(registry.take(1), Some(FillKind::Entry));
        assert_eq!(registry.take(1), None); // removed after dispatch
        assert_eq!(registry.take(2), Some(FillKind::Tp));
        assert_eq!(registry.take(3), Some(FillKind::Sl));
        assert_eq!(registry.take(99), None);
    }

    #[test]
    fn unregister_clears_all_sets() {
        let registry = OrderRegistry::new();
        registry.register_entry(7);
        registry.unregister(7);
        assert_eq!(registry.take(7), None);
    }

    #[test]
    fn parses_order_trade_update() {
        let text = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "E": 1700000000000,
            "o": {
                "i": 12345,
                "s": "BTCUSDT",
                "S": "SELL",
                "x": "TRADE",
                "X": "FILLED",
                "q": "0.002",
                "ap": "50000.5",
                "L": "50000.5"
            }
        }"#;
        let msg: UserDataMessage = serde_json::from_str(text).unwrap();
        assert_eq!(msg.event_type, "ORDER_TRADE_UPDATE");
        let update = msg.order.unwrap().into_update();
        assert_eq!(update.order_id, 12345);
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.status, "FILLED");
        assert_eq!(update.fill_price().to_string(), "50000.5");
    }

    #[test]
    fn non_fill_updates_are_distinguishable() {
        let text = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "o": {"i": 1, "s": "BTCUSDT", "S": "SELL", "x": "NEW", "X": "NEW"}
        }"#;
        let msg: UserDataMessage = serde_json::from_str(text).unwrap();
        let update = msg.order.unwrap().into_update();
        assert_ne!(update.exec_kind, "TRADE");
        assert_ne!(update.status, "FILLED");
    }
}
