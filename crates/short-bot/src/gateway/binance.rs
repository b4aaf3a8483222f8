//! Binance USD-M futures REST gateway.
//!
//! TP and SL are placed through the conditional algo-order endpoint
//! (`/fapi/v1/algoOrder`, `algoType=CONDITIONAL`) so they live server-side
//! and survive process restarts. `cancel` first tries the regular order
//! endpoint and falls back to the algo endpoint on -2011.
//!
//! Signed requests carry an HMAC-SHA256 signature over the query string,
//! keyed by the API secret. Transient HTTP failures (429, 5xx) and transport
//! errors are retried with exponential backoff before surfacing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config::BotConfig;

use super::{
    AlgoAck, GatewayError, OrderAck, OrderGateway, OrderInfo, PairFilters, PositionInfo,
    PriceMatch, SlOutcome,
};

const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_SECS: f64 = 1.5;

/// Binance error code: margin type already set.
const CODE_MARGIN_ALREADY_SET: i64 = -4046;
/// Binance error code: unknown order.
const CODE_UNKNOWN_ORDER: i64 = -2011;
/// Binance error code: order would immediately trigger.
const CODE_WOULD_TRIGGER: i64 = -2021;

type HmacSha256 = Hmac<Sha256>;

/// Round a quantity down to the nearest step multiple.
pub(crate) fn round_down_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

/// Round a price to the nearest tick.
pub(crate) fn round_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return value;
    }
    (value / tick).round() * tick
}

/// TP trigger for a short: `entry * (1 - tp_pct/100)`, tick-rounded.
pub(crate) fn tp_trigger_price(entry: Decimal, tp_pct: Decimal, tick: Decimal) -> Decimal {
    round_tick(entry * (Decimal::ONE - tp_pct / Decimal::ONE_HUNDRED), tick)
}

/// SL trigger for a short: `entry * (1 + sl_pct/100)`, tick-rounded.
pub(crate) fn sl_trigger_price(entry: Decimal, sl_pct: Decimal, tick: Decimal) -> Decimal {
    round_tick(entry * (Decimal::ONE + sl_pct / Decimal::ONE_HUNDRED), tick)
}

/// Time-in-force for the maker entry. `LIMIT` rests a regular GTC maker
/// order; the default `LIMIT_GTX` is post-only and gets rejected by the
/// exchange if it would cross the book.
pub(crate) fn entry_time_in_force(order_type: &str) -> &'static str {
    if order_type == "LIMIT" {
        "GTC"
    } else {
        "GTX"
    }
}

/// Largest quantity for `capital` at `price` that satisfies the pair filters.
pub(crate) fn quantity_for(
    pair: &str,
    capital: Decimal,
    price: Decimal,
    filters: &PairFilters,
) -> Result<Decimal, GatewayError> {
    if price <= Decimal::ZERO {
        return Err(GatewayError::Config(format!(
            "{pair}: non-positive reference price {price}"
        )));
    }
    let qty = round_down_step(capital / price, filters.step_size);
    if qty < filters.min_qty {
        return Err(GatewayError::Config(format!(
            "{pair}: qty={qty} below minQty={}; raise capital_per_trade",
            filters.min_qty
        )));
    }
    let notional = qty * price;
    if notional < filters.min_notional {
        return Err(GatewayError::Config(format!(
            "{pair}: notional={notional} below minNotional={}; raise capital_per_trade",
            filters.min_notional
        )));
    }
    Ok(qty)
}

/// Production [`OrderGateway`] over the Binance USD-M futures REST API.
pub struct BinanceGateway {
    http: reqwest::Client,
    base_url: String,
    api_secret: String,
    capital_per_trade: Decimal,
    tp_pct: Decimal,
    sl_pct: Decimal,
    entry_tif: &'static str,
    filters_cache: DashMap<String, PairFilters>,
}

impl BinanceGateway {
    pub fn new(cfg: &BotConfig) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&cfg.exchange.api_key)
            .map_err(|e| GatewayError::Config(format!("invalid api key: {e}")))?;
        headers.insert("X-MBX-APIKEY", key);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.exchange.base_url.trim_end_matches('/').to_string(),
            api_secret: cfg.exchange.api_secret.clone(),
            capital_per_trade: cfg.strategy.capital_per_trade,
            tp_pct: cfg.strategy.tp_pct,
            sl_pct: cfg.strategy.sl_pct,
            entry_tif: entry_time_in_force(&cfg.entry.order_type),
            filters_cache: DashMap::new(),
        })
    }

    fn sign(&self, mut params: Vec<(&'static str, String)>) -> Result<String, GatewayError> {
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = encode_params(&params);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| GatewayError::Config(format!("invalid api secret: {e}")))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{query}&signature={signature}"))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&'static str, String)>,
        signed: bool,
    ) -> Result<Value, GatewayError> {
        let query = if signed {
            self.sign(params)?
        } else {
            encode_params(&params)
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut last_err = GatewayError::Transport("request not attempted".to_string());
        for attempt in 1..=MAX_RETRIES {
            let started = std::time::Instant::now();
            match self.http.request(method.clone(), url.as_str()).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body: Value = resp.json().await.unwrap_or(Value::Null);
                    debug!(
                        %method,
                        path,
                        status,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "exchange request"
                    );
                    if RETRY_STATUSES.contains(&status) {
                        last_err = GatewayError::Transport(format!("http {status}"));
                    } else if status >= 400 {
                        let code = body
                            .get("code")
                            .and_then(Value::as_i64)
                            .unwrap_or(status as i64);
                        let message = body
                            .get("msg")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown exchange error")
                            .to_string();
                        return Err(GatewayError::Api { code, message });
                    } else {
                        return Ok(body);
                    }
                }
                Err(e) => {
                    last_err = GatewayError::Transport(e.to_string());
                }
            }
            if attempt < MAX_RETRIES {
                let wait = BACKOFF_BASE_SECS.powi(attempt as i32);
                warn!(path, attempt, wait_secs = wait, "retrying exchange request");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
        }
        Err(last_err)
    }

    async fn get(
        &self,
        path: &str,
        params: Vec<(&'static str, String)>,
        signed: bool,
    ) -> Result<Value, GatewayError> {
        self.request(Method::GET, path, params, signed).await
    }

    async fn post(
        &self,
        path: &str,
        params: Vec<(&'static str, String)>,
        signed: bool,
    ) -> Result<Value, GatewayError> {
        self.request(Method::POST, path, params, signed).await
    }

    async fn delete(
        &self,
        path: &str,
        params: Vec<(&'static str, String)>,
    ) -> Result<Value, GatewayError> {
        self.request(Method::DELETE, path, params, true).await
    }

    async fn book_ticker(&self, pair: &str) -> Result<Value, GatewayError> {
        self.get(
            "/fapi/v1/ticker/bookTicker",
            vec![("symbol", pair.to_string())],
            false,
        )
        .await
    }

    fn order_ack(body: &Value) -> Result<OrderAck, GatewayError> {
        let order_id = int_field(body, "orderId")
            .or_else(|_| int_field(body, "algoId"))?;
        Ok(OrderAck {
            order_id,
            status: body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("NEW")
                .to_string(),
            avg_price: opt_dec_field(body, "avgPrice").filter(|p| !p.is_zero()),
        })
    }

    fn order_info(body: &Value) -> Result<OrderInfo, GatewayError> {
        let order_id = int_field(body, "orderId")
            .or_else(|_| int_field(body, "algoId"))?;
        Ok(OrderInfo {
            order_id,
            status: body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            avg_price: opt_dec_field(body, "avgPrice"),
            price: opt_dec_field(body, "price"),
        })
    }
}

#[async_trait]
impl OrderGateway for BinanceGateway {
    async fn balance(&self) -> Result<Decimal, GatewayError> {
        let body = self.get("/fapi/v2/balance", vec![], true).await?;
        let entries = body
            .as_array()
            .ok_or_else(|| GatewayError::Decode("balance: expected array".to_string()))?;
        for entry in entries {
            if entry.get("asset").and_then(Value::as_str) == Some("USDT") {
                return dec_field(entry, "availableBalance");
            }
        }
        Ok(Decimal::ZERO)
    }

    async fn exchange_info(&self, pair: &str) -> Result<PairFilters, GatewayError> {
        if let Some(cached) = self.filters_cache.get(pair) {
            return Ok(cached.clone());
        }
        let body = self.get("/fapi/v1/exchangeInfo", vec![], false).await?;
        let symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::Decode("exchangeInfo: missing symbols".to_string()))?;
        for sym in symbols {
            if sym.get("symbol").and_then(Value::as_str) != Some(pair) {
                continue;
            }
            let empty = Vec::new();
            let filter_list = sym.get("filters").and_then(Value::as_array).unwrap_or(&empty);
            let find = |kind: &str, key: &str, default: &str| -> Decimal {
                filter_list
                    .iter()
                    .find(|f| f.get("filterType").and_then(Value::as_str) == Some(kind))
                    .and_then(|f| f.get(key))
                    .and_then(Value::as_str)
                    .unwrap_or(default)
                    .parse()
                    .unwrap_or(Decimal::ZERO)
            };
            let filters = PairFilters {
                tick_size: find("PRICE_FILTER", "tickSize", "0.0001"),
                step_size: find("LOT_SIZE", "stepSize", "0.001"),
                min_qty: find("LOT_SIZE", "minQty", "0.001"),
                min_notional: find("MIN_NOTIONAL", "notional", "5"),
            };
            debug!(pair, ?filters, "exchange info cached");
            self.filters_cache.insert(pair.to_string(), filters.clone());
            return Ok(filters);
        }
        Err(GatewayError::Config(format!(
            "{pair}: symbol not found in exchange info"
        )))
    }

    async fn set_leverage(&self, pair: &str, leverage: u32) -> Result<(), GatewayError> {
        info!(pair, leverage, "setting leverage");
        self.post(
            "/fapi/v1/leverage",
            vec![
                ("symbol", pair.to_string()),
                ("leverage", leverage.to_string()),
            ],
            true,
        )
        .await?;
        Ok(())
    }

    async fn set_margin_type(&self, pair: &str) -> Result<(), GatewayError> {
        let result = self
            .post(
                "/fapi/v1/marginType",
                vec![
                    ("symbol", pair.to_string()),
                    ("marginType", "ISOLATED".to_string()),
                ],
                true,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.api_code() == Some(CODE_MARGIN_ALREADY_SET) => {
                debug!(pair, "margin type already isolated");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn best_bid(&self, pair: &str) -> Result<Decimal, GatewayError> {
        let body = self.book_ticker(pair).await?;
        dec_field(&body, "bidPrice")
    }

    async fn best_ask(&self, pair: &str) -> Result<Decimal, GatewayError> {
        let body = self.book_ticker(pair).await?;
        dec_field(&body, "askPrice")
    }

    async fn mark_price(&self, pair: &str) -> Result<Decimal, GatewayError> {
        let body = self
            .get(
                "/fapi/v1/premiumIndex",
                vec![("symbol", pair.to_string())],
                false,
            )
            .await?;
        dec_field(&body, "markPrice")
    }

    async fn calc_quantity(&self, pair: &str, price: Decimal) -> Result<Decimal, GatewayError> {
        let filters = self.exchange_info(pair).await?;
        quantity_for(pair, self.capital_per_trade, price, &filters)
    }

    async fn open_short_maker(
        &self,
        pair: &str,
        qty: Decimal,
        price_match: PriceMatch,
    ) -> Result<OrderAck, GatewayError> {
        info!(pair, %qty, %price_match, time_in_force = self.entry_tif, "submitting maker short");
        let body = self
            .post(
                "/fapi/v1/order",
                vec![
                    ("symbol", pair.to_string()),
                    ("side", "SELL".to_string()),
                    ("positionSide", "BOTH".to_string()),
                    ("type", "LIMIT".to_string()),
                    ("timeInForce", self.entry_tif.to_string()),
                    ("priceMatch", price_match.as_str().to_string()),
                    ("quantity", qty.to_string()),
                ],
                true,
            )
            .await?;
        Self::order_ack(&body)
    }

    async fn open_short_market(&self, pair: &str, qty: Decimal) -> Result<OrderAck, GatewayError> {
        info!(pair, %qty, "submitting market short");
        let body = self
            .post(
                "/fapi/v1/order",
                vec![
                    ("symbol", pair.to_string()),
                    ("side", "SELL".to_string()),
                    ("positionSide", "BOTH".to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", qty.to_string()),
                ],
                true,
            )
            .await?;
        Self::order_ack(&body)
    }

    async fn place_tp(
        &self,
        pair: &str,
        qty: Decimal,
        entry_price: Decimal,
    ) -> Result<AlgoAck, GatewayError> {
        let filters = self.exchange_info(pair).await?;
        let trigger = tp_trigger_price(entry_price, self.tp_pct, filters.tick_size);
        info!(pair, %entry_price, %trigger, "placing conditional take-profit");
        let body = self
            .post(
                "/fapi/v1/algoOrder",
                vec![
                    ("symbol", pair.to_string()),
                    ("side", "BUY".to_string()),
                    ("positionSide", "BOTH".to_string()),
                    ("type", "TAKE_PROFIT".to_string()),
                    ("algoType", "CONDITIONAL".to_string()),
                    ("quantity", qty.to_string()),
                    ("triggerPrice", trigger.to_string()),
                    ("priceMatch", "OPPONENT".to_string()),
                    ("timeInForce", "GTC".to_string()),
                    ("workingType", "MARK_PRICE".to_string()),
                    ("reduceOnly", "true".to_string()),
                    ("priceProtect", "true".to_string()),
                ],
                true,
            )
            .await?;
        let order_id = int_field(&body, "algoId").or_else(|_| int_field(&body, "orderId"))?;
        Ok(AlgoAck {
            order_id,
            trigger_price: trigger,
        })
    }

    async fn place_sl(
        &self,
        pair: &str,
        qty: Decimal,
        entry_price: Decimal,
    ) -> Result<SlOutcome, GatewayError> {
        let filters = self.exchange_info(pair).await?;
        let trigger = sl_trigger_price(entry_price, self.sl_pct, filters.tick_size);
        info!(pair, %entry_price, %trigger, "placing conditional stop-market");
        let result = self
            .post(
                "/fapi/v1/algoOrder",
                vec![
                    ("symbol", pair.to_string()),
                    ("side", "BUY".to_string()),
                    ("positionSide", "BOTH".to_string()),
                    ("type", "STOP_MARKET".to_string()),
                    ("algoType", "CONDITIONAL".to_string()),
                    ("quantity", qty.to_string()),
                    ("triggerPrice", trigger.to_string()),
                    ("workingType", "MARK_PRICE".to_string()),
                    ("reduceOnly", "true".to_string()),
                    ("priceProtect", "true".to_string()),
                ],
                true,
            )
            .await;
        match result {
            Ok(body) => {
                let order_id =
                    int_field(&body, "algoId").or_else(|_| int_field(&body, "orderId"))?;
                Ok(SlOutcome::Placed(AlgoAck {
                    order_id,
                    trigger_price: trigger,
                }))
            }
            Err(e) if e.api_code() == Some(CODE_WOULD_TRIGGER) => {
                warn!(pair, %trigger, "stop trigger already crossed at placement");
                Ok(SlOutcome::TriggerAlreadyCrossed)
            }
            Err(e) => Err(e),
        }
    }

    async fn close_limit(
        &self,
        pair: &str,
        qty: Decimal,
        price: Decimal,
    ) -> Result<OrderAck, GatewayError> {
        let filters = self.exchange_info(pair).await?;
        let price = round_tick(price, filters.tick_size);
        info!(pair, %qty, %price, "submitting reduce-only limit close");
        let body = self
            .post(
                "/fapi/v1/order",
                vec![
                    ("symbol", pair.to_string()),
                    ("side", "BUY".to_string()),
                    ("positionSide", "BOTH".to_string()),
                    ("type", "LIMIT".to_string()),
                    ("timeInForce", "GTC".to_string()),
                    ("quantity", qty.to_string()),
                    ("price", price.to_string()),
                    ("reduceOnly", "true".to_string()),
                ],
                true,
            )
            .await?;
        Self::order_ack(&body)
    }

    async fn close_bbo(&self, pair: &str, qty: Decimal) -> Result<OrderAck, GatewayError> {
        info!(pair, %qty, "submitting reduce-only BBO close");
        let body = self
            .post(
                "/fapi/v1/order",
                vec![
                    ("symbol", pair.to_string()),
                    ("side", "BUY".to_string()),
                    ("positionSide", "BOTH".to_string()),
                    ("type", "LIMIT".to_string()),
                    ("timeInForce", "GTC".to_string()),
                    ("priceMatch", "OPPONENT".to_string()),
                    ("quantity", qty.to_string()),
                    ("reduceOnly", "true".to_string()),
                ],
                true,
            )
            .await?;
        Self::order_ack(&body)
    }

    async fn close_market(&self, pair: &str, qty: Decimal) -> Result<OrderAck, GatewayError> {
        warn!(pair, %qty, "submitting reduce-only market close");
        let body = self
            .post(
                "/fapi/v1/order",
                vec![
                    ("symbol", pair.to_string()),
                    ("side", "BUY".to_string()),
                    ("positionSide", "BOTH".to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", qty.to_string()),
                    ("reduceOnly", "true".to_string()),
                ],
                true,
            )
            .await?;
        Self::order_ack(&body)
    }

    async fn cancel(&self, pair: &str, order_id: i64) -> Result<(), GatewayError> {
        info!(pair, order_id, "cancelling order");
        let result = self
            .delete(
                "/fapi/v1/order",
                vec![
                    ("symbol", pair.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.api_code() == Some(CODE_UNKNOWN_ORDER) => {
                debug!(pair, order_id, "not a regular order, trying algo endpoint");
                let algo = self
                    .delete(
                        "/fapi/v1/algoOrder",
                        vec![
                            ("symbol", pair.to_string()),
                            ("algoId", order_id.to_string()),
                        ],
                    )
                    .await;
                match algo {
                    Ok(_) => Ok(()),
                    Err(e) if e.api_code() == Some(CODE_UNKNOWN_ORDER) => {
                        debug!(pair, order_id, "order unknown on both endpoints");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order(&self, pair: &str, order_id: i64) -> Result<OrderInfo, GatewayError> {
        let body = self
            .get(
                "/fapi/v1/order",
                vec![
                    ("symbol", pair.to_string()),
                    ("orderId", order_id.to_string()),
                ],
                true,
            )
            .await?;
        Self::order_info(&body)
    }

    async fn open_orders(&self, pair: &str) -> Result<Vec<OrderInfo>, GatewayError> {
        let body = self
            .get("/fapi/v1/openOrders", vec![("symbol", pair.to_string())], true)
            .await?;
        let list = body
            .as_array()
            .ok_or_else(|| GatewayError::Decode("openOrders: expected array".to_string()))?;
        list.iter().map(Self::order_info).collect()
    }

    async fn open_algo_orders(&self, pair: &str) -> Result<Vec<OrderInfo>, GatewayError> {
        let result = self
            .get(
                "/fapi/v1/openAlgoOrders",
                vec![("symbol", pair.to_string())],
                true,
            )
            .await;
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                debug!(pair, error = %e, "open algo orders unavailable");
                return Ok(Vec::new());
            }
        };
        let list = match &body {
            Value::Array(list) => list.clone(),
            other => other
                .get("orders")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        };
        Ok(list.iter().filter_map(|o| Self::order_info(o).ok()).collect())
    }

    async fn positions(&self) -> Result<Vec<PositionInfo>, GatewayError> {
        let body = self.get("/fapi/v2/positionRisk", vec![], true).await?;
        let list = body
            .as_array()
            .ok_or_else(|| GatewayError::Decode("positionRisk: expected array".to_string()))?;
        let mut out = Vec::new();
        for p in list {
            let amt = opt_dec_field(p, "positionAmt").unwrap_or(Decimal::ZERO);
            if amt.is_zero() {
                continue;
            }
            out.push(PositionInfo {
                symbol: p
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                position_amt: amt,
                entry_price: opt_dec_field(p, "entryPrice").unwrap_or(Decimal::ZERO),
            });
        }
        Ok(out)
    }

    async fn listen_key(&self) -> Result<String, GatewayError> {
        let body = self.post("/fapi/v1/listenKey", vec![], false).await?;
        let key = body
            .get("listenKey")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Decode("listenKey missing".to_string()))?;
        info!("listen key acquired");
        Ok(key.to_string())
    }

    async fn keepalive_listen_key(&self, key: &str) -> Result<(), GatewayError> {
        self.request(
            Method::PUT,
            "/fapi/v1/listenKey",
            vec![("listenKey", key.to_string())],
            false,
        )
        .await?;
        debug!("listen key renewed");
        Ok(())
    }

    async fn close_listen_key(&self, key: &str) -> Result<(), GatewayError> {
        self.request(
            Method::DELETE,
            "/fapi/v1/listenKey",
            vec![("listenKey", key.to_string())],
            false,
        )
        .await?;
        Ok(())
    }
}

fn encode_params(params: &[(&'static str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn dec_field(v: &Value, key: &str) -> Result<Decimal, GatewayError> {
    opt_dec_field(v, key)
        .ok_or_else(|| GatewayError::Decode(format!("missing or non-numeric field {key:?}")))
}

fn opt_dec_field(v: &Value, key: &str) -> Option<Decimal> {
    match v.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn int_field(v: &Value, key: &str) -> Result<i64, GatewayError> {
    let field = v
        .get(key)
        .ok_or_else(|| GatewayError::Decode(format!("missing field {key:?}")))?;
    match field {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| GatewayError::Decode(format!("non-integer field {key:?}"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| GatewayError::Decode(format!("non-integer field {key:?}"))),
        _ => Err(GatewayError::Decode(format!("non-integer field {key:?}"))),
    }
}
