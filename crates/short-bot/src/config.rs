//! Configuration for short-bot.
//!
//! Loaded from a TOML file with environment variable overrides for
//! credentials. Every tunable the engine reads lives here; nothing is
//! hardcoded in the trading paths.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub exchange: ExchangeConfig,
    pub strategy: StrategyConfig,
    pub signals: SignalsConfig,
    pub entry: EntryConfig,
    pub exit: ExitConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub observer: ObserverConfig,
}

/// Exchange connectivity and credentials.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub api_secret: String,
    /// REST base URL, e.g. `https://fapi.binance.com`.
    pub base_url: String,
    /// User-data stream base URL; derived from `base_url` when unset.
    pub ws_url: String,
}

/// Strategy parameters. The engine is short-only; `mode` exists so a config
/// written for a different mode fails validation instead of trading.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub mode: String,
    pub capital_per_trade: Decimal,
    pub max_open_trades: usize,
    pub tp_pct: Decimal,
    pub sl_pct: Decimal,
    pub timeout_hours: f64,
    pub top_n: u32,
    pub leverage: u32,
    pub min_momentum_pct: f64,
    pub min_vol_ratio: f64,
    pub min_trades_ratio: f64,
    pub allowed_quintiles: Vec<u32>,
    pub max_trades_per_pair: usize,
}

/// Signal-file intake parameters.
#[derive(Debug, Clone)]
pub struct SignalsConfig {
    pub file_path: String,
    pub poll_interval_seconds: u64,
    pub max_signal_age_minutes: f64,
}

/// Entry chase-loop parameters.
#[derive(Debug, Clone)]
pub struct EntryConfig {
    /// `LIMIT_GTX` posts the maker entry post-only; `LIMIT` rests it GTC.
    pub order_type: String,
    pub chase_interval_seconds: u64,
    pub chase_timeout_seconds: u64,
    pub max_chase_attempts: u32,
    pub market_fallback: bool,
}

/// Timeout-exit parameters.
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// `LIMIT`, `BBO` or `MARKET`.
    pub timeout_order_type: String,
    pub timeout_chase_seconds: u64,
    pub timeout_market_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

/// Read-only observer surface (external dashboard subscribes to the event
/// broadcast; the bot itself serves nothing).
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides for credentials.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("BINANCE_API_KEY") {
            self.exchange.api_key = key;
        }
        if let Ok(secret) = std::env::var("BINANCE_API_SECRET") {
            self.exchange.api_secret = secret;
        }
    }

    /// Validate configuration; errors here abort startup with exit code 1.
    pub fn validate(&self) -> Result<()> {
        if self.exchange.api_key.is_empty() {
            bail!("exchange.api_key is required (or BINANCE_API_KEY)");
        }
        if self.exchange.api_secret.is_empty() {
            bail!("exchange.api_secret is required (or BINANCE_API_SECRET)");
        }
        if self.exchange.base_url.is_empty() {
            bail!("exchange.base_url is required");
        }
        if self.strategy.mode != "short" {
            bail!("strategy.mode must be \"short\" (got {:?})", self.strategy.mode);
        }
        if self.strategy.capital_per_trade <= Decimal::ZERO {
            bail!("strategy.capital_per_trade must be positive");
        }
        if self.strategy.tp_pct <= Decimal::ZERO || self.strategy.sl_pct <= Decimal::ZERO {
            bail!("strategy.tp_pct and strategy.sl_pct must be positive");
        }
        if self.strategy.max_open_trades == 0 {
            bail!("strategy.max_open_trades must be at least 1");
        }
        if self.strategy.max_trades_per_pair == 0 {
            bail!("strategy.max_trades_per_pair must be at least 1");
        }
        if self.strategy.leverage == 0 {
            bail!("strategy.leverage must be at least 1");
        }
        if self.signals.file_path.is_empty() {
            bail!("signals.file_path is required");
        }
        if self.entry.max_chase_attempts == 0 {
            bail!("entry.max_chase_attempts must be at least 1");
        }
        match self.entry.order_type.as_str() {
            "LIMIT_GTX" | "LIMIT" => {}
            other => bail!("entry.order_type must be LIMIT_GTX or LIMIT (got {other:?})"),
        }
        match self.exit.timeout_order_type.as_str() {
            "LIMIT" | "BBO" | "MARKET" => {}
            other => bail!("exit.timeout_order_type must be LIMIT, BBO or MARKET (got {other:?})"),
        }
        if self.store.path.is_empty() {
            bail!("store.path is required");
        }
        Ok(())
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    exchange: ExchangeToml,
    #[serde(default)]
    strategy: StrategyToml,
    #[serde(default)]
    signals: SignalsToml,
    #[serde(default)]
    entry: EntryToml,
    #[serde(default)]
    exit: ExitToml,
    #[serde(default)]
    store: StoreToml,
    #[serde(default)]
    logging: LoggingToml,
    #[serde(default)]
    observer: ObserverToml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExchangeToml {
    api_key: String,
    api_secret: String,
    base_url: String,
    ws_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct StrategyToml {
    mode: String,
    capital_per_trade: f64,
    max_open_trades: usize,
    tp_pct: f64,
    sl_pct: f64,
    timeout_hours: f64,
    top_n: u32,
    leverage: u32,
    min_momentum_pct: f64,
    min_vol_ratio: f64,
    min_trades_ratio: f64,
    allowed_quintiles: Vec<u32>,
    max_trades_per_pair: usize,
}

impl Default for StrategyToml {
    fn default() -> Self {
        Self {
            mode: "short".to_string(),
            capital_per_trade: 10.0,
            max_open_trades: 10,
            tp_pct: 15.0,
            sl_pct: 60.0,
            timeout_hours: 24.0,
            top_n: 1,
            leverage: 1,
            min_momentum_pct: 0.0,
            min_vol_ratio: 0.0,
            min_trades_ratio: 0.0,
            allowed_quintiles: vec![1, 2, 3, 4, 5],
            max_trades_per_pair: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SignalsToml {
    file_path: String,
    poll_interval_seconds: u64,
    max_signal_age_minutes: f64,
}

impl Default for SignalsToml {
    fn default() -> Self {
        Self {
            file_path: String::new(),
            poll_interval_seconds: 15,
            max_signal_age_minutes: 10.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EntryToml {
    order_type: String,
    chase_interval_seconds: u64,
    chase_timeout_seconds: u64,
    max_chase_attempts: u32,
    market_fallback: bool,
}

impl Default for EntryToml {
    fn default() -> Self {
        Self {
            order_type: "LIMIT_GTX".to_string(),
            chase_interval_seconds: 2,
            chase_timeout_seconds: 30,
            max_chase_attempts: 3,
            market_fallback: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ExitToml {
    timeout_order_type: String,
    timeout_chase_seconds: u64,
    timeout_market_fallback: bool,
}

impl Default for ExitToml {
    fn default() -> Self {
        Self {
            timeout_order_type: "LIMIT".to_string(),
            timeout_chase_seconds: 30,
            timeout_market_fallback: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct StoreToml {
    path: String,
}

impl Default for StoreToml {
    fn default() -> Self {
        Self {
            path: "data/trades.db".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LoggingToml {
    level: String,
}

impl Default for LoggingToml {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ObserverToml {
    enabled: bool,
    host: String,
    port: u16,
}

impl Default for ObserverToml {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Convert f64 to Decimal, clamping unrepresentable values to zero so
/// validation rejects them.
fn f64_to_decimal(val: f64) -> Decimal {
    Decimal::try_from(val).unwrap_or(Decimal::ZERO)
}

/// Derive the user-data stream URL from the REST base URL.
fn derive_ws_url(base_url: &str) -> String {
    if base_url.contains("fapi.binance.com") {
        "wss://fstream.binance.com".to_string()
    } else {
        "wss://stream.binancefuture.com".to_string()
    }
}

impl From<TomlConfig> for BotConfig {
    fn from(toml: TomlConfig) -> Self {
        let ws_url = toml
            .exchange
            .ws_url
            .clone()
            .unwrap_or_else(|| derive_ws_url(&toml.exchange.base_url));
        Self {
            exchange: ExchangeConfig {
                api_key: toml.exchange.api_key,
                api_secret: toml.exchange.api_secret,
                base_url: toml.exchange.base_url,
                ws_url,
            },
            strategy: StrategyConfig {
                mode: toml.strategy.mode,
                capital_per_trade: f64_to_decimal(toml.strategy.capital_per_trade),
                max_open_trades: toml.strategy.max_open_trades,
                tp_pct: f64_to_decimal(toml.strategy.tp_pct),
                sl_pct: f64_to_decimal(toml.strategy.sl_pct),
                timeout_hours: toml.strategy.timeout_hours,
                top_n: toml.strategy.top_n,
                leverage: toml.strategy.leverage,
                min_momentum_pct: toml.strategy.min_momentum_pct,
                min_vol_ratio: toml.strategy.min_vol_ratio,
                min_trades_ratio: toml.strategy.min_trades_ratio,
                allowed_quintiles: toml.strategy.allowed_quintiles,
                max_trades_per_pair: toml.strategy.max_trades_per_pair,
            },
            signals: SignalsConfig {
                file_path: toml.signals.file_path,
                poll_interval_seconds: toml.signals.poll_interval_seconds,
                max_signal_age_minutes: toml.signals.max_signal_age_minutes,
            },
            entry: EntryConfig {
                order_type: toml.entry.order_type,
                chase_interval_seconds: toml.entry.chase_interval_seconds,
                chase_timeout_seconds: toml.entry.chase_timeout_seconds,
                max_chase_attempts: toml.entry.max_chase_attempts,
                market_fallback: toml.entry.market_fallback,
            },
            exit: ExitConfig {
                timeout_order_type: toml.exit.timeout_order_type,
                timeout_chase_seconds: toml.exit.timeout_chase_seconds,
                timeout_market_fallback: toml.exit.timeout_market_fallback,
            },
            store: StoreConfig {
                path: toml.store.path,
            },
            logging: LoggingConfig {
                level: toml.logging.level,
            },
            observer: ObserverConfig {
                enabled: toml.observer.enabled,
                host: toml.observer.host,
                port: toml.observer.port,
            },
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self::from(TomlConfig {
            exchange: ExchangeToml::default(),
            strategy: StrategyToml::default(),
            signals: SignalsToml::default(),
            entry: EntryToml::default(),
            exit: ExitToml::default(),
            store: StoreToml::default(),
            logging: LoggingToml::default(),
            observer: ObserverToml::default(),
        })
    }
}
