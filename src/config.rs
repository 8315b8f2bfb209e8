//! Bot configuration
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`BOT__SECTION__KEY`, e.g. `BOT__TRADING__SYMBOL=ETHUSDT`)
//! 2. Configuration file (TOML)
//! 3. Defaults

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::api::paper::PaperConfig;
use crate::execution::gateway::RetryPolicy;
use crate::execution::position_manager::ExitConfig;
use crate::risk::sizer::SizingConfig;
use crate::strategy::classifier::ClassifierConfig;
use crate::strategy::signals::SignalConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub paper: PaperConfig,
}

/// Exchange connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Push trade prices from the websocket stream into the feed
    #[serde(default)]
    pub use_trade_stream: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            api_key: None,
            api_secret: None,
            recv_window_ms: default_recv_window_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            requests_per_second: default_requests_per_second(),
            use_trade_stream: false,
        }
    }
}

impl ExchangeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_requests_per_second() -> u32 {
    10
}

/// Control loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Margin asset used for equity
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Candle interval (1m, 5m, 15m, 1h, ...)
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_candle_limit")]
    pub candle_limit: usize,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay after a failed cycle before the next one
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Exclude the still-forming candle from indicator input
    #[serde(default = "default_true")]
    pub closed_candles_only: bool,
    /// Evaluate an opposite entry in the same cycle after a reversal close
    #[serde(default = "default_true")]
    pub reenter_on_reversal: bool,
    /// Place a reduce-only stop-market on the exchange after every entry
    #[serde(default)]
    pub protective_stop: bool,
    /// Market-close an OPEN position on shutdown instead of leaving it
    #[serde(default)]
    pub flatten_on_shutdown: bool,
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            quote_asset: default_quote_asset(),
            interval: default_interval(),
            candle_limit: default_candle_limit(),
            leverage: default_leverage(),
            poll_interval_secs: default_poll_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            closed_candles_only: true,
            reenter_on_reversal: true,
            protective_stop: false,
            flatten_on_shutdown: false,
            ledger_capacity: default_ledger_capacity(),
        }
    }
}

impl TradingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_candle_limit() -> usize {
    100
}

fn default_leverage() -> u32 {
    10
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_error_backoff_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_ledger_capacity() -> usize {
    200
}

/// Parse an exchange interval string ("1m", "4h", "1d") into a duration
pub fn parse_interval(interval: &str) -> Option<Duration> {
    let (unit_start, _) = interval.char_indices().last()?;
    let (count, unit) = interval.split_at(unit_start);
    let count: u64 = count.parse().ok()?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    (count > 0).then(|| Duration::from_secs(count * unit_secs))
}

impl BotConfig {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                anyhow::bail!("Config file not found: {}", path);
            }
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("BOT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: BotConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        // Credentials conventionally live in their own env vars
        if config.exchange.api_key.is_none() {
            config.exchange.api_key = std::env::var("BINANCE_API_KEY").ok();
        }
        if config.exchange.api_secret.is_none() {
            config.exchange.api_secret = std::env::var("BINANCE_API_SECRET").ok();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the control loop cannot run with
    pub fn validate(&self) -> Result<()> {
        let t = &self.trading;
        if t.symbol.is_empty() {
            anyhow::bail!("trading.symbol must not be empty");
        }
        if t.leverage == 0 || t.leverage > 125 {
            anyhow::bail!("trading.leverage must be in 1..=125, got {}", t.leverage);
        }
        if parse_interval(&t.interval).is_none() {
            anyhow::bail!("trading.interval '{}' is not a valid interval", t.interval);
        }
        if t.poll_interval_secs == 0 {
            anyhow::bail!("trading.poll_interval_secs must be positive");
        }
        if t.ledger_capacity == 0 {
            anyhow::bail!("trading.ledger_capacity must be positive");
        }
        // The forming candle is fetched but dropped before the indicators see it
        let min_candles = crate::indicators::IndicatorEngine::new(&self.signal).min_candles()
            + usize::from(t.closed_candles_only);
        if t.candle_limit < min_candles {
            anyhow::bail!(
                "trading.candle_limit {} is below the {} candles the indicators need{}",
                t.candle_limit,
                min_candles,
                if t.closed_candles_only {
                    " (including the forming candle that is left out)"
                } else {
                    ""
                }
            );
        }
        if self.exchange.request_timeout_secs == 0 {
            anyhow::bail!("exchange.request_timeout_secs must be positive");
        }

        self.signal.validate().map_err(anyhow::Error::msg)?;
        self.sizing.validate().map_err(anyhow::Error::msg)?;
        self.exits.validate().map_err(anyhow::Error::msg)?;
        self.retry.validate().map_err(anyhow::Error::msg)?;
        self.classifier.validate().map_err(anyhow::Error::msg)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trading.symbol, "BTCUSDT");
        assert_eq!(config.trading.ledger_capacity, 200);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_interval("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_interval("4h"), Some(Duration::from_secs(14_400)));
        assert_eq!(parse_interval("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_interval("0m"), None);
        assert_eq!(parse_interval("m"), None);
        assert_eq!(parse_interval(""), None);
        assert_eq!(parse_interval("5x"), None);
        assert_eq!(parse_interval("1µ"), None);
        assert_eq!(parse_interval("µ"), None);
    }

    #[test]
    fn test_multibyte_interval_is_a_validation_error() {
        let mut config = BotConfig::default();
        config.trading.interval = "1µ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("trading.interval"));
    }

    #[test]
    fn test_rejects_zero_leverage() {
        let mut config = BotConfig::default();
        config.trading.leverage = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_short_candle_limit() {
        let mut config = BotConfig::default();
        config.trading.candle_limit = 5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("candle_limit"));
    }

    #[test]
    fn test_candle_limit_counts_the_dropped_forming_candle() {
        let mut config = BotConfig::default();
        let needed = crate::indicators::IndicatorEngine::new(&config.signal).min_candles();
        assert_eq!(needed, 21);

        config.trading.candle_limit = needed;
        assert!(config.trading.closed_candles_only);
        assert!(config.validate().is_err());

        config.trading.candle_limit = needed + 1;
        assert!(config.validate().is_ok());

        config.trading.candle_limit = needed;
        config.trading.closed_candles_only = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_retry_attempts() {
        let mut config = BotConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let result = BotConfig::load(Some("/nonexistent/futuresbot.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!("futuresbot-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
[trading]
symbol = "ETHUSDT"
leverage = 20

[exits]
take_profit_pct = 0.02
stop_loss_pct = 0.01
"#,
        )
        .unwrap();

        let config = BotConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.trading.symbol, "ETHUSDT");
        assert_eq!(config.trading.leverage, 20);
        assert_eq!(config.exits.take_profit_pct, 0.02);
        // Untouched sections keep their defaults
        assert_eq!(config.trading.interval, "1m");
        assert_eq!(config.signal.rsi_period, 14);
    }
}
