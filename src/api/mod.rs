pub mod binance;
pub mod error;
pub mod paper;
pub mod stream;

pub use binance::BinanceFuturesClient;
pub use error::ExchangeError;
pub use paper::PaperExchange;

use async_trait::async_trait;

use crate::models::{Candle, ExchangePosition, Fill, OrderIntent, SymbolFilters};

/// Everything the bot needs from a margin exchange
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Recent candles, oldest first
    async fn get_recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_latest_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn get_account_equity(&self, asset: &str) -> Result<f64, ExchangeError>;

    /// Submit one order; never retried here
    async fn place_order(&self, symbol: &str, intent: &OrderIntent) -> Result<Fill, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;

    /// Current exchange position, `None` when flat
    async fn get_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError>;
}
