//! Error types for the trading bot

use thiserror::Error;

use crate::api::ExchangeError;
use crate::execution::gateway::OrderError;
use crate::execution::position_manager::PositionError;

/// Top-level error for a control cycle
#[derive(Error, Debug)]
pub enum BotError {
    /// Feed returned no usable data; the cycle is treated as a FLAT signal
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    /// Every retry of a close failed; the position stays CLOSING
    #[error("close failed for {symbol} {side} qty={quantity} after {attempts} attempts: {source}")]
    CloseFailure {
        symbol: String,
        side: String,
        quantity: f64,
        attempts: u32,
        #[source]
        source: OrderError,
    },

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("order error: {0}")]
    Order(#[from] OrderError),

    #[error("position error: {0}")]
    Position(#[from] PositionError),

    #[error("configuration error: {0}")]
    Config(String),
}
