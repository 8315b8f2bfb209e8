// Core modules
pub mod api;
pub mod config;
pub mod errors;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use api::{Exchange, ExchangeError};
pub use config::BotConfig;
pub use errors::BotError;
pub use execution::{BotHandle, BotStatus, TradingBot};
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
