// Order execution, position tracking and the control loop
pub mod candle_buffer;
pub mod controller;
pub mod executor;
pub mod gateway;
pub mod ledger;
pub mod position_manager;
pub mod price_feed;

pub use candle_buffer::{CandleBuffer, PushOutcome};
pub use controller::{BotHandle, BotStatus, TradingBot};
pub use executor::{CycleInput, ExecutionAction, ExecutionDecision, Executor};
pub use gateway::{OrderError, OrderGateway, RetryPolicy};
pub use ledger::{LedgerEntry, Severity, TradeLedger};
pub use position_manager::{
    ClosedTrade, ExitBasis, ExitConfig, ExitReason, Position, PositionError, PositionManager,
    PositionState,
};
pub use price_feed::{MarketData, PriceFeed};
