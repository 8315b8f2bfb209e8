// Technical indicators: Williams %R, RSI, volume ratio, ATR

pub mod atr;
pub mod engine;
pub mod moving_average;
pub mod rsi;
pub mod williams_r;

pub use atr::calculate_atr;
pub use engine::{IndicatorEngine, IndicatorSnapshot};
pub use moving_average::{calculate_sma, calculate_volume_ratio};
pub use rsi::calculate_rsi;
pub use williams_r::calculate_williams_r;
