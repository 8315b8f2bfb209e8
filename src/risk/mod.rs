// Risk management module
pub mod sizer;

pub use sizer::{round_down, round_stop_price, RiskSizer, SizeDecision, SizingConfig, SizingMode};
