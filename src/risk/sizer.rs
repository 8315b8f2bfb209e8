use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::models::{Side, SymbolFilters};

/// How order quantity is derived from equity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// `equity * equity_fraction * leverage / price`
    #[default]
    Notional,
    /// `equity * risk_fraction / atr`, capped at the notional quantity
    RiskBased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub mode: SizingMode,
    /// Share of equity committed as margin in notional mode
    pub equity_fraction: f64,
    /// Share of equity risked per ATR of adverse movement in risk-based mode
    pub risk_fraction: f64,
    /// Used when the exchange does not report symbol filters
    pub fallback_filters: SymbolFilters,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            mode: SizingMode::Notional,
            equity_fraction: 1.0,
            risk_fraction: 0.01,
            fallback_filters: SymbolFilters::default(),
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.equity_fraction > 0.0 && self.equity_fraction <= 1.0) {
            return Err(format!(
                "sizing.equity_fraction must be in (0, 1], got {}",
                self.equity_fraction
            ));
        }
        if !(self.risk_fraction > 0.0 && self.risk_fraction <= 1.0) {
            return Err(format!(
                "sizing.risk_fraction must be in (0, 1], got {}",
                self.risk_fraction
            ));
        }
        let f = &self.fallback_filters;
        if f.min_qty < 0.0 || f.min_notional < 0.0 {
            return Err("sizing.fallback_filters minimums must be non-negative".to_string());
        }
        Ok(())
    }
}

/// Outcome of a sizing request
#[derive(Debug, Clone, PartialEq)]
pub enum SizeDecision {
    Trade { quantity: f64 },
    NoTrade { reason: String },
}

impl SizeDecision {
    fn no_trade(reason: impl Into<String>) -> Self {
        SizeDecision::NoTrade {
            reason: reason.into(),
        }
    }
}

/// Round toward zero to `precision` decimal places
///
/// Goes through `Decimal` so 0.3 stays 0.3 instead of 0.29999999999999999.
pub fn round_down(value: f64, precision: u32) -> Option<f64> {
    Decimal::from_f64(value)?
        .round_dp_with_strategy(precision, RoundingStrategy::ToZero)
        .to_f64()
}

/// Align a stop trigger to `precision` decimals, moving it away from the position
///
/// A LONG stop sits below the entry and rounds down; a SHORT stop rounds up.
pub fn round_stop_price(price: f64, precision: u32, side: Side) -> Option<f64> {
    let strategy = match side {
        Side::Long => RoundingStrategy::ToNegativeInfinity,
        Side::Short => RoundingStrategy::ToPositiveInfinity,
    };
    Decimal::from_f64(price)?
        .round_dp_with_strategy(precision, strategy)
        .to_f64()
}

/// Turns equity and market state into an order quantity the exchange will accept
#[derive(Debug, Clone)]
pub struct RiskSizer {
    config: SizingConfig,
}

impl RiskSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Size an entry
    ///
    /// # Arguments
    /// * `equity` - Account equity in the margin asset
    /// * `leverage` - Account leverage for the symbol
    /// * `price` - Expected fill price
    /// * `atr` - Current ATR, only used in risk-based mode
    /// * `filters` - Exchange quantity precision and minimums
    ///
    /// Never rounds up to meet a minimum: too small means `NoTrade`.
    pub fn size(
        &self,
        equity: f64,
        leverage: u32,
        price: f64,
        atr: Option<f64>,
        filters: &SymbolFilters,
    ) -> SizeDecision {
        if !equity.is_finite() || equity <= 0.0 {
            return SizeDecision::no_trade(format!("equity {} is not positive", equity));
        }
        if !price.is_finite() || price <= 0.0 {
            return SizeDecision::no_trade(format!("price {} is not positive", price));
        }
        if leverage == 0 {
            return SizeDecision::no_trade("leverage is zero");
        }

        let notional_qty = equity * self.config.equity_fraction * f64::from(leverage) / price;

        let raw_qty = match (self.config.mode, atr) {
            (SizingMode::Notional, _) => notional_qty,
            (SizingMode::RiskBased, Some(atr)) if atr.is_finite() && atr > 0.0 => {
                (equity * self.config.risk_fraction / atr).min(notional_qty)
            }
            (SizingMode::RiskBased, _) => {
                tracing::debug!("ATR unavailable, sizing by notional");
                notional_qty
            }
        };

        let Some(quantity) = round_down(raw_qty, filters.quantity_precision) else {
            return SizeDecision::no_trade(format!("quantity {} is not representable", raw_qty));
        };

        if quantity <= 0.0 || quantity < filters.min_qty {
            return SizeDecision::no_trade(format!(
                "quantity {} below minimum {}",
                quantity, filters.min_qty
            ));
        }

        let notional = quantity * price;
        if notional < filters.min_notional {
            return SizeDecision::no_trade(format!(
                "notional {:.2} below minimum {}",
                notional, filters.min_notional
            ));
        }

        SizeDecision::Trade { quantity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            quantity_precision: 3,
            price_precision: 1,
            min_qty: 0.001,
            min_notional: 5.0,
        }
    }

    #[test]
    fn test_notional_sizing_rounds_down() {
        let sizer = RiskSizer::new(SizingConfig::default());
        // 50 * 125 / 60000 = 0.1041666...
        let decision = sizer.size(50.0, 125, 60000.0, None, &filters());
        assert_eq!(decision, SizeDecision::Trade { quantity: 0.104 });
    }

    #[test]
    fn test_equity_fraction() {
        let sizer = RiskSizer::new(SizingConfig {
            equity_fraction: 0.5,
            ..SizingConfig::default()
        });
        let decision = sizer.size(100.0, 10, 50000.0, None, &filters());
        assert_eq!(decision, SizeDecision::Trade { quantity: 0.01 });
    }

    #[test]
    fn test_below_min_qty_is_no_trade() {
        let sizer = RiskSizer::new(SizingConfig::default());
        // 0.5 * 1 / 60000 rounds down to 0.000
        let decision = sizer.size(0.5, 1, 60000.0, None, &filters());
        assert!(matches!(decision, SizeDecision::NoTrade { .. }));
    }

    #[test]
    fn test_below_min_notional_is_no_trade() {
        let sizer = RiskSizer::new(SizingConfig::default());
        let strict = SymbolFilters {
            min_notional: 100.0,
            ..filters()
        };
        // 0.001 BTC at 60000 = 60 notional
        let decision = sizer.size(1.0, 70, 60000.0, None, &strict);
        match decision {
            SizeDecision::NoTrade { reason } => assert!(reason.contains("notional")),
            other => panic!("expected NoTrade, got {:?}", other),
        }
    }

    #[test]
    fn test_risk_based_sizing() {
        let sizer = RiskSizer::new(SizingConfig {
            mode: SizingMode::RiskBased,
            risk_fraction: 0.02,
            ..SizingConfig::default()
        });
        // 1000 * 0.02 / 500 = 0.04, well under the notional cap of 1.666
        let decision = sizer.size(1000.0, 100, 60000.0, Some(500.0), &filters());
        assert_eq!(decision, SizeDecision::Trade { quantity: 0.04 });
    }

    #[test]
    fn test_risk_based_capped_by_notional() {
        let sizer = RiskSizer::new(SizingConfig {
            mode: SizingMode::RiskBased,
            risk_fraction: 0.5,
            ..SizingConfig::default()
        });
        // Tiny ATR would ask for 50 BTC; margin allows 1000 * 2 / 60000 = 0.0333
        let decision = sizer.size(1000.0, 2, 60000.0, Some(10.0), &filters());
        assert_eq!(decision, SizeDecision::Trade { quantity: 0.033 });
    }

    #[test]
    fn test_risk_based_falls_back_without_atr() {
        let sizer = RiskSizer::new(SizingConfig {
            mode: SizingMode::RiskBased,
            ..SizingConfig::default()
        });
        let decision = sizer.size(50.0, 125, 60000.0, None, &filters());
        assert_eq!(decision, SizeDecision::Trade { quantity: 0.104 });
    }

    #[test]
    fn test_invalid_inputs_are_no_trade() {
        let sizer = RiskSizer::new(SizingConfig::default());
        for (equity, price) in [(0.0, 60000.0), (-5.0, 60000.0), (f64::NAN, 60000.0), (50.0, 0.0), (50.0, f64::INFINITY)] {
            let decision = sizer.size(equity, 10, price, None, &filters());
            assert!(
                matches!(decision, SizeDecision::NoTrade { .. }),
                "equity={} price={}",
                equity,
                price
            );
        }
    }

    #[test]
    fn test_round_down() {
        assert_eq!(round_down(0.1049999, 3), Some(0.104));
        assert_eq!(round_down(1.9, 0), Some(1.0));
        assert_eq!(round_down(f64::NAN, 3), None);
    }

    #[test]
    fn test_stop_price_rounds_away_from_position() {
        assert_eq!(round_stop_price(60009.81, 1, Side::Long), Some(60009.8));
        assert_eq!(round_stop_price(62459.19, 1, Side::Short), Some(62459.2));
        assert_eq!(round_stop_price(58800.0, 2, Side::Long), Some(58800.0));
        assert_eq!(round_stop_price(0.123456, 4, Side::Short), Some(0.1235));
        assert_eq!(round_stop_price(f64::NAN, 1, Side::Long), None);
    }
}
