use serde::Serialize;

use super::{calculate_atr, calculate_rsi, calculate_volume_ratio, calculate_williams_r};
use crate::models::Candle;
use crate::strategy::signals::SignalConfig;

/// Indicator values for the newest candle in a window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub williams_r: f64,
    pub rsi: f64,
    pub volume_ratio: f64,
    pub atr: Option<f64>,
    pub close: f64,
}

/// Computes every indicator the signal generator needs from one candle window
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    wr_period: usize,
    rsi_period: usize,
    volume_period: usize,
    atr_period: usize,
}

impl IndicatorEngine {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            wr_period: config.wr_period,
            rsi_period: config.rsi_period,
            volume_period: config.volume_period,
            atr_period: config.atr_period,
        }
    }

    /// Longest lookback among the indicators, plus one for the first price change
    pub fn min_candles(&self) -> usize {
        self.wr_period
            .max(self.rsi_period)
            .max(self.volume_period)
            .max(self.atr_period)
            + 1
    }

    /// `None` means "not ready": too few candles, a non-finite candle in
    /// the window, or a non-finite result
    pub fn compute(&self, candles: &[Candle]) -> Option<IndicatorSnapshot> {
        if candles.len() < self.min_candles() {
            return None;
        }
        if candles.iter().any(|c| !c.is_finite()) {
            tracing::warn!(count = candles.len(), "Non-finite candle data, skipping indicators");
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let williams_r = calculate_williams_r(candles, self.wr_period)?;
        let rsi = calculate_rsi(&closes, self.rsi_period)?;
        let volume_ratio = calculate_volume_ratio(candles, self.volume_period)?;
        let close = *closes.last()?;

        if ![williams_r, rsi, volume_ratio, close]
            .iter()
            .all(|v| v.is_finite())
        {
            return None;
        }

        let atr = calculate_atr(candles, self.atr_period).filter(|v| v.is_finite() && *v > 0.0);

        Some(IndicatorSnapshot {
            williams_r,
            rsi,
            volume_ratio,
            atr,
            close,
        })
    }
}
