use crate::models::Candle;

/// Calculate Simple Moving Average (SMA) of the trailing `period` values
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Last candle's volume divided by the SMA of volume over the trailing
/// `period` candles (the last candle included)
///
/// `None` when there is not enough data or the average volume is zero.
pub fn calculate_volume_ratio(candles: &[Candle], period: usize) -> Option<f64> {
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let average = calculate_sma(&volumes, period)?;
    let last = *volumes.last()?;

    if average <= 0.0 {
        return None;
    }
    Some(last / average)
}
