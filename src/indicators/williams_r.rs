use crate::models::Candle;

/// Williams %R over the trailing `period` candles
///
/// `(highest_high - close) / (highest_high - lowest_low) * -100`, in
/// [-100, 0]. Near -100 is oversold, near 0 overbought. A flat window
/// (zero range) returns the midpoint -50.
pub fn calculate_williams_r(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }

    let window = &candles[candles.len() - period..];
    let close = window.last()?.close;
    let highest = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let lowest = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);

    let range = highest - lowest;
    if range == 0.0 {
        return Some(-50.0);
    }

    Some((highest - close) / range * -100.0)
}
