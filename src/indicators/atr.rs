/// Average True Range (ATR)
///
/// True range is the largest of high − low, |high − previous close| and
/// |low − previous close|. The first ATR is the mean of the first `period`
/// true ranges; later values use Wilder's smoothing.
use crate::models::Candle;

fn true_range(candle: &Candle, prev_close: f64) -> f64 {
    (candle.high - candle.low)
        .max((candle.high - prev_close).abs())
        .max((candle.low - prev_close).abs())
}

/// Current ATR, or `None` with fewer than `period + 1` candles
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let ranges: Vec<f64> = candles
        .windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .collect();

    let seed = ranges[..period].iter().sum::<f64>() / period as f64;
    let smoothing = period as f64;
    let atr = ranges[period..]
        .iter()
        .fold(seed, |atr, tr| (atr * (smoothing - 1.0) + tr) / smoothing);

    Some(atr)
}
