/// Relative Strength Index over the last `period` price changes
///
/// Uses plain averages of gains and losses (not Wilder smoothing), so the
/// value only depends on the trailing `period + 1` prices.
///
/// - RSI > 70: overbought
/// - RSI < 30: oversold
///
/// Returns `None` with fewer than `period + 1` prices. A window without any
/// losses yields 100.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let window = &prices[prices.len() - period - 1..];
    let (gain_sum, loss_sum) = window
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold((0.0, 0.0), |(gains, losses), change| {
            if change > 0.0 {
                (gains + change, losses)
            } else {
                (gains, losses - change)
            }
        });

    let avg_gain = gain_sum / period as f64;
    let avg_loss = loss_sum / period as f64;

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}
