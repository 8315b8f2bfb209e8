// Trading strategy module
pub mod classifier;
pub mod signals;

use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::models::Candle;
use classifier::{ClassifierMode, ClassifierVote};
use signals::{generate_signal, SignalConfig, TradeSignal};

/// Base trait for signal strategies
///
/// Evaluation is split in two so the caller can consult an async
/// classifier between computing indicators and deciding.
pub trait Strategy: Send + Sync {
    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required before any signal can be produced
    fn min_candles_required(&self) -> usize;

    /// Indicator values for the newest candle, `None` when not ready
    fn snapshot(&self, candles: &[Candle]) -> Option<IndicatorSnapshot>;

    /// Signal from a snapshot and an optional classifier vote
    fn decide(
        &self,
        snapshot: Option<IndicatorSnapshot>,
        vote: Option<ClassifierVote>,
    ) -> TradeSignal;
}

/// Mean-reversion entries on Williams %R and RSI extremes with volume confirmation
pub struct WilliamsRsiStrategy {
    engine: IndicatorEngine,
    config: SignalConfig,
    mode: ClassifierMode,
}

impl WilliamsRsiStrategy {
    pub fn new(config: SignalConfig, mode: ClassifierMode) -> Self {
        Self {
            engine: IndicatorEngine::new(&config),
            config,
            mode,
        }
    }
}

impl Strategy for WilliamsRsiStrategy {
    fn name(&self) -> &str {
        "williams-rsi"
    }

    fn min_candles_required(&self) -> usize {
        self.engine.min_candles()
    }

    fn snapshot(&self, candles: &[Candle]) -> Option<IndicatorSnapshot> {
        self.engine.compute(candles)
    }

    fn decide(
        &self,
        snapshot: Option<IndicatorSnapshot>,
        vote: Option<ClassifierVote>,
    ) -> TradeSignal {
        generate_signal(snapshot, vote, &self.config, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Signal;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_too_few_candles_is_flat() {
        let strategy = WilliamsRsiStrategy::new(SignalConfig::default(), ClassifierMode::Veto);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles: Vec<Candle> = (0..strategy.min_candles_required() - 1)
            .map(|i| Candle {
                open_time: start + Duration::minutes(i as i64),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();

        let snapshot = strategy.snapshot(&candles);
        assert!(snapshot.is_none());
        assert_eq!(strategy.decide(snapshot, None).direction, Signal::Flat);
    }

    #[test]
    fn test_selloff_on_volume_is_long() {
        let strategy = WilliamsRsiStrategy::new(SignalConfig::default(), ClassifierMode::Veto);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // Steady decline, final candle closes at the low on double volume
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let close = 100.0 - i as f64;
                Candle {
                    open_time: start + Duration::minutes(i as i64),
                    open: close + 0.5,
                    high: close + 1.0,
                    low: close,
                    close,
                    volume: if i == 29 { 20.0 } else { 10.0 },
                }
            })
            .collect();

        let snapshot = strategy.snapshot(&candles);
        let signal = strategy.decide(snapshot, None);
        assert_eq!(signal.direction, Signal::Long);
        assert_eq!(strategy.decide(snapshot, Some(ClassifierVote::Down)).direction, Signal::Flat);
    }
}
