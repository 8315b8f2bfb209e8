use serde::{Deserialize, Serialize};

use super::classifier::{ClassifierMode, ClassifierVote};
use crate::indicators::IndicatorSnapshot;
use crate::models::Signal;

/// Thresholds and lookbacks for the Williams %R / RSI / volume strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub wr_period: usize,
    pub rsi_period: usize,
    pub volume_period: usize,
    pub atr_period: usize,
    /// LONG needs Williams %R below this
    pub wr_oversold: f64,
    /// SHORT needs Williams %R above this
    pub wr_overbought: f64,
    /// LONG needs RSI below this
    pub rsi_lower: f64,
    /// SHORT needs RSI above this
    pub rsi_upper: f64,
    /// Both directions need volume above this multiple of its average
    pub volume_multiplier: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            wr_period: 14,
            rsi_period: 14,
            volume_period: 20,
            atr_period: 14,
            wr_oversold: -85.0,
            wr_overbought: -15.0,
            rsi_lower: 38.0,
            rsi_upper: 62.0,
            volume_multiplier: 1.05,
        }
    }
}

impl SignalConfig {
    pub fn validate(&self) -> Result<(), String> {
        if [self.wr_period, self.rsi_period, self.volume_period, self.atr_period].contains(&0) {
            return Err("signal periods must be positive".to_string());
        }
        if !(-100.0..=0.0).contains(&self.wr_oversold)
            || !(-100.0..=0.0).contains(&self.wr_overbought)
            || self.wr_oversold >= self.wr_overbought
        {
            return Err(format!(
                "signal Williams %R thresholds must satisfy -100 <= oversold ({}) < overbought ({}) <= 0",
                self.wr_oversold, self.wr_overbought
            ));
        }
        if !(0.0..=100.0).contains(&self.rsi_lower)
            || !(0.0..=100.0).contains(&self.rsi_upper)
            || self.rsi_lower >= self.rsi_upper
        {
            return Err(format!(
                "signal RSI thresholds must satisfy 0 <= lower ({}) < upper ({}) <= 100",
                self.rsi_lower, self.rsi_upper
            ));
        }
        if !self.volume_multiplier.is_finite() || self.volume_multiplier < 0.0 {
            return Err("signal.volume_multiplier must be a non-negative number".to_string());
        }
        Ok(())
    }
}

/// Signal for one cycle together with the inputs that produced it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeSignal {
    pub direction: Signal,
    pub snapshot: Option<IndicatorSnapshot>,
    pub classifier_vote: Option<ClassifierVote>,
}

impl TradeSignal {
    pub fn flat() -> Self {
        Self {
            direction: Signal::Flat,
            snapshot: None,
            classifier_vote: None,
        }
    }
}

/// Direction implied by the indicators alone
///
/// LONG when oversold on both oscillators with above-average volume,
/// SHORT when overbought on both with above-average volume. A missing
/// snapshot (indicators not ready) is FLAT.
pub fn indicator_signal(snapshot: Option<&IndicatorSnapshot>, config: &SignalConfig) -> Signal {
    let Some(s) = snapshot else {
        return Signal::Flat;
    };

    let volume_confirmed = s.volume_ratio > config.volume_multiplier;

    if s.williams_r < config.wr_oversold && s.rsi < config.rsi_lower && volume_confirmed {
        Signal::Long
    } else if s.williams_r > config.wr_overbought && s.rsi > config.rsi_upper && volume_confirmed {
        Signal::Short
    } else {
        Signal::Flat
    }
}

/// Combine the indicator direction with an optional classifier vote
pub fn apply_vote(direction: Signal, vote: Option<ClassifierVote>, mode: ClassifierMode) -> Signal {
    if direction == Signal::Flat {
        return Signal::Flat;
    }

    match mode {
        ClassifierMode::Ignore => direction,
        ClassifierMode::Veto => match vote.map(ClassifierVote::as_signal) {
            Some(voted) if voted != Signal::Flat && voted != direction => Signal::Flat,
            _ => direction,
        },
        ClassifierMode::Require => match vote.map(ClassifierVote::as_signal) {
            Some(voted) if voted == direction => direction,
            _ => Signal::Flat,
        },
    }
}

/// Pure signal function: same inputs always give the same signal
pub fn generate_signal(
    snapshot: Option<IndicatorSnapshot>,
    vote: Option<ClassifierVote>,
    config: &SignalConfig,
    mode: ClassifierMode,
) -> TradeSignal {
    let raw = indicator_signal(snapshot.as_ref(), config);
    let direction = apply_vote(raw, vote, mode);

    if raw != direction {
        tracing::debug!(?raw, ?vote, ?mode, "Classifier overrode indicator signal");
    }

    TradeSignal {
        direction,
        snapshot,
        classifier_vote: vote,
    }
}
