use crate::models::Candle;
use std::collections::VecDeque;

/// What happened to a candle offered to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Newer than everything buffered
    Appended,
    /// Same open time as the newest candle; the forming candle was re-reported
    Replaced,
    /// Older than the newest candle, or non-finite
    Dropped,
}

/// Rolling window of candles for one symbol, ordered by strictly increasing open time
#[derive(Debug, Clone)]
pub struct CandleBuffer {
    candles: VecDeque<Candle>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Window size; should be at least the longest indicator lookback + 1
    pub fn new(max_candles: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(max_candles + 1),
            max_candles: max_candles.max(1),
        }
    }

    /// Offer a candle to the buffer
    ///
    /// If the buffer is full, the oldest candle is evicted.
    pub fn push(&mut self, candle: Candle) -> PushOutcome {
        if !candle.is_finite() {
            tracing::warn!(open_time = %candle.open_time, "Dropping non-finite candle");
            return PushOutcome::Dropped;
        }

        if let Some(newest) = self.candles.back_mut() {
            if candle.open_time == newest.open_time {
                *newest = candle;
                return PushOutcome::Replaced;
            }
            if candle.open_time < newest.open_time {
                return PushOutcome::Dropped;
            }
        }

        self.candles.push_back(candle);
        while self.candles.len() > self.max_candles {
            self.candles.pop_front();
        }
        PushOutcome::Appended
    }

    /// Merge a batch (e.g. a REST refresh), returning how many were appended
    pub fn extend<I: IntoIterator<Item = Candle>>(&mut self, candles: I) -> usize {
        candles
            .into_iter()
            .map(|c| self.push(c))
            .filter(|outcome| *outcome == PushOutcome::Appended)
            .count()
    }

    /// All buffered candles, oldest first
    pub fn candles(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }

    /// The `n` most recent candles, oldest first
    pub fn recent(&self, n: usize) -> Vec<Candle> {
        let skip = self.candles.len().saturating_sub(n);
        self.candles.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn clear(&mut self) {
        self.candles.clear();
    }
}
