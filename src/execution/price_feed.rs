use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::CandleBuffer;
use crate::api::stream::FeedEvent;
use crate::api::{Exchange, ExchangeError};
use crate::config::parse_interval;
use crate::errors::BotError;
use crate::models::Candle;

/// Candles older than this many intervals are treated as stale
const STALE_INTERVALS: i32 = 3;

/// Market data for one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct MarketData {
    /// Latest trade price, `None` if missing or stale
    pub price: Option<f64>,
    /// Indicator input, oldest first; empty if stale
    pub candles: Vec<Candle>,
}

/// Candle and price source for one symbol
///
/// Pulls candles and the ticker price over REST each cycle and, when a
/// streaming task is attached, drains pushed trade prices first. Owned by
/// the control task; the stream only holds the sending half of the queue.
pub struct PriceFeed {
    exchange: Arc<dyn Exchange>,
    symbol: String,
    interval: String,
    interval_duration: chrono::Duration,
    limit: usize,
    buffer: CandleBuffer,
    events: Option<mpsc::UnboundedReceiver<FeedEvent>>,
    latest_price: Option<(f64, DateTime<Utc>)>,
    request_timeout: Duration,
    price_max_age: chrono::Duration,
    closed_candles_only: bool,
}

impl PriceFeed {
    /// Create a new price feed
    ///
    /// # Arguments
    /// * `limit` - Candles requested per refresh; also the buffer size
    /// * `request_timeout` - Upper bound on each REST call
    /// * `closed_candles_only` - Leave the still-forming candle out of indicator input
    pub fn new(
        exchange: Arc<dyn Exchange>,
        symbol: &str,
        interval: &str,
        limit: usize,
        request_timeout: Duration,
        closed_candles_only: bool,
    ) -> Self {
        let interval_duration = parse_interval(interval)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(|| chrono::Duration::minutes(1));

        Self {
            exchange,
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            interval_duration,
            limit,
            buffer: CandleBuffer::new(limit),
            events: None,
            latest_price: None,
            request_timeout,
            price_max_age: chrono::Duration::seconds(30),
            closed_candles_only,
        }
    }

    /// Attach the receiving half of a streaming queue
    pub fn with_events(mut self, events: mpsc::UnboundedReceiver<FeedEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// How old a price may be before it is no longer used
    pub fn with_price_max_age(mut self, max_age: Duration) -> Self {
        if let Ok(age) = chrono::Duration::from_std(max_age) {
            self.price_max_age = age;
        }
        self
    }

    /// Consume everything queued by the streaming task, keeping the newest price
    pub fn drain_events(&mut self) -> usize {
        let Some(events) = self.events.as_mut() else {
            return 0;
        };

        let mut drained = 0;
        while let Ok(event) = events.try_recv() {
            drained += 1;
            match event {
                FeedEvent::Price { price, timestamp } => {
                    let newer = self
                        .latest_price
                        .map_or(true, |(_, seen)| timestamp >= seen);
                    if newer && price.is_finite() && price > 0.0 {
                        self.latest_price = Some((price, timestamp));
                    }
                }
            }
        }
        drained
    }

    fn price_is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.latest_price
            .is_some_and(|(_, at)| now - at <= self.price_max_age)
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        call: impl std::future::Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(format!(
                "{} for {} exceeded {:?}",
                what, self.symbol, self.request_timeout
            ))),
        }
    }

    /// Drain pushed prices, then refresh candles and (unless the stream is
    /// fresh) the ticker price over REST
    pub async fn refresh(&mut self) -> Result<(), BotError> {
        let drained = self.drain_events();
        if drained > 0 {
            tracing::debug!(symbol = %self.symbol, drained, "Drained streamed prices");
        }

        let exchange = Arc::clone(&self.exchange);
        let candles = self
            .with_timeout(
                "candle request",
                exchange.get_recent_candles(&self.symbol, &self.interval, self.limit),
            )
            .await;

        let candle_result = match candles {
            Ok(candles) => {
                let appended = self.buffer.extend(candles);
                tracing::debug!(symbol = %self.symbol, appended, buffered = self.buffer.len(), "Candles refreshed");
                Ok(())
            }
            Err(e) => Err(e),
        };

        let price_result = if self.events.is_some() && self.price_is_fresh(Utc::now()) {
            Ok(())
        } else {
            match self
                .with_timeout("price request", exchange.get_latest_price(&self.symbol))
                .await
            {
                Ok(price) if price.is_finite() && price > 0.0 => {
                    self.latest_price = Some((price, Utc::now()));
                    Ok(())
                }
                Ok(price) => Err(ExchangeError::InvalidResponse(format!(
                    "ticker price {} for {}",
                    price, self.symbol
                ))),
                Err(e) => Err(e),
            }
        };

        candle_result?;
        price_result?;
        Ok(())
    }

    /// Latest usable price, if not stale
    pub fn latest_price(&self) -> Option<f64> {
        self.latest_price_at(Utc::now())
    }

    fn latest_price_at(&self, now: DateTime<Utc>) -> Option<f64> {
        self.price_is_fresh(now)
            .then(|| self.latest_price.map(|(p, _)| p))
            .flatten()
    }

    /// Candles for indicator evaluation as of `now`
    ///
    /// Empty when the newest candle is stale. When configured, the newest
    /// candle is left out while it is still forming.
    pub fn indicator_candles(&self, now: DateTime<Utc>) -> Vec<Candle> {
        let Some(newest) = self.buffer.latest() else {
            return Vec::new();
        };

        if newest.open_time + self.interval_duration * STALE_INTERVALS < now {
            tracing::warn!(
                symbol = %self.symbol,
                newest = %newest.open_time,
                "Candle data is stale"
            );
            return Vec::new();
        }

        let mut candles = self.buffer.candles();
        if self.closed_candles_only && newest.open_time + self.interval_duration > now {
            candles.pop();
        }
        candles
    }

    /// Everything the control loop needs for one cycle
    pub fn market_data(&self) -> MarketData {
        let now = Utc::now();
        MarketData {
            price: self.latest_price_at(now),
            candles: self.indicator_candles(now),
        }
    }

    pub fn buffer(&self) -> &CandleBuffer {
        &self.buffer
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}
