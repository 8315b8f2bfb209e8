//! Binance aggTrade websocket feeding trade prices to the control loop

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// Event pushed from a streaming task into the feed queue
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Price { price: f64, timestamp: DateTime<Utc> },
}

#[derive(Debug, Deserialize)]
struct AggTrade {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Parse an aggTrade payload into a price event
pub fn parse_agg_trade(text: &str) -> Option<FeedEvent> {
    let trade: AggTrade = serde_json::from_str(text).ok()?;
    if trade.event_type != "aggTrade" {
        return None;
    }
    let price: f64 = trade.price.parse().ok()?;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    Some(FeedEvent::Price {
        price,
        timestamp: DateTime::from_timestamp_millis(trade.trade_time).unwrap_or_else(Utc::now),
    })
}

/// Streams trade prices for one symbol until shutdown or until the
/// receiving side of the queue is dropped
pub struct TradeStream {
    url: String,
}

impl TradeStream {
    pub fn new(ws_base_url: &str, symbol: &str) -> Self {
        Self {
            url: format!(
                "{}/{}@aggTrade",
                ws_base_url.trim_end_matches('/'),
                symbol.to_lowercase()
            ),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run with reconnect and exponential backoff
    pub async fn run(
        self,
        sender: mpsc::UnboundedSender<FeedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = ReconnectBackoff::default();

        loop {
            if *shutdown.borrow() || sender.is_closed() {
                break;
            }

            let result = match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    backoff.reset();
                    tracing::info!(url = %self.url, "📡 Trade stream connected");
                    self.pump(ws_stream, &sender, &mut shutdown).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        url = %self.url,
                        attempt = backoff.attempt(),
                        "Trade stream dropped: {}. Reconnecting in {}s",
                        e,
                        delay.as_secs()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        tracing::info!(url = %self.url, "Trade stream stopped");
    }

    /// One connection lifetime; `Ok` means a clean stop was requested
    async fn pump(
        &self,
        ws_stream: WsStream,
        sender: &mpsc::UnboundedSender<FeedEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WsError> {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_agg_trade(&text) {
                            if sender.send(event).is_err() {
                                // Control loop is gone
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::warn!(?frame, "Trade stream closed by server");
                        return Err(WsError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                    None => return Err(WsError::ConnectionClosed),
                }
            }
        }
    }
}

/// Reconnect delays of 1, 2, 4 ... seconds, capped, restarting after a successful connect
#[derive(Debug, Default)]
struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let secs = 2_u64
            .saturating_pow(self.attempt.min(6) - 1)
            .min(MAX_RECONNECT_DELAY_SECS);
        Duration::from_secs(secs)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agg_trade() {
        let text = r#"{"e":"aggTrade","E":123456789,"s":"BTCUSDT","a":5933014,"p":"60123.40","q":"0.010","f":100,"l":105,"T":1700000000000,"m":true}"#;
        let event = parse_agg_trade(text).unwrap();
        let FeedEvent::Price { price, timestamp } = event;
        assert_eq!(price, 60123.4);
        assert_eq!(timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_ignores_other_events() {
        let text = r#"{"e":"kline","p":"1.0","T":1}"#;
        assert!(parse_agg_trade(text).is_none());
        assert!(parse_agg_trade("not json").is_none());
        assert!(parse_agg_trade(r#"{"e":"aggTrade","p":"NaN","T":1}"#).is_none());
    }

    #[test]
    fn test_reconnect_backoff_restarts_after_connect() {
        let mut backoff = ReconnectBackoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32]);

        // A connection that later drops starts over at 1s
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.attempt(), 1);
    }

    #[test]
    fn test_stream_url() {
        let stream = TradeStream::new("wss://fstream.binance.com/ws/", "BTCUSDT");
        assert_eq!(stream.url(), "wss://fstream.binance.com/ws/btcusdt@aggTrade");
    }
}
