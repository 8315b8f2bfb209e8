use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::api::{Exchange, ExchangeError};
use crate::execution::position_manager::Position;
use crate::models::{Fill, OrderIntent, OrderStatus, Side};

/// Bounded exponential backoff for order submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 8000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            ));
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-based): `initial * 2^(attempt-1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    /// Terminal exchange error; not retried
    #[error("order rejected: {0}")]
    Rejected(#[source] ExchangeError),

    #[error("order failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: ExchangeError,
    },

    /// An earlier attempt may have executed; resubmitting could double the order
    #[error("order outcome unknown after {attempts} attempts: {last}")]
    Unconfirmed {
        attempts: u32,
        #[source]
        last: ExchangeError,
    },

    /// Accepted but nothing executed
    #[error("order {order_id} not filled (status {status:?})")]
    NotFilled { order_id: String, status: OrderStatus },
}

impl OrderError {
    /// Underlying exchange error, if any
    pub fn exchange_error(&self) -> Option<&ExchangeError> {
        match self {
            OrderError::Rejected(e)
            | OrderError::RetriesExhausted { last: e, .. }
            | OrderError::Unconfirmed { last: e, .. } => Some(e),
            OrderError::NotFilled { .. } => None,
        }
    }
}

/// Places orders for one symbol with bounded retry
///
/// Submissions are serialized: a second caller waits until the first
/// order (including its retries) has resolved.
pub struct OrderGateway {
    exchange: Arc<dyn Exchange>,
    symbol: String,
    policy: RetryPolicy,
    submit_lock: Mutex<()>,
}

impl OrderGateway {
    pub fn new(exchange: Arc<dyn Exchange>, symbol: &str, policy: RetryPolicy) -> Self {
        Self {
            exchange,
            symbol: symbol.to_string(),
            policy,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submit an order, retrying transient failures
    ///
    /// The intent's client order id is reused on every attempt. The
    /// returned fill is whatever the exchange acknowledged; callers that
    /// need execution use [`open`](Self::open) or [`close`](Self::close).
    pub async fn submit(&self, intent: &OrderIntent) -> Result<Fill, OrderError> {
        self.submit_guarded(intent, false).await
    }

    /// Retry loop; with `require_flat` an attempt whose outcome is unknown is
    /// only resubmitted while the exchange still reports no position
    async fn submit_guarded(
        &self,
        intent: &OrderIntent,
        require_flat: bool,
    ) -> Result<Fill, OrderError> {
        let _guard = self.submit_lock.lock().await;
        let max_attempts = self.policy.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.exchange.place_order(&self.symbol, intent).await {
                Ok(fill) => {
                    if attempt > 1 {
                        tracing::info!(
                            symbol = %self.symbol,
                            client_order_id = %intent.client_order_id,
                            attempt,
                            "Order accepted after retry"
                        );
                    }
                    return Ok(fill);
                }
                Err(e) if !e.is_transient() => {
                    tracing::error!(
                        symbol = %self.symbol,
                        side = intent.side.as_str(),
                        quantity = intent.quantity,
                        price = ?intent.price.or(intent.stop_price),
                        attempt,
                        error = %e,
                        "Order rejected"
                    );
                    return Err(OrderError::Rejected(e));
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(
                        symbol = %self.symbol,
                        side = intent.side.as_str(),
                        quantity = intent.quantity,
                        price = ?intent.price.or(intent.stop_price),
                        attempt,
                        error = %e,
                        "Order retries exhausted"
                    );
                    return Err(OrderError::RetriesExhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = e
                        .retry_after()
                        .map_or_else(|| self.policy.backoff(attempt), |d| d.min(self.policy.max_backoff()));
                    tracing::warn!(
                        symbol = %self.symbol,
                        side = intent.side.as_str(),
                        quantity = intent.quantity,
                        price = ?intent.price.or(intent.stop_price),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient order failure, retrying"
                    );
                    sleep(delay).await;

                    if require_flat && e.may_have_executed() {
                        self.ensure_still_flat(intent, attempt, e).await?;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn ensure_still_flat(
        &self,
        intent: &OrderIntent,
        attempt: u32,
        last: ExchangeError,
    ) -> Result<(), OrderError> {
        match self.exchange.get_position(&self.symbol).await {
            Ok(None) => Ok(()),
            Ok(Some(position)) => {
                tracing::warn!(
                    symbol = %self.symbol,
                    client_order_id = %intent.client_order_id,
                    side = ?position.side,
                    quantity = position.quantity,
                    attempt,
                    "Exchange holds a position after an unanswered entry, not resubmitting"
                );
                Err(OrderError::Unconfirmed {
                    attempts: attempt,
                    last,
                })
            }
            Err(check) => {
                tracing::warn!(
                    symbol = %self.symbol,
                    client_order_id = %intent.client_order_id,
                    attempt,
                    error = %check,
                    "Cannot verify unanswered entry, not resubmitting"
                );
                Err(OrderError::Unconfirmed {
                    attempts: attempt,
                    last,
                })
            }
        }
    }

    async fn submit_executed(
        &self,
        intent: &OrderIntent,
        require_flat: bool,
    ) -> Result<Fill, OrderError> {
        let fill = self.submit_guarded(intent, require_flat).await?;
        if !fill.is_executed() {
            tracing::warn!(
                symbol = %self.symbol,
                order_id = %fill.order_id,
                status = ?fill.status,
                quantity = intent.quantity,
                "Order accepted without execution"
            );
            return Err(OrderError::NotFilled {
                order_id: fill.order_id,
                status: fill.status,
            });
        }
        Ok(fill)
    }

    /// Market order opening a position from flat
    ///
    /// After a timeout, network error or 5xx the order is only resubmitted
    /// if the exchange still reports no position; otherwise
    /// [`OrderError::Unconfirmed`] is returned for the caller to reconcile.
    pub async fn open(&self, side: Side, quantity: f64) -> Result<Fill, OrderError> {
        self.submit_executed(&OrderIntent::market(side.entry_order_side(), quantity), true)
            .await
    }

    /// Reduce-only market order flattening `position`
    pub async fn close(&self, position: &Position) -> Result<Fill, OrderError> {
        let intent =
            OrderIntent::market(position.side.exit_order_side(), position.quantity).reduce_only();
        self.submit_executed(&intent, false).await
    }

    /// Reduce-only STOP_MARKET resting at `trigger`
    pub async fn protective_stop(
        &self,
        position: &Position,
        trigger: f64,
    ) -> Result<Fill, OrderError> {
        let intent =
            OrderIntent::stop_market(position.side.exit_order_side(), position.quantity, trigger);
        self.submit(&intent).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Candle, ExchangePosition, OrderSide, OrderType, SymbolFilters};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;

    /// Replays scripted `place_order` results and records every intent
    struct ScriptedOrders {
        results: StdMutex<VecDeque<Result<Fill, ExchangeError>>>,
        seen: StdMutex<Vec<OrderIntent>>,
        delay: Duration,
        position: Option<ExchangePosition>,
    }

    impl ScriptedOrders {
        fn new(results: Vec<Result<Fill, ExchangeError>>) -> Self {
            Self {
                results: StdMutex::new(results.into()),
                seen: StdMutex::new(Vec::new()),
                delay: Duration::ZERO,
                position: None,
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Exchange for ScriptedOrders {
        async fn get_recent_candles(
            &self,
            _symbol: &str,
            _interval: &str,
            _limit: usize,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn get_latest_price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
            Ok(60000.0)
        }

        async fn get_account_equity(&self, _asset: &str) -> Result<f64, ExchangeError> {
            Ok(50.0)
        }

        async fn place_order(
            &self,
            _symbol: &str,
            intent: &OrderIntent,
        ) -> Result<Fill, ExchangeError> {
            self.seen.lock().unwrap().push(intent.clone());
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(filled(intent.quantity)))
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn get_symbol_filters(&self, _symbol: &str) -> Result<SymbolFilters, ExchangeError> {
            Ok(SymbolFilters::default())
        }

        async fn get_position(
            &self,
            _symbol: &str,
        ) -> Result<Option<ExchangePosition>, ExchangeError> {
            Ok(self.position.clone())
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    fn filled(qty: f64) -> Fill {
        Fill {
            order_id: "42".to_string(),
            client_order_id: "fb-test".to_string(),
            status: OrderStatus::Filled,
            executed_qty: qty,
            avg_price: 60000.0,
            timestamp: Utc::now(),
        }
    }

    fn server_error() -> ExchangeError {
        ExchangeError::Server {
            status: 503,
            message: "Service Unavailable".to_string(),
        }
    }

    fn gateway(exchange: Arc<ScriptedOrders>) -> OrderGateway {
        OrderGateway::new(exchange, "BTCUSDT", RetryPolicy::default())
    }

    fn long_position() -> Position {
        Position {
            side: Side::Long,
            entry_price: 60000.0,
            quantity: 0.104,
            entry_time: Utc::now(),
            entry_commission: 2.496,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let zero = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_retries() {
        let exchange = Arc::new(ScriptedOrders::new(
            (0..5).map(|_| Err(server_error())).collect(),
        ));
        let gw = gateway(exchange.clone());

        let start = Instant::now();
        let err = gw.open(Side::Long, 0.104).await.unwrap_err();

        assert_eq!(
            err,
            OrderError::RetriesExhausted {
                attempts: 5,
                last: server_error()
            }
        );
        assert_eq!(exchange.calls(), 5);
        // 1 + 2 + 4 + 8 seconds between the five attempts
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let rejected = ExchangeError::Rejected {
            code: -2019,
            message: "Margin is insufficient.".to_string(),
        };
        let exchange = Arc::new(ScriptedOrders::new(vec![Err(rejected.clone())]));
        let gw = gateway(exchange.clone());

        let err = gw.open(Side::Short, 0.1).await.unwrap_err();
        assert_eq!(err, OrderError::Rejected(rejected));
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let exchange = Arc::new(ScriptedOrders::new(vec![
            Err(ExchangeError::Timeout("slow".to_string())),
            Err(ExchangeError::Network("reset".to_string())),
            Ok(filled(0.104)),
        ]));
        let gw = gateway(exchange.clone());

        let start = Instant::now();
        let fill = gw.open(Side::Long, 0.104).await.unwrap();
        assert_eq!(fill.executed_qty, 0.104);
        assert_eq!(exchange.calls(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honored_and_capped() {
        let exchange = Arc::new(ScriptedOrders::new(vec![
            Err(ExchangeError::RateLimited {
                code: -1003,
                message: "Too many requests".to_string(),
                retry_after: Some(Duration::from_secs(60)),
            }),
            Ok(filled(0.1)),
        ]));
        let gw = gateway(exchange.clone());

        let start = Instant::now();
        gw.open(Side::Long, 0.1).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_order_id_reused_across_retries() {
        let exchange = Arc::new(ScriptedOrders::new(vec![
            Err(server_error()),
            Err(server_error()),
            Ok(filled(0.1)),
        ]));
        let gw = gateway(exchange.clone());

        gw.open(Side::Long, 0.1).await.unwrap();

        let seen = exchange.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen
            .iter()
            .all(|i| i.client_order_id == seen[0].client_order_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_entry_is_not_resubmitted_once_position_exists() {
        let mut scripted =
            ScriptedOrders::new(vec![Err(ExchangeError::Timeout("read timed out".to_string()))]);
        scripted.position = Some(ExchangePosition {
            side: Side::Long,
            quantity: 0.1,
            entry_price: 60000.0,
        });
        let exchange = Arc::new(scripted);
        let gw = gateway(exchange.clone());

        let err = gw.open(Side::Long, 0.1).await.unwrap_err();
        assert_eq!(
            err,
            OrderError::Unconfirmed {
                attempts: 1,
                last: ExchangeError::Timeout("read timed out".to_string())
            }
        );
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_entry_retries_without_position_check() {
        let mut scripted = ScriptedOrders::new(vec![
            Err(ExchangeError::RateLimited {
                code: -1003,
                message: "Too many requests".to_string(),
                retry_after: None,
            }),
            Ok(filled(0.1)),
        ]);
        // A 429 was refused outright, so a position here is not ours to worry about
        scripted.position = Some(ExchangePosition {
            side: Side::Long,
            quantity: 0.1,
            entry_price: 60000.0,
        });
        let exchange = Arc::new(scripted);
        let gw = gateway(exchange.clone());

        gw.open(Side::Long, 0.1).await.unwrap();
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_retries_while_position_is_open() {
        let mut scripted = ScriptedOrders::new(vec![Err(server_error()), Ok(filled(0.104))]);
        scripted.position = Some(ExchangePosition {
            side: Side::Long,
            quantity: 0.104,
            entry_price: 60000.0,
        });
        let exchange = Arc::new(scripted);
        let gw = gateway(exchange.clone());

        let fill = gw.close(&long_position()).await.unwrap();
        assert_eq!(fill.executed_qty, 0.104);
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn test_accepted_without_execution_is_not_filled() {
        let mut unfilled = filled(0.0);
        unfilled.status = OrderStatus::Expired;
        unfilled.avg_price = 0.0;
        let exchange = Arc::new(ScriptedOrders::new(vec![Ok(unfilled)]));
        let gw = gateway(exchange);

        let err = gw.open(Side::Long, 0.1).await.unwrap_err();
        assert_eq!(
            err,
            OrderError::NotFilled {
                order_id: "42".to_string(),
                status: OrderStatus::Expired
            }
        );
    }

    #[tokio::test]
    async fn test_close_is_reduce_only_opposite_side() {
        let exchange = Arc::new(ScriptedOrders::new(Vec::new()));
        let gw = gateway(exchange.clone());

        gw.close(&long_position()).await.unwrap();

        let seen = exchange.seen.lock().unwrap();
        assert_eq!(seen[0].side, OrderSide::Sell);
        assert_eq!(seen[0].order_type, OrderType::Market);
        assert!(seen[0].reduce_only);
        assert_eq!(seen[0].quantity, 0.104);
    }

    #[tokio::test]
    async fn test_protective_stop_accepts_resting_order() {
        let mut resting = filled(0.0);
        resting.status = OrderStatus::New;
        resting.avg_price = 0.0;
        let exchange = Arc::new(ScriptedOrders::new(vec![Ok(resting)]));
        let gw = gateway(exchange.clone());

        let fill = gw.protective_stop(&long_position(), 58800.0).await.unwrap();
        assert_eq!(fill.status, OrderStatus::New);

        let seen = exchange.seen.lock().unwrap();
        assert_eq!(seen[0].order_type, OrderType::StopMarket);
        assert_eq!(seen[0].stop_price, Some(58800.0));
        assert!(seen[0].reduce_only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submissions_are_serialized() {
        let mut scripted = ScriptedOrders::new(Vec::new());
        scripted.delay = Duration::from_secs(1);
        let exchange = Arc::new(scripted);
        let gw = Arc::new(gateway(exchange.clone()));

        let start = Instant::now();
        let (a, b) = tokio::join!(gw.open(Side::Long, 0.1), gw.open(Side::Long, 0.2));
        a.unwrap();
        b.unwrap();

        // Each call holds the exchange for 1s; overlapping would finish in 1s
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(exchange.calls(), 2);
    }
}
