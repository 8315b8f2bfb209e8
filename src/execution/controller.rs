use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::api::stream::FeedEvent;
use crate::api::Exchange;
use crate::config::BotConfig;
use crate::errors::BotError;
use crate::execution::executor::{CycleInput, ExecutionAction, Executor};
use crate::execution::gateway::{OrderError, OrderGateway};
use crate::execution::ledger::{LedgerEntry, TradeLedger};
use crate::execution::position_manager::{ClosedTrade, ExitReason, Position, PositionManager, PositionState};
use crate::execution::price_feed::PriceFeed;
use crate::models::{AccountState, Candle, PositionSide, Side, SymbolFilters};
use crate::risk::{round_stop_price, RiskSizer};
use crate::strategy::classifier::{FeatureRow, SignalClassifier};
use crate::strategy::signals::TradeSignal;
use crate::strategy::{Strategy, WilliamsRsiStrategy};
use crate::Result;

/// Snapshot served to the control surface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotStatus {
    pub running: bool,
    pub state: String,
    pub side: PositionSide,
    pub entry_price: Option<f64>,
    pub quantity: f64,
    pub equity: f64,
    pub last_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
}

impl BotStatus {
    fn initial(equity: f64) -> Self {
        Self {
            running: false,
            state: "FLAT".to_string(),
            side: PositionSide::Flat,
            entry_price: None,
            quantity: 0.0,
            equity,
            last_price: None,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
        }
    }
}

fn lock_ledger(ledger: &Mutex<TradeLedger>) -> MutexGuard<'_, TradeLedger> {
    // A panic mid-append leaves the ledger usable
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clonable control surface for a running [`TradingBot`]
///
/// Commands take effect between cycles; the control task owns all
/// trading state.
#[derive(Clone)]
pub struct BotHandle {
    running: Arc<watch::Sender<bool>>,
    shutdown: Arc<watch::Sender<bool>>,
    status: watch::Receiver<BotStatus>,
    ledger: Arc<Mutex<TradeLedger>>,
}

impl BotHandle {
    /// Allow entries and signal evaluation. Idempotent.
    pub fn start(&self) -> BotStatus {
        let started = self.running.send_if_modified(|running| {
            let changed = !*running;
            *running = true;
            changed
        });
        if started {
            lock_ledger(&self.ledger).info("Bot started");
        }
        self.status()
    }

    /// Stop entries and signal evaluation; a pending close is still driven. Idempotent.
    pub fn stop(&self) -> BotStatus {
        let stopped = self.running.send_if_modified(|running| {
            let changed = *running;
            *running = false;
            changed
        });
        if stopped {
            let status = self.status();
            let mut ledger = lock_ledger(&self.ledger);
            ledger.info("Bot stopped");
            if status.state == "OPEN" {
                ledger.warn(format!(
                    "Stopped with an OPEN {:?} position of {} @ {:?}; it is no longer managed",
                    status.side, status.quantity, status.entry_price
                ));
            }
        }
        self.status()
    }

    pub fn status(&self) -> BotStatus {
        let mut status = self.status.borrow().clone();
        status.running = *self.running.borrow();
        status
    }

    /// The `n` most recent ledger entries, oldest first
    pub fn recent_log_entries(&self, n: usize) -> Vec<LedgerEntry> {
        lock_ledger(&self.ledger).recent(n)
    }

    /// Ask the control loop to exit after a final close attempt
    pub fn shutdown(&self) {
        self.running.send_replace(false);
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // The sender lives as long as the bot, so this only returns once asked to stop
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Single-symbol trading bot
///
/// Owns the feed, gateway, position manager and executor; driven by
/// [`run`](Self::run) or one [`run_cycle`](Self::run_cycle) at a time.
pub struct TradingBot {
    config: BotConfig,
    exchange: Arc<dyn Exchange>,
    feed: PriceFeed,
    strategy: Box<dyn Strategy>,
    classifier: Option<Box<dyn SignalClassifier>>,
    gateway: OrderGateway,
    positions: PositionManager,
    executor: Executor,
    filters: SymbolFilters,
    account: AccountState,
    last_price: Option<f64>,
    ledger: Arc<Mutex<TradeLedger>>,
    running: Arc<watch::Sender<bool>>,
    shutdown: Arc<watch::Sender<bool>>,
    status: watch::Sender<BotStatus>,
}

impl TradingBot {
    pub fn new(config: BotConfig, exchange: Arc<dyn Exchange>) -> Self {
        let trading = &config.trading;
        let feed = PriceFeed::new(
            Arc::clone(&exchange),
            &trading.symbol,
            &trading.interval,
            trading.candle_limit,
            config.exchange.request_timeout(),
            trading.closed_candles_only,
        );
        let strategy = WilliamsRsiStrategy::new(config.signal.clone(), config.classifier.mode);
        let gateway = OrderGateway::new(Arc::clone(&exchange), &trading.symbol, config.retry.clone());
        let positions = PositionManager::new(config.exits.clone(), trading.leverage);
        let executor = Executor::new(RiskSizer::new(config.sizing.clone()));
        let ledger = Arc::new(Mutex::new(TradeLedger::new(trading.ledger_capacity)));
        let (status, _) = watch::channel(BotStatus::initial(0.0));

        Self {
            filters: config.sizing.fallback_filters.clone(),
            account: AccountState {
                equity: 0.0,
                leverage: trading.leverage,
            },
            exchange,
            feed,
            strategy: Box::new(strategy),
            classifier: None,
            gateway,
            positions,
            executor,
            last_price: None,
            ledger,
            running: Arc::new(watch::channel(false).0),
            shutdown: Arc::new(watch::channel(false).0),
            status,
            config,
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn SignalClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Attach the receiving half of a trade stream queue
    pub fn with_feed_events(mut self, events: mpsc::UnboundedReceiver<FeedEvent>) -> Self {
        self.feed = self.feed.with_events(events);
        self
    }

    pub fn handle(&self) -> BotHandle {
        BotHandle {
            running: Arc::clone(&self.running),
            shutdown: Arc::clone(&self.shutdown),
            status: self.status.subscribe(),
            ledger: Arc::clone(&self.ledger),
        }
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn account(&self) -> &AccountState {
        &self.account
    }

    pub fn filters(&self) -> &SymbolFilters {
        &self.filters
    }

    fn symbol(&self) -> &str {
        &self.config.trading.symbol
    }

    fn ledger(&self) -> MutexGuard<'_, TradeLedger> {
        lock_ledger(&self.ledger)
    }

    /// Set leverage, load symbol rules and equity, adopt any open exchange position
    pub async fn initialize(&mut self) -> Result<()> {
        let symbol = self.symbol().to_string();
        let leverage = self.config.trading.leverage;

        self.exchange.set_leverage(&symbol, leverage).await?;
        tracing::info!(symbol = %symbol, leverage, "Leverage set");

        match self.exchange.get_symbol_filters(&symbol).await {
            Ok(filters) => self.filters = filters,
            Err(e) => {
                tracing::warn!(
                    symbol = %symbol,
                    error = %e,
                    "Symbol filters unavailable, using configured fallback"
                );
            }
        }

        self.account.equity = self
            .exchange
            .get_account_equity(&self.config.trading.quote_asset)
            .await?;

        if let Some(existing) = self.exchange.get_position(&symbol).await? {
            let position = self.positions.adopt(&existing)?;
            let message = format!(
                "Adopted existing {:?} position of {} @ {:.2}",
                position.side, position.quantity, position.entry_price
            );
            self.ledger().warn(message);
        }

        let message = format!(
            "Initialized {} at {}x, equity {:.2}, qty precision {}, min notional {}",
            symbol,
            leverage,
            self.account.equity,
            self.filters.quantity_precision,
            self.filters.min_notional
        );
        self.ledger().info(message);
        self.publish_status();
        Ok(())
    }

    /// Drive cycles until shutdown, then make a final close attempt
    pub async fn run(mut self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.trading.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            symbol = %self.symbol(),
            strategy = self.strategy.name(),
            poll_secs = self.config.trading.poll_interval_secs,
            "Control loop starting"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.run_cycle().await {
                tracing::error!(symbol = %self.symbol(), error = %e, "Cycle failed");
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = sleep(self.config.trading.error_backoff()) => {}
                }
            }
        }

        self.finish_on_shutdown().await;
        self.publish_status();
        tracing::info!(symbol = %self.symbol(), "Control loop stopped");
        Ok(())
    }

    /// One control cycle: refresh data, evaluate, act at most once
    pub async fn run_cycle(&mut self) -> Result<()> {
        let running = *self.running.borrow();

        if let Err(e) = self.feed.refresh().await {
            tracing::warn!(symbol = %self.symbol(), error = %e, "Market data refresh failed");
        }
        let market = self.feed.market_data();
        if market.price.is_some() {
            self.last_price = market.price;
        }

        if self.positions.is_flat() {
            self.reconcile_flat().await;
        }

        let signal = if running && matches!(self.positions.state(), PositionState::Flat | PositionState::Open(_)) {
            match self.evaluate(&market.candles).await {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!(symbol = %self.symbol(), error = %e, "Treating cycle as FLAT");
                    TradeSignal::flat()
                }
            }
        } else {
            TradeSignal::flat()
        };

        let result = self.act(&signal, market.price, running).await;
        self.publish_status();
        result
    }

    async fn evaluate(&self, candles: &[Candle]) -> Result<TradeSignal> {
        let Some(latest) = candles.last() else {
            return Err(BotError::DataUnavailable(format!(
                "no fresh candles for {}",
                self.symbol()
            )));
        };

        let snapshot = self.strategy.snapshot(candles);
        if snapshot.is_none() {
            tracing::debug!(
                symbol = %self.symbol(),
                candles = candles.len(),
                needed = self.strategy.min_candles_required(),
                "Indicators not ready"
            );
        }

        let vote = match (&self.classifier, snapshot) {
            (Some(classifier), Some(_)) => match classifier.classify(&FeatureRow::from(latest)).await {
                Ok(vote) => Some(vote),
                Err(e) => {
                    tracing::warn!(symbol = %self.symbol(), error = %e, "Classifier unavailable");
                    None
                }
            },
            _ => None,
        };

        let signal = self.strategy.decide(snapshot, vote);
        if let Some(s) = &signal.snapshot {
            tracing::debug!(
                symbol = %self.symbol(),
                williams_r = s.williams_r,
                rsi = s.rsi,
                volume_ratio = s.volume_ratio,
                vote = ?signal.classifier_vote,
                direction = ?signal.direction,
                "Signal evaluated"
            );
        }
        Ok(signal)
    }

    fn cycle_input<'a>(
        &'a self,
        signal: &'a TradeSignal,
        price: Option<f64>,
        running: bool,
    ) -> CycleInput<'a> {
        CycleInput {
            signal,
            price,
            equity: self.account.equity,
            leverage: self.account.leverage,
            filters: &self.filters,
            entries_allowed: running,
        }
    }

    async fn act(&mut self, signal: &TradeSignal, price: Option<f64>, running: bool) -> Result<()> {
        let decision = self
            .executor
            .decide(&self.positions, self.cycle_input(signal, price, running));

        match decision.action {
            ExecutionAction::Skip => {
                tracing::debug!(symbol = %self.symbol(), reason = %decision.reason, "No action");
                Ok(())
            }
            ExecutionAction::Enter { side, quantity } => {
                tracing::info!(symbol = %self.symbol(), reason = %decision.reason, "Entering");
                self.enter(side, quantity).await
            }
            ExecutionAction::RetryClose => {
                tracing::info!(symbol = %self.symbol(), reason = %decision.reason, "Retrying close");
                self.retry_close().await.map(|_| ())
            }
            ExecutionAction::Close { reason } => {
                tracing::info!(symbol = %self.symbol(), reason = %decision.reason, "Closing");
                let position = self.positions.begin_close(reason)?;
                let closed = self.attempt_close(position).await?;

                let reenter = reason == ExitReason::Reversal
                    && self.config.trading.reenter_on_reversal
                    && closed.is_some_and(|t| t.fully_closed);
                if !reenter {
                    return Ok(());
                }

                let decision = self
                    .executor
                    .decide(&self.positions, self.cycle_input(signal, price, running));
                match decision.action {
                    ExecutionAction::Enter { side, quantity } => {
                        tracing::info!(symbol = %self.symbol(), reason = %decision.reason, "Re-entering after reversal");
                        self.enter(side, quantity).await
                    }
                    _ => {
                        tracing::info!(symbol = %self.symbol(), reason = %decision.reason, "No re-entry after reversal");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Adopt a position the exchange holds while the local record is FLAT
    async fn reconcile_flat(&mut self) {
        let symbol = self.symbol().to_string();
        let existing = match self.exchange.get_position(&symbol).await {
            Ok(Some(existing)) => existing,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Position check failed");
                return;
            }
        };

        let message = match self.positions.adopt(&existing) {
            Ok(position) => format!(
                "Exchange holds untracked {:?} position of {} @ {:.2}; adopted",
                position.side, position.quantity, position.entry_price
            ),
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Cannot adopt exchange position");
                return;
            }
        };
        self.ledger().warn(message);
    }

    async fn enter(&mut self, side: Side, quantity: f64) -> Result<()> {
        let symbol = self.symbol().to_string();

        // Also reached right after a reversal close within the same cycle
        if let Some(existing) = self.exchange.get_position(&symbol).await? {
            let position = self.positions.adopt(&existing)?;
            let message = format!(
                "Found unexpected {:?} position of {} @ {:.2} before entry; adopted instead of entering",
                position.side, position.quantity, position.entry_price
            );
            self.ledger().warn(message);
            return Ok(());
        }

        self.positions.begin_entry(side, quantity)?;
        let fill = match self.gateway.open(side, quantity).await {
            Ok(fill) => fill,
            Err(e) => {
                self.positions.abort_entry()?;
                return self.reconcile_entry(side, quantity, e).await;
            }
        };

        let position = match self.positions.confirm_entry(&fill) {
            Ok(position) => position.clone(),
            Err(e) => {
                self.positions.abort_entry()?;
                return Err(e.into());
            }
        };

        self.ledger().info(format!(
            "Opened {:?} {} {} @ {:.2}",
            position.side, position.quantity, symbol, position.entry_price
        ));

        self.place_protective_stop(&position).await;
        Ok(())
    }

    /// After a failed entry, trust the exchange: any position it reports is adopted
    ///
    /// A timed-out order may still have filled, so the error alone does not
    /// prove the bot is flat.
    async fn reconcile_entry(
        &mut self,
        side: Side,
        quantity: f64,
        error: OrderError,
    ) -> Result<()> {
        let symbol = self.symbol().to_string();
        match self.exchange.get_position(&symbol).await {
            Ok(Some(existing)) => {
                let position = self.positions.adopt(&existing)?.clone();
                self.ledger().warn(format!(
                    "Entry {:?} {} on {} reported '{}' but the exchange holds {:?} {} @ {:.2}; adopted",
                    side,
                    quantity,
                    symbol,
                    error,
                    position.side,
                    position.quantity,
                    position.entry_price
                ));
                self.place_protective_stop(&position).await;
                Ok(())
            }
            Ok(None) => {
                self.ledger().warn(format!(
                    "Entry {:?} {} on {} failed: {}",
                    side, quantity, symbol, error
                ));
                Err(error.into())
            }
            Err(check) => {
                self.ledger().warn(format!(
                    "Entry {:?} {} on {} failed: {}; position check failed: {}",
                    side, quantity, symbol, error, check
                ));
                Err(error.into())
            }
        }
    }

    async fn place_protective_stop(&self, position: &Position) {
        if !self.config.trading.protective_stop {
            return;
        }
        let raw = self.positions.stop_loss_price(position);
        let trigger =
            round_stop_price(raw, self.filters.price_precision, position.side).unwrap_or(raw);
        if let Err(e) = self.gateway.protective_stop(position, trigger).await {
            self.ledger().warn(format!(
                "Protective stop at {} for {} not placed: {}",
                trigger,
                self.symbol(),
                e
            ));
        }
    }

    async fn retry_close(&mut self) -> Result<Option<ClosedTrade>> {
        let Some(position) = self.positions.position().cloned() else {
            return Ok(None);
        };
        self.attempt_close(position).await
    }

    /// Submit a close for a CLOSING position
    ///
    /// On a terminal failure the exchange is asked whether the position is
    /// already gone; if so the close is confirmed at the last price.
    async fn attempt_close(&mut self, position: Position) -> Result<Option<ClosedTrade>> {
        match self.gateway.close(&position).await {
            Ok(fill) => {
                let trade = self.finish_close(fill.avg_price, fill.executed_qty).await?;
                Ok(Some(trade))
            }
            Err(e) => {
                let attempts = self.positions.close_failed()?;

                if !matches!(e, OrderError::RetriesExhausted { .. }) {
                    if let Some(trade) = self.reconcile_close(&position).await? {
                        return Ok(Some(trade));
                    }
                }

                self.ledger().critical(format!(
                    "Close of {:?} {} {} failed ({} cycles): {}",
                    position.side,
                    position.quantity,
                    self.symbol(),
                    attempts,
                    e
                ));
                Err(BotError::CloseFailure {
                    symbol: self.symbol().to_string(),
                    side: format!("{:?}", position.side),
                    quantity: position.quantity,
                    attempts,
                    source: e,
                })
            }
        }
    }

    async fn reconcile_close(&mut self, position: &Position) -> Result<Option<ClosedTrade>> {
        let exchange_position = match self.exchange.get_position(self.symbol()).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(symbol = %self.symbol(), error = %e, "Position reconcile failed");
                return Ok(None);
            }
        };
        if exchange_position.is_some() {
            return Ok(None);
        }

        let price = self.last_price.unwrap_or(position.entry_price);
        self.ledger().warn(format!(
            "Exchange reports {} flat; close confirmed at last price {:.2}",
            self.symbol(),
            price
        ));
        self.finish_close(price, position.quantity).await.map(Some)
    }

    async fn finish_close(&mut self, price: f64, quantity: f64) -> Result<ClosedTrade> {
        let trade = self.positions.confirm_close(price, quantity, Utc::now())?;
        self.account.equity += trade.net_pnl;

        self.ledger().trade(
            format!(
                "Closed {:?} {} {} @ {:.2} ({:?}), net {:.4}{}",
                trade.side,
                trade.quantity,
                self.symbol(),
                trade.exit_price,
                trade.reason,
                trade.net_pnl,
                if trade.fully_closed { "" } else { ", remainder pending" }
            ),
            trade.net_pnl,
        );

        if trade.fully_closed && self.config.trading.protective_stop {
            if let Err(e) = self.exchange.cancel_all_orders(self.symbol()).await {
                tracing::warn!(symbol = %self.symbol(), error = %e, "Failed to cancel open orders after close");
            }
        }
        Ok(trade)
    }

    async fn finish_on_shutdown(&mut self) {
        if self.config.trading.flatten_on_shutdown {
            if let Ok(position) = self.positions.begin_close(ExitReason::Shutdown) {
                tracing::info!(symbol = %self.symbol(), side = ?position.side, "Flattening on shutdown");
            }
        }

        if matches!(self.positions.state(), PositionState::Closing { .. }) {
            if let Err(e) = self.retry_close().await {
                self.ledger()
                    .critical(format!("Shutdown with close still pending: {}", e));
            }
        }
        if let PositionState::Open(position) = self.positions.state() {
            let message = format!(
                "Shutdown with OPEN {:?} position of {} @ {:.2} left on the exchange",
                position.side, position.quantity, position.entry_price
            );
            self.ledger().warn(message);
        }
        self.ledger().info("Bot shut down");
    }

    fn publish_status(&self) {
        let position = self.positions.position();
        let status = BotStatus {
            running: *self.running.borrow(),
            state: self.positions.state().name().to_string(),
            side: self.positions.side(),
            entry_price: position.map(|p| p.entry_price),
            quantity: position.map_or(0.0, |p| p.quantity),
            equity: self.account.equity,
            last_price: self.last_price,
            unrealized_pnl: self
                .last_price
                .map_or(0.0, |price| self.positions.unrealized_pnl(price)),
            realized_pnl: self.positions.realized_pnl(),
        };
        self.status.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExchangeError;
    use crate::execution::ledger::Severity;
    use crate::models::{ExchangePosition, Fill, OrderIntent, OrderStatus};
    use async_trait::async_trait;

    /// Exchange that accepts everything and reports flat
    struct QuietExchange;

    #[async_trait]
    impl Exchange for QuietExchange {
        async fn get_recent_candles(
            &self,
            _symbol: &str,
            _interval: &str,
            _limit: usize,
        ) -> std::result::Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn get_latest_price(&self, _symbol: &str) -> std::result::Result<f64, ExchangeError> {
            Ok(60000.0)
        }

        async fn get_account_equity(&self, _asset: &str) -> std::result::Result<f64, ExchangeError> {
            Ok(50.0)
        }

        async fn place_order(
            &self,
            _symbol: &str,
            intent: &OrderIntent,
        ) -> std::result::Result<Fill, ExchangeError> {
            Ok(Fill {
                order_id: "1".to_string(),
                client_order_id: intent.client_order_id.clone(),
                status: OrderStatus::Filled,
                executed_qty: intent.quantity,
                avg_price: 60000.0,
                timestamp: Utc::now(),
            })
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> std::result::Result<(), ExchangeError> {
            Ok(())
        }

        async fn get_symbol_filters(
            &self,
            _symbol: &str,
        ) -> std::result::Result<SymbolFilters, ExchangeError> {
            Err(ExchangeError::InvalidResponse("no filters".to_string()))
        }

        async fn get_position(
            &self,
            _symbol: &str,
        ) -> std::result::Result<Option<ExchangePosition>, ExchangeError> {
            Ok(None)
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> std::result::Result<(), ExchangeError> {
            Ok(())
        }
    }

    fn bot() -> TradingBot {
        TradingBot::new(BotConfig::default(), Arc::new(QuietExchange))
    }

    #[tokio::test]
    async fn test_initialize_falls_back_to_configured_filters() {
        let mut bot = bot();
        bot.initialize().await.unwrap();

        assert_eq!(bot.filters(), &SymbolFilters::default());
        assert_eq!(bot.account().equity, 50.0);
        assert_eq!(bot.handle().status().equity, 50.0);
        assert!(bot.positions().is_flat());
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let bot = bot();
        let handle = bot.handle();

        assert!(handle.start().running);
        assert!(handle.start().running);
        assert!(!handle.stop().running);
        assert!(!handle.stop().running);

        let messages: Vec<String> = handle
            .recent_log_entries(10)
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["Bot started", "Bot stopped"]);
    }

    #[tokio::test]
    async fn test_stopped_cycle_without_data_does_nothing() {
        let mut bot = bot();
        bot.initialize().await.unwrap();

        bot.run_cycle().await.unwrap();
        assert!(bot.positions().is_flat());
        assert_eq!(bot.handle().status().last_price, Some(60000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_shutdown() {
        let mut bot = bot();
        bot.initialize().await.unwrap();
        let handle = bot.handle();
        handle.start();

        let task = tokio::spawn(bot.run());
        tokio::time::sleep(std::time::Duration::from_secs(12)).await;
        handle.shutdown();
        task.await.unwrap().unwrap();

        assert!(handle.is_shutdown());
        let last = handle.recent_log_entries(1);
        assert_eq!(last[0].message, "Bot shut down");
        assert_eq!(last[0].severity, Severity::Info);
    }
}
