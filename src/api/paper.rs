use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use super::{Exchange, ExchangeError};
use crate::config::parse_interval;
use crate::models::{
    Candle, ExchangePosition, Fill, OrderIntent, OrderSide, OrderStatus, OrderType, Side,
    SymbolFilters,
};

/// Paper trading settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_initial_equity")]
    pub initial_equity: f64,
    #[serde(default = "default_start_price")]
    pub start_price: f64,
    /// Standard deviation of the per-candle return
    #[serde(default = "default_volatility")]
    pub volatility: f64,
    #[serde(default = "default_base_volume")]
    pub base_volume: f64,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_equity: default_initial_equity(),
            start_price: default_start_price(),
            volatility: default_volatility(),
            base_volume: default_base_volume(),
            fee_rate: default_fee_rate(),
            seed: None,
        }
    }
}

fn default_initial_equity() -> f64 {
    1000.0
}

fn default_start_price() -> f64 {
    60_000.0
}

fn default_volatility() -> f64 {
    0.002
}

fn default_base_volume() -> f64 {
    50.0
}

fn default_fee_rate() -> f64 {
    0.0004
}

#[derive(Debug, Clone)]
struct PendingStop {
    side: OrderSide,
    quantity: f64,
    stop_price: f64,
    client_order_id: String,
}

struct PaperState {
    rng: StdRng,
    candles: Vec<Candle>,
    /// Signed position amount, positive for long
    position_amt: f64,
    entry_price: f64,
    equity: f64,
    leverage: u32,
    stops: Vec<PendingStop>,
    next_order_id: u64,
}

/// In-process simulated exchange
///
/// Prices follow a seeded random walk; every candle request advances the
/// walk by one candle. Market orders fill at the last close.
pub struct PaperExchange {
    config: PaperConfig,
    filters: SymbolFilters,
    interval: ChronoDuration,
    state: Mutex<PaperState>,
}

const HISTORY_CANDLES: usize = 200;

impl PaperExchange {
    pub fn new(config: PaperConfig, interval: &str) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        let interval = parse_interval(interval)
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .unwrap_or_else(|| ChronoDuration::minutes(1));

        let mut state = PaperState {
            rng: StdRng::seed_from_u64(seed),
            candles: Vec::with_capacity(HISTORY_CANDLES + 1),
            position_amt: 0.0,
            entry_price: 0.0,
            equity: config.initial_equity,
            leverage: 1,
            stops: Vec::new(),
            next_order_id: 1,
        };

        let start = Utc::now() - interval * HISTORY_CANDLES as i32;
        let mut price = config.start_price;
        for i in 0..HISTORY_CANDLES {
            let candle = next_candle(&mut state.rng, &config, start + interval * i as i32, price);
            price = candle.close;
            state.candles.push(candle);
        }

        tracing::info!(
            seed,
            start_price = config.start_price,
            equity = config.initial_equity,
            "📄 Paper exchange initialized"
        );

        Self {
            config,
            filters: SymbolFilters::default(),
            interval,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PaperState>, ExchangeError> {
        self.state
            .lock()
            .map_err(|_| ExchangeError::InvalidResponse("paper exchange state poisoned".to_string()))
    }

    /// Advance the walk by one candle and trigger any resting stops
    fn step(&self, state: &mut PaperState) {
        let (open_time, price) = match state.candles.last() {
            Some(last) => (last.open_time + self.interval, last.close),
            None => (Utc::now(), self.config.start_price),
        };
        let candle = next_candle(&mut state.rng, &self.config, open_time, price);
        let (high, low) = (candle.high, candle.low);
        state.candles.push(candle);
        if state.candles.len() > HISTORY_CANDLES {
            let excess = state.candles.len() - HISTORY_CANDLES;
            state.candles.drain(..excess);
        }

        let triggered: Vec<PendingStop> = state
            .stops
            .iter()
            .filter(|stop| match stop.side {
                OrderSide::Sell => low <= stop.stop_price,
                OrderSide::Buy => high >= stop.stop_price,
            })
            .cloned()
            .collect();
        if triggered.is_empty() {
            return;
        }
        state.stops.clear();

        for stop in triggered {
            let quantity = stop.quantity.min(state.position_amt.abs());
            if quantity <= 0.0 {
                continue;
            }
            tracing::info!(
                stop_price = stop.stop_price,
                client_order_id = %stop.client_order_id,
                "Paper stop triggered"
            );
            self.execute(state, stop.side, quantity, stop.stop_price);
        }
    }

    fn last_price(state: &PaperState) -> f64 {
        state.candles.last().map(|c| c.close).unwrap_or(0.0)
    }

    /// Apply a fill to the simulated account
    fn execute(&self, state: &mut PaperState, side: OrderSide, quantity: f64, price: f64) {
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let current = state.position_amt;

        if current == 0.0 || current.signum() == signed.signum() {
            let total = current.abs() + quantity;
            state.entry_price = (state.entry_price * current.abs() + price * quantity) / total;
        } else {
            let closed = quantity.min(current.abs());
            state.equity += (price - state.entry_price) * closed * current.signum();
            if quantity > current.abs() {
                // Flipped through zero
                state.entry_price = price;
            }
        }

        state.equity -= price * quantity * self.config.fee_rate;
        state.position_amt = current + signed;
        if state.position_amt.abs() < 1e-12 {
            state.position_amt = 0.0;
            state.entry_price = 0.0;
        }
    }
}

fn next_candle(rng: &mut StdRng, config: &PaperConfig, open_time: DateTime<Utc>, open: f64) -> Candle {
    // Box-Muller for a normal return
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    let close = (open * (1.0 + z * config.volatility)).max(open * 0.5);

    let wick = open * config.volatility * rng.gen::<f64>();
    let high = open.max(close) + wick;
    let low = (open.min(close) - wick).max(f64::EPSILON);

    // Occasional volume spikes on large moves
    let spike = if z.abs() > 1.5 { 2.0 } else { 1.0 };
    let volume = config.base_volume * rng.gen_range(0.5..1.5) * spike;

    Candle {
        open_time,
        open,
        high,
        low,
        close,
        volume,
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_recent_candles(
        &self,
        _symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let mut state = self.lock()?;
        self.step(&mut state);
        let start = state.candles.len().saturating_sub(limit);
        Ok(state.candles[start..].to_vec())
    }

    async fn get_latest_price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
        let state = self.lock()?;
        Ok(Self::last_price(&state))
    }

    async fn get_account_equity(&self, _asset: &str) -> Result<f64, ExchangeError> {
        Ok(self.lock()?.equity)
    }

    async fn place_order(&self, _symbol: &str, intent: &OrderIntent) -> Result<Fill, ExchangeError> {
        let mut state = self.lock()?;
        let order_id = state.next_order_id;
        state.next_order_id += 1;
        let price = Self::last_price(&state);

        if !intent.quantity.is_finite() || intent.quantity <= 0.0 {
            return Err(ExchangeError::Rejected {
                code: -4003,
                message: "Quantity less than or equal to zero.".to_string(),
            });
        }

        let reduces = match intent.side {
            OrderSide::Buy => state.position_amt < 0.0,
            OrderSide::Sell => state.position_amt > 0.0,
        };
        if intent.reduce_only && !reduces {
            return Err(ExchangeError::Rejected {
                code: -2022,
                message: "ReduceOnly Order is rejected.".to_string(),
            });
        }

        if intent.order_type == OrderType::StopMarket {
            let stop_price = intent.stop_price.ok_or_else(|| ExchangeError::Rejected {
                code: -1102,
                message: "Mandatory parameter 'stopPrice' was not sent".to_string(),
            })?;
            state.stops.push(PendingStop {
                side: intent.side,
                quantity: intent.quantity,
                stop_price,
                client_order_id: intent.client_order_id.clone(),
            });
            return Ok(Fill {
                order_id: order_id.to_string(),
                client_order_id: intent.client_order_id.clone(),
                status: OrderStatus::New,
                executed_qty: 0.0,
                avg_price: 0.0,
                timestamp: Utc::now(),
            });
        }

        let quantity = if intent.reduce_only {
            intent.quantity.min(state.position_amt.abs())
        } else {
            intent.quantity
        };

        if !reduces {
            let required_margin = price * (state.position_amt.abs() + quantity) / f64::from(state.leverage);
            if required_margin > state.equity {
                return Err(ExchangeError::Rejected {
                    code: -2019,
                    message: "Margin is insufficient.".to_string(),
                });
            }
        }

        self.execute(&mut state, intent.side, quantity, price);

        Ok(Fill {
            order_id: order_id.to_string(),
            client_order_id: intent.client_order_id.clone(),
            status: OrderStatus::Filled,
            executed_qty: quantity,
            avg_price: price,
            timestamp: Utc::now(),
        })
    }

    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        if leverage == 0 || leverage > 125 {
            return Err(ExchangeError::Rejected {
                code: -4028,
                message: format!("Leverage {} is not valid", leverage),
            });
        }
        self.lock()?.leverage = leverage;
        Ok(())
    }

    async fn get_symbol_filters(&self, _symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        Ok(self.filters.clone())
    }

    async fn get_position(&self, _symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        let state = self.lock()?;
        if state.position_amt == 0.0 {
            return Ok(None);
        }
        Ok(Some(ExchangePosition {
            side: if state.position_amt > 0.0 { Side::Long } else { Side::Short },
            quantity: state.position_amt.abs(),
            entry_price: state.entry_price,
        }))
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> Result<(), ExchangeError> {
        self.lock()?.stops.clear();
        Ok(())
    }
}
