use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// True when every price/volume field is a finite number
    pub fn is_finite(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Direction of a position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn exit_order_side(self) -> OrderSide {
        self.opposite().entry_order_side()
    }
}

/// Position side as reported to the control surface (includes FLAT)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl From<Option<Side>> for PositionSide {
    fn from(side: Option<Side>) -> Self {
        match side {
            Some(Side::Long) => PositionSide::Long,
            Some(Side::Short) => PositionSide::Short,
            None => PositionSide::Flat,
        }
    }
}

/// Trading signal direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Long,
    Short,
    Flat,
}

impl Signal {
    pub fn side(self) -> Option<Side> {
        match self {
            Signal::Long => Some(Side::Long),
            Signal::Short => Some(Side::Short),
            Signal::Flat => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
        }
    }
}

/// An order the gateway should place
///
/// The client order id is fixed at construction and reused on every retry.
/// Binance only rejects a duplicate id while the first order is still open,
/// so a filled market order is not protected by it.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub client_order_id: String,
}

impl OrderIntent {
    pub fn market(side: OrderSide, quantity: f64) -> Self {
        Self {
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            reduce_only: false,
            client_order_id: new_client_order_id(),
        }
    }

    pub fn limit(side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(side, quantity)
        }
    }

    pub fn stop_market(side: OrderSide, quantity: f64, stop_price: f64) -> Self {
        Self {
            order_type: OrderType::StopMarket,
            stop_price: Some(stop_price),
            reduce_only: true,
            ..Self::market(side, quantity)
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

fn new_client_order_id() -> String {
    // Binance caps client order ids at 36 chars
    format!("fb-{}", Uuid::new_v4().simple())
        .chars()
        .take(36)
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// Exchange acknowledgement of an order
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    /// True when some quantity actually executed at a usable price
    pub fn is_executed(&self) -> bool {
        self.executed_qty > 0.0 && self.avg_price > 0.0 && self.avg_price.is_finite()
    }
}

/// Account snapshot, refreshed from the exchange on demand
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AccountState {
    pub equity: f64,
    pub leverage: u32,
}

/// Position as reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Exchange trading rules for a symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolFilters {
    pub quantity_precision: u32,
    pub price_precision: u32,
    pub min_qty: f64,
    pub min_notional: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        // BTCUSDT perpetual
        Self {
            quantity_precision: 3,
            price_precision: 1,
            min_qty: 0.001,
            min_notional: 100.0,
        }
    }
}
