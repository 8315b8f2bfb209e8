use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ExchangePosition, Fill, PositionSide, Side};

/// Why a position is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    /// Opposing signal
    Reversal,
    /// Operator shutdown
    Shutdown,
}

/// What TP/SL percentages are measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitBasis {
    /// Percent move of the price from entry
    #[default]
    PriceMove,
    /// Percent return on margin; the price thresholds are divided by leverage
    LeveragedReturn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    /// Taker fee per leg as a fraction of notional
    pub fee_rate: f64,
    pub exit_basis: ExitBasis,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: 0.04,
            stop_loss_pct: 0.02,
            fee_rate: 0.0004,
            exit_basis: ExitBasis::PriceMove,
        }
    }
}

impl ExitConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.take_profit_pct > 0.0) || !(self.stop_loss_pct > 0.0) {
            return Err(format!(
                "exits.take_profit_pct ({}) and exits.stop_loss_pct ({}) must be positive",
                self.take_profit_pct, self.stop_loss_pct
            ));
        }
        if self.exit_basis == ExitBasis::PriceMove && self.stop_loss_pct >= 1.0 {
            return Err("exits.stop_loss_pct must be below 1.0".to_string());
        }
        if !(0.0..0.1).contains(&self.fee_rate) {
            return Err(format!("exits.fee_rate {} is out of range", self.fee_rate));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    /// Fee paid on the entry leg
    pub entry_commission: f64,
}

impl Position {
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.side.sign()
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }
}

/// Lifecycle of the single position this bot manages
#[derive(Debug, Clone, PartialEq)]
pub enum PositionState {
    Flat,
    /// Entry order submitted, not yet confirmed
    Entering {
        side: Side,
        quantity: f64,
        since: DateTime<Utc>,
    },
    Open(Position),
    /// Close submitted or pending retry
    Closing {
        position: Position,
        reason: ExitReason,
        attempts: u32,
        since: DateTime<Utc>,
    },
}

impl PositionState {
    pub fn name(&self) -> &'static str {
        match self {
            PositionState::Flat => "FLAT",
            PositionState::Entering { .. } => "ENTERING",
            PositionState::Open(_) => "OPEN",
            PositionState::Closing { .. } => "CLOSING",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error("invalid fill: {0}")]
    InvalidFill(String),
}

/// A realized close, full or partial
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub side: Side,
    pub reason: ExitReason,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub raw_pnl: f64,
    /// Entry and exit fees attributable to `quantity`
    pub commission: f64,
    pub net_pnl: f64,
    pub exit_time: DateTime<Utc>,
    /// False when part of the position is still CLOSING
    pub fully_closed: bool,
}

/// Quantities below this are treated as zero
const QTY_EPSILON: f64 = 1e-9;

/// Authoritative in-memory record of the position
///
/// Every transition goes through a method here; anything not allowed from
/// the current state is an `InvalidTransition` and leaves the state as is.
pub struct PositionManager {
    state: PositionState,
    exits: ExitConfig,
    leverage: u32,
    realized_pnl: f64,
    closed_trades: u32,
}

impl PositionManager {
    pub fn new(exits: ExitConfig, leverage: u32) -> Self {
        Self {
            state: PositionState::Flat,
            exits,
            leverage: leverage.max(1),
            realized_pnl: 0.0,
            closed_trades: 0,
        }
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn is_flat(&self) -> bool {
        matches!(self.state, PositionState::Flat)
    }

    /// Position currently held (OPEN or CLOSING)
    pub fn position(&self) -> Option<&Position> {
        match &self.state {
            PositionState::Open(position) | PositionState::Closing { position, .. } => {
                Some(position)
            }
            _ => None,
        }
    }

    pub fn side(&self) -> PositionSide {
        match &self.state {
            PositionState::Flat => PositionSide::Flat,
            PositionState::Entering { side, .. } => PositionSide::from(Some(*side)),
            _ => PositionSide::from(self.position().map(|p| p.side)),
        }
    }

    /// Total net PnL of confirmed closes
    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn closed_trades(&self) -> u32 {
        self.closed_trades
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.position().map_or(0.0, |p| p.unrealized_pnl(price))
    }

    pub fn exits(&self) -> &ExitConfig {
        &self.exits
    }

    fn invalid(&self, action: &'static str) -> PositionError {
        PositionError::InvalidTransition {
            action,
            state: self.state.name(),
        }
    }

    fn threshold(&self, pct: f64) -> f64 {
        match self.exits.exit_basis {
            ExitBasis::PriceMove => pct,
            ExitBasis::LeveragedReturn => pct / f64::from(self.leverage),
        }
    }

    /// Price at which `position` takes profit
    pub fn take_profit_price(&self, position: &Position) -> f64 {
        position.entry_price * (1.0 + position.side.sign() * self.threshold(self.exits.take_profit_pct))
    }

    /// Price at which `position` is stopped out
    pub fn stop_loss_price(&self, position: &Position) -> f64 {
        position.entry_price * (1.0 - position.side.sign() * self.threshold(self.exits.stop_loss_pct))
    }

    /// TP/SL check against the latest price; only an OPEN position can trigger
    pub fn check_exit(&self, price: f64) -> Option<ExitReason> {
        let PositionState::Open(position) = &self.state else {
            return None;
        };
        if !price.is_finite() {
            return None;
        }

        let tp = self.take_profit_price(position);
        let sl = self.stop_loss_price(position);
        let (hit_tp, hit_sl) = match position.side {
            Side::Long => (price >= tp, price <= sl),
            Side::Short => (price <= tp, price >= sl),
        };

        if hit_sl {
            Some(ExitReason::StopLoss)
        } else if hit_tp {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }

    /// FLAT → ENTERING
    pub fn begin_entry(&mut self, side: Side, quantity: f64) -> Result<(), PositionError> {
        if !self.is_flat() {
            return Err(self.invalid("begin entry"));
        }
        if !(quantity > 0.0) {
            return Err(PositionError::InvalidFill(format!("entry quantity {}", quantity)));
        }
        self.state = PositionState::Entering {
            side,
            quantity,
            since: Utc::now(),
        };
        Ok(())
    }

    /// ENTERING → OPEN on an executed fill
    pub fn confirm_entry(&mut self, fill: &Fill) -> Result<&Position, PositionError> {
        let PositionState::Entering { side, .. } = self.state else {
            return Err(self.invalid("confirm entry"));
        };
        if !fill.is_executed() {
            return Err(PositionError::InvalidFill(format!(
                "order {} executed {} at {}",
                fill.order_id, fill.executed_qty, fill.avg_price
            )));
        }

        self.state = PositionState::Open(Position {
            side,
            entry_price: fill.avg_price,
            quantity: fill.executed_qty,
            entry_time: fill.timestamp,
            entry_commission: fill.avg_price * fill.executed_qty * self.exits.fee_rate,
        });
        self.debug_check();

        match &self.state {
            PositionState::Open(position) => Ok(position),
            _ => Err(self.invalid("confirm entry")),
        }
    }

    /// ENTERING → FLAT after the entry order failed
    pub fn abort_entry(&mut self) -> Result<(), PositionError> {
        if !matches!(self.state, PositionState::Entering { .. }) {
            return Err(self.invalid("abort entry"));
        }
        self.state = PositionState::Flat;
        Ok(())
    }

    /// OPEN → CLOSING; returns the position to close
    pub fn begin_close(&mut self, reason: ExitReason) -> Result<Position, PositionError> {
        let PositionState::Open(position) = &self.state else {
            return Err(self.invalid("begin close"));
        };
        let position = position.clone();
        self.state = PositionState::Closing {
            position: position.clone(),
            reason,
            attempts: 0,
            since: Utc::now(),
        };
        Ok(position)
    }

    /// Record a failed close attempt; the position stays CLOSING
    pub fn close_failed(&mut self) -> Result<u32, PositionError> {
        if let PositionState::Closing { attempts, .. } = &mut self.state {
            *attempts += 1;
            return Ok(*attempts);
        }
        Err(self.invalid("record close failure"))
    }

    /// CLOSING → FLAT (or still CLOSING on a partial fill)
    ///
    /// PnL: raw = (exit − entry) × qty × side sign; each leg pays
    /// price × qty × fee_rate; net = raw − both fees.
    pub fn confirm_close(
        &mut self,
        exit_price: f64,
        executed_qty: f64,
        exit_time: DateTime<Utc>,
    ) -> Result<ClosedTrade, PositionError> {
        let PositionState::Closing {
            position, reason, ..
        } = &self.state
        else {
            return Err(self.invalid("confirm close"));
        };
        if !(exit_price > 0.0) || !exit_price.is_finite() || !(executed_qty > 0.0) {
            return Err(PositionError::InvalidFill(format!(
                "close executed {} at {}",
                executed_qty, exit_price
            )));
        }

        let quantity = executed_qty.min(position.quantity);
        let share = quantity / position.quantity;
        let raw_pnl = (exit_price - position.entry_price) * quantity * position.side.sign();
        let entry_fee = position.entry_commission * share;
        let exit_fee = exit_price * quantity * self.exits.fee_rate;
        let commission = entry_fee + exit_fee;
        let net_pnl = raw_pnl - commission;
        let remaining = position.quantity - quantity;
        let fully_closed = remaining <= QTY_EPSILON;

        let trade = ClosedTrade {
            side: position.side,
            reason: *reason,
            entry_price: position.entry_price,
            exit_price,
            quantity,
            raw_pnl,
            commission,
            net_pnl,
            exit_time,
            fully_closed,
        };

        if fully_closed {
            self.state = PositionState::Flat;
            self.closed_trades += 1;
        } else if let PositionState::Closing { position, .. } = &mut self.state {
            position.entry_commission -= entry_fee;
            position.quantity = remaining;
        }
        self.realized_pnl += net_pnl;
        self.debug_check();

        Ok(trade)
    }

    /// Replace the local record with the exchange's view (FLAT or OPEN only)
    ///
    /// The position is rebuilt as a whole from the exchange's weighted
    /// entry price and size; no fields are merged.
    pub fn adopt(&mut self, exchange: &ExchangePosition) -> Result<&Position, PositionError> {
        if !matches!(self.state, PositionState::Flat | PositionState::Open(_)) {
            return Err(self.invalid("adopt exchange position"));
        }
        if !(exchange.quantity > 0.0) || !(exchange.entry_price > 0.0) {
            return Err(PositionError::InvalidFill(format!(
                "exchange position {} @ {}",
                exchange.quantity, exchange.entry_price
            )));
        }

        let entry_time = self
            .position()
            .filter(|p| p.side == exchange.side)
            .map_or_else(Utc::now, |p| p.entry_time);

        self.state = PositionState::Open(Position {
            side: exchange.side,
            entry_price: exchange.entry_price,
            quantity: exchange.quantity,
            entry_time,
            entry_commission: exchange.entry_price * exchange.quantity * self.exits.fee_rate,
        });
        self.debug_check();

        match &self.state {
            PositionState::Open(position) => Ok(position),
            _ => Err(self.invalid("adopt exchange position")),
        }
    }

    /// `quantity > 0` and a positive entry price exactly when a position is held
    pub fn invariants_hold(&self) -> bool {
        match &self.state {
            PositionState::Flat => true,
            PositionState::Entering { quantity, .. } => *quantity > 0.0,
            PositionState::Open(p) | PositionState::Closing { position: p, .. } => {
                p.quantity > 0.0 && p.entry_price > 0.0 && p.entry_price.is_finite()
            }
        }
    }

    fn debug_check(&self) {
        debug_assert!(self.invariants_hold(), "position invariants violated: {:?}", self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;

    fn fill(qty: f64, price: f64) -> Fill {
        Fill {
            order_id: "1".to_string(),
            client_order_id: "fb-test".to_string(),
            status: OrderStatus::Filled,
            executed_qty: qty,
            avg_price: price,
            timestamp: Utc::now(),
        }
    }

    fn manager(fee_rate: f64) -> PositionManager {
        PositionManager::new(
            ExitConfig {
                fee_rate,
                ..ExitConfig::default()
            },
            125,
        )
    }

    fn open(manager: &mut PositionManager, side: Side, qty: f64, price: f64) {
        manager.begin_entry(side, qty).unwrap();
        manager.confirm_entry(&fill(qty, price)).unwrap();
    }

    #[test]
    fn test_entry_lifecycle() {
        let mut pm = manager(0.0004);
        assert!(pm.is_flat());
        assert_eq!(pm.side(), PositionSide::Flat);

        pm.begin_entry(Side::Long, 0.104).unwrap();
        assert_eq!(pm.state().name(), "ENTERING");
        assert!(pm.position().is_none());
        assert!(pm.invariants_hold());

        let position = pm.confirm_entry(&fill(0.104, 60000.0)).unwrap();
        assert_eq!(position.entry_price, 60000.0);
        assert!((position.entry_commission - 2.496).abs() < 1e-9);
        assert_eq!(pm.side(), PositionSide::Long);
        assert!(pm.invariants_hold());
    }

    #[test]
    fn test_abort_entry_returns_to_flat() {
        let mut pm = manager(0.0004);
        pm.begin_entry(Side::Short, 0.1).unwrap();
        pm.abort_entry().unwrap();
        assert!(pm.is_flat());
        assert!(pm.invariants_hold());
    }

    #[test]
    fn test_cannot_enter_twice() {
        let mut pm = manager(0.0004);
        open(&mut pm, Side::Long, 0.1, 60000.0);

        let err = pm.begin_entry(Side::Long, 0.1).unwrap_err();
        assert_eq!(
            err,
            PositionError::InvalidTransition {
                action: "begin entry",
                state: "OPEN"
            }
        );
        assert_eq!(pm.position().unwrap().quantity, 0.1);
    }

    #[test]
    fn test_unexecuted_fill_is_rejected() {
        let mut pm = manager(0.0004);
        pm.begin_entry(Side::Long, 0.1).unwrap();
        assert!(pm.confirm_entry(&fill(0.0, 0.0)).is_err());
        assert_eq!(pm.state().name(), "ENTERING");
    }

    #[test]
    fn test_take_profit_trigger_price() {
        let mut pm = manager(0.0004);
        open(&mut pm, Side::Long, 0.104, 60000.0);

        let tp = pm.take_profit_price(pm.position().unwrap());
        assert!((tp - 62400.0).abs() < 1e-6);
        assert_eq!(pm.check_exit(62000.0), None);
        assert_eq!(pm.check_exit(62500.0), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_short_exit_thresholds() {
        let mut pm = manager(0.0004);
        open(&mut pm, Side::Short, 0.1, 50000.0);

        // TP 4% below entry, SL 2% above
        assert_eq!(pm.check_exit(47900.0), Some(ExitReason::TakeProfit));
        assert_eq!(pm.check_exit(51100.0), Some(ExitReason::StopLoss));
        assert_eq!(pm.check_exit(50500.0), None);
    }

    #[test]
    fn test_leveraged_return_basis() {
        let mut pm = PositionManager::new(
            ExitConfig {
                take_profit_pct: 0.5,
                stop_loss_pct: 0.25,
                exit_basis: ExitBasis::LeveragedReturn,
                ..ExitConfig::default()
            },
            125,
        );
        open(&mut pm, Side::Long, 0.1, 60000.0);

        // 50% on margin at 125x is a 0.4% price move
        let tp = pm.take_profit_price(pm.position().unwrap());
        assert!((tp - 60240.0).abs() < 1e-6);
        let sl = pm.stop_loss_price(pm.position().unwrap());
        assert!((sl - 59880.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_exit_check_while_closing() {
        let mut pm = manager(0.0004);
        open(&mut pm, Side::Long, 0.1, 60000.0);
        pm.begin_close(ExitReason::Reversal).unwrap();
        assert_eq!(pm.check_exit(10.0), None);
    }

    #[test]
    fn test_net_pnl_long_take_profit() {
        let mut pm = manager(0.0004);
        open(&mut pm, Side::Long, 0.104, 60000.0);
        pm.begin_close(ExitReason::TakeProfit).unwrap();

        let trade = pm.confirm_close(62400.0, 0.104, Utc::now()).unwrap();
        assert!((trade.raw_pnl - 249.6).abs() < 1e-9);
        assert!((trade.net_pnl - 244.50816).abs() < 1e-9);
        assert!(trade.fully_closed);
        assert!(pm.is_flat());
        assert!((pm.realized_pnl() - 244.50816).abs() < 1e-9);
    }

    #[test]
    fn test_net_pnl_matches_closed_form() {
        // net = (X - E) * Q - F * Q * (E + X) for a long
        let cases = [
            (60000.0, 58800.0, 0.05, 0.0004),
            (100.0, 100.0, 2.0, 0.001),
            (2500.0, 2650.0, 1.5, 0.0002),
        ];
        for (entry, exit, qty, fee) in cases {
            let mut pm = manager(fee);
            open(&mut pm, Side::Long, qty, entry);
            pm.begin_close(ExitReason::StopLoss).unwrap();
            let trade = pm.confirm_close(exit, qty, Utc::now()).unwrap();

            let expected = (exit - entry) * qty - fee * qty * (entry + exit);
            assert!(
                (trade.net_pnl - expected).abs() < 1e-9,
                "entry={} exit={} got {} expected {}",
                entry,
                exit,
                trade.net_pnl,
                expected
            );
        }
    }

    #[test]
    fn test_short_pnl_sign() {
        let mut pm = manager(0.0);
        open(&mut pm, Side::Short, 0.5, 3000.0);
        assert_eq!(pm.unrealized_pnl(2900.0), 50.0);

        pm.begin_close(ExitReason::TakeProfit).unwrap();
        let trade = pm.confirm_close(2900.0, 0.5, Utc::now()).unwrap();
        assert_eq!(trade.net_pnl, 50.0);
    }

    #[test]
    fn test_close_failure_stays_closing() {
        let mut pm = manager(0.0004);
        open(&mut pm, Side::Long, 0.1, 60000.0);
        pm.begin_close(ExitReason::StopLoss).unwrap();

        assert_eq!(pm.close_failed().unwrap(), 1);
        assert_eq!(pm.close_failed().unwrap(), 2);
        match pm.state() {
            PositionState::Closing {
                attempts, reason, ..
            } => {
                assert_eq!(*attempts, 2);
                assert_eq!(*reason, ExitReason::StopLoss);
            }
            other => panic!("expected CLOSING, got {:?}", other),
        }
        assert!(pm.invariants_hold());
    }

    #[test]
    fn test_partial_close_keeps_remainder() {
        let mut pm = manager(0.0);
        open(&mut pm, Side::Long, 0.3, 100.0);
        pm.begin_close(ExitReason::Reversal).unwrap();

        let first = pm.confirm_close(110.0, 0.1, Utc::now()).unwrap();
        assert!(!first.fully_closed);
        assert!((pm.position().unwrap().quantity - 0.2).abs() < 1e-12);
        assert_eq!(pm.state().name(), "CLOSING");

        let second = pm.confirm_close(110.0, 0.2, Utc::now()).unwrap();
        assert!(second.fully_closed);
        assert!(pm.is_flat());
        assert!((pm.realized_pnl() - 3.0).abs() < 1e-9);
        assert_eq!(pm.closed_trades(), 1);
    }

    #[test]
    fn test_adopt_replaces_whole_position() {
        let mut pm = manager(0.0004);
        open(&mut pm, Side::Long, 0.1, 60000.0);

        let adopted = pm
            .adopt(&ExchangePosition {
                side: Side::Long,
                quantity: 0.25,
                entry_price: 61000.0,
            })
            .unwrap();
        assert_eq!(adopted.quantity, 0.25);
        assert_eq!(adopted.entry_price, 61000.0);
        assert!(pm.invariants_hold());
    }

    #[test]
    fn test_adopt_not_allowed_while_closing() {
        let mut pm = manager(0.0004);
        open(&mut pm, Side::Long, 0.1, 60000.0);
        pm.begin_close(ExitReason::StopLoss).unwrap();

        let result = pm.adopt(&ExchangePosition {
            side: Side::Short,
            quantity: 1.0,
            entry_price: 1.0,
        });
        assert!(result.is_err());
        assert_eq!(pm.state().name(), "CLOSING");
    }

    #[test]
    fn test_confirm_close_requires_closing() {
        let mut pm = manager(0.0004);
        assert!(pm.confirm_close(100.0, 1.0, Utc::now()).is_err());
        open(&mut pm, Side::Long, 0.1, 60000.0);
        assert!(pm.confirm_close(100.0, 1.0, Utc::now()).is_err());
        assert_eq!(pm.state().name(), "OPEN");
    }
}
