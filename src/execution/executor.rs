use crate::execution::position_manager::{ExitReason, PositionManager, PositionState};
use crate::models::{Side, Signal, SymbolFilters};
use crate::risk::{RiskSizer, SizeDecision};
use crate::strategy::signals::TradeSignal;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    /// Open a new position
    Enter { side: Side, quantity: f64 },
    /// Close the open position
    Close { reason: ExitReason },
    /// Re-submit a close left pending by an earlier failure
    RetryClose,
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// Inputs to one decision
#[derive(Debug, Clone, Copy)]
pub struct CycleInput<'a> {
    pub signal: &'a TradeSignal,
    /// Latest price; `None` when the feed has nothing fresh
    pub price: Option<f64>,
    pub equity: f64,
    pub leverage: u32,
    pub filters: &'a SymbolFilters,
    /// False while the bot is stopped: only a pending close is driven
    pub entries_allowed: bool,
}

/// Turns position state, signal and account into at most one action per cycle
///
/// Priority: pending close, then TP/SL, then reversal, then entry.
pub struct Executor {
    sizer: RiskSizer,
}

impl Executor {
    pub fn new(sizer: RiskSizer) -> Self {
        Self { sizer }
    }

    pub fn decide(&self, pm: &PositionManager, input: CycleInput<'_>) -> ExecutionDecision {
        match pm.state() {
            PositionState::Closing { attempts, reason, .. } => ExecutionDecision {
                action: ExecutionAction::RetryClose,
                reason: format!("Close pending ({:?}, {} failed attempts)", reason, attempts),
            },

            PositionState::Entering { .. } => ExecutionDecision::skip("Entry in flight"),

            _ if !input.entries_allowed => ExecutionDecision::skip("Bot stopped"),

            PositionState::Open(position) => {
                let Some(price) = input.price else {
                    return ExecutionDecision::skip("No fresh price for TP/SL check");
                };

                if let Some(reason) = pm.check_exit(price) {
                    let trigger = match reason {
                        ExitReason::TakeProfit => pm.take_profit_price(position),
                        _ => pm.stop_loss_price(position),
                    };
                    return ExecutionDecision {
                        action: ExecutionAction::Close { reason },
                        reason: format!(
                            "{:?} hit: price {:.2} vs trigger {:.2}",
                            reason, price, trigger
                        ),
                    };
                }

                if input.signal.direction.side() == Some(position.side.opposite()) {
                    return ExecutionDecision {
                        action: ExecutionAction::Close {
                            reason: ExitReason::Reversal,
                        },
                        reason: format!(
                            "{:?} signal against open {:?}",
                            input.signal.direction, position.side
                        ),
                    };
                }

                ExecutionDecision::skip(format!(
                    "Holding {:?}, unrealized {:.2}",
                    position.side,
                    position.unrealized_pnl(price)
                ))
            }

            PositionState::Flat => self.decide_entry(input),
        }
    }

    fn decide_entry(&self, input: CycleInput<'_>) -> ExecutionDecision {
        let Some(side) = input.signal.direction.side() else {
            return ExecutionDecision::skip("Flat signal");
        };
        let Some(price) = input.price else {
            return ExecutionDecision::skip("No fresh price for sizing");
        };
        let atr = input.signal.snapshot.and_then(|s| s.atr);

        match self
            .sizer
            .size(input.equity, input.leverage, price, atr, input.filters)
        {
            SizeDecision::Trade { quantity } => ExecutionDecision {
                action: ExecutionAction::Enter { side, quantity },
                reason: format!(
                    "{:?} signal, equity {:.2} at {}x",
                    input.signal.direction, input.equity, input.leverage
                ),
            },
            SizeDecision::NoTrade { reason } => {
                ExecutionDecision::skip(format!("{:?} signal but no trade: {}", Signal::from(side), reason))
            }
        }
    }
}

impl From<Side> for Signal {
    fn from(side: Side) -> Self {
        match side {
            Side::Long => Signal::Long,
            Side::Short => Signal::Short,
        }
    }
}
