use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Entries served when the caller does not ask for a count
pub const DEFAULT_RECENT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    /// Net PnL, set on realized closes
    pub pnl: Option<f64>,
}

/// Bounded log of notable bot events, newest last
///
/// Appends are mirrored to `tracing` at the matching level.
#[derive(Debug, Clone)]
pub struct TradeLedger {
    entries: VecDeque<LedgerEntry>,
    capacity: usize,
}

impl TradeLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, severity: Severity, message: impl Into<String>, pnl: Option<f64>) {
        let message = message.into();
        match severity {
            Severity::Info => tracing::info!(pnl, "{}", message),
            Severity::Warn => tracing::warn!(pnl, "{}", message),
            Severity::Critical => tracing::error!(pnl, critical = true, "{}", message),
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LedgerEntry {
            timestamp: Utc::now(),
            severity,
            message,
            pnl,
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.record(Severity::Info, message, None);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.record(Severity::Warn, message, None);
    }

    pub fn critical(&mut self, message: impl Into<String>) {
        self.record(Severity::Critical, message, None);
    }

    /// Realized close with its net PnL
    pub fn trade(&mut self, message: impl Into<String>, net_pnl: f64) {
        self.record(Severity::Info, message, Some(net_pnl));
    }

    /// The `n` most recent entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<LedgerEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TradeLedger {
    fn default() -> Self {
        Self::new(200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut ledger = TradeLedger::new(3);
        for i in 0..5 {
            ledger.info(format!("event {}", i));
        }

        assert_eq!(ledger.len(), 3);
        let recent = ledger.recent(10);
        assert_eq!(recent[0].message, "event 2");
        assert_eq!(recent[2].message, "event 4");
    }

    #[test]
    fn test_recent_returns_newest() {
        let mut ledger = TradeLedger::default();
        assert_eq!(ledger.capacity(), 200);
        for i in 0..150 {
            ledger.info(format!("event {}", i));
        }

        let recent = ledger.recent(DEFAULT_RECENT);
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0].message, "event 50");
        assert_eq!(recent[99].message, "event 149");
    }

    #[test]
    fn test_trade_entry_carries_pnl() {
        let mut ledger = TradeLedger::new(10);
        ledger.trade("Closed LONG", 244.5);
        ledger.critical("Close failed");

        let recent = ledger.recent(2);
        assert_eq!(recent[0].pnl, Some(244.5));
        assert_eq!(recent[0].severity, Severity::Info);
        assert_eq!(recent[1].severity, Severity::Critical);
        assert_eq!(recent[1].pnl, None);
    }
}
