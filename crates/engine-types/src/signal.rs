use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StrategyError;
use crate::market::Symbol;

/// Long or short, the two position directions this engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Long,
    Short,
}

/// Why an active signal closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseOutcome {
    Tp,
    Sl,
    Timeout,
    Manual,
}

/// The proposal a user strategy's `getSignal` callback returns for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalProposal {
    pub position: Position,
    /// Entry price. `None` means open immediately at the current market price.
    pub price_open: Option<Decimal>,
    pub price_take_profit: Decimal,
    pub price_stop_loss: Decimal,
    /// Timeout, in minutes, measured from `pending_at`.
    pub minute_estimated_time: u32,
    pub metadata: Option<serde_json::Value>,
}

impl SignalProposal {
    pub fn new(
        position: Position,
        price_take_profit: Decimal,
        price_stop_loss: Decimal,
        minute_estimated_time: u32,
    ) -> Self {
        Self {
            position,
            price_open: None,
            price_take_profit,
            price_stop_loss,
            minute_estimated_time,
            metadata: None,
        }
    }

    pub fn with_price_open(mut self, price_open: Decimal) -> Self {
        self.price_open = Some(price_open);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Validates the TP/SL/open price ordering invariant (data model
    /// invariant 3). For `long`: `stop_loss < open < take_profit`. For
    /// `short`: the reverse. When `price_open` is absent (market-open), only
    /// the stop-loss/take-profit ordering relative to direction is checked.
    pub fn validate(&self) -> Result<(), StrategyError> {
        let ordering_ok = match (self.position, self.price_open) {
            (Position::Long, Some(open)) => {
                self.price_stop_loss < open && open < self.price_take_profit
            }
            (Position::Short, Some(open)) => {
                self.price_take_profit < open && open < self.price_stop_loss
            }
            (Position::Long, None) => self.price_stop_loss < self.price_take_profit,
            (Position::Short, None) => self.price_take_profit < self.price_stop_loss,
        };

        if !ordering_ok {
            return Err(StrategyError::InvalidProposal {
                message: format!(
                    "invalid TP/SL ordering for {:?} proposal: open={:?} tp={} sl={}",
                    self.position, self.price_open, self.price_take_profit, self.price_stop_loss
                ),
            });
        }

        Ok(())
    }
}

/// The canonical persisted runtime object: a signal that is either scheduled
/// (pending activation) or active (holding a position).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    pub id: Uuid,
    pub symbol: Symbol,
    pub strategy_name: String,
    pub exchange_name: String,
    pub position: Position,
    pub price_open: Decimal,
    pub price_take_profit: Decimal,
    pub price_stop_loss: Decimal,
    pub minute_estimated_time: u32,
    pub scheduled_at: DateTime<Utc>,
    /// `None` while scheduled; set the moment the signal activates.
    pub pending_at: Option<DateTime<Utc>>,
    /// Discriminator kept alongside store placement for a self-describing
    /// JSON document (spec §3's `_isScheduled`).
    pub is_scheduled: bool,
}

impl SignalRow {
    pub fn composite_key(&self) -> String {
        format!("{}:{}", self.strategy_name, self.symbol)
    }

    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.symbol, self.strategy_name)
    }
}

/// A risk tracker's view of one open position, keyed by
/// `"{strategyName}:{symbol}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePosition {
    pub signal: SignalRow,
    pub strategy_name: String,
    pub exchange_name: String,
    pub open_timestamp: DateTime<Utc>,
}

impl ActivePosition {
    pub fn composite_key(&self) -> String {
        format!("{}:{}", self.strategy_name, self.signal.symbol)
    }
}

/// The tagged result emitted exactly once per `tick()`/fast-forward step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum TickResult {
    Idle {
        symbol: Symbol,
        strategy_name: String,
        exchange_name: String,
        when: DateTime<Utc>,
    },
    Scheduled {
        symbol: Symbol,
        strategy_name: String,
        exchange_name: String,
        when: DateTime<Utc>,
        signal_id: Uuid,
        price_open: Decimal,
    },
    Opened {
        symbol: Symbol,
        strategy_name: String,
        exchange_name: String,
        when: DateTime<Utc>,
        signal_id: Uuid,
        price_open: Decimal,
    },
    Active {
        symbol: Symbol,
        strategy_name: String,
        exchange_name: String,
        when: DateTime<Utc>,
        signal_id: Uuid,
        unrealized_pnl_pct: Decimal,
    },
    Closed {
        symbol: Symbol,
        strategy_name: String,
        exchange_name: String,
        when: DateTime<Utc>,
        signal_id: Uuid,
        price_open: Decimal,
        price_close: Decimal,
        pnl_pct: Decimal,
        outcome: CloseOutcome,
    },
    Cancelled {
        symbol: Symbol,
        strategy_name: String,
        exchange_name: String,
        when: DateTime<Utc>,
        signal_id: Uuid,
        reason: String,
    },
}

impl TickResult {
    pub fn symbol(&self) -> &Symbol {
        match self {
            TickResult::Idle { symbol, .. }
            | TickResult::Scheduled { symbol, .. }
            | TickResult::Opened { symbol, .. }
            | TickResult::Active { symbol, .. }
            | TickResult::Closed { symbol, .. }
            | TickResult::Cancelled { symbol, .. } => symbol,
        }
    }
}

/// Realised or unrealised PnL percentage for a position, net of a constant
/// fee rate subtracted from both the entry and exit leg.
pub fn pnl_pct(position: Position, entry: Decimal, exit: Decimal, fee_rate: Decimal) -> Decimal {
    let raw = match position {
        Position::Long => (exit - entry) / entry,
        Position::Short => (entry - exit) / entry,
    };
    (raw - fee_rate * Decimal::from(2)) * Decimal::from(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn long_proposal_ordering_rejected_when_violated() {
        let proposal = SignalProposal::new(Position::Long, dec!(90), dec!(95), 60)
            .with_price_open(dec!(100));
        assert!(proposal.validate().is_err());
    }

    #[test]
    fn long_proposal_ordering_accepted() {
        let proposal = SignalProposal::new(Position::Long, dec!(110), dec!(95), 60)
            .with_price_open(dec!(100));
        assert!(proposal.validate().is_ok());
    }

    #[test]
    fn short_proposal_ordering_accepted() {
        let proposal = SignalProposal::new(Position::Short, dec!(90), dec!(105), 60)
            .with_price_open(dec!(100));
        assert!(proposal.validate().is_ok());
    }

    #[test]
    fn market_open_proposal_checks_direction_only() {
        let long_ok = SignalProposal::new(Position::Long, dec!(110), dec!(95), 60);
        assert!(long_ok.validate().is_ok());

        let long_bad = SignalProposal::new(Position::Long, dec!(90), dec!(95), 60);
        assert!(long_bad.validate().is_err());
    }

    #[test]
    fn pnl_long_take_profit() {
        // S1: long closed at TP 110 from open 100, fee=0 -> +10.0%
        let pnl = pnl_pct(Position::Long, dec!(100), dec!(110), dec!(0));
        assert_eq!(pnl, dec!(10.0));
    }

    #[test]
    fn pnl_long_stop_loss() {
        // S2: long closed at SL 95 from open 100, fee=0 -> -5.0%
        let pnl = pnl_pct(Position::Long, dec!(100), dec!(95), dec!(0));
        assert_eq!(pnl, dec!(-5.0));
    }

    #[test]
    fn pnl_short_mirrors_long() {
        let long_pnl = pnl_pct(Position::Long, dec!(100), dec!(110), dec!(0));
        let short_pnl = pnl_pct(Position::Short, dec!(100), dec!(90), dec!(0));
        assert_eq!(long_pnl, short_pnl);
    }

    #[test]
    fn pnl_subtracts_fee_from_both_legs() {
        let pnl_no_fee = pnl_pct(Position::Long, dec!(100), dec!(110), dec!(0));
        let pnl_with_fee = pnl_pct(Position::Long, dec!(100), dec!(110), dec!(0.001));
        // fee_rate * 2 * 100 = 0.2 percentage points subtracted
        assert_eq!(pnl_no_fee - pnl_with_fee, dec!(0.2));
    }

    #[test]
    fn composite_key_format() {
        let row = SignalRow {
            id: Uuid::nil(),
            symbol: Symbol::new("BTCUSDT"),
            strategy_name: "trend".into(),
            exchange_name: "binance".into(),
            position: Position::Long,
            price_open: dec!(100),
            price_take_profit: dec!(110),
            price_stop_loss: dec!(95),
            minute_estimated_time: 60,
            scheduled_at: Utc::now(),
            pending_at: None,
            is_scheduled: true,
        };
        assert_eq!(row.composite_key(), "trend:BTCUSDT");
        assert_eq!(row.file_stem(), "BTCUSDT_trend");
    }
}
