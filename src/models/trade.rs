//! Trade records: immutable audit entries written on open and on close.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Instrument, Position, Side};

/// Which end of the position a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Open,
    Close,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Profit retraced too far from its peak
    PeakRetrace,
    /// Reversal bar pattern or EMA cross after a peak
    Reversal,
    /// Decision advisor asked to exit
    AdvisorExit,
    /// Portfolio risk breach closed everything
    RiskForceClose,
    /// Held past the maximum holding time
    MaxHold,
    /// Stop, take-profit or trailing stop filled at the broker
    BrokerClosed,
    /// Operator shutdown
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeakRetrace => "peak_retrace",
            Self::Reversal => "reversal",
            Self::AdvisorExit => "advisor_exit",
            Self::RiskForceClose => "risk_force_close",
            Self::MaxHold => "max_hold",
            Self::BrokerClosed => "broker_closed",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry finalized once per position open and once per close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub kind: RecordKind,
    pub instrument: Instrument,
    pub side: Side,
    pub units: u64,
    pub trade_id: String,
    pub correlation_id: String,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    /// Realized P/L in account currency, close records only
    pub realized_pnl: Option<f64>,
    pub pnl_pips: Option<f64>,
    pub max_profit_pips: f64,
    pub scale_count: u32,
}

impl TradeRecord {
    /// Record for a freshly opened position.
    pub fn opened(position: &Position) -> Self {
        Self {
            kind: RecordKind::Open,
            instrument: position.instrument.clone(),
            side: position.side,
            units: position.units,
            trade_id: position.trade_id.clone(),
            correlation_id: position.correlation_id.clone(),
            entry_price: position.entry_price,
            entry_time: position.entry_time,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: None,
            pnl_pips: None,
            max_profit_pips: 0.0,
            scale_count: 0,
        }
    }

    /// Record for a closed position. Partial-close P/L already booked on
    /// the position is folded into `realized_pnl`.
    pub fn closed(
        position: &Position,
        exit_price: Option<Decimal>,
        realized_pnl: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: RecordKind::Close,
            instrument: position.instrument.clone(),
            side: position.side,
            units: position.units,
            trade_id: position.trade_id.clone(),
            correlation_id: position.correlation_id.clone(),
            entry_price: position.entry_price,
            entry_time: position.entry_time,
            exit_price,
            exit_time: Some(now),
            exit_reason: Some(reason),
            realized_pnl: Some(realized_pnl + position.realized_pnl),
            pnl_pips: exit_price.map(|p| position.pips_from_entry(p)),
            max_profit_pips: position.flags.max_profit_pips,
            scale_count: position.flags.scale_count,
        }
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl.map(|p| p > 0.0).unwrap_or(false)
    }
}
