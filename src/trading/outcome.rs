//! Tagged outcomes for declining to act, and the typed errors callers branch on.

use std::fmt;

use thiserror::Error;

/// Result of a decision that may legitimately decline to act.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<T> {
    Act(T),
    Skip(SkipReason),
}

impl<T> Verdict<T> {
    pub fn is_act(&self) -> bool {
        matches!(self, Verdict::Act(_))
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            Verdict::Skip(reason) => Some(reason),
            Verdict::Act(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Verdict<U> {
        match self {
            Verdict::Act(v) => Verdict::Act(f(v)),
            Verdict::Skip(r) => Verdict::Skip(r),
        }
    }
}

/// Why an entry or lifecycle step declined to act.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoSignal,
    NoPosition,
    PositionOpen,
    PendingEntry,
    MissingIndicator(&'static str),
    MissingPrice,
    LossStreak { losses: u32 },
    RiskVeto { cvar: f64, max_cvar: f64 },
    SizeBelowMinimum { lots: f64 },
    StopTooTight { sl_pips: f64, min_pips: f64 },
    RrrTooLow { tp_pips: f64, sl_pips: f64, min_rrr: f64 },
    CostExceedsTarget { net_tp_pips: f64, sl_pips: f64 },
    BelowTrigger { profit_pips: f64, trigger_pips: f64 },
    AlreadyDone(&'static str),
    NotArmed,
    Disabled(&'static str),
    Unchanged(&'static str),
    TrailTooWide { distance_pips: f64, profit_pips: f64 },
    NoTakeProfit,
    LimitExceeded { count: u32, max: u32 },
    BrokerRejected { code: String, message: String },
    BrokerUnavailable { attempts: u32, error: String },
    NotDue,
}

impl SkipReason {
    /// Short machine-readable code for the audit log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSignal => "no_signal",
            Self::NoPosition => "no_position",
            Self::PositionOpen => "position_open",
            Self::PendingEntry => "pending_entry",
            Self::MissingIndicator(_) => "missing_indicator",
            Self::MissingPrice => "missing_price",
            Self::LossStreak { .. } => "loss_streak",
            Self::RiskVeto { .. } => "risk_veto",
            Self::SizeBelowMinimum { .. } => "size_below_minimum",
            Self::StopTooTight { .. } => "stop_too_tight",
            Self::RrrTooLow { .. } => "rrr_too_low",
            Self::CostExceedsTarget { .. } => "cost_exceeds_target",
            Self::BelowTrigger { .. } => "below_trigger",
            Self::AlreadyDone(_) => "already_done",
            Self::NotArmed => "not_armed",
            Self::Disabled(_) => "disabled",
            Self::Unchanged(_) => "unchanged",
            Self::TrailTooWide { .. } => "trail_too_wide",
            Self::NoTakeProfit => "no_take_profit",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::BrokerRejected { .. } => "broker_rejected",
            Self::BrokerUnavailable { .. } => "broker_unavailable",
            Self::NotDue => "not_due",
        }
    }

    /// Skips that happen on most ticks and only deserve debug logging.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            Self::BelowTrigger { .. }
                | Self::AlreadyDone(_)
                | Self::NotArmed
                | Self::Disabled(_)
                | Self::Unchanged(_)
                | Self::NotDue
                | Self::NoSignal
                | Self::NoPosition
        )
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSignal => write!(f, "advisor gave no trade"),
            Self::NoPosition => write!(f, "no open position"),
            Self::PositionOpen => write!(f, "position already open"),
            Self::PendingEntry => write!(f, "entry order already pending"),
            Self::MissingIndicator(name) => write!(f, "indicator {} unavailable", name),
            Self::MissingPrice => write!(f, "price unavailable"),
            Self::LossStreak { losses } => write!(f, "{} consecutive losses", losses),
            Self::RiskVeto { cvar, max_cvar } => {
                write!(f, "CVaR {:.2} at or beyond budget {:.2}", cvar, max_cvar)
            }
            Self::SizeBelowMinimum { lots } => write!(f, "size {:.3} lots below minimum", lots),
            Self::StopTooTight { sl_pips, min_pips } => {
                write!(f, "stop {:.1}p tighter than minimum {:.1}p", sl_pips, min_pips)
            }
            Self::RrrTooLow {
                tp_pips,
                sl_pips,
                min_rrr,
            } => write!(f, "RRR {:.1}/{:.1} below {:.2}", tp_pips, sl_pips, min_rrr),
            Self::CostExceedsTarget {
                net_tp_pips,
                sl_pips,
            } => write!(
                f,
                "net target {:.1}p after costs too small for stop {:.1}p",
                net_tp_pips, sl_pips
            ),
            Self::BelowTrigger {
                profit_pips,
                trigger_pips,
            } => write!(f, "profit {:.1}p below trigger {:.1}p", profit_pips, trigger_pips),
            Self::AlreadyDone(what) => write!(f, "{} already done", what),
            Self::NotArmed => write!(f, "breakeven not armed"),
            Self::Disabled(what) => write!(f, "{} disabled", what),
            Self::Unchanged(what) => write!(f, "{} unchanged", what),
            Self::TrailTooWide {
                distance_pips,
                profit_pips,
            } => write!(
                f,
                "trail distance {:.1}p not below profit {:.1}p",
                distance_pips, profit_pips
            ),
            Self::NoTakeProfit => write!(f, "no take-profit attached"),
            Self::LimitExceeded { count, max } => write!(f, "count {} reached max {}", count, max),
            Self::BrokerRejected { code, message } => {
                write!(f, "broker rejected: {} {}", code, message)
            }
            Self::BrokerUnavailable { attempts, error } => {
                write!(f, "broker unavailable after {} attempts: {}", attempts, error)
            }
            Self::NotDue => write!(f, "not due"),
        }
    }
}

/// Errors from risk calculations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("cannot compute CVaR over an empty sample")]
    EmptySample,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_map() {
        let v: Verdict<u32> = Verdict::Act(2);
        assert_eq!(v.map(|x| x * 2), Verdict::Act(4));

        let s: Verdict<u32> = Verdict::Skip(SkipReason::NotArmed);
        assert_eq!(s.skip_reason().map(|r| r.code()), Some("not_armed"));
    }

    #[test]
    fn test_skip_reason_display() {
        let reason = SkipReason::RrrTooLow {
            tp_pips: 10.0,
            sl_pips: 20.0,
            min_rrr: 2.0,
        };
        assert_eq!(reason.to_string(), "RRR 10.0/20.0 below 2.00");
        assert!(!reason.is_routine());
    }
}
