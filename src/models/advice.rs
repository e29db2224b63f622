//! Decision advisor contract. Advice is untrusted input and is re-validated
//! before anything reaches the broker.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Direction suggested by the advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdviceSide {
    Long,
    Short,
    #[default]
    No,
}

impl AdviceSide {
    pub fn as_side(&self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Long),
            Self::Short => Some(Side::Short),
            Self::No => None,
        }
    }
}

/// How to enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryMode {
    #[default]
    Market,
    Limit,
}

impl EntryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
        }
    }
}

/// Management action for an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdvisorAction {
    #[default]
    Hold,
    Exit,
    Scale,
    MoveBe,
    ReduceTp,
    ShrinkSl,
}

/// One advisor response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Advice {
    #[serde(default)]
    pub side: AdviceSide,
    #[serde(default)]
    pub mode: EntryMode,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub tp_pips: Option<f64>,
    #[serde(default)]
    pub sl_pips: Option<f64>,
    #[serde(default)]
    pub action: AdvisorAction,
    #[serde(default)]
    pub confidence: f64,
}

impl Advice {
    /// Advice that only asks for a management action.
    pub fn action(action: AdvisorAction) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    /// Positive, finite TP distance if the advisor gave one.
    pub fn tp(&self) -> Option<f64> {
        self.tp_pips.filter(|v| v.is_finite() && *v > 0.0)
    }

    /// Positive, finite SL distance if the advisor gave one.
    pub fn sl(&self) -> Option<f64> {
        self.sl_pips.filter(|v| v.is_finite() && *v > 0.0)
    }
}
