//! Position model: one open FX position and its lifecycle flags.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Instrument, Quote, Side};

/// Primary lifecycle progression of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Entered,
    BreakevenArmed,
    Trailing,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Entered => "ENTERED",
            Self::BreakevenArmed => "BREAKEVEN_ARMED",
            Self::Trailing => "TRAILING",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// A protective or profit-taking order attached to a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedOrder {
    pub id: Option<String>,
    pub price: Decimal,
}

/// A trailing stop attached to a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedTrailing {
    pub id: Option<String>,
    pub distance_pips: f64,
}

/// Per-position flags. A fresh position starts with all of them cleared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionFlags {
    pub breakeven_reached: bool,
    /// The broker refused the breakeven stop; the position stays ENTERED
    pub breakeven_abandoned: bool,
    pub sl_reset_done: bool,
    pub tp_extended: bool,
    pub tp_reduced: bool,
    pub partial_closed: bool,
    pub scale_count: u32,
    pub max_profit_pips: f64,
}

/// Open position owned by exactly one lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,
    pub side: Side,

    /// Units currently open
    pub units: u64,

    /// Units at entry, before partial closes and scale-ins
    pub initial_units: u64,

    /// Average entry price
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,

    /// Broker trade id of the primary fill
    pub trade_id: String,

    /// Trade ids opened by scale-in fills
    #[serde(default)]
    pub scale_trade_ids: Vec<String>,

    /// Correlation id of the entry order
    pub correlation_id: String,

    /// Stop distance chosen at entry
    pub initial_sl_pips: f64,

    /// Take-profit distance chosen at entry
    pub initial_tp_pips: f64,

    pub stop_loss: Option<AttachedOrder>,
    pub take_profit: Option<AttachedOrder>,
    pub trailing_stop: Option<AttachedTrailing>,

    pub state: LifecycleState,

    #[serde(default)]
    pub flags: PositionFlags,

    /// Realized P/L of partial closes so far
    #[serde(default)]
    pub realized_pnl: f64,

    pub last_synced: Option<DateTime<Utc>>,
}

impl Position {
    /// Create a position from a fill acknowledgement.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        instrument: Instrument,
        side: Side,
        units: u64,
        entry_price: Decimal,
        entry_time: DateTime<Utc>,
        trade_id: String,
        correlation_id: String,
        sl_pips: f64,
        tp_pips: f64,
    ) -> Self {
        let stop_price = entry_price - side.sign() * instrument.pips_to_price(sl_pips);
        let take_profit = (tp_pips > 0.0).then(|| AttachedOrder {
            id: None,
            price: entry_price + side.sign() * instrument.pips_to_price(tp_pips),
        });

        Self {
            instrument,
            side,
            units,
            initial_units: units,
            entry_price,
            entry_time,
            trade_id,
            scale_trade_ids: Vec::new(),
            correlation_id,
            initial_sl_pips: sl_pips,
            initial_tp_pips: tp_pips,
            stop_loss: Some(AttachedOrder {
                id: None,
                price: stop_price,
            }),
            take_profit,
            trailing_stop: None,
            state: LifecycleState::Entered,
            flags: PositionFlags::default(),
            realized_pnl: 0.0,
            last_synced: None,
        }
    }

    /// Signed pip distance from entry to `price`, positive when in profit.
    pub fn pips_from_entry(&self, price: Decimal) -> f64 {
        self.instrument
            .price_to_pips((price - self.entry_price) * self.side.sign())
    }

    /// Unrealized profit in pips at the current quote.
    pub fn profit_pips(&self, quote: &Quote) -> f64 {
        self.pips_from_entry(quote.exit_price(self.side))
    }

    /// Unrealized P/L in quote currency at the current quote.
    pub fn unrealized_pnl(&self, quote: &Quote) -> f64 {
        let delta = (quote.exit_price(self.side) - self.entry_price) * self.side.sign();
        (delta * Decimal::from(self.units)).to_f64().unwrap_or(0.0)
    }

    /// Track the running profit peak. Returns the peak.
    pub fn update_peak(&mut self, profit_pips: f64) -> f64 {
        if profit_pips > self.flags.max_profit_pips {
            self.flags.max_profit_pips = profit_pips;
        }
        self.flags.max_profit_pips
    }

    /// Price `pips` away from entry on the profit side (negative moves to the loss side).
    pub fn price_at(&self, pips: f64) -> Decimal {
        self.entry_price + self.side.sign() * self.instrument.pips_to_price(pips)
    }

    /// True when `candidate` is a tighter stop than the current one.
    pub fn improves_stop(&self, candidate: Decimal) -> bool {
        match &self.stop_loss {
            Some(current) => (candidate - current.price) * self.side.sign() > Decimal::ZERO,
            None => true,
        }
    }

    /// Add a scale-in fill, averaging the entry price.
    pub fn add(&mut self, units: u64, price: Decimal, trade_id: String) {
        let old_cost = self.entry_price * Decimal::from(self.units);
        let new_cost = price * Decimal::from(units);
        let total_units = self.units + units;

        if total_units > 0 {
            self.entry_price = self
                .instrument
                .round_price((old_cost + new_cost) / Decimal::from(total_units));
        }

        self.units = total_units;
        self.scale_trade_ids.push(trade_id);
        self.flags.scale_count += 1;
    }

    /// Reduce the tracked size after a partial close.
    pub fn reduce(&mut self, units: u64, realized_pnl: f64) -> u64 {
        let reduce_by = units.min(self.units);
        self.units -= reduce_by;
        self.realized_pnl += realized_pnl;
        reduce_by
    }

    pub fn hold_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.entry_time
    }
}
