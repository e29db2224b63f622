//! Market data consumed once per tick: quotes, candles and indicator series.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Instrument, Side};

/// Ordered series of indicator values, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Most recent finite value.
    pub fn latest(&self) -> Option<f64> {
        self.previous(0)
    }

    /// Value `n` steps back from the latest (`previous(0) == latest()`).
    pub fn previous(&self, n: usize) -> Option<f64> {
        let idx = self.values.len().checked_sub(n + 1)?;
        self.values.get(idx).copied().filter(|v| v.is_finite())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }
}

impl From<Vec<f64>> for TimeSeries {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

/// OHLC bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Indicator values computed upstream, all in price units.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSet {
    #[serde(default)]
    pub atr: TimeSeries,
    #[serde(default)]
    pub adx: TimeSeries,
    #[serde(default)]
    pub ema_fast: TimeSeries,
    #[serde(default)]
    pub ema_slow: TimeSeries,
}

/// Bid/ask snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
}

impl Quote {
    /// Price at which a position on `side` would be closed.
    pub fn exit_price(&self, side: Side) -> Decimal {
        match side {
            Side::Long => self.bid,
            Side::Short => self.ask,
        }
    }

    /// Price at which a new position on `side` would be filled.
    pub fn entry_price(&self, side: Side) -> Decimal {
        match side {
            Side::Long => self.ask,
            Side::Short => self.bid,
        }
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Everything the engine reads for one instrument on one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub instrument: Instrument,
    pub quote: Quote,
    #[serde(default)]
    pub candles: Vec<Candle>,
    #[serde(default)]
    pub indicators: IndicatorSet,
    /// 0 = quiet, 3 = high-impact release window.
    #[serde(default)]
    pub calendar_level: u8,
}

impl MarketSnapshot {
    pub fn spread_pips(&self) -> f64 {
        self.instrument.price_to_pips(self.quote.ask - self.quote.bid)
    }

    /// Latest ATR converted to pips.
    pub fn atr_pips(&self) -> Option<f64> {
        self.indicators
            .atr
            .latest()
            .map(|atr| self.instrument.value_to_pips(atr))
            .filter(|pips| *pips > 0.0)
    }

    pub fn adx(&self) -> Option<f64> {
        self.indicators.adx.latest()
    }

    /// Fast EMA crossed the slow EMA against `side` on the latest bar.
    pub fn ema_crossed_against(&self, side: Side) -> bool {
        let ind = &self.indicators;
        let (Some(fast), Some(slow), Some(prev_fast), Some(prev_slow)) = (
            ind.ema_fast.latest(),
            ind.ema_slow.latest(),
            ind.ema_fast.previous(1),
            ind.ema_slow.previous(1),
        ) else {
            return false;
        };

        match side {
            Side::Long => prev_fast >= prev_slow && fast < slow,
            Side::Short => prev_fast <= prev_slow && fast > slow,
        }
    }
}

/// Detect a three-bar peak (long) or trough (short) whose last bar closes
/// back against the position.
pub fn detect_peak_reversal(candles: &[Candle], side: Side) -> bool {
    let [a, b, c] = match candles {
        [.., a, b, c] => [a, b, c],
        _ => return false,
    };

    match side {
        Side::Long => b.high >= a.high && b.high >= c.high && c.close < b.close,
        Side::Short => b.low <= a.low && b.low <= c.low && c.close > b.close,
    }
}
