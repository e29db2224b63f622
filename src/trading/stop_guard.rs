//! Stop-loss distance and reward:risk validation.

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::models::{Candle, Instrument, Side};

use super::config::StopConfig;
use super::outcome::{SkipReason, Verdict};

/// `sl > 0 && tp / sl >= min_rrr`.
pub fn validate_rrr(tp_pips: f64, sl_pips: f64, min_rrr: f64) -> bool {
    sl_pips > 0.0 && tp_pips / sl_pips >= min_rrr
}

/// RRR after subtracting spread and slippage from the target.
pub fn validate_rrr_after_cost(
    tp_pips: f64,
    sl_pips: f64,
    min_rrr: f64,
    spread_pips: f64,
    slippage_pips: f64,
) -> bool {
    validate_rrr(tp_pips - spread_pips - slippage_pips, sl_pips, min_rrr)
}

/// Shrink the stop so `tp / sl == min_rrr`. Never widens it.
pub fn shrink_sl_for_rrr(tp_pips: f64, sl_pips: f64, min_rrr: f64) -> f64 {
    if min_rrr <= 0.0 {
        return sl_pips;
    }
    sl_pips.min(tp_pips / min_rrr)
}

/// Stop and target distances approved for submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopPlan {
    pub tp_pips: f64,
    pub sl_pips: f64,
    pub min_sl_pips: f64,
}

/// Derives and validates stop distances.
pub struct StopLossGuard {
    config: StopConfig,
}

impl StopLossGuard {
    /// Create a new guard with given config.
    pub fn new(config: StopConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StopConfig {
        &self.config
    }

    /// True during configured high-liquidity hours.
    pub fn is_high_vol_session(&self, now: DateTime<Utc>) -> bool {
        let hour = now.hour();
        self.config
            .high_vol_hours_utc
            .iter()
            .any(|[start, end]| hour >= *start && hour < *end)
    }

    /// Pip distance from `entry` to the recent swing low (long) or swing high
    /// (short) over the lookback window.
    pub fn swing_distance_pips(
        &self,
        candles: &[Candle],
        side: Side,
        entry: Decimal,
        instrument: &Instrument,
    ) -> Option<f64> {
        let lookback = self.config.swing_lookback.max(1);
        let window = &candles[candles.len().saturating_sub(lookback)..];
        if window.is_empty() {
            return None;
        }

        let swing = match side {
            Side::Long => window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min),
            Side::Short => window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max),
        };
        if !swing.is_finite() {
            return None;
        }

        let entry = entry.to_f64()?;
        Some((entry - swing).abs() / instrument.pip_size_f64())
    }

    /// `max(atr * atr_mult, swing + buffer)`, widened in high-liquidity hours.
    pub fn min_stop_pips(&self, atr_pips: f64, swing_pips: Option<f64>, now: DateTime<Utc>) -> f64 {
        let atr_floor = atr_pips * self.config.atr_mult;
        let swing_floor = swing_pips
            .map(|s| s + self.config.swing_buffer_pips)
            .unwrap_or(0.0);

        let session = if self.is_high_vol_session(now) {
            self.config.high_vol_session_mult
        } else {
            1.0
        };

        atr_floor.max(swing_floor) * session
    }

    /// Fails when the proposed stop is tighter than `atr * min_atr_mult`.
    pub fn validate_sl(&self, sl_pips: f64, atr_pips: f64) -> bool {
        sl_pips >= atr_pips * self.config.min_atr_mult
    }

    /// Turn advisor TP/SL into validated distances:
    /// widen to the dynamic minimum, shrink the stop for RRR, check against
    /// ATR, then apply the cost-adjusted gate.
    #[allow(clippy::too_many_arguments)]
    pub fn plan(
        &self,
        tp_pips: Option<f64>,
        sl_pips: Option<f64>,
        atr_pips: f64,
        candles: &[Candle],
        side: Side,
        entry: Decimal,
        instrument: &Instrument,
        spread_pips: f64,
        now: DateTime<Utc>,
    ) -> Verdict<StopPlan> {
        let cfg = &self.config;
        let tp = tp_pips.unwrap_or(cfg.default_tp_pips);
        let mut sl = sl_pips.unwrap_or(cfg.default_sl_pips);

        let swing = self.swing_distance_pips(candles, side, entry, instrument);
        let min_sl = self.min_stop_pips(atr_pips, swing, now);
        if sl < min_sl {
            debug!(sl_pips = sl, min_sl_pips = min_sl, "Widening stop to dynamic minimum");
            sl = min_sl;
        }

        if !validate_rrr(tp, sl, cfg.min_rrr) {
            let shrunk = shrink_sl_for_rrr(tp, sl, cfg.min_rrr);
            info!(tp_pips = tp, sl_pips = sl, shrunk_pips = shrunk, "Shrinking stop to meet RRR");
            sl = shrunk;
        }

        if !self.validate_sl(sl, atr_pips) {
            return Verdict::Skip(SkipReason::StopTooTight {
                sl_pips: sl,
                min_pips: atr_pips * cfg.min_atr_mult,
            });
        }
        if !validate_rrr(tp, sl, cfg.min_rrr) {
            return Verdict::Skip(SkipReason::RrrTooLow {
                tp_pips: tp,
                sl_pips: sl,
                min_rrr: cfg.min_rrr,
            });
        }

        let net_tp = tp - spread_pips - cfg.slippage_pips;
        if net_tp < cfg.min_net_tp_pips
            || !validate_rrr_after_cost(tp, sl, cfg.min_rrr, spread_pips, cfg.slippage_pips)
        {
            return Verdict::Skip(SkipReason::CostExceedsTarget {
                net_tp_pips: net_tp,
                sl_pips: sl,
            });
        }

        Verdict::Act(StopPlan {
            tp_pips: tp,
            sl_pips: sl,
            min_sl_pips: min_sl,
        })
    }
}
