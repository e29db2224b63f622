//! Position sizing from balance, risk fraction and stop distance, throttled
//! by portfolio CVaR.

use tracing::debug;

use super::config::SizingConfig;
use super::outcome::{RiskError, SkipReason, Verdict};
use super::portfolio_risk::PortfolioRiskMonitor;

/// Lots risking `balance * risk_pct` over `stop_pips`.
///
/// With a risk monitor the base size is scaled by
/// `max(0, 1 - |CVaR| / maxCVaR)` and forced to exactly 0 once the CVaR
/// budget is reached, whatever the other inputs are.
pub fn size(
    balance: f64,
    risk_pct: f64,
    stop_pips: f64,
    pip_value: f64,
    risk: Option<&PortfolioRiskMonitor>,
) -> Result<f64, RiskError> {
    if let Some(monitor) = risk {
        if monitor.check_stop_conditions() {
            debug!(cvar = monitor.cvar(), "Sizing vetoed by CVaR budget");
            return Ok(0.0);
        }
    }

    if !(stop_pips > 0.0) {
        return Err(RiskError::InvalidParameter {
            name: "stop_pips",
            value: stop_pips,
        });
    }
    if !(pip_value > 0.0) {
        return Err(RiskError::InvalidParameter {
            name: "pip_value",
            value: pip_value,
        });
    }
    if !balance.is_finite() || !risk_pct.is_finite() {
        return Err(RiskError::InvalidParameter {
            name: "balance",
            value: balance * risk_pct,
        });
    }

    let base = (balance * risk_pct) / (stop_pips * pip_value);
    let factor = risk.map(|m| m.size_factor()).unwrap_or(1.0);

    Ok((base * factor).max(0.0))
}

/// Sizing with the configured bounds applied.
pub struct RiskSizer {
    config: SizingConfig,
}

impl RiskSizer {
    /// Create a new sizer with given config.
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    /// Units to submit for a new entry, or the reason not to enter.
    pub fn entry_units(
        &self,
        balance: f64,
        stop_pips: f64,
        risk: Option<&PortfolioRiskMonitor>,
    ) -> Result<Verdict<u64>, RiskError> {
        let lots = size(
            balance,
            self.config.risk_pct,
            stop_pips,
            self.config.pip_value,
            risk,
        )?;

        if lots == 0.0 {
            if let Some(m) = risk.filter(|m| m.check_stop_conditions()) {
                return Ok(Verdict::Skip(SkipReason::RiskVeto {
                    cvar: m.cvar(),
                    max_cvar: m.max_cvar(),
                }));
            }
        }
        if lots < self.config.min_lots {
            return Ok(Verdict::Skip(SkipReason::SizeBelowMinimum { lots }));
        }

        let lots = lots.min(self.config.max_lots);
        Ok(Verdict::Act(self.lots_to_units(lots)))
    }

    /// Units for a scale-in of `lots`, capped at `cap_units`.
    pub fn scale_units(&self, lots: f64, cap_units: u64) -> u64 {
        self.lots_to_units(lots.min(self.config.max_lots)).min(cap_units)
    }

    fn lots_to_units(&self, lots: f64) -> u64 {
        (lots * self.config.units_per_lot as f64).floor().max(0.0) as u64
    }
}
