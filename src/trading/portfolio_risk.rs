//! Portfolio-level risk: CVaR over realized and unrealized P/L, plus the
//! loss-streak guard.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::config::PortfolioConfig;
use super::outcome::{RiskError, SkipReason, Verdict};

/// Conditional value at risk: the mean of the worst `ceil(n * alpha)` values.
pub fn calc_cvar(values: &[f64], alpha: f64) -> Result<f64, RiskError> {
    if !(alpha > 0.0 && alpha <= 1.0) {
        return Err(RiskError::InvalidParameter {
            name: "alpha",
            value: alpha,
        });
    }
    if values.is_empty() {
        return Err(RiskError::EmptySample);
    }

    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return Err(RiskError::EmptySample);
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let tail = ((sorted.len() as f64 * alpha).ceil() as usize).clamp(1, sorted.len());
    Ok(sorted[..tail].iter().sum::<f64>() / tail as f64)
}

/// Snapshot of portfolio risk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskState {
    /// CVaR over the latest sample (0 when empty)
    pub cvar: f64,
    pub loss_streak: u32,
    pub safety_triggered: bool,
    pub sample_size: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Aggregates P/L into a CVaR estimate and tracks consecutive losses.
pub struct PortfolioRiskMonitor {
    config: PortfolioConfig,
    state: RiskState,
    last_loss_at: Option<DateTime<Utc>>,
}

impl PortfolioRiskMonitor {
    /// Create a new monitor with given config.
    pub fn new(config: PortfolioConfig) -> Self {
        Self {
            config,
            state: RiskState::default(),
            last_loss_at: None,
        }
    }

    /// Swap in a reloaded configuration, keeping the accumulated state.
    pub fn set_config(&mut self, config: PortfolioConfig) {
        self.config = config;
        self.refresh_safety();
    }

    /// Recompute CVaR over recent realized P/L followed by the unrealized
    /// P/L of every open position.
    pub fn update(&mut self, realized: &[f64], unrealized: &[f64], now: DateTime<Utc>) -> &RiskState {
        let sample: Vec<f64> = realized.iter().chain(unrealized).copied().collect();

        self.state.cvar = match calc_cvar(&sample, self.config.alpha) {
            Ok(cvar) => cvar,
            Err(RiskError::EmptySample) => 0.0,
            Err(e) => {
                warn!(error = %e, "CVaR calculation failed");
                0.0
            }
        };
        self.state.sample_size = sample.len();
        self.state.updated_at = Some(now);
        self.expire_loss_streak(now);
        self.refresh_safety();

        &self.state
    }

    /// True when `|CVaR| >= max_cvar`.
    pub fn check_stop_conditions(&self) -> bool {
        self.state.cvar.abs() >= self.config.max_cvar
    }

    /// Throttle factor applied to sizing: `max(0, 1 - |CVaR| / maxCVaR)`,
    /// exactly 0 once the budget is reached.
    pub fn size_factor(&self) -> f64 {
        if self.check_stop_conditions() {
            return 0.0;
        }
        (1.0 - self.state.cvar.abs() / self.config.max_cvar).max(0.0)
    }

    pub fn cvar(&self) -> f64 {
        self.state.cvar
    }

    pub fn max_cvar(&self) -> f64 {
        self.config.max_cvar
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn should_force_close(&self) -> bool {
        self.config.force_close_on_breach && self.check_stop_conditions()
    }

    /// Register a closed trade for the loss-streak guard.
    pub fn record_trade_result(&mut self, realized_pnl: f64, now: DateTime<Utc>) {
        if realized_pnl < 0.0 {
            self.state.loss_streak += 1;
            self.last_loss_at = Some(now);
            info!(loss_streak = self.state.loss_streak, pnl = realized_pnl, "Losing trade recorded");
        } else {
            self.state.loss_streak = 0;
        }
        self.refresh_safety();
    }

    /// Gate for new entries: loss streak, then CVaR budget.
    pub fn entry_gate(&self) -> Verdict<()> {
        let max_losses = self.config.max_consecutive_losses;
        if max_losses > 0 && self.state.loss_streak >= max_losses {
            return Verdict::Skip(SkipReason::LossStreak {
                losses: self.state.loss_streak,
            });
        }
        if self.check_stop_conditions() {
            return Verdict::Skip(SkipReason::RiskVeto {
                cvar: self.state.cvar,
                max_cvar: self.config.max_cvar,
            });
        }
        Verdict::Act(())
    }

    fn expire_loss_streak(&mut self, now: DateTime<Utc>) {
        let Some(last) = self.last_loss_at else {
            return;
        };
        if self.state.loss_streak > 0
            && now - last >= Duration::seconds(self.config.loss_cooldown_secs)
        {
            info!(loss_streak = self.state.loss_streak, "Loss streak cooldown elapsed");
            self.state.loss_streak = 0;
            self.last_loss_at = None;
        }
    }

    fn refresh_safety(&mut self) {
        let streak_hit = self.config.max_consecutive_losses > 0
            && self.state.loss_streak >= self.config.max_consecutive_losses;
        let triggered = streak_hit || self.check_stop_conditions();

        if triggered && !self.state.safety_triggered {
            warn!(
                cvar = self.state.cvar,
                max_cvar = self.config.max_cvar,
                loss_streak = self.state.loss_streak,
                "Portfolio safety triggered"
            );
        }
        self.state.safety_triggered = triggered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(max_cvar: f64) -> PortfolioRiskMonitor {
        PortfolioRiskMonitor::new(PortfolioConfig {
            alpha: 0.4,
            max_cvar,
            ..PortfolioConfig::default()
        })
    }

    #[test]
    fn test_cvar_worst_tail() {
        let cvar = calc_cvar(&[1.0, -2.0, -1.0, 3.0, -4.0], 0.4).unwrap();
        assert_eq!(cvar, -3.0);
    }

    #[test]
    fn test_cvar_minimum_one_value() {
        assert_eq!(calc_cvar(&[5.0, -1.0, 2.0], 0.01).unwrap(), -1.0);
        assert_eq!(calc_cvar(&[5.0, -1.0, 2.0], 1.0).unwrap(), 2.0);
    }

    #[test]
    fn test_cvar_rejects_bad_input() {
        assert_eq!(calc_cvar(&[], 0.05), Err(RiskError::EmptySample));
        assert!(matches!(
            calc_cvar(&[1.0], 0.0),
            Err(RiskError::InvalidParameter { name: "alpha", .. })
        ));
        assert!(calc_cvar(&[1.0], 1.5).is_err());
    }

    #[test]
    fn test_update_concatenates_realized_and_unrealized() {
        let mut m = monitor(10.0);
        let state = m.update(&[1.0, -2.0, 3.0], &[-1.0, -4.0], Utc::now());
        assert_eq!(state.cvar, -3.0);
        assert_eq!(state.sample_size, 5);
        assert!(!m.check_stop_conditions());
    }

    #[test]
    fn test_empty_sample_is_zero_risk() {
        let mut m = monitor(10.0);
        assert_eq!(m.update(&[], &[], Utc::now()).cvar, 0.0);
        assert_eq!(m.size_factor(), 1.0);
    }

    #[test]
    fn test_breach_triggers_safety_and_veto() {
        let mut m = monitor(3.0);
        m.update(&[-2.0, -4.0, 1.0, 5.0, 2.0], &[], Utc::now());

        assert!(m.check_stop_conditions());
        assert!(m.state().safety_triggered);
        assert_eq!(m.size_factor(), 0.0);
        assert!(matches!(m.entry_gate(), Verdict::Skip(SkipReason::RiskVeto { .. })));
    }

    #[test]
    fn test_size_factor_scales_linearly() {
        let mut m = monitor(10.0);
        m.update(&[-2.0, -2.0, 1.0, 1.0, 1.0], &[], Utc::now());
        assert!((m.size_factor() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_loss_streak_blocks_then_expires() {
        let mut m = monitor(100.0);
        let t0 = Utc::now();
        for _ in 0..3 {
            m.record_trade_result(-10.0, t0);
        }
        assert!(matches!(m.entry_gate(), Verdict::Skip(SkipReason::LossStreak { losses: 3 })));
        assert!(m.state().safety_triggered);

        m.update(&[], &[], t0 + Duration::seconds(3600));
        assert_eq!(m.state().loss_streak, 0);
        assert!(m.entry_gate().is_act());
    }

    #[test]
    fn test_win_resets_streak() {
        let mut m = monitor(100.0);
        m.record_trade_result(-1.0, Utc::now());
        m.record_trade_result(2.0, Utc::now());
        assert_eq!(m.state().loss_streak, 0);
    }
}
