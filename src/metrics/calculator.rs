//! Performance summary over realized trade P/L: win rate, profit factor,
//! dispersion, drawdown and CVaR.

use std::fmt;

use serde::Serialize;
use statrs::statistics::Statistics;

use crate::trading::calc_cvar;

/// Summary of closed-trade performance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub mean_pnl: f64,
    pub std_dev_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Gross profit over gross loss, 0 without losses
    pub profit_factor: f64,
    /// Largest peak-to-trough drop of cumulative P/L in account currency
    pub max_drawdown: f64,
    /// Mean of the worst alpha tail, `None` when there is nothing to measure
    pub cvar: Option<f64>,
}

/// Calculator for computing performance summaries.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Summarize realized P/L values given in chronological order.
    pub fn calculate(pnls: &[f64], alpha: f64) -> PerformanceSummary {
        let mut summary = PerformanceSummary::default();

        let pnls: Vec<f64> = pnls.iter().copied().filter(|p| p.is_finite()).collect();
        if pnls.is_empty() {
            return summary;
        }

        summary.total_trades = pnls.len() as u32;
        Self::calculate_pnl_metrics(&mut summary, &pnls);
        Self::calculate_dispersion(&mut summary, &pnls);
        Self::calculate_drawdown(&mut summary, &pnls);
        summary.cvar = calc_cvar(&pnls, alpha).ok();

        summary
    }

    fn calculate_pnl_metrics(summary: &mut PerformanceSummary, pnls: &[f64]) {
        let (wins, losses): (Vec<f64>, Vec<f64>) = pnls.iter().partition(|&&p| p > 0.0);

        summary.winning_trades = wins.len() as u32;
        summary.losing_trades = losses.len() as u32;
        summary.total_pnl = pnls.iter().sum();
        summary.win_rate = wins.len() as f64 / pnls.len() as f64;

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            summary.avg_win = gross_profit / wins.len() as f64;
        }
        if !losses.is_empty() {
            summary.avg_loss = gross_loss / losses.len() as f64;
        }
        if gross_loss > 0.0 {
            summary.profit_factor = gross_profit / gross_loss;
        }
    }

    fn calculate_dispersion(summary: &mut PerformanceSummary, pnls: &[f64]) {
        summary.mean_pnl = pnls.mean();
        // Sample std dev needs two points
        if pnls.len() >= 2 {
            summary.std_dev_pnl = pnls.std_dev();
        }
    }

    fn calculate_drawdown(summary: &mut PerformanceSummary, pnls: &[f64]) {
        let mut equity = 0.0f64;
        let mut peak = 0.0f64;
        let mut max_dd = 0.0f64;

        for pnl in pnls {
            equity += pnl;
            peak = peak.max(equity);
            max_dd = max_dd.max(peak - equity);
        }

        summary.max_drawdown = max_dd;
    }
}

impl fmt::Display for PerformanceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Trades:         {}", self.total_trades)?;
        writeln!(
            f,
            "Win Rate:       {:.1}% ({}W / {}L)",
            self.win_rate * 100.0,
            self.winning_trades,
            self.losing_trades
        )?;
        writeln!(f, "Total P&L:      {:.2}", self.total_pnl)?;
        writeln!(f, "Mean / Std:     {:.2} / {:.2}", self.mean_pnl, self.std_dev_pnl)?;
        writeln!(f, "Avg Win/Loss:   {:.2} / {:.2}", self.avg_win, self.avg_loss)?;
        writeln!(f, "Profit Factor:  {:.2}", self.profit_factor)?;
        writeln!(f, "Max Drawdown:   {:.2}", self.max_drawdown)?;
        match self.cvar {
            Some(cvar) => write!(f, "CVaR:           {:.2}", cvar),
            None => write!(f, "CVaR:           n/a"),
        }
    }
}
