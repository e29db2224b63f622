//! Performance metrics over recorded trades.

mod calculator;

pub use calculator::{MetricsCalculator, PerformanceSummary};
