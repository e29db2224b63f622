//! Trading logic: risk sizing, stop validation, portfolio risk, the order
//! gateway and the per-instrument position lifecycle.

mod config;
mod gateway;
mod lifecycle;
mod outcome;
mod portfolio_risk;
mod risk_sizer;
mod stop_guard;

pub use config::{
    diff_params, AgentConfig, BreakevenConfig, ConfigHandle, ConfigSnapshot, EntryConfig,
    ExitConfig, GatewayConfig, ParamChange, PartialCloseConfig, PortfolioConfig, ScaleInConfig,
    SizingConfig, StopConfig, TakeProfitConfig, TrailingConfig, WatchdogConfig,
};
pub use gateway::{GatewayOutcome, OrderGateway, Rejection};
pub use lifecycle::{
    Action, EntryTicket, PendingEntry, PendingOrders, PositionLifecycleManager, Step, TickContext,
    TickReport,
};
pub use outcome::{RiskError, SkipReason, Verdict};
pub use portfolio_risk::{calc_cvar, PortfolioRiskMonitor, RiskState};
pub use risk_sizer::{size, RiskSizer};
pub use stop_guard::{shrink_sl_for_rrr, validate_rrr, validate_rrr_after_cost, StopLossGuard, StopPlan};
