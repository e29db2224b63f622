//! Position lifecycle for one instrument: entry, pending limits, and the
//! per-tick exit state machine (breakeven, stop watchdog, take-profit
//! adjustment, trailing, partial close, peak exit, scale-in).
//!
//! A manager exclusively owns its position and its pending-entry store.
//! Every broker side-effect goes through the [`OrderGateway`]; a step that
//! declines to act returns a [`Verdict::Skip`] with the reason.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{EntryAck, OrderState, TradeSnapshot, TradeState};
use crate::models::{
    detect_peak_reversal, AdvisorAction, Advice, AttachedOrder, AttachedTrailing,
    ClientExtensions, EntryMode, EntryOrder, ExitReason, Instrument, LifecycleState,
    MarketSnapshot, Position, PositionFlags, Side, TradeRecord,
};

use super::config::{AgentConfig, ConfigSnapshot};
use super::gateway::{GatewayOutcome, OrderGateway};
use super::outcome::{SkipReason, Verdict};
use super::portfolio_risk::PortfolioRiskMonitor;
use super::risk_sizer::RiskSizer;
use super::stop_guard::{shrink_sl_for_rrr, StopLossGuard};

const PIP_EPSILON: f64 = 1e-9;

/// Attached prices or distances closer than this many pips are unchanged.
const PRICE_EPSILON_PIPS: f64 = 0.1;

/// One stage of the per-tick pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Config,
    Pending,
    Sync,
    AdvisorExit,
    MaxHold,
    PeakExit,
    Breakeven,
    Watchdog,
    TakeProfit,
    ShrinkStop,
    Trailing,
    PartialClose,
    ScaleIn,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Pending => "pending",
            Self::Sync => "sync",
            Self::AdvisorExit => "advisor_exit",
            Self::MaxHold => "max_hold",
            Self::PeakExit => "peak_exit",
            Self::Breakeven => "breakeven",
            Self::Watchdog => "watchdog",
            Self::TakeProfit => "take_profit",
            Self::ShrinkStop => "shrink_stop",
            Self::Trailing => "trailing",
            Self::PartialClose => "partial_close",
            Self::ScaleIn => "scale_in",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step did.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ConfigReloaded { generation: u64 },
    EntryFilled { trade_id: String },
    EntryDropped { correlation_id: String },
    LimitCancelled { order_id: String },
    LimitRenewed { order_id: String, retries: u32 },
    Synced,
    StopMoved { price: Decimal },
    TakeProfitMoved { price: Decimal },
    TrailingPlaced { distance_pips: f64 },
    PartiallyClosed { units: u64, realized_pnl: f64 },
    ScaledIn { units: u64, price: Decimal },
    Closed { reason: ExitReason },
}

/// An entry order submitted but not yet known to be filled.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub correlation_id: String,
    /// `None` until the broker has confirmed the order
    pub order_id: Option<String>,
    pub side: Side,
    pub units: u64,
    pub mode: EntryMode,
    pub limit_price: Option<Decimal>,
    pub tp_pips: f64,
    pub sl_pips: f64,
    pub placed_at: DateTime<Utc>,
    /// Times this entry has been cancelled and renewed
    pub retries: u32,
}

/// Pending entries keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingOrders {
    entries: HashMap<String, PendingEntry>,
}

impl PendingOrders {
    pub fn insert(&mut self, entry: PendingEntry) {
        self.entries.insert(entry.correlation_id.clone(), entry);
    }

    pub fn remove(&mut self, correlation_id: &str) -> Option<PendingEntry> {
        self.entries.remove(correlation_id)
    }

    pub fn get(&self, correlation_id: &str) -> Option<&PendingEntry> {
        self.entries.get(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn set_order_id(&mut self, correlation_id: &str, order_id: &str) {
        if let Some(entry) = self.entries.get_mut(correlation_id) {
            entry.order_id = Some(order_id.to_string());
        }
    }
}

/// Result of an entry attempt that reached the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryTicket {
    Filled(TradeRecord),
    Pending {
        correlation_id: String,
        order_id: String,
    },
}

/// Inputs for one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    pub snapshot: &'a MarketSnapshot,
    pub advice: Option<&'a Advice>,
    pub now: DateTime<Utc>,
}

impl TickContext<'_> {
    fn advised(&self, action: AdvisorAction) -> bool {
        self.advice.map(|a| a.action == action).unwrap_or(false)
    }
}

/// Everything a tick decided.
#[derive(Debug, Default)]
pub struct TickReport {
    pub steps: Vec<(Step, Verdict<Action>)>,
    pub opened: Option<TradeRecord>,
    pub closed: Option<TradeRecord>,
    pub unrealized_pnl: f64,
}

impl TickReport {
    /// Latest verdict recorded for `step`.
    pub fn verdict(&self, step: Step) -> Option<&Verdict<Action>> {
        self.steps
            .iter()
            .rev()
            .find(|(s, _)| *s == step)
            .map(|(_, v)| v)
    }

    fn push(&mut self, instrument: &Instrument, step: Step, verdict: Verdict<Action>) {
        match &verdict {
            Verdict::Act(action) => {
                info!(instrument = %instrument, step = %step, action = ?action, "Lifecycle step applied")
            }
            Verdict::Skip(reason) if reason.is_routine() => {
                debug!(instrument = %instrument, step = %step, reason = %reason, "Lifecycle step skipped")
            }
            Verdict::Skip(reason) => {
                info!(
                    instrument = %instrument,
                    step = %step,
                    code = reason.code(),
                    reason = %reason,
                    "Lifecycle step skipped"
                )
            }
        }
        self.steps.push((step, verdict));
    }
}

#[derive(Debug, Clone, Copy)]
enum TpChange {
    Extend,
    Reduce,
}

impl TpChange {
    fn mark(&self, flags: &mut PositionFlags) {
        match self {
            Self::Extend => flags.tp_extended = true,
            Self::Reduce => flags.tp_reduced = true,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Extend => "extend",
            Self::Reduce => "reduce",
        }
    }
}

/// Owns the position and pending entries of one instrument.
pub struct PositionLifecycleManager {
    instrument: Instrument,
    gateway: Arc<OrderGateway>,
    config_rx: watch::Receiver<ConfigSnapshot>,
    config: Arc<AgentConfig>,
    generation: u64,
    position: Option<Position>,
    pending: PendingOrders,
    last_sync: Option<DateTime<Utc>>,
}

impl PositionLifecycleManager {
    /// Create a flat manager for `instrument`.
    pub fn new(
        instrument: Instrument,
        gateway: Arc<OrderGateway>,
        mut config_rx: watch::Receiver<ConfigSnapshot>,
    ) -> Self {
        let snapshot = config_rx.borrow_and_update().clone();
        Self {
            instrument,
            gateway,
            config_rx,
            config: snapshot.config,
            generation: snapshot.generation,
            position: None,
            pending: PendingOrders::default(),
            last_sync: None,
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn pending(&self) -> &PendingOrders {
        &self.pending
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none() && self.pending.is_empty()
    }

    /// Unrealized P/L of the open position at `quote`, 0 when flat.
    pub fn unrealized_pnl(&self, quote: &crate::models::Quote) -> f64 {
        self.position
            .as_ref()
            .map(|p| p.unrealized_pnl(quote))
            .unwrap_or(0.0)
    }

    /// Run one tick. Errors are data faults in the snapshot; broker failures
    /// and declined steps are reported as verdicts.
    pub async fn tick(&mut self, ctx: &TickContext<'_>) -> Result<TickReport> {
        self.check_snapshot(ctx.snapshot)?;

        let mut report = TickReport::default();
        if let Some(generation) = self.refresh_config() {
            report.push(
                &self.instrument,
                Step::Config,
                Verdict::Act(Action::ConfigReloaded { generation }),
            );
        }
        let cfg = self.config.clone();

        self.process_pending(ctx, &cfg, &mut report).await;

        if self.position.is_none() {
            return Ok(report);
        }

        let synced = self.sync(ctx, &cfg, &mut report).await;
        if report.closed.is_some() {
            return Ok(report);
        }

        let (profit, peak) = match self.position.as_mut() {
            Some(pos) => {
                let profit = pos.profit_pips(&ctx.snapshot.quote);
                (profit, pos.update_peak(profit))
            }
            None => return Ok(report),
        };

        if let Some((step, reason)) = self.check_exits(ctx, &cfg, profit, peak, &mut report) {
            let verdict = self.close(reason, ctx.now, &mut report).await;
            report.push(&self.instrument, step, verdict);
            if report.closed.is_some() {
                return Ok(report);
            }
        }

        let verdict = self.breakeven(ctx, &cfg, profit).await;
        report.push(&self.instrument, Step::Breakeven, verdict);

        let verdict = self.watchdog(ctx, &cfg, synced.as_ref()).await;
        report.push(&self.instrument, Step::Watchdog, verdict);

        let verdict = self.adjust_take_profit(ctx, &cfg).await;
        report.push(&self.instrument, Step::TakeProfit, verdict);

        let verdict = self.shrink_stop(ctx, &cfg, profit).await;
        report.push(&self.instrument, Step::ShrinkStop, verdict);

        let verdict = self.trail(ctx, &cfg, profit).await;
        report.push(&self.instrument, Step::Trailing, verdict);

        let verdict = self.partial_close(&cfg, profit).await;
        report.push(&self.instrument, Step::PartialClose, verdict);

        let verdict = self.scale_in(ctx, &cfg, profit).await;
        report.push(&self.instrument, Step::ScaleIn, verdict);

        report.unrealized_pnl = self.unrealized_pnl(&ctx.snapshot.quote);
        Ok(report)
    }

    /// Validate advice and submit an entry order.
    pub async fn try_enter(
        &mut self,
        ctx: &TickContext<'_>,
        balance: f64,
        risk: &PortfolioRiskMonitor,
    ) -> Result<Verdict<EntryTicket>> {
        self.check_snapshot(ctx.snapshot)?;

        if self.position.is_some() {
            return Ok(Verdict::Skip(SkipReason::PositionOpen));
        }
        if !self.pending.is_empty() {
            return Ok(Verdict::Skip(SkipReason::PendingEntry));
        }
        let Some(advice) = ctx.advice else {
            return Ok(Verdict::Skip(SkipReason::NoSignal));
        };
        let Some(side) = advice.side.as_side() else {
            return Ok(Verdict::Skip(SkipReason::NoSignal));
        };
        if let Verdict::Skip(reason) = risk.entry_gate() {
            return Ok(Verdict::Skip(reason));
        }

        let cfg = self.config.clone();
        let snapshot = ctx.snapshot;
        let Some(atr) = snapshot.atr_pips() else {
            return Ok(Verdict::Skip(SkipReason::MissingIndicator("atr")));
        };

        let entry = match advice.mode {
            EntryMode::Market => snapshot.quote.entry_price(side),
            EntryMode::Limit => match advice.limit_price.filter(|p| *p > Decimal::ZERO) {
                Some(price) => self.instrument.round_price(price),
                None => return Ok(Verdict::Skip(SkipReason::MissingPrice)),
            },
        };

        let guard = StopLossGuard::new(cfg.stops.clone());
        let plan = match guard.plan(
            advice.tp(),
            advice.sl(),
            atr,
            &snapshot.candles,
            side,
            entry,
            &self.instrument,
            snapshot.spread_pips(),
            ctx.now,
        ) {
            Verdict::Act(plan) => plan,
            Verdict::Skip(reason) => return Ok(Verdict::Skip(reason)),
        };

        let sizer = RiskSizer::new(cfg.sizing.clone());
        let units = match sizer
            .entry_units(balance, plan.sl_pips, Some(risk))
            .context("Failed to size entry")?
        {
            Verdict::Act(units) if units > 0 => units,
            Verdict::Act(_) => return Ok(Verdict::Skip(SkipReason::SizeBelowMinimum { lots: 0.0 })),
            Verdict::Skip(reason) => return Ok(Verdict::Skip(reason)),
        };

        let pending = PendingEntry {
            correlation_id: String::new(),
            order_id: None,
            side,
            units,
            mode: advice.mode,
            limit_price: (advice.mode == EntryMode::Limit).then_some(entry),
            tp_pips: plan.tp_pips,
            sl_pips: plan.sl_pips,
            placed_at: ctx.now,
            retries: 0,
        };

        info!(
            instrument = %self.instrument,
            side = %side,
            mode = advice.mode.as_str(),
            units,
            entry = %entry,
            tp_pips = plan.tp_pips,
            sl_pips = plan.sl_pips,
            "Submitting entry"
        );

        let order = self.entry_order(&pending, entry, ctx.now, &cfg);
        Ok(self.submit_entry(order, pending).await)
    }

    /// Close the position and cancel pending entries, regardless of state.
    pub async fn force_close(&mut self, reason: ExitReason, now: DateTime<Utc>) -> Verdict<TradeRecord> {
        for correlation_id in self.pending.ids() {
            let order_id = self
                .pending
                .get(&correlation_id)
                .and_then(|e| e.order_id.clone());
            if let Some(order_id) = order_id {
                if self.gateway.cancel_order(&order_id).await.is_applied() {
                    self.pending.remove(&correlation_id);
                }
            }
        }

        let mut report = TickReport::default();
        match self.close(reason, now, &mut report).await {
            Verdict::Act(_) => match report.closed {
                Some(record) => Verdict::Act(record),
                None => Verdict::Skip(SkipReason::NoPosition),
            },
            Verdict::Skip(reason) => Verdict::Skip(reason),
        }
    }

    fn check_snapshot(&self, snapshot: &MarketSnapshot) -> Result<()> {
        if snapshot.instrument != self.instrument {
            bail!(
                "Snapshot for {} routed to the {} manager",
                snapshot.instrument,
                self.instrument
            );
        }
        let quote = snapshot.quote;
        if quote.bid <= Decimal::ZERO || quote.ask < quote.bid {
            bail!(
                "Malformed quote for {}: bid {} ask {}",
                self.instrument,
                quote.bid,
                quote.ask
            );
        }
        Ok(())
    }

    fn refresh_config(&mut self) -> Option<u64> {
        if !self.config_rx.has_changed().unwrap_or(false) {
            return None;
        }
        let snapshot = self.config_rx.borrow_and_update().clone();
        if snapshot.generation == self.generation {
            return None;
        }

        self.config = snapshot.config;
        self.generation = snapshot.generation;
        Some(self.generation)
    }

    fn entry_order(
        &self,
        pending: &PendingEntry,
        entry: Decimal,
        now: DateTime<Utc>,
        cfg: &AgentConfig,
    ) -> EntryOrder {
        let sign = pending.side.sign();
        let stop = entry - sign * self.instrument.pips_to_price(pending.sl_pips);
        let target = entry + sign * self.instrument.pips_to_price(pending.tp_pips);
        let client = ClientExtensions::generate(pending.mode.as_str(), pending.tp_pips, pending.sl_pips);

        let order = match pending.mode {
            EntryMode::Market => {
                EntryOrder::market(self.instrument.clone(), pending.side, pending.units, client)
            }
            EntryMode::Limit => EntryOrder::limit(
                self.instrument.clone(),
                pending.side,
                pending.units,
                entry,
                now + Duration::seconds(cfg.entry.limit_valid_secs),
                client,
            ),
        };
        order.with_protection(Some(target), stop)
    }

    async fn submit_entry(&mut self, order: EntryOrder, mut pending: PendingEntry) -> Verdict<EntryTicket> {
        pending.correlation_id = order.correlation_id().to_string();

        match self.gateway.place_entry(&order).await {
            GatewayOutcome::Applied(EntryAck::Filled {
                trade_id,
                price,
                units,
                time,
                ..
            }) => Verdict::Act(EntryTicket::Filled(
                self.open_position(&pending, trade_id, price, units, time),
            )),
            GatewayOutcome::Applied(EntryAck::Pending { order_id }) => {
                info!(
                    instrument = %self.instrument,
                    order_id = %order_id,
                    correlation_id = %pending.correlation_id,
                    "Entry order pending"
                );
                let correlation_id = pending.correlation_id.clone();
                pending.order_id = Some(order_id.clone());
                self.pending.insert(pending);
                Verdict::Act(EntryTicket::Pending {
                    correlation_id,
                    order_id,
                })
            }
            GatewayOutcome::Applied(EntryAck::Cancelled { reason, .. }) => {
                Verdict::Skip(SkipReason::BrokerRejected {
                    code: "ORDER_CANCELLED".to_string(),
                    message: reason,
                })
            }
            GatewayOutcome::Failed { attempts, error } => {
                warn!(
                    instrument = %self.instrument,
                    correlation_id = %pending.correlation_id,
                    "Entry outcome unknown, tracking it for reconciliation"
                );
                self.pending.insert(pending);
                Verdict::Skip(SkipReason::BrokerUnavailable {
                    attempts,
                    error: error.to_string(),
                })
            }
            outcome => not_applied(outcome),
        }
    }

    fn open_position(
        &mut self,
        entry: &PendingEntry,
        trade_id: String,
        price: Decimal,
        units: u64,
        time: DateTime<Utc>,
    ) -> TradeRecord {
        let position = Position::open(
            self.instrument.clone(),
            entry.side,
            units,
            price,
            time,
            trade_id,
            entry.correlation_id.clone(),
            entry.sl_pips,
            entry.tp_pips,
        );
        let record = TradeRecord::opened(&position);

        info!(
            instrument = %self.instrument,
            trade_id = %position.trade_id,
            side = %position.side,
            units,
            price = %price,
            "Position opened"
        );

        self.position = Some(position);
        self.last_sync = None;
        record
    }

    async fn process_pending(&mut self, ctx: &TickContext<'_>, cfg: &AgentConfig, report: &mut TickReport) {
        for correlation_id in self.pending.ids() {
            let Some(entry) = self.pending.get(&correlation_id).cloned() else {
                continue;
            };
            let verdict = self.check_pending(entry, ctx, cfg, report).await;
            report.push(&self.instrument, Step::Pending, verdict);
        }
    }

    async fn check_pending(
        &mut self,
        entry: PendingEntry,
        ctx: &TickContext<'_>,
        cfg: &AgentConfig,
        report: &mut TickReport,
    ) -> Verdict<Action> {
        let stale = ctx.now - entry.placed_at >= Duration::seconds(cfg.entry.max_limit_age_secs);

        let found = match &entry.order_id {
            Some(order_id) => match self.gateway.get_order(order_id).await {
                GatewayOutcome::Applied(order) => Some(order),
                outcome => {
                    if is_gone(&outcome) {
                        self.pending.remove(&entry.correlation_id);
                    }
                    return not_applied(outcome);
                }
            },
            None => match self.gateway.find_entry(&entry.correlation_id).await {
                GatewayOutcome::Applied(found) => found,
                outcome => return not_applied(outcome),
            },
        };

        let Some(order) = found else {
            if stale {
                info!(
                    instrument = %self.instrument,
                    correlation_id = %entry.correlation_id,
                    "Unconfirmed entry never reached the broker, dropping it"
                );
                self.pending.remove(&entry.correlation_id);
                return Verdict::Act(Action::EntryDropped {
                    correlation_id: entry.correlation_id,
                });
            }
            return Verdict::Skip(SkipReason::NotDue);
        };
        self.pending.set_order_id(&entry.correlation_id, &order.id);

        match order.state {
            OrderState::Filled => {
                self.pending.remove(&entry.correlation_id);
                match (order.trade_id, order.fill_price) {
                    (Some(trade_id), Some(price)) => {
                        let time = order.fill_time.unwrap_or(ctx.now);
                        let record = self.open_position(&entry, trade_id.clone(), price, order.units, time);
                        report.opened = Some(record);
                        Verdict::Act(Action::EntryFilled { trade_id })
                    }
                    _ => {
                        warn!(order_id = %order.id, "Filled order without trade details");
                        Verdict::Skip(SkipReason::MissingPrice)
                    }
                }
            }
            OrderState::Cancelled => {
                self.pending.remove(&entry.correlation_id);
                info!(instrument = %self.instrument, order_id = %order.id, "Pending entry expired or cancelled");
                Verdict::Act(Action::LimitCancelled { order_id: order.id })
            }
            OrderState::Pending | OrderState::Triggered if stale => {
                self.renew_limit(entry, order.id, ctx, cfg, report).await
            }
            OrderState::Pending | OrderState::Triggered => Verdict::Skip(SkipReason::NotDue),
        }
    }

    /// Cancel a stale limit and re-place it at the current price, up to the
    /// configured number of renewals.
    async fn renew_limit(
        &mut self,
        entry: PendingEntry,
        order_id: String,
        ctx: &TickContext<'_>,
        cfg: &AgentConfig,
        report: &mut TickReport,
    ) -> Verdict<Action> {
        // A fill racing the cancel is picked up on the next tick
        let outcome = self.gateway.cancel_order(&order_id).await;
        if !outcome.is_applied() {
            return not_applied(outcome);
        }
        self.pending.remove(&entry.correlation_id);

        if entry.retries >= cfg.entry.max_limit_retries {
            info!(
                instrument = %self.instrument,
                order_id = %order_id,
                retries = entry.retries,
                "Stale limit cancelled, renewals exhausted"
            );
            return Verdict::Act(Action::LimitCancelled { order_id });
        }

        let price = self
            .instrument
            .round_price(ctx.snapshot.quote.entry_price(entry.side));
        let renewed = PendingEntry {
            correlation_id: String::new(),
            order_id: None,
            mode: EntryMode::Limit,
            limit_price: Some(price),
            placed_at: ctx.now,
            retries: entry.retries + 1,
            ..entry
        };
        info!(
            instrument = %self.instrument,
            old_order_id = %order_id,
            price = %price,
            retries = renewed.retries,
            "Renewing stale limit at current price"
        );

        let retries = renewed.retries;
        let order = self.entry_order(&renewed, price, ctx.now, cfg);
        match self.submit_entry(order, renewed).await {
            Verdict::Act(EntryTicket::Filled(record)) => {
                let trade_id = record.trade_id.clone();
                report.opened = Some(record);
                Verdict::Act(Action::EntryFilled { trade_id })
            }
            Verdict::Act(EntryTicket::Pending { order_id, .. }) => {
                Verdict::Act(Action::LimitRenewed { order_id, retries })
            }
            Verdict::Skip(reason) => Verdict::Skip(reason),
        }
    }

    /// Refresh the position from the broker when due. Detects broker-side
    /// closes and returns the snapshot for the watchdog.
    async fn sync(
        &mut self,
        ctx: &TickContext<'_>,
        cfg: &AgentConfig,
        report: &mut TickReport,
    ) -> Option<TradeSnapshot> {
        let pos = self.position.as_ref()?;
        let due = self
            .last_sync
            .map(|t| ctx.now - t >= Duration::seconds(cfg.watchdog.sync_interval_secs))
            .unwrap_or(true);
        if !due {
            report.push(&self.instrument, Step::Sync, Verdict::Skip(SkipReason::NotDue));
            return None;
        }

        let trade_id = pos.trade_id.clone();
        let outcome = self.gateway.get_trade(&trade_id).await;
        match outcome {
            GatewayOutcome::Applied(snap) if snap.state == TradeState::Closed => {
                self.last_sync = Some(ctx.now);
                let booked = self.position.as_ref().map(|p| p.realized_pnl).unwrap_or(0.0);
                let mut pnl = snap.realized_pnl - booked;
                pnl += self.close_scale_trades().await;

                self.finalize(snap.close_price, pnl, ExitReason::BrokerClosed, ctx.now, report);
                report.push(
                    &self.instrument,
                    Step::Sync,
                    Verdict::Act(Action::Closed {
                        reason: ExitReason::BrokerClosed,
                    }),
                );
                None
            }
            GatewayOutcome::Applied(snap) => {
                self.last_sync = Some(ctx.now);
                if let Some(pos) = self.position.as_mut() {
                    pos.stop_loss = snap.stop_loss.clone();
                    pos.take_profit = snap.take_profit.clone();
                    pos.trailing_stop = snap.trailing_stop.clone();
                    if pos.scale_trade_ids.is_empty() {
                        pos.units = snap.units;
                    }
                    pos.last_synced = Some(ctx.now);
                }
                report.push(&self.instrument, Step::Sync, Verdict::Act(Action::Synced));
                Some(snap)
            }
            outcome if is_gone(&outcome) => {
                warn!(instrument = %self.instrument, trade_id = %trade_id, "Trade unknown to broker, finalizing position");
                self.finalize(None, 0.0, ExitReason::BrokerClosed, ctx.now, report);
                report.push(
                    &self.instrument,
                    Step::Sync,
                    Verdict::Act(Action::Closed {
                        reason: ExitReason::BrokerClosed,
                    }),
                );
                None
            }
            outcome => {
                report.push(&self.instrument, Step::Sync, not_applied(outcome));
                None
            }
        }
    }

    /// Close what scale-in trades remain after the primary closed. Returns their P/L.
    async fn close_scale_trades(&self) -> f64 {
        let Some(pos) = self.position.as_ref() else {
            return 0.0;
        };
        if pos.scale_trade_ids.is_empty() {
            return 0.0;
        }
        match self.gateway.close_position(&pos.instrument, pos.side).await {
            GatewayOutcome::Applied(ack) => ack.realized_pnl,
            _ => 0.0,
        }
    }

    fn check_exits(
        &self,
        ctx: &TickContext<'_>,
        cfg: &AgentConfig,
        profit: f64,
        peak: f64,
        report: &mut TickReport,
    ) -> Option<(Step, ExitReason)> {
        let pos = self.position.as_ref()?;

        if ctx.advised(AdvisorAction::Exit) {
            return Some((Step::AdvisorExit, ExitReason::AdvisorExit));
        }
        report.push(&self.instrument, Step::AdvisorExit, Verdict::Skip(SkipReason::NoSignal));

        let max_hold = cfg.exit.max_hold_hours;
        if max_hold > 0.0 {
            let limit = Duration::seconds((max_hold * 3600.0) as i64);
            if pos.hold_time(ctx.now) >= limit {
                return Some((Step::MaxHold, ExitReason::MaxHold));
            }
            report.push(&self.instrument, Step::MaxHold, Verdict::Skip(SkipReason::NotDue));
        } else {
            report.push(&self.instrument, Step::MaxHold, Verdict::Skip(SkipReason::Disabled("max_hold")));
        }

        if !cfg.exit.peak_exit_enabled {
            report.push(&self.instrument, Step::PeakExit, Verdict::Skip(SkipReason::Disabled("peak_exit")));
            return None;
        }

        let atr = ctx.snapshot.atr_pips();
        let retrace = peak - profit;
        if let Some(atr) = atr {
            let max_draw = atr * cfg.exit.max_draw_atr_ratio;
            if peak > 0.0 && retrace > max_draw + PIP_EPSILON {
                info!(
                    instrument = %self.instrument,
                    peak_pips = peak,
                    profit_pips = profit,
                    max_draw_pips = max_draw,
                    "Profit retraced from peak"
                );
                return Some((Step::PeakExit, ExitReason::PeakRetrace));
            }
        }
        if cfg.exit.reversal_exit && peak > 0.0 {
            let pattern = detect_peak_reversal(&ctx.snapshot.candles, pos.side);
            let ema_cross = ctx.snapshot.ema_crossed_against(pos.side);
            if pattern || ema_cross {
                info!(
                    instrument = %self.instrument,
                    peak_pips = peak,
                    pattern,
                    ema_cross,
                    "Reversal on latest bars"
                );
                return Some((Step::PeakExit, ExitReason::Reversal));
            }
        }

        let verdict = match atr {
            Some(atr) => Verdict::Skip(SkipReason::BelowTrigger {
                profit_pips: retrace,
                trigger_pips: atr * cfg.exit.max_draw_atr_ratio,
            }),
            None => Verdict::Skip(SkipReason::MissingIndicator("atr")),
        };
        report.push(&self.instrument, Step::PeakExit, verdict);
        None
    }

    async fn close(&mut self, reason: ExitReason, now: DateTime<Utc>, report: &mut TickReport) -> Verdict<Action> {
        let Some(pos) = self.position.as_ref() else {
            return Verdict::Skip(SkipReason::NoPosition);
        };
        let trade_id = pos.trade_id.clone();

        match self.gateway.close_position(&pos.instrument, pos.side).await {
            GatewayOutcome::Applied(ack) => {
                self.finalize(ack.price, ack.realized_pnl, reason, now, report);
                Verdict::Act(Action::Closed { reason })
            }
            outcome if is_gone(&outcome) => {
                warn!(instrument = %self.instrument, trade_id = %trade_id, "Position already closed at broker");
                let (price, pnl) = match self.gateway.get_trade(&trade_id).await {
                    GatewayOutcome::Applied(snap) => {
                        let booked = self.position.as_ref().map(|p| p.realized_pnl).unwrap_or(0.0);
                        (snap.close_price, snap.realized_pnl - booked)
                    }
                    _ => (None, 0.0),
                };
                self.finalize(price, pnl, ExitReason::BrokerClosed, now, report);
                Verdict::Act(Action::Closed {
                    reason: ExitReason::BrokerClosed,
                })
            }
            outcome => not_applied(outcome),
        }
    }

    fn finalize(
        &mut self,
        exit_price: Option<Decimal>,
        realized_pnl: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let Some(mut pos) = self.position.take() else {
            return;
        };
        pos.state = LifecycleState::Closed;
        let record = TradeRecord::closed(&pos, exit_price, realized_pnl, reason, now);

        info!(
            instrument = %pos.instrument,
            trade_id = %pos.trade_id,
            reason = %reason,
            pnl = record.realized_pnl.unwrap_or(0.0),
            max_profit_pips = pos.flags.max_profit_pips,
            "Position closed"
        );

        self.last_sync = None;
        report.closed = Some(record);
    }

    /// ENTERED -> BREAKEVEN_ARMED, once per position.
    async fn breakeven(&mut self, ctx: &TickContext<'_>, cfg: &AgentConfig, profit: f64) -> Verdict<Action> {
        let Some(pos) = self.position.as_mut() else {
            return Verdict::Skip(SkipReason::NoPosition);
        };
        if pos.flags.breakeven_reached || pos.flags.breakeven_abandoned {
            return Verdict::Skip(SkipReason::AlreadyDone("breakeven"));
        }

        let be = &cfg.breakeven;
        let atr = ctx.snapshot.atr_pips();
        let trigger = be
            .trigger_pips
            .max(atr.unwrap_or(0.0) * be.atr_trigger_mult)
            .max(pos.initial_sl_pips * be.r_trigger);
        let forced = ctx.advised(AdvisorAction::MoveBe);
        let stagnant = atr
            .map(|atr| is_stagnant(ctx.snapshot, be.stagnation_bars, atr * be.stagnation_atr_ratio))
            .unwrap_or(false);

        if profit <= 0.0 || (profit + PIP_EPSILON < trigger && !forced && !stagnant) {
            return Verdict::Skip(SkipReason::BelowTrigger {
                profit_pips: profit,
                trigger_pips: trigger,
            });
        }

        let mut target = pos.entry_price;
        if let (Some(atr), Some(adx)) = (atr, ctx.snapshot.adx()) {
            if adx >= be.vol_adx_min && be.vol_sl_mult > 0.0 {
                let offset = pos.price_at(-atr * be.vol_sl_mult);
                if pos.improves_stop(offset) {
                    target = offset;
                }
            }
        }
        let target = pos.instrument.round_price(target);

        if !pos.improves_stop(target) {
            arm(pos);
            return Verdict::Skip(SkipReason::Unchanged("stop_loss"));
        }

        info!(
            instrument = %pos.instrument,
            profit_pips = profit,
            trigger_pips = trigger,
            forced,
            stagnant,
            stop = %target,
            "Moving stop to breakeven"
        );

        let mut outcome = self
            .gateway
            .modify_stop_loss(&pos.instrument, &pos.trade_id, target)
            .await;
        if outcome.rejection().map(|r| !r.code.is_gone()).unwrap_or(false) {
            warn!(instrument = %pos.instrument, "Breakeven stop rejected, retrying once");
            outcome = self
                .gateway
                .modify_stop_loss(&pos.instrument, &pos.trade_id, target)
                .await;
        }

        match outcome {
            GatewayOutcome::Applied(ack) => {
                pos.stop_loss = Some(AttachedOrder {
                    id: ack.order_id,
                    price: target,
                });
                mirror_stop(&self.gateway, pos, target).await;
                arm(pos);
                Verdict::Act(Action::StopMoved { price: target })
            }
            outcome => {
                if let Some(rejection) = outcome.rejection() {
                    if rejection.code.is_gone() {
                        self.last_sync = None;
                    } else {
                        warn!(
                            instrument = %pos.instrument,
                            code = %rejection.code,
                            "Giving up on breakeven stop"
                        );
                        pos.flags.breakeven_abandoned = true;
                    }
                }
                not_applied(outcome)
            }
        }
    }

    /// Reapply a fallback stop once if the broker lost the protective stop.
    async fn watchdog(
        &mut self,
        ctx: &TickContext<'_>,
        cfg: &AgentConfig,
        synced: Option<&TradeSnapshot>,
    ) -> Verdict<Action> {
        let Some(pos) = self.position.as_mut() else {
            return Verdict::Skip(SkipReason::NoPosition);
        };
        if !pos.flags.breakeven_reached {
            return Verdict::Skip(SkipReason::NotArmed);
        }
        if pos.flags.sl_reset_done {
            return Verdict::Skip(SkipReason::AlreadyDone("stop_reset"));
        }
        let Some(snap) = synced else {
            return Verdict::Skip(SkipReason::NotDue);
        };
        if snap.stop_loss.is_some() || snap.trailing_stop.is_some() {
            return Verdict::Skip(SkipReason::Unchanged("stop_loss"));
        }
        let Some(atr) = ctx.snapshot.atr_pips() else {
            return Verdict::Skip(SkipReason::MissingIndicator("atr"));
        };

        let price = pos
            .instrument
            .round_price(pos.price_at(-atr * cfg.watchdog.fallback_atr_mult));
        warn!(
            instrument = %pos.instrument,
            trade_id = %pos.trade_id,
            stop = %price,
            "Protective stop missing at broker, reapplying fallback"
        );

        match self
            .gateway
            .modify_stop_loss(&pos.instrument, &pos.trade_id, price)
            .await
        {
            GatewayOutcome::Applied(ack) => {
                pos.stop_loss = Some(AttachedOrder {
                    id: ack.order_id,
                    price,
                });
                pos.flags.sl_reset_done = true;
                Verdict::Act(Action::StopMoved { price })
            }
            outcome => {
                if let Some(rejection) = outcome.rejection() {
                    pos.flags.sl_reset_done = true;
                    if rejection.code.is_gone() {
                        self.last_sync = None;
                    }
                }
                not_applied(outcome)
            }
        }
    }

    /// One-shot TP extension on trend strength, one-shot reduction on
    /// exhaustion (or when the advisor asks for it).
    async fn adjust_take_profit(&mut self, ctx: &TickContext<'_>, cfg: &AgentConfig) -> Verdict<Action> {
        let Some(pos) = self.position.as_mut() else {
            return Verdict::Skip(SkipReason::NoPosition);
        };
        if pos.take_profit.is_none() || pos.initial_tp_pips <= 0.0 {
            return Verdict::Skip(SkipReason::NoTakeProfit);
        }
        if pos.flags.tp_extended && pos.flags.tp_reduced {
            return Verdict::Skip(SkipReason::AlreadyDone("take_profit"));
        }
        let Some(atr) = ctx.snapshot.atr_pips() else {
            return Verdict::Skip(SkipReason::MissingIndicator("atr"));
        };

        let tp = &cfg.take_profit;
        let adx = ctx.snapshot.adx();
        let forced_reduce = ctx.advised(AdvisorAction::ReduceTp);
        let held = pos.hold_time(ctx.now) >= Duration::seconds(tp.reduction_min_hold_secs);

        let (change, target_pips) = if !pos.flags.tp_extended
            && adx.map(|a| a >= tp.extension_adx_min).unwrap_or(false)
        {
            (TpChange::Extend, pos.initial_tp_pips + atr * tp.extension_atr_mult)
        } else if !pos.flags.tp_reduced
            && (forced_reduce || (held && adx.map(|a| a <= tp.reduction_adx_max).unwrap_or(false)))
        {
            let reduced = (pos.initial_tp_pips - atr * tp.reduction_atr_mult).max(tp.min_tp_pips);
            (TpChange::Reduce, reduced)
        } else if adx.is_none() {
            return Verdict::Skip(SkipReason::MissingIndicator("adx"));
        } else {
            return Verdict::Skip(SkipReason::NotDue);
        };

        let target = pos.instrument.round_price(pos.price_at(target_pips));
        let current = if tp.verify_before_modify {
            match self.gateway.get_trade(&pos.trade_id).await {
                GatewayOutcome::Applied(snap) => {
                    pos.take_profit = snap.take_profit.clone();
                    snap.take_profit.map(|t| t.price)
                }
                _ => pos.take_profit.as_ref().map(|t| t.price),
            }
        } else {
            pos.take_profit.as_ref().map(|t| t.price)
        };

        if let Some(current) = current {
            let delta = pos.instrument.price_to_pips((target - current).abs());
            if delta < PRICE_EPSILON_PIPS {
                change.mark(&mut pos.flags);
                return Verdict::Skip(SkipReason::Unchanged("take_profit"));
            }
        }

        info!(
            instrument = %pos.instrument,
            change = change.as_str(),
            target_pips,
            price = %target,
            adx = adx.unwrap_or(f64::NAN),
            "Adjusting take-profit"
        );

        match self
            .gateway
            .modify_take_profit(&pos.instrument, &pos.trade_id, target)
            .await
        {
            GatewayOutcome::Applied(ack) => {
                pos.take_profit = Some(AttachedOrder {
                    id: ack.order_id,
                    price: target,
                });
                change.mark(&mut pos.flags);
                Verdict::Act(Action::TakeProfitMoved { price: target })
            }
            outcome => {
                if let Some(rejection) = outcome.rejection() {
                    change.mark(&mut pos.flags);
                    if rejection.code.is_gone() {
                        self.last_sync = None;
                    }
                }
                not_applied(outcome)
            }
        }
    }

    /// Advisor-requested stop tightening to `tp / min_rrr`. Never loosens.
    async fn shrink_stop(&mut self, ctx: &TickContext<'_>, cfg: &AgentConfig, profit: f64) -> Verdict<Action> {
        if !ctx.advised(AdvisorAction::ShrinkSl) {
            return Verdict::Skip(SkipReason::NoSignal);
        }
        let Some(pos) = self.position.as_mut() else {
            return Verdict::Skip(SkipReason::NoPosition);
        };
        let Some(tp_price) = pos.take_profit.as_ref().map(|t| t.price) else {
            return Verdict::Skip(SkipReason::NoTakeProfit);
        };

        let tp_pips = pos.pips_from_entry(tp_price);
        let sl_pips = match &pos.stop_loss {
            Some(stop) => -pos.pips_from_entry(stop.price),
            None => pos.initial_sl_pips,
        };
        let shrunk = shrink_sl_for_rrr(tp_pips, sl_pips, cfg.stops.min_rrr);
        let candidate = pos.instrument.round_price(pos.price_at(-shrunk));

        if !pos.improves_stop(candidate) {
            return Verdict::Skip(SkipReason::Unchanged("stop_loss"));
        }
        if -shrunk + PIP_EPSILON >= profit {
            return Verdict::Skip(SkipReason::StopTooTight {
                sl_pips: shrunk,
                min_pips: (-profit).max(0.0),
            });
        }

        info!(instrument = %pos.instrument, sl_pips, shrunk_pips = shrunk, "Shrinking stop on advisor request");
        match self
            .gateway
            .modify_stop_loss(&pos.instrument, &pos.trade_id, candidate)
            .await
        {
            GatewayOutcome::Applied(ack) => {
                pos.stop_loss = Some(AttachedOrder {
                    id: ack.order_id,
                    price: candidate,
                });
                mirror_stop(&self.gateway, pos, candidate).await;
                Verdict::Act(Action::StopMoved { price: candidate })
            }
            outcome => not_applied(outcome),
        }
    }

    /// BREAKEVEN_ARMED -> TRAILING.
    async fn trail(&mut self, ctx: &TickContext<'_>, cfg: &AgentConfig, profit: f64) -> Verdict<Action> {
        let t = &cfg.trailing;
        if !t.enabled {
            return Verdict::Skip(SkipReason::Disabled("trailing"));
        }
        let Some(pos) = self.position.as_mut() else {
            return Verdict::Skip(SkipReason::NoPosition);
        };
        if pos.state == LifecycleState::Entered {
            return Verdict::Skip(SkipReason::NotArmed);
        }
        let Some(atr) = ctx.snapshot.atr_pips() else {
            return Verdict::Skip(SkipReason::MissingIndicator("atr"));
        };

        let widen = if ctx.snapshot.calendar_level >= t.calendar_widen_level {
            t.calendar_widen_mult
        } else {
            1.0
        };
        let trigger = t.trigger_pips.max(atr * t.trigger_mult) * widen;
        let distance = t.distance_pips.max(atr * t.distance_mult) * widen;

        if profit + PIP_EPSILON < trigger {
            return Verdict::Skip(SkipReason::BelowTrigger {
                profit_pips: profit,
                trigger_pips: trigger,
            });
        }
        if distance + PIP_EPSILON >= profit {
            warn!(
                instrument = %pos.instrument,
                distance_pips = distance,
                profit_pips = profit,
                "Trailing distance would stop out at or beyond entry profit, not submitting"
            );
            return Verdict::Skip(SkipReason::TrailTooWide {
                distance_pips: distance,
                profit_pips: profit,
            });
        }
        if let Some(current) = &pos.trailing_stop {
            if (current.distance_pips - distance).abs() < PRICE_EPSILON_PIPS {
                return Verdict::Skip(SkipReason::Unchanged("trailing_stop"));
            }
        }

        match self
            .gateway
            .modify_trailing_stop(&pos.instrument, &pos.trade_id, distance)
            .await
        {
            GatewayOutcome::Applied(ack) => {
                pos.trailing_stop = Some(AttachedTrailing {
                    id: ack.order_id,
                    distance_pips: distance,
                });
                mirror_trailing(&self.gateway, pos, distance).await;
                pos.state = LifecycleState::Trailing;
                Verdict::Act(Action::TrailingPlaced {
                    distance_pips: distance,
                })
            }
            outcome => {
                if is_gone(&outcome) {
                    self.last_sync = None;
                }
                not_applied(outcome)
            }
        }
    }

    async fn partial_close(&mut self, cfg: &AgentConfig, profit: f64) -> Verdict<Action> {
        let pc = &cfg.partial_close;
        if pc.threshold_pips <= 0.0 {
            return Verdict::Skip(SkipReason::Disabled("partial_close"));
        }
        let Some(pos) = self.position.as_mut() else {
            return Verdict::Skip(SkipReason::NoPosition);
        };
        if pos.flags.partial_closed {
            return Verdict::Skip(SkipReason::AlreadyDone("partial_close"));
        }
        if profit + PIP_EPSILON < pc.threshold_pips {
            return Verdict::Skip(SkipReason::BelowTrigger {
                profit_pips: profit,
                trigger_pips: pc.threshold_pips,
            });
        }

        // Only the primary trade is reduced
        let units = ((pos.units as f64 * pc.fraction).floor() as u64).min(pos.initial_units);
        if units == 0 || units >= pos.units {
            return Verdict::Skip(SkipReason::SizeBelowMinimum {
                lots: units as f64 / cfg.sizing.units_per_lot as f64,
            });
        }

        match self.gateway.reduce_trade(&pos.trade_id, units).await {
            GatewayOutcome::Applied(ack) => {
                let closed = pos.reduce(ack.units, ack.realized_pnl);
                pos.flags.partial_closed = true;
                info!(
                    instrument = %pos.instrument,
                    units = closed,
                    remaining = pos.units,
                    pnl = ack.realized_pnl,
                    "Partial close"
                );
                Verdict::Act(Action::PartiallyClosed {
                    units: closed,
                    realized_pnl: ack.realized_pnl,
                })
            }
            outcome => {
                if outcome.rejection().is_some() {
                    pos.flags.partial_closed = true;
                }
                not_applied(outcome)
            }
        }
    }

    async fn scale_in(&mut self, ctx: &TickContext<'_>, cfg: &AgentConfig, profit: f64) -> Verdict<Action> {
        if !ctx.advised(AdvisorAction::Scale) {
            return Verdict::Skip(SkipReason::NoSignal);
        }
        let sc = &cfg.scale_in;
        if sc.max_count == 0 {
            return Verdict::Skip(SkipReason::Disabled("scale_in"));
        }
        let Some(pos) = self.position.as_mut() else {
            return Verdict::Skip(SkipReason::NoPosition);
        };
        if pos.flags.scale_count >= sc.max_count {
            return Verdict::Skip(SkipReason::LimitExceeded {
                count: pos.flags.scale_count,
                max: sc.max_count,
            });
        }
        let Some(atr) = ctx.snapshot.atr_pips() else {
            return Verdict::Skip(SkipReason::MissingIndicator("atr"));
        };
        let trigger = atr * sc.trigger_atr;
        if profit + PIP_EPSILON < trigger {
            return Verdict::Skip(SkipReason::BelowTrigger {
                profit_pips: profit,
                trigger_pips: trigger,
            });
        }

        let cap = ((cfg.sizing.max_lots * cfg.sizing.units_per_lot as f64).floor() as u64)
            .saturating_sub(pos.units);
        let units = RiskSizer::new(cfg.sizing.clone()).scale_units(sc.lots, cap);
        if units == 0 {
            return Verdict::Skip(SkipReason::SizeBelowMinimum { lots: 0.0 });
        }

        let stop = pos
            .stop_loss
            .as_ref()
            .map(|s| s.price)
            .unwrap_or_else(|| pos.price_at(-pos.initial_sl_pips));
        let target = pos.take_profit.as_ref().map(|t| t.price);
        let client = ClientExtensions::generate("scale", pos.initial_tp_pips, pos.initial_sl_pips);
        let order = EntryOrder::market(pos.instrument.clone(), pos.side, units, client)
            .with_protection(target, stop);

        match self.gateway.place_entry(&order).await {
            GatewayOutcome::Applied(EntryAck::Filled {
                trade_id,
                price,
                units,
                ..
            }) => {
                pos.add(units, price, trade_id);
                info!(
                    instrument = %pos.instrument,
                    units,
                    price = %price,
                    total_units = pos.units,
                    scale_count = pos.flags.scale_count,
                    "Scaled into position"
                );
                Verdict::Act(Action::ScaledIn { units, price })
            }
            GatewayOutcome::Applied(ack) => Verdict::Skip(SkipReason::BrokerRejected {
                code: "NOT_FILLED".to_string(),
                message: format!("{:?}", ack),
            }),
            outcome => not_applied(outcome),
        }
    }
}

/// Apply a stop move on the primary trade to every scale-in trade.
async fn mirror_stop(gateway: &OrderGateway, pos: &Position, price: Decimal) {
    for trade_id in &pos.scale_trade_ids {
        let outcome = gateway.modify_stop_loss(&pos.instrument, trade_id, price).await;
        if !outcome.is_applied() {
            warn!(
                instrument = %pos.instrument,
                trade_id = %trade_id,
                stop = %price,
                "Stop not applied to scale-in trade"
            );
        }
    }
}

async fn mirror_trailing(gateway: &OrderGateway, pos: &Position, distance_pips: f64) {
    for trade_id in &pos.scale_trade_ids {
        let outcome = gateway
            .modify_trailing_stop(&pos.instrument, trade_id, distance_pips)
            .await;
        if !outcome.is_applied() {
            warn!(
                instrument = %pos.instrument,
                trade_id = %trade_id,
                distance_pips,
                "Trailing stop not applied to scale-in trade"
            );
        }
    }
}

fn arm(pos: &mut Position) {
    pos.flags.breakeven_reached = true;
    if pos.state == LifecycleState::Entered {
        pos.state = LifecycleState::BreakevenArmed;
    }
}

/// Last `bars` candles ranged less than `max_range_pips`.
fn is_stagnant(snapshot: &MarketSnapshot, bars: usize, max_range_pips: f64) -> bool {
    let candles = &snapshot.candles;
    if bars == 0 || candles.len() < bars {
        return false;
    }
    let window = &candles[candles.len() - bars..];
    let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);

    snapshot.instrument.value_to_pips(high - low) < max_range_pips
}

fn is_gone<T>(outcome: &GatewayOutcome<T>) -> bool {
    outcome.rejection().map(|r| r.code.is_gone()).unwrap_or(false)
}

/// Skip verdict for an outcome the broker did not apply.
fn not_applied<T, U>(outcome: GatewayOutcome<T>) -> Verdict<U> {
    match outcome.into_verdict() {
        Verdict::Skip(reason) => Verdict::Skip(reason),
        Verdict::Act(_) => Verdict::Skip(SkipReason::Unchanged("broker state")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BrokerError, BrokerOp, PaperBroker};
    use crate::models::{AdviceSide, IndicatorSet, Quote, TimeSeries};
    use crate::trading::config::{ConfigHandle, PortfolioConfig};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(secs: i64) -> DateTime<Utc> {
        // 02:00 UTC is outside the high-volatility session windows
        Utc.with_ymd_and_hms(2024, 5, 7, 2, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn test_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.gateway.initial_backoff_ms = 1;
        config.gateway.max_backoff_ms = 2;
        config.gateway.request_timeout_ms = 500;
        config
    }

    fn long_advice() -> Advice {
        Advice {
            side: AdviceSide::Long,
            tp_pips: Some(60.0),
            sl_pips: Some(30.0),
            ..Advice::default()
        }
    }

    struct Harness {
        broker: Arc<PaperBroker>,
        handle: ConfigHandle,
        manager: PositionLifecycleManager,
        risk: PortfolioRiskMonitor,
        instrument: Instrument,
    }

    impl Harness {
        fn new(config: AgentConfig) -> Self {
            let broker = Arc::new(PaperBroker::new(dec!(10000)));
            let risk = PortfolioRiskMonitor::new(config.portfolio.clone());
            let handle = ConfigHandle::new(config, None);
            let gateway = Arc::new(OrderGateway::new(broker.clone(), handle.subscribe()));
            let instrument = Instrument::new("USD_JPY");
            let manager = PositionLifecycleManager::new(instrument.clone(), gateway, handle.subscribe());

            Self {
                broker,
                handle,
                manager,
                risk,
                instrument,
            }
        }

        /// USD/JPY snapshot with a one-pip spread. `atr` is in price units.
        fn snapshot(&self, bid: Decimal, atr: f64, adx: f64, now: DateTime<Utc>) -> MarketSnapshot {
            MarketSnapshot {
                instrument: self.instrument.clone(),
                quote: Quote {
                    bid,
                    ask: bid + dec!(0.01),
                    time: now,
                },
                candles: Vec::new(),
                indicators: IndicatorSet {
                    atr: TimeSeries::from(vec![atr]),
                    adx: TimeSeries::from(vec![adx]),
                    ..IndicatorSet::default()
                },
                calendar_level: 0,
            }
        }

        async fn enter(&mut self, snapshot: &MarketSnapshot, advice: &Advice) -> Verdict<EntryTicket> {
            self.broker.set_quote(&self.instrument, snapshot.quote).await;
            let ctx = TickContext {
                snapshot,
                advice: Some(advice),
                now: snapshot.quote.time,
            };
            self.manager.try_enter(&ctx, 10_000.0, &self.risk).await.unwrap()
        }

        /// Enter long at 150.00 with a 5 pip ATR.
        async fn enter_long(&mut self) -> String {
            let snap = self.snapshot(dec!(149.99), 0.05, 22.0, at(0));
            let ticket = self.enter(&snap, &long_advice()).await;
            assert!(matches!(ticket, Verdict::Act(EntryTicket::Filled(_))), "{:?}", ticket);
            self.manager.position().unwrap().trade_id.clone()
        }

        async fn tick(&mut self, snapshot: &MarketSnapshot, advice: Option<&Advice>) -> TickReport {
            self.broker.set_quote(&self.instrument, snapshot.quote).await;
            let ctx = TickContext {
                snapshot,
                advice,
                now: snapshot.quote.time,
            };
            self.manager.tick(&ctx).await.unwrap()
        }

        async fn values(&self, op: BrokerOp) -> Vec<String> {
            self.broker
                .calls()
                .await
                .into_iter()
                .filter(|c| c.op == op)
                .filter_map(|c| c.value)
                .collect()
        }
    }

    fn trailing_off() -> AgentConfig {
        let mut config = test_config();
        config.trailing.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_entry_sizes_from_validated_stop() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        let pos = h.manager.position().unwrap();
        assert_eq!(pos.entry_price, dec!(150.00));
        // 10_000 * 1% / (30 pips * 10) = 0.333 lots
        assert_eq!(pos.units, 333);
        assert_eq!(pos.stop_loss.as_ref().map(|s| s.price), Some(dec!(149.70)));
        assert_eq!(h.values(BrokerOp::PlaceOrder).await, vec!["333".to_string()]);
    }

    #[tokio::test]
    async fn test_breakeven_fires_once() {
        let mut h = Harness::new(trailing_off());
        h.enter_long().await;

        let snap = h.snapshot(dec!(150.10), 0.05, 22.0, at(1));
        let report = h.tick(&snap, None).await;
        assert!(matches!(report.verdict(Step::Breakeven), Some(Verdict::Act(Action::StopMoved { .. }))));

        let snap = h.snapshot(dec!(150.12), 0.05, 22.0, at(2));
        let report = h.tick(&snap, None).await;
        assert_eq!(
            report.verdict(Step::Breakeven),
            Some(&Verdict::Skip(SkipReason::AlreadyDone("breakeven")))
        );

        assert_eq!(h.values(BrokerOp::ModifyStopLoss).await, vec!["150.000".to_string()]);
        let pos = h.manager.position().unwrap();
        assert!(pos.flags.breakeven_reached);
        assert_eq!(pos.state, LifecycleState::BreakevenArmed);
    }

    #[tokio::test]
    async fn test_breakeven_rejection_retried_once_then_abandoned() {
        let mut h = Harness::new(trailing_off());
        h.enter_long().await;
        for _ in 0..2 {
            h.broker
                .fail_next(BrokerOp::ModifyStopLoss, BrokerError::rejected(400, "INVALID_MODIFY", "bad stop"))
                .await;
        }

        let snap = h.snapshot(dec!(150.10), 0.05, 22.0, at(1));
        let report = h.tick(&snap, None).await;
        assert!(matches!(
            report.verdict(Step::Breakeven),
            Some(Verdict::Skip(SkipReason::BrokerRejected { .. }))
        ));

        let snap = h.snapshot(dec!(150.11), 0.05, 22.0, at(2));
        h.tick(&snap, None).await;

        assert_eq!(h.broker.call_count(BrokerOp::ModifyStopLoss).await, 2);
        let pos = h.manager.position().unwrap();
        assert_eq!(pos.stop_loss.as_ref().map(|s| s.price), Some(dec!(149.700)));
        assert!(pos.flags.breakeven_abandoned);
        assert!(!pos.flags.breakeven_reached);
        assert_eq!(pos.state, LifecycleState::Entered);
    }

    #[tokio::test]
    async fn test_abandoned_breakeven_leaves_watchdog_unarmed() {
        let mut h = Harness::new(trailing_off());
        let trade_id = h.enter_long().await;
        for _ in 0..2 {
            h.broker
                .fail_next(BrokerOp::ModifyStopLoss, BrokerError::rejected(400, "INVALID_MODIFY", "bad stop"))
                .await;
        }

        let snap = h.snapshot(dec!(150.10), 0.05, 22.0, at(1));
        h.tick(&snap, None).await;

        h.broker.drop_stop_loss(&trade_id).await;
        let snap = h.snapshot(dec!(150.10), 0.05, 22.0, at(20));
        let report = h.tick(&snap, None).await;

        assert_eq!(report.verdict(Step::Watchdog), Some(&Verdict::Skip(SkipReason::NotArmed)));
        assert_eq!(h.broker.call_count(BrokerOp::ModifyStopLoss).await, 2);
    }

    #[tokio::test]
    async fn test_trailing_refused_when_distance_reaches_profit() {
        let mut config = test_config();
        config.trailing.distance_pips = 15.0;
        let mut h = Harness::new(config);
        h.enter_long().await;

        let snap = h.snapshot(dec!(150.15), 0.05, 22.0, at(1));
        let report = h.tick(&snap, None).await;

        assert!(matches!(
            report.verdict(Step::Trailing),
            Some(Verdict::Skip(SkipReason::TrailTooWide { .. }))
        ));
        assert_eq!(h.broker.call_count(BrokerOp::ModifyTrailingStop).await, 0);
    }

    #[tokio::test]
    async fn test_trailing_submitted_once_for_unchanged_distance() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        // 22p profit, trail max(6, 5 * 1.0) = 6p
        let snap = h.snapshot(dec!(150.22), 0.05, 22.0, at(1));
        let report = h.tick(&snap, None).await;
        assert!(matches!(
            report.verdict(Step::Trailing),
            Some(Verdict::Act(Action::TrailingPlaced { .. }))
        ));
        assert_eq!(h.manager.position().unwrap().state, LifecycleState::Trailing);

        let snap = h.snapshot(dec!(150.23), 0.05, 22.0, at(2));
        let report = h.tick(&snap, None).await;
        assert_eq!(
            report.verdict(Step::Trailing),
            Some(&Verdict::Skip(SkipReason::Unchanged("trailing_stop")))
        );

        assert_eq!(h.values(BrokerOp::ModifyTrailingStop).await, vec!["0.060".to_string()]);
    }

    #[tokio::test]
    async fn test_trailing_widened_during_calendar_window() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        let mut snap = h.snapshot(dec!(150.22), 0.05, 22.0, at(1));
        snap.calendar_level = 3;
        h.tick(&snap, None).await;

        // 6p * 1.5
        assert_eq!(h.values(BrokerOp::ModifyTrailingStop).await, vec!["0.090".to_string()]);
    }

    #[tokio::test]
    async fn test_end_to_end_breakeven_then_trailing() {
        let mut h = Harness::new(test_config());
        let advice = Advice {
            side: AdviceSide::Long,
            tp_pips: Some(60.0),
            sl_pips: Some(20.0),
            ..Advice::default()
        };

        // ATR 0.20 = 20 pips; the 20p stop widens to 20 * 1.2 = 24p
        let snap = h.snapshot(dec!(149.99), 0.20, 22.0, at(0));
        let ticket = h.enter(&snap, &advice).await;
        assert!(matches!(ticket, Verdict::Act(EntryTicket::Filled(_))));
        assert_eq!(h.manager.position().unwrap().entry_price, dec!(150.00));
        assert_eq!(h.manager.position().unwrap().initial_sl_pips, 24.0);

        let snap = h.snapshot(dec!(150.10), 0.20, 22.0, at(1));
        let report = h.tick(&snap, None).await;
        assert_eq!(
            report.verdict(Step::Breakeven),
            Some(&Verdict::Act(Action::StopMoved { price: dec!(150.000) }))
        );
        assert!(matches!(report.verdict(Step::Trailing), Some(Verdict::Skip(SkipReason::BelowTrigger { .. }))));

        let snap = h.snapshot(dec!(150.20), 0.20, 22.0, at(2));
        h.tick(&snap, None).await;
        assert_eq!(h.broker.call_count(BrokerOp::ModifyTrailingStop).await, 0);

        // Trigger max(10, 20 * 1.2) = 24p
        let snap = h.snapshot(dec!(150.24), 0.20, 22.0, at(3));
        let report = h.tick(&snap, None).await;
        assert!(matches!(
            report.verdict(Step::Trailing),
            Some(Verdict::Act(Action::TrailingPlaced { .. }))
        ));

        assert_eq!(h.values(BrokerOp::ModifyStopLoss).await, vec!["150.000".to_string()]);
        assert_eq!(h.values(BrokerOp::ModifyTrailingStop).await, vec!["0.200".to_string()]);
        assert_eq!(h.manager.position().unwrap().state, LifecycleState::Trailing);
    }

    #[tokio::test]
    async fn test_watchdog_reapplies_missing_stop_once() {
        let mut h = Harness::new(trailing_off());
        let trade_id = h.enter_long().await;

        let snap = h.snapshot(dec!(150.10), 0.05, 22.0, at(1));
        h.tick(&snap, None).await;

        h.broker.drop_stop_loss(&trade_id).await;
        let snap = h.snapshot(dec!(150.10), 0.05, 22.0, at(20));
        let report = h.tick(&snap, None).await;
        assert!(matches!(report.verdict(Step::Watchdog), Some(Verdict::Act(Action::StopMoved { .. }))));

        h.broker.drop_stop_loss(&trade_id).await;
        let snap = h.snapshot(dec!(150.10), 0.05, 22.0, at(40));
        let report = h.tick(&snap, None).await;
        assert_eq!(
            report.verdict(Step::Watchdog),
            Some(&Verdict::Skip(SkipReason::AlreadyDone("stop_reset")))
        );

        // Fallback at entry - 2 * ATR
        assert_eq!(
            h.values(BrokerOp::ModifyStopLoss).await,
            vec!["150.000".to_string(), "149.900".to_string()]
        );
    }

    #[tokio::test]
    async fn test_watchdog_ignores_failed_lookup() {
        let mut h = Harness::new(trailing_off());
        h.enter_long().await;

        let snap = h.snapshot(dec!(150.10), 0.05, 22.0, at(1));
        h.tick(&snap, None).await;

        for _ in 0..3 {
            h.broker
                .fail_next(BrokerOp::GetTrade, BrokerError::Transport("reset".into()))
                .await;
        }
        let snap = h.snapshot(dec!(150.10), 0.05, 22.0, at(20));
        let report = h.tick(&snap, None).await;

        assert_eq!(report.verdict(Step::Watchdog), Some(&Verdict::Skip(SkipReason::NotDue)));
        assert_eq!(h.broker.call_count(BrokerOp::ModifyStopLoss).await, 1);
    }

    #[tokio::test]
    async fn test_take_profit_extension_is_one_shot() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        for secs in [1, 2, 3] {
            let snap = h.snapshot(dec!(150.05), 0.05, 30.0, at(secs));
            h.tick(&snap, None).await;
        }

        // 60p + 5p ATR extension
        assert_eq!(h.values(BrokerOp::ModifyTakeProfit).await, vec!["150.650".to_string()]);
        let pos = h.manager.position().unwrap();
        assert!(pos.flags.tp_extended);
        assert!(!pos.flags.tp_reduced);
    }

    #[tokio::test]
    async fn test_take_profit_already_at_target_is_noop() {
        let mut h = Harness::new(test_config());
        let trade_id = h.enter_long().await;
        h.broker.set_take_profit(&trade_id, dec!(150.65)).await;

        let snap = h.snapshot(dec!(150.05), 0.05, 30.0, at(1));
        let report = h.tick(&snap, None).await;

        assert_eq!(
            report.verdict(Step::TakeProfit),
            Some(&Verdict::Skip(SkipReason::Unchanged("take_profit")))
        );
        assert_eq!(h.broker.call_count(BrokerOp::ModifyTakeProfit).await, 0);
        assert!(h.manager.position().unwrap().flags.tp_extended);
    }

    #[tokio::test]
    async fn test_take_profit_reduction_waits_for_hold_time() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        let snap = h.snapshot(dec!(150.05), 0.05, 15.0, at(100));
        let report = h.tick(&snap, None).await;
        assert_eq!(report.verdict(Step::TakeProfit), Some(&Verdict::Skip(SkipReason::NotDue)));

        for secs in [1000, 1100] {
            let snap = h.snapshot(dec!(150.05), 0.05, 15.0, at(secs));
            h.tick(&snap, None).await;
        }

        // 60p - 5p ATR reduction
        assert_eq!(h.values(BrokerOp::ModifyTakeProfit).await, vec!["150.550".to_string()]);
        assert!(h.manager.position().unwrap().flags.tp_reduced);
    }

    #[tokio::test]
    async fn test_advisor_reduce_tp_forces_reduction() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        let snap = h.snapshot(dec!(150.05), 0.05, 22.0, at(1));
        h.tick(&snap, Some(&Advice::action(AdvisorAction::ReduceTp))).await;

        assert_eq!(h.values(BrokerOp::ModifyTakeProfit).await, vec!["150.550".to_string()]);
    }

    #[tokio::test]
    async fn test_advisor_shrink_sl_tightens_only() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        // TP 60p at RRR 1.0 leaves the 30p stop alone
        let snap = h.snapshot(dec!(150.05), 0.05, 22.0, at(1));
        let report = h.tick(&snap, Some(&Advice::action(AdvisorAction::ShrinkSl))).await;
        assert_eq!(
            report.verdict(Step::ShrinkStop),
            Some(&Verdict::Skip(SkipReason::Unchanged("stop_loss")))
        );

        let mut config = test_config();
        config.stops.min_rrr = 3.0;
        h.handle.publish(config).unwrap();

        let snap = h.snapshot(dec!(150.05), 0.05, 22.0, at(2));
        let report = h.tick(&snap, Some(&Advice::action(AdvisorAction::ShrinkSl))).await;
        assert!(matches!(report.verdict(Step::Config), Some(Verdict::Act(Action::ConfigReloaded { generation: 1 }))));

        // 60 / 3 = 20p
        assert_eq!(h.values(BrokerOp::ModifyStopLoss).await, vec!["149.800".to_string()]);
    }

    #[tokio::test]
    async fn test_peak_retrace_closes_position() {
        let mut h = Harness::new(trailing_off());
        h.enter_long().await;

        let snap = h.snapshot(dec!(150.25), 0.05, 22.0, at(1));
        h.tick(&snap, None).await;

        // Peak 25p, now 12p: retrace 13p exceeds 2 * 5p
        let snap = h.snapshot(dec!(150.12), 0.05, 22.0, at(2));
        let report = h.tick(&snap, None).await;

        let record = report.closed.expect("position closed");
        assert_eq!(record.exit_reason, Some(ExitReason::PeakRetrace));
        assert_eq!(record.max_profit_pips, 25.0);
        assert!((record.realized_pnl.unwrap() - 39.96).abs() < 1e-6);
        assert!(h.manager.position().is_none());
        assert_eq!(h.broker.call_count(BrokerOp::ClosePosition).await, 1);
    }

    #[tokio::test]
    async fn test_advisor_exit_closes_position() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        let snap = h.snapshot(dec!(150.03), 0.05, 22.0, at(1));
        let report = h.tick(&snap, Some(&Advice::action(AdvisorAction::Exit))).await;

        assert_eq!(report.closed.and_then(|r| r.exit_reason), Some(ExitReason::AdvisorExit));
        assert!(h.manager.is_flat());
    }

    #[tokio::test]
    async fn test_max_hold_closes_position() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        let snap = h.snapshot(dec!(150.03), 0.05, 22.0, at(6 * 3600));
        let report = h.tick(&snap, None).await;

        assert_eq!(report.closed.and_then(|r| r.exit_reason), Some(ExitReason::MaxHold));
    }

    #[tokio::test]
    async fn test_broker_side_close_detected_on_sync() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        // Bid through the 149.70 stop
        let snap = h.snapshot(dec!(149.69), 0.05, 22.0, at(1));
        let report = h.tick(&snap, None).await;

        let record = report.closed.expect("broker close detected");
        assert_eq!(record.exit_reason, Some(ExitReason::BrokerClosed));
        assert!((record.realized_pnl.unwrap() + 103.23).abs() < 1e-6);
        assert_eq!(h.broker.call_count(BrokerOp::ClosePosition).await, 0);
    }

    #[tokio::test]
    async fn test_partial_close_once() {
        let mut config = trailing_off();
        config.partial_close.threshold_pips = 15.0;
        config.partial_close.fraction = 0.5;
        let mut h = Harness::new(config);
        h.enter_long().await;

        for (secs, bid) in [(1, dec!(150.16)), (2, dec!(150.18))] {
            let snap = h.snapshot(bid, 0.05, 22.0, at(secs));
            h.tick(&snap, None).await;
        }

        assert_eq!(h.values(BrokerOp::CloseTrade).await, vec!["166".to_string()]);
        let pos = h.manager.position().unwrap();
        assert_eq!(pos.units, 167);
        assert_eq!(pos.state, LifecycleState::BreakevenArmed);
        assert!((pos.realized_pnl - 26.56).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_scale_in_bounded_by_max_count() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;
        let scale = Advice::action(AdvisorAction::Scale);

        let snap = h.snapshot(dec!(150.05), 0.05, 22.0, at(1));
        let report = h.tick(&snap, Some(&scale)).await;
        assert!(matches!(report.verdict(Step::ScaleIn), Some(Verdict::Act(Action::ScaledIn { units: 500, .. }))));

        let snap = h.snapshot(dec!(150.06), 0.05, 22.0, at(2));
        let report = h.tick(&snap, Some(&scale)).await;
        assert_eq!(
            report.verdict(Step::ScaleIn),
            Some(&Verdict::Skip(SkipReason::LimitExceeded { count: 1, max: 1 }))
        );

        let pos = h.manager.position().unwrap();
        assert_eq!(pos.units, 833);
        assert_eq!(pos.flags.scale_count, 1);
        assert_eq!(h.broker.call_count(BrokerOp::PlaceOrder).await, 2);
    }

    #[tokio::test]
    async fn test_scale_trades_follow_breakeven_and_trailing() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;

        let snap = h.snapshot(dec!(150.05), 0.05, 22.0, at(1));
        let report = h.tick(&snap, Some(&Advice::action(AdvisorAction::Scale))).await;
        assert!(matches!(report.verdict(Step::ScaleIn), Some(Verdict::Act(Action::ScaledIn { .. }))));

        let pos = h.manager.position().unwrap();
        // 333 @ 150.00 + 500 @ 150.06
        assert_eq!(pos.entry_price, dec!(150.036));
        let scale_id = pos.scale_trade_ids[0].clone();

        let snap = h.snapshot(dec!(150.22), 0.05, 22.0, at(2));
        let report = h.tick(&snap, None).await;
        assert_eq!(
            report.verdict(Step::Breakeven),
            Some(&Verdict::Act(Action::StopMoved { price: dec!(150.036) }))
        );
        assert!(matches!(
            report.verdict(Step::Trailing),
            Some(Verdict::Act(Action::TrailingPlaced { .. }))
        ));

        let scale_trade = h.broker.trade(&scale_id).await.unwrap();
        assert_eq!(scale_trade.stop_loss.map(|s| s.price), Some(dec!(150.036)));
        assert!(scale_trade.trailing_stop.is_some());
        assert_eq!(
            h.values(BrokerOp::ModifyStopLoss).await,
            vec!["150.036".to_string(), "150.036".to_string()]
        );
        assert_eq!(
            h.values(BrokerOp::ModifyTrailingStop).await,
            vec!["0.060".to_string(), "0.060".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rejected_entry_leaves_manager_flat() {
        let mut h = Harness::new(test_config());
        h.broker
            .fail_next(BrokerOp::PlaceOrder, BrokerError::rejected(400, "INSUFFICIENT_MARGIN", "margin"))
            .await;

        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(0));
        let ticket = h.enter(&snap, &long_advice()).await;

        assert!(matches!(ticket, Verdict::Skip(SkipReason::BrokerRejected { .. })), "{:?}", ticket);
        assert!(h.manager.is_flat());
        assert_eq!(h.broker.call_count(BrokerOp::PlaceOrder).await, 1);
    }

    #[tokio::test]
    async fn test_ema_cross_against_position_closes() {
        let mut h = Harness::new(trailing_off());
        h.enter_long().await;

        let mut snap = h.snapshot(dec!(150.08), 0.05, 22.0, at(1));
        snap.indicators.ema_fast = TimeSeries::from(vec![150.02, 150.06]);
        snap.indicators.ema_slow = TimeSeries::from(vec![150.00, 150.03]);
        let report = h.tick(&snap, None).await;
        assert!(report.closed.is_none());

        // Fast EMA drops under the slow one while in profit
        let mut snap = h.snapshot(dec!(150.07), 0.05, 22.0, at(2));
        snap.indicators.ema_fast = TimeSeries::from(vec![150.06, 150.03]);
        snap.indicators.ema_slow = TimeSeries::from(vec![150.03, 150.04]);
        let report = h.tick(&snap, None).await;

        assert_eq!(report.closed.and_then(|r| r.exit_reason), Some(ExitReason::Reversal));
        assert!(h.manager.is_flat());
    }

    #[tokio::test]
    async fn test_stale_limit_renewed_then_filled() {
        let mut config = test_config();
        config.entry.max_limit_age_secs = 60;
        config.entry.max_limit_retries = 1;
        let mut h = Harness::new(config);

        let advice = Advice {
            mode: EntryMode::Limit,
            limit_price: Some(dec!(149.95)),
            ..long_advice()
        };
        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(0));
        assert!(matches!(h.enter(&snap, &advice).await, Verdict::Act(EntryTicket::Pending { .. })));

        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(30));
        let report = h.tick(&snap, None).await;
        assert_eq!(report.verdict(Step::Pending), Some(&Verdict::Skip(SkipReason::NotDue)));

        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(90));
        let report = h.tick(&snap, None).await;
        assert!(matches!(
            report.verdict(Step::Pending),
            Some(Verdict::Act(Action::LimitRenewed { retries: 1, .. }))
        ));
        assert_eq!(h.broker.call_count(BrokerOp::CancelOrder).await, 1);

        // The renewed limit sits at the 150.00 ask and fills on the next quote
        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(95));
        let report = h.tick(&snap, None).await;
        assert!(report.opened.is_some());
        assert_eq!(h.manager.position().unwrap().entry_price, dec!(150.00));
        assert!(h.manager.pending().is_empty());
    }

    #[tokio::test]
    async fn test_stale_limit_dropped_when_renewals_exhausted() {
        let mut config = test_config();
        config.entry.max_limit_age_secs = 60;
        config.entry.max_limit_retries = 0;
        let mut h = Harness::new(config);

        let advice = Advice {
            mode: EntryMode::Limit,
            limit_price: Some(dec!(149.95)),
            ..long_advice()
        };
        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(0));
        h.enter(&snap, &advice).await;

        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(90));
        let report = h.tick(&snap, None).await;

        assert!(matches!(report.verdict(Step::Pending), Some(Verdict::Act(Action::LimitCancelled { .. }))));
        assert!(h.manager.is_flat());
        assert_eq!(h.broker.call_count(BrokerOp::PlaceOrder).await, 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_entry_tracked_then_dropped() {
        let mut h = Harness::new(test_config());
        for _ in 0..3 {
            h.broker
                .fail_next(BrokerOp::PlaceOrder, BrokerError::Transport("reset".into()))
                .await;
        }

        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(0));
        let ticket = h.enter(&snap, &long_advice()).await;
        assert!(matches!(ticket, Verdict::Skip(SkipReason::BrokerUnavailable { attempts: 3, .. })));
        assert_eq!(h.manager.pending().len(), 1);

        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(10));
        h.tick(&snap, None).await;
        assert_eq!(h.manager.pending().len(), 1);

        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(200));
        let report = h.tick(&snap, None).await;
        assert!(matches!(report.verdict(Step::Pending), Some(Verdict::Act(Action::EntryDropped { .. }))));
        assert!(h.manager.is_flat());
    }

    #[tokio::test]
    async fn test_cvar_breach_vetoes_entry_before_network() {
        let mut h = Harness::new(test_config());
        h.risk = PortfolioRiskMonitor::new(PortfolioConfig {
            alpha: 0.5,
            max_cvar: 50.0,
            ..PortfolioConfig::default()
        });
        h.risk.update(&[-100.0, -80.0, 10.0, 20.0], &[], at(0));

        let snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(0));
        let ticket = h.enter(&snap, &long_advice()).await;

        assert!(matches!(ticket, Verdict::Skip(SkipReason::RiskVeto { .. })));
        assert_eq!(h.broker.call_count(BrokerOp::PlaceOrder).await, 0);
    }

    #[tokio::test]
    async fn test_force_close() {
        let mut h = Harness::new(test_config());
        h.enter_long().await;
        h.broker
            .set_quote(&h.instrument, Quote { bid: dec!(150.02), ask: dec!(150.03), time: at(1) })
            .await;

        let verdict = h.manager.force_close(ExitReason::RiskForceClose, at(1)).await;
        match verdict {
            Verdict::Act(record) => {
                assert_eq!(record.exit_reason, Some(ExitReason::RiskForceClose));
                assert_eq!(record.exit_price, Some(dec!(150.02)));
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert!(h.manager.position().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_for_other_instrument_is_an_error() {
        let mut h = Harness::new(test_config());
        let mut snap = h.snapshot(dec!(149.99), 0.05, 22.0, at(0));
        snap.instrument = Instrument::new("EUR_USD");

        let ctx = TickContext {
            snapshot: &snap,
            advice: None,
            now: at(0),
        };
        assert!(h.manager.tick(&ctx).await.is_err());
    }
}
