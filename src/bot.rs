//! Agent runner: drives every instrument's lifecycle manager once per tick.
//!
//! Each tick:
//! - Picks up a reloaded configuration and audits the changed parameters
//! - Fetches snapshots for all instruments concurrently
//! - Updates portfolio CVaR from recorded and open P/L, force-closing on a breach
//! - Asks the decision advisor (rate limited per instrument)
//! - Ticks each manager and attempts entries on flat instruments
//! - Records opens, closes and entry skips in the audit store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{Broker, DecisionAdvisor, MarketFeed, PaperBroker};
use crate::db::AuditLog;
use crate::models::{Advice, ExitReason, Instrument, MarketSnapshot, Position};
use crate::trading::{
    ConfigHandle, EntryTicket, OrderGateway, PortfolioRiskMonitor, PositionLifecycleManager,
    SkipReason, TickContext, Verdict,
};

/// Runtime switches that are not part of the reloadable configuration.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Trading against the paper broker
    pub dry_run: bool,

    /// Close open positions when the loop stops
    pub close_on_shutdown: bool,
}

/// Main agent runner.
pub struct Agent {
    config: ConfigHandle,
    options: AgentOptions,
    gateway: Arc<OrderGateway>,
    managers: Vec<PositionLifecycleManager>,
    feed: Arc<dyn MarketFeed>,
    advisor: Option<Arc<dyn DecisionAdvisor>>,
    last_advice_at: HashMap<Instrument, DateTime<Utc>>,
    risk: PortfolioRiskMonitor,
    audit: AuditLog,
    audit_writes: Vec<JoinHandle<()>>,
    paper: Option<Arc<PaperBroker>>,

    // Runtime state
    balance: f64,
    last_realized: Vec<f64>,
    ticks: u64,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Agent {
    /// Create a new agent with one lifecycle manager per configured instrument.
    pub fn new(
        config: ConfigHandle,
        broker: Arc<dyn Broker>,
        feed: Arc<dyn MarketFeed>,
        advisor: Option<Arc<dyn DecisionAdvisor>>,
        audit: AuditLog,
        options: AgentOptions,
    ) -> Self {
        let current = config.current().config;
        let gateway = Arc::new(OrderGateway::new(broker, config.subscribe()));

        let managers = current
            .instruments
            .iter()
            .map(|instrument| {
                PositionLifecycleManager::new(instrument.clone(), gateway.clone(), config.subscribe())
            })
            .collect();

        Self {
            risk: PortfolioRiskMonitor::new(current.portfolio.clone()),
            config,
            options,
            gateway,
            managers,
            feed,
            advisor,
            last_advice_at: HashMap::new(),
            audit,
            audit_writes: Vec::new(),
            paper: None,
            balance: 0.0,
            last_realized: Vec::new(),
            ticks: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Feed every fetched quote into the paper broker so it can fill and
    /// trigger orders.
    pub fn with_paper(mut self, paper: Arc<PaperBroker>) -> Self {
        self.paper = Some(paper);
        self
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn managers(&self) -> &[PositionLifecycleManager] {
        &self.managers
    }

    pub fn risk(&self) -> &PortfolioRiskMonitor {
        &self.risk
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        let tick_secs = self.config.current().config.tick_interval_secs.max(1);
        info!(
            dry_run = self.options.dry_run,
            tick_interval = tick_secs,
            instruments = self.managers.len(),
            "Starting agent run loop"
        );

        let mut tick_interval = interval(Duration::from_secs(tick_secs));

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            tick_interval.tick().await;

            if let Err(e) = self.tick_at(Utc::now()).await {
                error!(error = %e, "Error in agent tick");
            }
        }

        self.shutdown().await
    }

    /// Single iteration of the main loop.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ticks += 1;
        self.audit_writes.retain(|h| !h.is_finished());
        debug!(tick = self.ticks, "Agent tick");

        // 1. Configuration reload
        if let Some((generation, changes)) = self.config.reload_if_changed().await {
            if !changes.is_empty() {
                self.audit_writes.push(self.audit.log_param_changes(generation, changes));
            }
            self.risk.set_config(self.config.current().config.portfolio.clone());
        }
        let cfg = self.config.current().config;

        // 2. Market snapshots
        let snapshots = self.fetch_snapshots().await;
        if let Some(paper) = &self.paper {
            for snapshot in snapshots.iter().flatten() {
                paper.set_quote(&snapshot.instrument, snapshot.quote).await;
            }
        }

        // 3. Account balance
        match self.gateway.account_balance().await.applied() {
            Some(balance) => self.balance = balance.to_f64().unwrap_or(self.balance),
            None => warn!(balance = self.balance, "Balance unavailable, using last known"),
        }

        // 4. Portfolio risk
        let realized = match self
            .audit
            .database()
            .recent_realized_pnl(i64::from(cfg.portfolio.lookback_trades))
            .await
        {
            Ok(pnls) => {
                self.last_realized.clone_from(&pnls);
                pnls
            }
            Err(e) => {
                warn!(
                    error = %e,
                    sample = self.last_realized.len(),
                    "Realized P/L unavailable, using last sample"
                );
                self.last_realized.clone()
            }
        };
        let unrealized: Vec<f64> = self
            .managers
            .iter()
            .zip(&snapshots)
            .filter_map(|(manager, snapshot)| {
                let snapshot = snapshot.as_ref()?;
                manager.position()?;
                Some(manager.unrealized_pnl(&snapshot.quote))
            })
            .collect();

        let state = self.risk.update(&realized, &unrealized, now);
        debug!(
            cvar = state.cvar,
            sample = state.sample_size,
            loss_streak = state.loss_streak,
            "Portfolio risk updated"
        );
        self.audit_writes
            .push(self.audit.record_equity(self.balance, unrealized.iter().sum(), now));

        if self.risk.should_force_close() {
            warn!(
                cvar = self.risk.cvar(),
                max_cvar = self.risk.max_cvar(),
                "CVaR budget breached, closing all positions"
            );
            self.close_all(ExitReason::RiskForceClose, now).await;
            return Ok(());
        }

        // 5. Lifecycle and entries
        for (manager, snapshot) in self.managers.iter_mut().zip(&snapshots) {
            let Some(snapshot) = snapshot else {
                continue;
            };

            let advice = Self::advise(
                self.advisor.as_deref(),
                &mut self.last_advice_at,
                cfg.entry.advisor_cooldown_secs,
                snapshot,
                manager.position(),
                now,
            )
            .await;

            let ctx = TickContext {
                snapshot,
                advice: advice.as_ref(),
                now,
            };

            let report = match manager.tick(&ctx).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(instrument = %manager.instrument(), error = %e, "Lifecycle tick failed");
                    continue;
                }
            };

            if let Some(record) = report.opened {
                self.audit_writes.push(self.audit.log_trade(record));
            }
            if let Some(record) = report.closed {
                if let Some(pnl) = record.realized_pnl {
                    self.risk.record_trade_result(pnl, now);
                }
                self.audit_writes.push(self.audit.log_trade(record));
            }

            if !manager.is_flat() {
                continue;
            }

            match manager.try_enter(&ctx, self.balance, &self.risk).await {
                Ok(Verdict::Act(EntryTicket::Filled(record))) => {
                    self.audit_writes.push(self.audit.log_trade(record));
                }
                Ok(Verdict::Act(EntryTicket::Pending {
                    correlation_id,
                    order_id,
                })) => {
                    info!(
                        instrument = %manager.instrument(),
                        correlation_id = %correlation_id,
                        order_id = %order_id,
                        "Entry pending"
                    );
                }
                Ok(Verdict::Skip(SkipReason::NoSignal)) => {}
                Ok(Verdict::Skip(reason)) => {
                    info!(
                        instrument = %manager.instrument(),
                        code = reason.code(),
                        reason = %reason,
                        "Entry skipped"
                    );
                    self.audit_writes
                        .push(self.audit.log_entry_skip(manager.instrument().clone(), reason));
                }
                Err(e) => {
                    warn!(instrument = %manager.instrument(), error = %e, "Entry attempt failed");
                }
            }
        }

        Ok(())
    }

    async fn fetch_snapshots(&self) -> Vec<Option<MarketSnapshot>> {
        let results = join_all(
            self.managers
                .iter()
                .map(|manager| self.feed.snapshot(manager.instrument())),
        )
        .await;

        results
            .into_iter()
            .zip(&self.managers)
            .map(|(result, manager)| match result {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(instrument = %manager.instrument(), error = %e, "Snapshot fetch failed");
                    None
                }
            })
            .collect()
    }

    /// Ask the advisor unless it was asked for this instrument within the
    /// cooldown. Advisor failures mean no advice this tick.
    async fn advise(
        advisor: Option<&dyn DecisionAdvisor>,
        last_advice_at: &mut HashMap<Instrument, DateTime<Utc>>,
        cooldown_secs: i64,
        snapshot: &MarketSnapshot,
        position: Option<&Position>,
        now: DateTime<Utc>,
    ) -> Option<Advice> {
        let advisor = advisor?;
        let instrument = &snapshot.instrument;

        if let Some(last) = last_advice_at.get(instrument) {
            if (now - *last).num_seconds() < cooldown_secs {
                return None;
            }
        }
        last_advice_at.insert(instrument.clone(), now);

        match advisor.advise(snapshot, position).await {
            Ok(advice) => {
                debug!(
                    instrument = %instrument,
                    side = ?advice.side,
                    action = ?advice.action,
                    confidence = advice.confidence,
                    "Advice received"
                );
                Some(advice)
            }
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Advisor call failed");
                None
            }
        }
    }

    /// Force-close every manager that holds a position or pending entry.
    async fn close_all(&mut self, reason: ExitReason, now: DateTime<Utc>) {
        for manager in &mut self.managers {
            if manager.is_flat() {
                continue;
            }
            match manager.force_close(reason, now).await {
                Verdict::Act(record) => {
                    if let Some(pnl) = record.realized_pnl {
                        self.risk.record_trade_result(pnl, now);
                    }
                    self.audit_writes.push(self.audit.log_trade(record));
                }
                Verdict::Skip(reason) => {
                    warn!(instrument = %manager.instrument(), reason = %reason, "Force close skipped");
                }
            }
        }
    }

    /// Wait for outstanding audit writes.
    pub async fn flush_audit(&mut self) {
        for handle in self.audit_writes.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Audit task failed");
            }
        }
    }

    /// Graceful shutdown.
    async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down agent...");

        if self.options.close_on_shutdown {
            self.close_all(ExitReason::Manual, Utc::now()).await;
        } else {
            for manager in &self.managers {
                if let Some(position) = manager.position() {
                    warn!(
                        instrument = %manager.instrument(),
                        trade_id = %position.trade_id,
                        "Leaving position open at the broker"
                    );
                }
            }
        }

        self.flush_audit().await;

        info!("Agent shutdown complete");
        Ok(())
    }

    /// Get current stats.
    pub async fn get_stats(&self) -> AgentStats {
        let max_drawdown = self
            .audit
            .database()
            .calculate_max_drawdown()
            .await
            .unwrap_or(0.0);
        let state = self.risk.state();

        AgentStats {
            ticks: self.ticks,
            generation: self.config.current().generation,
            balance: self.balance,
            open_positions: self.managers.iter().filter(|m| m.position().is_some()).count(),
            pending_entries: self.managers.iter().map(|m| m.pending().len()).sum(),
            cvar: state.cvar,
            max_cvar: self.risk.max_cvar(),
            loss_streak: state.loss_streak,
            max_drawdown,
            is_running: !self.shutdown.load(Ordering::SeqCst),
            dry_run: self.options.dry_run,
        }
    }
}

/// Agent statistics.
#[derive(Debug, Clone)]
pub struct AgentStats {
    pub ticks: u64,
    pub generation: u64,
    pub balance: f64,
    pub open_positions: usize,
    pub pending_entries: usize,
    pub cvar: f64,
    pub max_cvar: f64,
    pub loss_streak: u32,
    pub max_drawdown: f64,
    pub is_running: bool,
    pub dry_run: bool,
}

impl std::fmt::Display for AgentStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Agent Statistics ===")?;
        writeln!(f, "Ticks:           {}", self.ticks)?;
        writeln!(f, "Config Gen:      {}", self.generation)?;
        writeln!(f, "Balance:         {:.2}", self.balance)?;
        writeln!(f, "Open Positions:  {}", self.open_positions)?;
        writeln!(f, "Pending Entries: {}", self.pending_entries)?;
        writeln!(f, "CVaR:            {:.2} (budget {:.2})", self.cvar, self.max_cvar)?;
        writeln!(f, "Loss Streak:     {}", self.loss_streak)?;
        writeln!(f, "Max Drawdown:    {:.2}%", self.max_drawdown * 100.0)?;
        writeln!(f, "Status:          {} {}",
            if self.is_running { "Running" } else { "Stopped" },
            if self.dry_run { "(Dry Run)" } else { "" })?;
        Ok(())
    }
}
