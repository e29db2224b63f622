//! Agent configuration: one validated struct built at startup, hot-reloaded
//! in process through a watch channel that carries a generation counter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::models::Instrument;

/// Position sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Fraction of balance risked per trade (0.01 = 1%)
    pub risk_pct: f64,
    /// Account-currency value of one pip for one lot
    pub pip_value: f64,
    pub min_lots: f64,
    pub max_lots: f64,
    pub units_per_lot: u64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            risk_pct: 0.01,
            pip_value: 10.0,
            min_lots: 0.1,
            max_lots: 5.0,
            units_per_lot: 1000,
        }
    }
}

/// Stop-loss and reward:risk guards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    /// ATR multiple for the dynamic minimum stop
    pub atr_mult: f64,
    /// Proposed stops below `atr * min_atr_mult` are rejected
    pub min_atr_mult: f64,
    pub swing_lookback: usize,
    pub swing_buffer_pips: f64,
    /// Multiplier on the minimum stop during high-liquidity hours
    pub high_vol_session_mult: f64,
    /// UTC hour ranges `[start, end)` treated as high-liquidity
    pub high_vol_hours_utc: Vec<[u32; 2]>,
    pub min_rrr: f64,
    pub slippage_pips: f64,
    /// Take-profit after costs must stay at or above this
    pub min_net_tp_pips: f64,
    pub default_tp_pips: f64,
    pub default_sl_pips: f64,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            atr_mult: 1.2,
            min_atr_mult: 1.0,
            swing_lookback: 20,
            swing_buffer_pips: 5.0,
            high_vol_session_mult: 1.3,
            high_vol_hours_utc: vec![[6, 8], [13, 15]],
            min_rrr: 1.0,
            slippage_pips: 0.5,
            min_net_tp_pips: 1.0,
            default_tp_pips: 30.0,
            default_sl_pips: 20.0,
        }
    }
}

/// Breakeven arming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakevenConfig {
    pub trigger_pips: f64,
    /// Applied only when > 0
    pub atr_trigger_mult: f64,
    /// Trigger as a multiple of the initial stop, applied only when > 0
    pub r_trigger: f64,
    /// ADX at or above this keeps the stop `atr * vol_sl_mult` behind entry
    pub vol_adx_min: f64,
    pub vol_sl_mult: f64,
    /// Bars checked for a stagnating market; 0 disables
    pub stagnation_bars: usize,
    pub stagnation_atr_ratio: f64,
}

impl Default for BreakevenConfig {
    fn default() -> Self {
        Self {
            trigger_pips: 10.0,
            atr_trigger_mult: 0.0,
            r_trigger: 0.0,
            vol_adx_min: 30.0,
            vol_sl_mult: 2.0,
            stagnation_bars: 6,
            stagnation_atr_ratio: 0.2,
        }
    }
}

/// Broker sync and the missing-stop watchdog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Minimum seconds between trade fetches
    pub sync_interval_secs: i64,
    /// Fallback stop distance in ATR when the stop vanished
    pub fallback_atr_mult: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 10,
            fallback_atr_mult: 2.0,
        }
    }
}

/// One-shot take-profit extension and reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakeProfitConfig {
    pub extension_adx_min: f64,
    /// 0 disables extension
    pub extension_atr_mult: f64,
    pub reduction_adx_max: f64,
    /// 0 disables reduction
    pub reduction_atr_mult: f64,
    pub reduction_min_hold_secs: i64,
    /// A reduced target never sits closer to entry than this
    pub min_tp_pips: f64,
    /// Fetch the attached TP from the broker before deciding a change is redundant
    pub verify_before_modify: bool,
}

impl Default for TakeProfitConfig {
    fn default() -> Self {
        Self {
            extension_adx_min: 25.0,
            extension_atr_mult: 1.0,
            reduction_adx_max: 20.0,
            reduction_atr_mult: 1.0,
            reduction_min_hold_secs: 900,
            min_tp_pips: 5.0,
            verify_before_modify: true,
        }
    }
}

/// Trailing stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingConfig {
    pub enabled: bool,
    pub trigger_pips: f64,
    pub distance_pips: f64,
    pub trigger_mult: f64,
    pub distance_mult: f64,
    /// Calendar level at which trigger and distance are widened
    pub calendar_widen_level: u8,
    pub calendar_widen_mult: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_pips: 10.0,
            distance_pips: 6.0,
            trigger_mult: 1.2,
            distance_mult: 1.0,
            calendar_widen_level: 2,
            calendar_widen_mult: 1.5,
        }
    }
}

/// Partial close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialCloseConfig {
    /// 0 disables
    pub threshold_pips: f64,
    pub fraction: f64,
}

impl Default for PartialCloseConfig {
    fn default() -> Self {
        Self {
            threshold_pips: 0.0,
            fraction: 0.5,
        }
    }
}

/// Peak-profit exit and maximum holding time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub peak_exit_enabled: bool,
    pub max_draw_atr_ratio: f64,
    pub reversal_exit: bool,
    /// 0 disables
    pub max_hold_hours: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            peak_exit_enabled: true,
            max_draw_atr_ratio: 2.0,
            reversal_exit: true,
            max_hold_hours: 6.0,
        }
    }
}

/// Scale-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleInConfig {
    /// 0 disables
    pub max_count: u32,
    /// Minimum profit before adding, in ATR
    pub trigger_atr: f64,
    pub lots: f64,
}

impl Default for ScaleInConfig {
    fn default() -> Self {
        Self {
            max_count: 1,
            trigger_atr: 0.5,
            lots: 0.5,
        }
    }
}

/// Portfolio-level risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub alpha: f64,
    /// CVaR budget in account currency
    pub max_cvar: f64,
    /// Realized trades fed into the CVaR estimate
    pub lookback_trades: u32,
    pub force_close_on_breach: bool,
    pub max_consecutive_losses: u32,
    pub loss_cooldown_secs: i64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            max_cvar: 5000.0,
            lookback_trades: 100,
            force_close_on_breach: false,
            max_consecutive_losses: 3,
            loss_cooldown_secs: 3600,
        }
    }
}

/// Order gateway retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 8000,
            request_timeout_ms: 10_000,
        }
    }
}

/// Entry orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    pub limit_valid_secs: i64,
    pub max_limit_age_secs: i64,
    pub max_limit_retries: u32,
    /// Minimum seconds between advisor calls per instrument
    pub advisor_cooldown_secs: i64,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            limit_valid_secs: 180,
            max_limit_age_secs: 180,
            max_limit_retries: 3,
            advisor_cooldown_secs: 60,
        }
    }
}

/// Full agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub instruments: Vec<Instrument>,
    pub tick_interval_secs: u64,
    pub sizing: SizingConfig,
    pub stops: StopConfig,
    pub breakeven: BreakevenConfig,
    pub watchdog: WatchdogConfig,
    pub take_profit: TakeProfitConfig,
    pub trailing: TrailingConfig,
    pub partial_close: PartialCloseConfig,
    pub exit: ExitConfig,
    pub scale_in: ScaleInConfig,
    pub portfolio: PortfolioConfig,
    pub gateway: GatewayConfig,
    pub entry: EntryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instruments: vec![Instrument::new("USD_JPY")],
            tick_interval_secs: 1,
            sizing: SizingConfig::default(),
            stops: StopConfig::default(),
            breakeven: BreakevenConfig::default(),
            watchdog: WatchdogConfig::default(),
            take_profit: TakeProfitConfig::default(),
            trailing: TrailingConfig::default(),
            partial_close: PartialCloseConfig::default(),
            exit: ExitConfig::default(),
            scale_in: ScaleInConfig::default(),
            portfolio: PortfolioConfig::default(),
            gateway: GatewayConfig::default(),
            entry: EntryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without validating.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse config TOML")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Reject values the engine cannot act on safely.
    pub fn validate(&self) -> Result<()> {
        if self.instruments.is_empty() {
            bail!("at least one instrument is required");
        }
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be positive");
        }

        let s = &self.sizing;
        if !(s.risk_pct > 0.0 && s.risk_pct <= 0.1) {
            bail!("sizing.risk_pct must be in (0, 0.1], got {}", s.risk_pct);
        }
        if s.pip_value <= 0.0 {
            bail!("sizing.pip_value must be positive");
        }
        if s.min_lots < 0.0 || s.max_lots < s.min_lots {
            bail!("sizing lot bounds are inconsistent: {}..{}", s.min_lots, s.max_lots);
        }
        if s.units_per_lot == 0 {
            bail!("sizing.units_per_lot must be positive");
        }

        let st = &self.stops;
        if st.min_rrr <= 0.0 {
            bail!("stops.min_rrr must be positive");
        }
        if st.default_sl_pips <= 0.0 || st.default_tp_pips <= 0.0 {
            bail!("stops default TP/SL must be positive");
        }
        for [start, end] in &st.high_vol_hours_utc {
            if *start > 23 || *end > 24 || start >= end {
                bail!("stops.high_vol_hours_utc has an invalid range {}..{}", start, end);
            }
        }
        non_negative("stops.atr_mult", st.atr_mult)?;
        non_negative("stops.min_atr_mult", st.min_atr_mult)?;
        non_negative("stops.swing_buffer_pips", st.swing_buffer_pips)?;
        non_negative("stops.slippage_pips", st.slippage_pips)?;
        if st.high_vol_session_mult < 1.0 {
            bail!("stops.high_vol_session_mult must be >= 1");
        }

        non_negative("breakeven.trigger_pips", self.breakeven.trigger_pips)?;
        non_negative("breakeven.atr_trigger_mult", self.breakeven.atr_trigger_mult)?;
        non_negative("breakeven.r_trigger", self.breakeven.r_trigger)?;
        non_negative("breakeven.vol_sl_mult", self.breakeven.vol_sl_mult)?;
        non_negative("watchdog.fallback_atr_mult", self.watchdog.fallback_atr_mult)?;
        non_negative("take_profit.extension_atr_mult", self.take_profit.extension_atr_mult)?;
        non_negative("take_profit.reduction_atr_mult", self.take_profit.reduction_atr_mult)?;

        let t = &self.trailing;
        non_negative("trailing.trigger_pips", t.trigger_pips)?;
        non_negative("trailing.distance_pips", t.distance_pips)?;
        non_negative("trailing.trigger_mult", t.trigger_mult)?;
        non_negative("trailing.distance_mult", t.distance_mult)?;
        if t.distance_pips <= 0.0 && t.distance_mult <= 0.0 {
            bail!("trailing.distance_pips or trailing.distance_mult must be positive");
        }
        if t.calendar_widen_mult < 1.0 {
            bail!("trailing.calendar_widen_mult must be >= 1");
        }

        let pc = &self.partial_close;
        non_negative("partial_close.threshold_pips", pc.threshold_pips)?;
        if pc.threshold_pips > 0.0 && !(pc.fraction > 0.0 && pc.fraction < 1.0) {
            bail!("partial_close.fraction must be in (0, 1), got {}", pc.fraction);
        }

        non_negative("exit.max_draw_atr_ratio", self.exit.max_draw_atr_ratio)?;
        non_negative("exit.max_hold_hours", self.exit.max_hold_hours)?;
        non_negative("scale_in.trigger_atr", self.scale_in.trigger_atr)?;
        non_negative("scale_in.lots", self.scale_in.lots)?;

        let p = &self.portfolio;
        if !(p.alpha > 0.0 && p.alpha <= 1.0) {
            bail!("portfolio.alpha must be in (0, 1], got {}", p.alpha);
        }
        if p.max_cvar <= 0.0 {
            bail!("portfolio.max_cvar must be positive");
        }

        let g = &self.gateway;
        if g.max_attempts == 0 {
            bail!("gateway.max_attempts must be at least 1");
        }
        if g.request_timeout_ms == 0 {
            bail!("gateway.request_timeout_ms must be positive");
        }
        if g.max_backoff_ms < g.initial_backoff_ms {
            bail!("gateway.max_backoff_ms must be >= initial_backoff_ms");
        }

        if self.entry.limit_valid_secs <= 0 {
            bail!("entry.limit_valid_secs must be positive");
        }

        Ok(())
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        bail!("{} must be a non-negative number, got {}", name, value);
    }
    Ok(())
}

/// A published configuration and its generation number.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub generation: u64,
    pub config: Arc<AgentConfig>,
}

/// One changed parameter between two generations.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamChange {
    pub key: String,
    pub old: String,
    pub new: String,
}

/// Owner of the live configuration. Readers subscribe and pick up the
/// newest generation at the start of their next tick.
pub struct ConfigHandle {
    tx: watch::Sender<ConfigSnapshot>,
    path: Option<PathBuf>,
    last_modified: Option<SystemTime>,
}

impl ConfigHandle {
    /// Create a handle publishing generation 0.
    pub fn new(config: AgentConfig, path: Option<PathBuf>) -> Self {
        let last_modified = path.as_deref().and_then(modified_at);
        let (tx, _rx) = watch::channel(ConfigSnapshot {
            generation: 0,
            config: Arc::new(config),
        });

        Self {
            tx,
            path,
            last_modified,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConfigSnapshot {
        self.tx.borrow().clone()
    }

    /// Validate and publish a new configuration. Returns the new generation
    /// and the parameters that changed.
    pub fn publish(&self, config: AgentConfig) -> Result<(u64, Vec<ParamChange>)> {
        config.validate()?;

        let previous = self.current();
        let changes = diff_params(&previous.config, &config)?;
        let generation = previous.generation + 1;

        self.tx.send_replace(ConfigSnapshot {
            generation,
            config: Arc::new(config),
        });

        info!(generation, changed = changes.len(), "Configuration published");
        Ok((generation, changes))
    }

    /// Reload from disk if the file changed since the last check. Invalid
    /// files are logged and ignored; the running generation stays active.
    pub async fn reload_if_changed(&mut self) -> Option<(u64, Vec<ParamChange>)> {
        let path = self.path.clone()?;
        let modified = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());

        if modified.is_none() || modified == self.last_modified {
            return None;
        }
        self.last_modified = modified;

        let loaded = match tokio::fs::read_to_string(&path).await {
            Ok(text) => AgentConfig::from_toml(&text),
            Err(e) => Err(anyhow::Error::from(e)),
        };

        match loaded.and_then(|config| self.publish(config)) {
            Ok((generation, changes)) if changes.is_empty() => {
                info!(generation, "Config file touched without parameter changes");
                Some((generation, changes))
            }
            Ok(published) => Some(published),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring invalid config reload");
                None
            }
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

/// Flattened key-by-key diff of two configurations.
pub fn diff_params(old: &AgentConfig, new: &AgentConfig) -> Result<Vec<ParamChange>> {
    let old = serde_json::to_value(old).context("Failed to serialize config")?;
    let new = serde_json::to_value(new).context("Failed to serialize config")?;

    let mut old_flat = Vec::new();
    let mut new_flat = Vec::new();
    flatten("", &old, &mut old_flat);
    flatten("", &new, &mut new_flat);

    let mut changes = Vec::new();
    for (key, new_value) in &new_flat {
        let old_value = old_flat
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        if &old_value != new_value {
            changes.push(ParamChange {
                key: key.clone(),
                old: old_value,
                new: new_value.clone(),
            });
        }
    }

    Ok(changes)
}

fn flatten(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten(&key, v, out);
            }
        }
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config = AgentConfig::from_toml(
            r#"
            instruments = ["EUR_USD", "USD_JPY"]

            [trailing]
            trigger_pips = 15.0
            "#,
        )
        .unwrap();

        assert_eq!(config.instruments.len(), 2);
        assert_eq!(config.trailing.trigger_pips, 15.0);
        assert_eq!(config.trailing.distance_pips, 6.0);
        assert_eq!(config.portfolio.alpha, 0.05);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AgentConfig::default();
        config.portfolio.alpha = 1.5;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.gateway.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.partial_close.threshold_pips = 20.0;
        config.partial_close.fraction = 1.0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.trailing.distance_mult = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_trailing_distance() {
        let mut config = AgentConfig::default();
        config.trailing.distance_pips = 0.0;
        config.trailing.distance_mult = 0.0;
        assert!(config.validate().is_err());

        // Either source alone is enough
        config.trailing.distance_mult = 0.8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_publish_bumps_generation_and_reports_changes() {
        let handle = ConfigHandle::new(AgentConfig::default(), None);
        let mut rx = handle.subscribe();

        let mut next = AgentConfig::default();
        next.trailing.distance_pips = 8.0;

        let (generation, changes) = handle.publish(next).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, "trailing.distance_pips");
        assert_eq!(changes[0].new, "8.0");

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().config.trailing.distance_pips, 8.0);
    }

    #[test]
    fn test_publish_rejects_invalid_config() {
        let handle = ConfigHandle::new(AgentConfig::default(), None);
        let mut bad = AgentConfig::default();
        bad.portfolio.max_cvar = 0.0;

        assert!(handle.publish(bad).is_err());
        assert_eq!(handle.current().generation, 0);
    }

    #[tokio::test]
    async fn test_reload_without_path_is_noop() {
        let mut handle = ConfigHandle::new(AgentConfig::default(), None);
        assert!(handle.reload_if_changed().await.is_none());
    }
}
