//! SQLite audit store.
//!
//! Records:
//! - Trade records, one row per position open and one per close
//! - Entry skips with their machine-readable reason
//! - Configuration parameter changes per generation
//! - Equity curve points for drawdown tracking
//!
//! [`AuditLog`] wraps the store for the trading loop: writes are spawned and
//! never block or fail a tick.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::models::{Instrument, TradeRecord};
use crate::trading::{ParamChange, SkipReason};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored trade record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: i64,
    pub kind: String,
    pub instrument: String,
    pub side: String,
    pub units: i64,
    pub trade_id: String,
    pub correlation_id: String,
    pub entry_price: String,
    pub entry_time: String,
    pub exit_price: Option<String>,
    pub exit_time: Option<String>,
    pub exit_reason: Option<String>,
    pub realized_pnl: Option<f64>,
    pub pnl_pips: Option<f64>,
    pub max_profit_pips: f64,
    pub scale_count: i64,
    pub created_at: String,
}

/// Stored entry skip.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEntrySkip {
    pub id: i64,
    pub instrument: String,
    pub code: String,
    pub reason: String,
    pub created_at: String,
}

/// Equity curve point.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EquityPoint {
    pub id: i64,
    pub timestamp: String,
    pub balance: f64,
    pub unrealized_pnl: f64,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to :memory: is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Close every pooled connection. Later queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                instrument TEXT NOT NULL,
                side TEXT NOT NULL,
                units INTEGER NOT NULL,
                trade_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_price TEXT,
                exit_time TEXT,
                exit_reason TEXT,
                realized_pnl REAL,
                pnl_pips REAL,
                max_profit_pips REAL NOT NULL DEFAULT 0,
                scale_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_skips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                code TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS param_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                generation INTEGER NOT NULL,
                param_key TEXT NOT NULL,
                old_value TEXT NOT NULL,
                new_value TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                balance REAL NOT NULL,
                unrealized_pnl REAL NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_kind ON trades(kind, id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Trades ====================

    /// Append a trade record.
    pub async fn log_trade(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                kind, instrument, side, units, trade_id, correlation_id,
                entry_price, entry_time, exit_price, exit_time, exit_reason,
                realized_pnl, pnl_pips, max_profit_pips, scale_count
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.kind.as_str())
        .bind(record.instrument.as_str())
        .bind(record.side.as_str())
        .bind(i64::try_from(record.units).unwrap_or(i64::MAX))
        .bind(&record.trade_id)
        .bind(&record.correlation_id)
        .bind(record.entry_price.to_string())
        .bind(record.entry_time.to_rfc3339())
        .bind(record.exit_price.map(|p| p.to_string()))
        .bind(record.exit_time.map(|t| t.to_rfc3339()))
        .bind(record.exit_reason.map(|r| r.as_str()))
        .bind(record.realized_pnl)
        .bind(record.pnl_pips)
        .bind(record.max_profit_pips)
        .bind(i64::from(record.scale_count))
        .execute(&self.pool)
        .await
        .context("Failed to insert trade record")?;

        Ok(())
    }

    /// Most recent trade records, newest first.
    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>("SELECT * FROM trades ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch trades")
    }

    /// Realized P/L of the most recent closes, newest first.
    pub async fn recent_realized_pnl(&self, limit: i64) -> Result<Vec<f64>> {
        sqlx::query_scalar::<_, f64>(
            r#"
            SELECT realized_pnl FROM trades
            WHERE kind = 'close' AND realized_pnl IS NOT NULL
            ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch realized P/L")
    }

    // ==================== Entry skips ====================

    /// Record why an entry was not taken.
    pub async fn log_entry_skip(&self, instrument: &Instrument, reason: &SkipReason) -> Result<()> {
        sqlx::query("INSERT INTO entry_skips (instrument, code, reason) VALUES (?, ?, ?)")
            .bind(instrument.as_str())
            .bind(reason.code())
            .bind(reason.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to insert entry skip")?;

        Ok(())
    }

    pub async fn recent_entry_skips(&self, limit: i64) -> Result<Vec<StoredEntrySkip>> {
        sqlx::query_as::<_, StoredEntrySkip>("SELECT * FROM entry_skips ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch entry skips")
    }

    // ==================== Config ====================

    /// Record one changed parameter of a published generation.
    pub async fn log_param_change(&self, generation: u64, change: &ParamChange) -> Result<()> {
        sqlx::query(
            "INSERT INTO param_changes (generation, param_key, old_value, new_value) VALUES (?, ?, ?, ?)",
        )
        .bind(i64::try_from(generation).unwrap_or(i64::MAX))
        .bind(&change.key)
        .bind(&change.old)
        .bind(&change.new)
        .execute(&self.pool)
        .await
        .context("Failed to insert parameter change")?;

        Ok(())
    }

    pub async fn param_change_count(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM param_changes")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count parameter changes")
    }

    // ==================== Equity Curve ====================

    /// Record an equity curve point.
    pub async fn record_equity_point(&self, balance: f64, unrealized_pnl: f64) -> Result<()> {
        sqlx::query("INSERT INTO equity_curve (timestamp, balance, unrealized_pnl) VALUES (?, ?, ?)")
            .bind(Utc::now().to_rfc3339())
            .bind(balance)
            .bind(unrealized_pnl)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get recent equity curve points, newest first.
    pub async fn get_equity_curve(&self, limit: i64) -> Result<Vec<EquityPoint>> {
        sqlx::query_as::<_, EquityPoint>("SELECT * FROM equity_curve ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch equity curve")
    }

    /// Max drawdown of balance plus unrealized P/L over the equity curve.
    pub async fn calculate_max_drawdown(&self) -> Result<f64> {
        let points = self.get_equity_curve(1000).await?;

        let mut peak = 0.0f64;
        let mut max_dd = 0.0f64;

        // Points are in DESC order, reverse for calculation
        for point in points.into_iter().rev() {
            let equity = point.balance + point.unrealized_pnl;
            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                max_dd = max_dd.max((peak - equity) / peak);
            }
        }

        Ok(max_dd)
    }
}

/// Fire-and-forget audit writer. Failures are logged, never returned.
#[derive(Clone)]
pub struct AuditLog {
    db: Arc<Database>,
}

impl AuditLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn log_trade(&self, record: TradeRecord) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.log_trade(&record).await {
                warn!(trade_id = %record.trade_id, error = %e, "Audit write failed");
            }
        })
    }

    pub fn log_entry_skip(&self, instrument: Instrument, reason: SkipReason) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.log_entry_skip(&instrument, &reason).await {
                warn!(instrument = %instrument, error = %e, "Audit write failed");
            }
        })
    }

    pub fn log_param_changes(&self, generation: u64, changes: Vec<ParamChange>) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            for change in &changes {
                if let Err(e) = db.log_param_change(generation, change).await {
                    warn!(generation, key = %change.key, error = %e, "Audit write failed");
                }
            }
        })
    }

    pub fn record_equity(&self, balance: f64, unrealized_pnl: f64, at: DateTime<Utc>) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.record_equity_point(balance, unrealized_pnl).await {
                warn!(at = %at, error = %e, "Equity write failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, Position, Side};
    use rust_decimal_macros::dec;

    async fn memory_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn position() -> Position {
        Position::open(
            Instrument::new("USD_JPY"),
            Side::Long,
            1000,
            dec!(150.00),
            Utc::now(),
            "T1".to_string(),
            "c1".to_string(),
            20.0,
            40.0,
        )
    }

    #[tokio::test]
    async fn test_trade_records_and_realized_pnl() {
        let db = memory_db().await;
        let pos = position();

        db.log_trade(&TradeRecord::opened(&pos)).await.unwrap();
        db.log_trade(&TradeRecord::closed(&pos, Some(dec!(150.10)), 100.0, ExitReason::PeakRetrace, Utc::now()))
            .await
            .unwrap();
        db.log_trade(&TradeRecord::closed(&pos, Some(dec!(149.80)), -200.0, ExitReason::BrokerClosed, Utc::now()))
            .await
            .unwrap();

        let trades = db.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[0].exit_reason.as_deref(), Some("broker_closed"));
        assert_eq!(trades[2].kind, "open");

        // Newest first, opens excluded
        assert_eq!(db.recent_realized_pnl(10).await.unwrap(), vec![-200.0, 100.0]);
        assert_eq!(db.recent_realized_pnl(1).await.unwrap(), vec![-200.0]);
    }

    #[tokio::test]
    async fn test_entry_skips_and_param_changes() {
        let db = memory_db().await;
        db.log_entry_skip(&Instrument::new("EUR_USD"), &SkipReason::RiskVeto { cvar: -60.0, max_cvar: 50.0 })
            .await
            .unwrap();

        let skips = db.recent_entry_skips(5).await.unwrap();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].code, "risk_veto");

        let change = ParamChange {
            key: "trailing.distance_pips".to_string(),
            old: "6.0".to_string(),
            new: "8.0".to_string(),
        };
        tokio_test::assert_ok!(db.log_param_change(2, &change).await);
        assert_eq!(tokio_test::assert_ok!(db.param_change_count().await), 1);
    }

    #[tokio::test]
    async fn test_audit_log_writes_in_background() {
        let audit = AuditLog::new(Arc::new(memory_db().await));
        audit.log_trade(TradeRecord::opened(&position())).await.unwrap();
        audit
            .log_entry_skip(Instrument::new("USD_JPY"), SkipReason::NoSignal)
            .await
            .unwrap();

        assert_eq!(audit.database().recent_trades(5).await.unwrap().len(), 1);
        assert_eq!(audit.database().recent_entry_skips(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_max_drawdown() {
        let db = memory_db().await;
        for balance in [10_000.0, 11_000.0, 9_900.0, 10_500.0] {
            db.record_equity_point(balance, 0.0).await.unwrap();
        }

        let dd = db.calculate_max_drawdown().await.unwrap();
        assert!((dd - 0.1).abs() < 1e-9);
    }
}
