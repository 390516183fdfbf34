use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::any::AnyPoolOptions;
use trading_core::*;

use crate::rows::{
    day, ts, ExecutionRow, RiskMetricsRow, SignalRow, EXECUTION_COLUMNS, RISK_COLUMNS,
    SIGNAL_COLUMNS,
};

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// `TradingStore` backed by a relational database
#[derive(Clone)]
pub struct SqlStore {
    pool: sqlx::AnyPool,
}

impl SqlStore {
    pub fn new(pool: sqlx::AnyPool) -> Self {
        Self { pool }
    }

    /// Connect, then create any missing tables
    pub async fn connect(database_url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to {}", database_url))?;

        let store = Self::new(pool);
        store.init_tables().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &sqlx::AnyPool {
        &self.pool
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                confidence REAL NOT NULL,
                strength REAL NOT NULL,
                entry_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                tp1 REAL NOT NULL,
                tp2 REAL NOT NULL,
                tp3 REAL NOT NULL,
                risk_reward REAL NOT NULL,
                position_size_usd REAL NOT NULL,
                leverage INTEGER NOT NULL,
                layers TEXT NOT NULL,
                tier TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                status_reason TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id INTEGER,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                direction TEXT NOT NULL,
                order_type TEXT NOT NULL,
                order_id TEXT,
                requested_leverage INTEGER NOT NULL,
                actual_leverage INTEGER NOT NULL,
                quantity REAL NOT NULL,
                notional_usd REAL NOT NULL,
                margin_used REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL,
                stop_loss REAL,
                take_profit REAL,
                realized_pnl REAL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                funding_fees REAL NOT NULL DEFAULT 0,
                trading_fees REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                mfe_percent REAL NOT NULL DEFAULT 0,
                mae_percent REAL NOT NULL DEFAULT 0,
                mfe_price REAL,
                mae_price REAL,
                close_reason TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS risk_metrics (
                date TEXT PRIMARY KEY,
                starting_balance REAL NOT NULL,
                current_balance REAL NOT NULL,
                peak_balance REAL NOT NULL,
                daily_pnl REAL NOT NULL,
                daily_pnl_percent REAL NOT NULL,
                trades_count INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                losses INTEGER NOT NULL,
                current_drawdown_percent REAL NOT NULL,
                max_drawdown_percent REAL NOT NULL,
                open_positions INTEGER NOT NULL,
                total_exposure_usd REAL NOT NULL,
                max_single_exposure_usd REAL NOT NULL,
                avg_leverage REAL NOT NULL,
                max_leverage REAL NOT NULL,
                daily_loss_limit_percent REAL NOT NULL,
                max_drawdown_limit_percent REAL NOT NULL,
                max_positions INTEGER NOT NULL,
                max_position_size_percent REAL NOT NULL,
                emergency_stop_triggered INTEGER NOT NULL DEFAULT 0,
                trading_enabled INTEGER NOT NULL DEFAULT 1,
                paused_until TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                voice_text TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scan_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tier TEXT NOT NULL,
                started_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                symbols_scanned INTEGER NOT NULL,
                signals_found INTEGER NOT NULL,
                errors INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status, created_at)")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_closed ON executions(closed_at)")
            .execute(&self.pool)
            .await
            .ok();

        tracing::info!("Trading store tables ready");
        Ok(())
    }

    async fn fetch_executions(&self, sql: &str, binds: Vec<String>) -> StoreResult<Vec<Execution>> {
        let mut query = sqlx::query_as::<_, ExecutionRow>(sql);
        for value in binds {
            query = query.bind(value);
        }
        query
            .fetch_all(&self.pool)
            .await
            .map_err(db)?
            .into_iter()
            .map(Execution::try_from)
            .collect()
    }
}

#[async_trait]
impl TradingStore for SqlStore {
    async fn insert_signal(&self, signal: &Signal) -> StoreResult<i64> {
        let layers = serde_json::to_string(&signal.layers)
            .map_err(|e| StoreError::Corrupt(format!("signal layers: {}", e)))?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO signals (
                symbol, direction, confidence, strength, entry_price, stop_loss,
                tp1, tp2, tp3, risk_reward, position_size_usd, leverage, layers, tier,
                created_at, expires_at, status, status_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id",
        )
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(signal.confidence)
        .bind(signal.strength)
        .bind(signal.entry_price)
        .bind(signal.stop_loss)
        .bind(signal.take_profits[0])
        .bind(signal.take_profits[1])
        .bind(signal.take_profits[2])
        .bind(signal.risk_reward)
        .bind(signal.position_size_usd)
        .bind(signal.leverage as i64)
        .bind(layers)
        .bind(&signal.tier)
        .bind(ts(signal.created_at))
        .bind(ts(signal.expires_at))
        .bind(signal.status.as_str())
        .bind(signal.status_reason.clone())
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;

        tracing::debug!("Stored signal {} ({} {})", id, signal.symbol, signal.direction);
        Ok(id)
    }

    async fn get_signal(&self, id: i64) -> StoreResult<Option<Signal>> {
        let sql = format!("SELECT {} FROM signals WHERE id = ?", SIGNAL_COLUMNS);
        let row: Option<SignalRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(Signal::try_from).transpose()
    }

    async fn pending_signals(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Signal>> {
        let sql = format!(
            "SELECT {} FROM signals
             WHERE status = 'pending' AND expires_at > ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
            SIGNAL_COLUMNS
        );
        let rows: Vec<SignalRow> = sqlx::query_as(&sql)
            .bind(ts(now))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.into_iter().map(Signal::try_from).collect()
    }

    async fn transition_signal(
        &self,
        id: i64,
        from: SignalStatus,
        to: SignalStatus,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        // Conditional on the current status: concurrent claimers race on
        // this single statement and exactly one sees a changed row.
        let result = sqlx::query(
            "UPDATE signals
             SET status = ?, status_reason = COALESCE(?, status_reason)
             WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(reason.map(str::to_string))
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(result.rows_affected() == 1)
    }

    async fn expire_signals(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE signals SET status = 'expired', status_reason = 'TTL elapsed'
             WHERE status = 'pending' AND expires_at <= ?",
        )
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(result.rows_affected())
    }

    async fn signals_expired_in(
        &self,
        status: SignalStatus,
        expired_by: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Signal>> {
        let sql = format!(
            "SELECT {} FROM signals
             WHERE status = ? AND expires_at <= ?
             ORDER BY created_at ASC, id ASC
             LIMIT ?",
            SIGNAL_COLUMNS
        );
        let rows: Vec<SignalRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .bind(ts(expired_by))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.into_iter().map(Signal::try_from).collect()
    }

    async fn insert_execution(&self, execution: &Execution) -> StoreResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO executions (
                signal_id, symbol, side, direction, order_type, order_id,
                requested_leverage, actual_leverage, quantity, notional_usd, margin_used,
                entry_price, exit_price, stop_loss, take_profit, realized_pnl, unrealized_pnl,
                funding_fees, trading_fees, status, opened_at, closed_at,
                mfe_percent, mae_percent, mfe_price, mae_price, close_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id",
        )
        .bind(execution.signal_id)
        .bind(&execution.symbol)
        .bind(execution.side.as_str())
        .bind(execution.direction.as_str())
        .bind(execution.order_type.as_str())
        .bind(execution.order_id.clone())
        .bind(execution.requested_leverage as i64)
        .bind(execution.actual_leverage as i64)
        .bind(execution.quantity)
        .bind(execution.notional_usd)
        .bind(execution.margin_used)
        .bind(execution.entry_price)
        .bind(execution.exit_price)
        .bind(execution.stop_loss)
        .bind(execution.take_profit)
        .bind(execution.realized_pnl)
        .bind(execution.unrealized_pnl)
        .bind(execution.funding_fees)
        .bind(execution.trading_fees)
        .bind(execution.status.as_str())
        .bind(ts(execution.opened_at))
        .bind(execution.closed_at.map(ts))
        .bind(execution.excursion.mfe_percent)
        .bind(execution.excursion.mae_percent)
        .bind(execution.excursion.mfe_price)
        .bind(execution.excursion.mae_price)
        .bind(execution.close_reason.clone())
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;

        Ok(id)
    }

    async fn open_executions(&self) -> StoreResult<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE status IN ('pending', 'open', 'closing')
             ORDER BY opened_at ASC, id ASC",
            EXECUTION_COLUMNS
        );
        self.fetch_executions(&sql, Vec::new()).await
    }

    async fn execution_for_signal(&self, signal_id: i64) -> StoreResult<Option<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions WHERE signal_id = ? ORDER BY id DESC LIMIT 1",
            EXECUTION_COLUMNS
        );
        let row: Option<ExecutionRow> = sqlx::query_as(&sql)
            .bind(signal_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(Execution::try_from).transpose()
    }

    async fn open_execution_for(
        &self,
        symbol: &str,
        direction: Direction,
    ) -> StoreResult<Option<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE symbol = ? AND direction = ? AND status IN ('pending', 'open', 'closing')
             ORDER BY id DESC LIMIT 1",
            EXECUTION_COLUMNS
        );
        let mut rows = self
            .fetch_executions(&sql, vec![symbol.to_string(), direction.as_str().to_string()])
            .await?;
        Ok(rows.pop())
    }

    async fn update_excursion(
        &self,
        id: i64,
        excursion: &Excursion,
        unrealized_pnl: f64,
        stop_loss: Option<f64>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE executions
             SET mfe_percent = ?, mae_percent = ?, mfe_price = ?, mae_price = ?,
                 unrealized_pnl = ?, stop_loss = COALESCE(?, stop_loss)
             WHERE id = ?",
        )
        .bind(excursion.mfe_percent)
        .bind(excursion.mae_percent)
        .bind(excursion.mfe_price)
        .bind(excursion.mae_price)
        .bind(unrealized_pnl)
        .bind(stop_loss)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("execution {}", id)));
        }
        Ok(())
    }

    async fn close_execution(&self, id: i64, close: &ExecutionClose) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE executions
             SET status = ?, exit_price = ?, realized_pnl = ?, trading_fees = ?,
                 closed_at = ?, mfe_percent = ?, mae_percent = ?, mfe_price = ?,
                 mae_price = ?, unrealized_pnl = 0, close_reason = ?
             WHERE id = ?",
        )
        .bind(close.status.as_str())
        .bind(close.exit_price)
        .bind(close.realized_pnl)
        .bind(close.trading_fees)
        .bind(ts(close.closed_at))
        .bind(close.excursion.mfe_percent)
        .bind(close.excursion.mae_percent)
        .bind(close.excursion.mfe_price)
        .bind(close.excursion.mae_price)
        .bind(&close.close_reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("execution {}", id)));
        }
        Ok(())
    }

    async fn recent_closed_executions(&self, limit: usize) -> StoreResult<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE status IN ('closed', 'liquidated') AND closed_at IS NOT NULL
             ORDER BY closed_at DESC, id DESC
             LIMIT {}",
            EXECUTION_COLUMNS, limit
        );
        self.fetch_executions(&sql, Vec::new()).await
    }

    async fn closed_executions_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE status IN ('closed', 'liquidated') AND closed_at >= ?
             ORDER BY closed_at ASC, id ASC",
            EXECUTION_COLUMNS
        );
        self.fetch_executions(&sql, vec![ts(since)]).await
    }

    async fn risk_metrics_for(&self, date: NaiveDate) -> StoreResult<Option<RiskMetrics>> {
        let sql = format!("SELECT {} FROM risk_metrics WHERE date = ?", RISK_COLUMNS);
        let row: Option<RiskMetricsRow> = sqlx::query_as(&sql)
            .bind(day(date))
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(RiskMetrics::try_from).transpose()
    }

    async fn latest_risk_metrics(&self, date: NaiveDate) -> StoreResult<Option<RiskMetrics>> {
        let sql = format!(
            "SELECT {} FROM risk_metrics WHERE date <= ? ORDER BY date DESC LIMIT 1",
            RISK_COLUMNS
        );
        let row: Option<RiskMetricsRow> = sqlx::query_as(&sql)
            .bind(day(date))
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(RiskMetrics::try_from).transpose()
    }

    async fn upsert_risk_metrics(&self, m: &RiskMetrics) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO risk_metrics (
                date, starting_balance, current_balance, peak_balance, daily_pnl,
                daily_pnl_percent, trades_count, wins, losses, current_drawdown_percent,
                max_drawdown_percent, open_positions, total_exposure_usd,
                max_single_exposure_usd, avg_leverage, max_leverage, daily_loss_limit_percent,
                max_drawdown_limit_percent, max_positions, max_position_size_percent,
                emergency_stop_triggered, trading_enabled, paused_until, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
                starting_balance = excluded.starting_balance,
                current_balance = excluded.current_balance,
                peak_balance = excluded.peak_balance,
                daily_pnl = excluded.daily_pnl,
                daily_pnl_percent = excluded.daily_pnl_percent,
                trades_count = excluded.trades_count,
                wins = excluded.wins,
                losses = excluded.losses,
                current_drawdown_percent = excluded.current_drawdown_percent,
                max_drawdown_percent = excluded.max_drawdown_percent,
                open_positions = excluded.open_positions,
                total_exposure_usd = excluded.total_exposure_usd,
                max_single_exposure_usd = excluded.max_single_exposure_usd,
                avg_leverage = excluded.avg_leverage,
                max_leverage = excluded.max_leverage,
                daily_loss_limit_percent = excluded.daily_loss_limit_percent,
                max_drawdown_limit_percent = excluded.max_drawdown_limit_percent,
                max_positions = excluded.max_positions,
                max_position_size_percent = excluded.max_position_size_percent,
                emergency_stop_triggered = excluded.emergency_stop_triggered,
                trading_enabled = excluded.trading_enabled,
                paused_until = excluded.paused_until,
                updated_at = excluded.updated_at",
        )
        .bind(day(m.date))
        .bind(m.starting_balance)
        .bind(m.current_balance)
        .bind(m.peak_balance)
        .bind(m.daily_pnl)
        .bind(m.daily_pnl_percent)
        .bind(m.trades_count as i64)
        .bind(m.wins as i64)
        .bind(m.losses as i64)
        .bind(m.current_drawdown_percent)
        .bind(m.max_drawdown_percent)
        .bind(m.open_positions as i64)
        .bind(m.total_exposure_usd)
        .bind(m.max_single_exposure_usd)
        .bind(m.avg_leverage)
        .bind(m.max_leverage)
        .bind(m.daily_loss_limit_percent)
        .bind(m.max_drawdown_limit_percent)
        .bind(m.max_positions as i64)
        .bind(m.max_position_size_percent)
        .bind(m.emergency_stop_triggered as i64)
        .bind(m.trading_enabled as i64)
        .bind(m.paused_until.map(ts))
        .bind(ts(m.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> StoreResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO alerts (kind, severity, title, message, voice_text, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(alert.kind.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(alert.voice_text.clone())
        .bind(ts(alert.created_at))
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;

        Ok(id)
    }

    async fn record_scan(&self, outcome: &ScanOutcome) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO scan_outcomes (
                tier, started_at, duration_ms, symbols_scanned, signals_found, errors
            ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&outcome.tier)
        .bind(ts(outcome.started_at))
        .bind(outcome.duration_ms as i64)
        .bind(outcome.symbols_scanned as i64)
        .bind(outcome.signals_found as i64)
        .bind(outcome.errors as i64)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(())
    }
}
