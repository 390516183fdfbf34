use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use trading_core::*;

pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn day(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_day(s: &str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("date '{}': {}", s, e)))
}

fn to_u32(v: i64, field: &str) -> StoreResult<u32> {
    u32::try_from(v).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", field, v)))
}

pub(crate) const SIGNAL_COLUMNS: &str = "id, symbol, direction, confidence, strength, entry_price, \
     stop_loss, tp1, tp2, tp3, risk_reward, position_size_usd, leverage, layers, tier, \
     created_at, expires_at, status, status_reason";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SignalRow {
    pub id: i64,
    pub symbol: String,
    pub direction: String,
    pub confidence: f64,
    pub strength: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub tp3: f64,
    pub risk_reward: f64,
    pub position_size_usd: f64,
    pub leverage: i64,
    pub layers: String,
    pub tier: String,
    pub created_at: String,
    pub expires_at: String,
    pub status: String,
    pub status_reason: Option<String>,
}

impl TryFrom<SignalRow> for Signal {
    type Error = StoreError;

    fn try_from(row: SignalRow) -> StoreResult<Self> {
        let layers: Vec<LayerContribution> = serde_json::from_str(&row.layers)
            .map_err(|e| StoreError::Corrupt(format!("signal {} layers: {}", row.id, e)))?;

        Ok(Signal {
            id: Some(row.id),
            direction: row.direction.parse()?,
            confidence: row.confidence,
            strength: row.strength,
            entry_price: row.entry_price,
            stop_loss: row.stop_loss,
            take_profits: [row.tp1, row.tp2, row.tp3],
            risk_reward: row.risk_reward,
            position_size_usd: row.position_size_usd,
            leverage: to_u32(row.leverage, "leverage")?,
            layers,
            created_at: parse_ts(&row.created_at)?,
            expires_at: parse_ts(&row.expires_at)?,
            status: row.status.parse()?,
            status_reason: row.status_reason,
            symbol: row.symbol,
            tier: row.tier,
        })
    }
}

pub(crate) const EXECUTION_COLUMNS: &str = "id, signal_id, symbol, side, direction, order_type, \
     order_id, requested_leverage, actual_leverage, quantity, notional_usd, margin_used, \
     entry_price, exit_price, stop_loss, take_profit, realized_pnl, unrealized_pnl, \
     funding_fees, trading_fees, status, opened_at, closed_at, mfe_percent, mae_percent, \
     mfe_price, mae_price, close_reason";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ExecutionRow {
    pub id: i64,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub side: String,
    pub direction: String,
    pub order_type: String,
    pub order_id: Option<String>,
    pub requested_leverage: i64,
    pub actual_leverage: i64,
    pub quantity: f64,
    pub notional_usd: f64,
    pub margin_used: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub unrealized_pnl: f64,
    pub funding_fees: f64,
    pub trading_fees: f64,
    pub status: String,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub mfe_percent: f64,
    pub mae_percent: f64,
    pub mfe_price: Option<f64>,
    pub mae_price: Option<f64>,
    pub close_reason: Option<String>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> StoreResult<Self> {
        Ok(Execution {
            id: Some(row.id),
            signal_id: row.signal_id,
            side: row.side.parse()?,
            direction: row.direction.parse()?,
            order_type: row.order_type.parse()?,
            order_id: row.order_id,
            requested_leverage: to_u32(row.requested_leverage, "requested_leverage")?,
            actual_leverage: to_u32(row.actual_leverage, "actual_leverage")?,
            quantity: row.quantity,
            notional_usd: row.notional_usd,
            margin_used: row.margin_used,
            entry_price: row.entry_price,
            exit_price: row.exit_price,
            stop_loss: row.stop_loss,
            take_profit: row.take_profit,
            realized_pnl: row.realized_pnl,
            unrealized_pnl: row.unrealized_pnl,
            funding_fees: row.funding_fees,
            trading_fees: row.trading_fees,
            status: row.status.parse()?,
            opened_at: parse_ts(&row.opened_at)?,
            closed_at: parse_opt_ts(row.closed_at)?,
            excursion: Excursion {
                mfe_percent: row.mfe_percent,
                mae_percent: row.mae_percent,
                mfe_price: row.mfe_price,
                mae_price: row.mae_price,
            },
            close_reason: row.close_reason,
            symbol: row.symbol,
        })
    }
}

pub(crate) const RISK_COLUMNS: &str = "date, starting_balance, current_balance, peak_balance, \
     daily_pnl, daily_pnl_percent, trades_count, wins, losses, current_drawdown_percent, \
     max_drawdown_percent, open_positions, total_exposure_usd, max_single_exposure_usd, \
     avg_leverage, max_leverage, daily_loss_limit_percent, max_drawdown_limit_percent, \
     max_positions, max_position_size_percent, emergency_stop_triggered, trading_enabled, \
     paused_until, updated_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RiskMetricsRow {
    pub date: String,
    pub starting_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub daily_pnl: f64,
    pub daily_pnl_percent: f64,
    pub trades_count: i64,
    pub wins: i64,
    pub losses: i64,
    pub current_drawdown_percent: f64,
    pub max_drawdown_percent: f64,
    pub open_positions: i64,
    pub total_exposure_usd: f64,
    pub max_single_exposure_usd: f64,
    pub avg_leverage: f64,
    pub max_leverage: f64,
    pub daily_loss_limit_percent: f64,
    pub max_drawdown_limit_percent: f64,
    pub max_positions: i64,
    pub max_position_size_percent: f64,
    pub emergency_stop_triggered: i64,
    pub trading_enabled: i64,
    pub paused_until: Option<String>,
    pub updated_at: String,
}

impl TryFrom<RiskMetricsRow> for RiskMetrics {
    type Error = StoreError;

    fn try_from(row: RiskMetricsRow) -> StoreResult<Self> {
        Ok(RiskMetrics {
            date: parse_day(&row.date)?,
            starting_balance: row.starting_balance,
            current_balance: row.current_balance,
            peak_balance: row.peak_balance,
            daily_pnl: row.daily_pnl,
            daily_pnl_percent: row.daily_pnl_percent,
            trades_count: to_u32(row.trades_count, "trades_count")?,
            wins: to_u32(row.wins, "wins")?,
            losses: to_u32(row.losses, "losses")?,
            current_drawdown_percent: row.current_drawdown_percent,
            max_drawdown_percent: row.max_drawdown_percent,
            open_positions: to_u32(row.open_positions, "open_positions")?,
            total_exposure_usd: row.total_exposure_usd,
            max_single_exposure_usd: row.max_single_exposure_usd,
            avg_leverage: row.avg_leverage,
            max_leverage: row.max_leverage,
            daily_loss_limit_percent: row.daily_loss_limit_percent,
            max_drawdown_limit_percent: row.max_drawdown_limit_percent,
            max_positions: to_u32(row.max_positions, "max_positions")?,
            max_position_size_percent: row.max_position_size_percent,
            emergency_stop_triggered: row.emergency_stop_triggered != 0,
            trading_enabled: row.trading_enabled != 0,
            paused_until: parse_opt_ts(row.paused_until)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}
