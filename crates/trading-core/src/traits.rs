use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{ExchangeResult, StoreResult};
use crate::types::*;

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// One independent scoring layer.
///
/// Implementations return a score in [0, 100] where 50 is neutral. Errors are
/// absorbed by the caller, which substitutes a neutral reading.
#[async_trait]
pub trait LayerScorer: Send + Sync {
    fn layer(&self) -> Layer;

    async fn score(&self, symbol: &str) -> anyhow::Result<LayerReading>;
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Latest ticker for a linear perpetual
    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;

    /// Candles, oldest first. `interval` uses exchange notation ("60", "D").
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32)
        -> ExchangeResult<Vec<Candle>>;

    async fn get_orderbook(&self, symbol: &str, depth: u32) -> ExchangeResult<OrderBook>;

    /// Lot size and leverage bounds for a symbol
    async fn get_instrument(&self, symbol: &str) -> ExchangeResult<InstrumentInfo>;

    /// Set buy and sell leverage. "Leverage not modified" counts as success.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    async fn place_order(&self, order: &OrderRequest) -> ExchangeResult<OrderAck>;

    /// Open positions with non-zero size. `symbol` of None lists all.
    async fn get_positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ExchangePosition>>;

    async fn get_wallet_balance(&self) -> ExchangeResult<WalletBalance>;

    async fn set_trading_stop(&self, request: &TradingStopRequest) -> ExchangeResult<()>;

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> ExchangeResult<()>;

    /// Realized P&L records, newest first
    async fn get_closed_pnl(&self, symbol: Option<&str>, limit: u32)
        -> ExchangeResult<Vec<ClosedPnl>>;

    /// True once repeated auth failures have suspended authenticated calls
    fn credentials_degraded(&self) -> bool;

    /// Position index used for a direction (hedge mode: 1 long, 2 short)
    fn position_idx(&self, direction: Direction) -> u8;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TradingStore: Send + Sync {
    // Signals

    /// Insert a signal and return its id
    async fn insert_signal(&self, signal: &Signal) -> StoreResult<i64>;

    async fn get_signal(&self, id: i64) -> StoreResult<Option<Signal>>;

    /// Unexpired pending signals, newest first
    async fn pending_signals(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Signal>>;

    /// Atomically move a signal from `from` to `to`. Returns false when the
    /// signal was no longer in `from`, meaning another worker won it.
    async fn transition_signal(
        &self,
        id: i64,
        from: SignalStatus,
        to: SignalStatus,
        reason: Option<&str>,
    ) -> StoreResult<bool>;

    /// Mark every pending signal past its TTL as expired; returns the count
    async fn expire_signals(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Signals in `status` whose TTL ended at or before `expired_by`, oldest first
    async fn signals_expired_in(
        &self,
        status: SignalStatus,
        expired_by: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Signal>>;

    // Executions

    async fn insert_execution(&self, execution: &Execution) -> StoreResult<i64>;

    async fn open_executions(&self) -> StoreResult<Vec<Execution>>;

    /// The execution recorded for a signal, if any
    async fn execution_for_signal(&self, signal_id: i64) -> StoreResult<Option<Execution>>;

    async fn open_execution_for(
        &self,
        symbol: &str,
        direction: Direction,
    ) -> StoreResult<Option<Execution>>;

    async fn update_excursion(
        &self,
        id: i64,
        excursion: &Excursion,
        unrealized_pnl: f64,
        stop_loss: Option<f64>,
    ) -> StoreResult<()>;

    async fn close_execution(&self, id: i64, close: &ExecutionClose) -> StoreResult<()>;

    /// Most recent closed executions, newest first
    async fn recent_closed_executions(&self, limit: usize) -> StoreResult<Vec<Execution>>;

    async fn closed_executions_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Execution>>;

    // Risk

    async fn risk_metrics_for(&self, date: NaiveDate) -> StoreResult<Option<RiskMetrics>>;

    /// Most recent risk record on or before `date`
    async fn latest_risk_metrics(&self, date: NaiveDate) -> StoreResult<Option<RiskMetrics>>;

    async fn upsert_risk_metrics(&self, metrics: &RiskMetrics) -> StoreResult<()>;

    // Alerts and observability

    async fn insert_alert(&self, alert: &Alert) -> StoreResult<i64>;

    async fn record_scan(&self, outcome: &ScanOutcome) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Cross-process seams
// ---------------------------------------------------------------------------

/// Where alerts go once produced
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: Alert);
}

/// Admission gate consulted before every new position
#[async_trait]
pub trait TradeGate: Send + Sync {
    async fn can_trade(&self, proposed_size_percent: f64) -> anyhow::Result<RiskCheck>;
}

/// Flattens the whole book during an emergency stop
#[async_trait]
pub trait PositionLiquidator: Send + Sync {
    /// Close every open position; returns how many closes succeeded
    async fn close_all_positions(&self, reason: &str) -> anyhow::Result<usize>;
}
