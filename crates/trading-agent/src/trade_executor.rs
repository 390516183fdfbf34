use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use exchange_client::{round_down_to_step, round_to_tick};
use tokio_util::sync::CancellationToken;
use trading_core::{
    Alert, AlertKind, AlertSeverity, AlertSink, Exchange, ExchangeError, Excursion, Execution,
    ExecutionStatus, InstrumentInfo, OrderRequest, OrderType, PeriodicTask, PositionLiquidator,
    Signal, SignalStatus, TradeGate, TradingStore, TradingStopRequest,
};

use crate::config::AgentConfig;
use crate::market_filter::{FilterVerdict, MarketFilter};

/// Shares of the entry quantity closed at TP1 / TP2 / TP3, in percent
const TAKE_PROFIT_SPLIT: [u64; 3] = [40, 30, 30];

/// Pending signals looked at per tick
const PENDING_BATCH: usize = 20;

/// Store writes made after an order is live are tried this many times
const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// An approved signal this far past its TTL has no worker left holding it
const STALE_CLAIM_GRACE_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub leverage_ladder: Vec<u32>,
    pub trailing_distance_percent: f64,
    pub trailing_activation_percent: f64,
    pub partial_take_profits: bool,
}

impl From<&AgentConfig> for ExecutorSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            leverage_ladder: config.leverage_ladder.clone(),
            trailing_distance_percent: config.trailing_distance_percent,
            trailing_activation_percent: config.trailing_activation_percent,
            partial_take_profits: config.partial_take_profits,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// `execution_id` is None when the position opened but its record
    /// could not be saved
    Executed { execution_id: Option<i64>, leverage: u32 },
    Rejected(String),
    /// Another worker claimed the signal first
    Lost,
}

/// What one executor tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub expired: u64,
    pub executed: usize,
    pub rejected: usize,
    pub lost: usize,
    pub errors: usize,
    /// Stale `approved` signals resolved by the sweep
    pub recovered: usize,
}

/// Turns pending signals into exchange positions.
///
/// The `pending -> approved` transition is the claim: it is made before any
/// order goes out, and every claimed signal ends as `executed` or `rejected`.
/// A claim whose final transition could not be written is resolved by the
/// stale-claim sweep at the start of a later tick.
pub struct TradeExecutor {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn TradingStore>,
    gate: Arc<dyn TradeGate>,
    filter: MarketFilter,
    alerts: Arc<dyn AlertSink>,
    settings: ExecutorSettings,
    instruments: DashMap<String, InstrumentInfo>,
}

impl TradeExecutor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn TradingStore>,
        gate: Arc<dyn TradeGate>,
        filter: MarketFilter,
        alerts: Arc<dyn AlertSink>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            exchange,
            store,
            gate,
            filter,
            alerts,
            settings,
            instruments: DashMap::new(),
        }
    }

    /// Expire stale signals and resolve abandoned claims, then work through
    /// the pending ones newest first
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary {
            expired: self.store.expire_signals(now).await?,
            recovered: self.resolve_stale_claims(now).await,
            ..TickSummary::default()
        };
        if summary.expired > 0 {
            tracing::info!("Expired {} stale signals", summary.expired);
        }

        let pending = self.store.pending_signals(now, PENDING_BATCH).await?;
        let mut opened: HashSet<String> = HashSet::new();

        for signal in pending {
            let Some(id) = signal.id else { continue };

            if opened.contains(&signal.symbol) {
                self.reject(id, SignalStatus::Pending, "Position already open").await;
                summary.rejected += 1;
                continue;
            }

            match self.execute_signal(&signal).await {
                Ok(ExecutionOutcome::Executed { .. }) => {
                    opened.insert(signal.symbol.clone());
                    summary.executed += 1;
                }
                Ok(ExecutionOutcome::Rejected(_)) => summary.rejected += 1,
                Ok(ExecutionOutcome::Lost) => summary.lost += 1,
                Err(e) => {
                    tracing::warn!("Signal #{} ({}) left pending: {:#}", id, signal.symbol, e);
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Take one pending signal through the checks, the claim and the entry.
    ///
    /// Errors before the claim leave the signal pending for the next tick;
    /// anything after the claim resolves it one way or the other.
    pub async fn execute_signal(&self, signal: &Signal) -> Result<ExecutionOutcome> {
        let id = signal
            .id
            .ok_or_else(|| anyhow!("Signal for {} has no id", signal.symbol))?;

        let existing = self
            .exchange
            .get_positions(Some(&signal.symbol))
            .await
            .context("Position check failed")?;
        if !existing.is_empty() {
            let reason = format!("Position already open on {}", signal.symbol);
            self.reject(id, SignalStatus::Pending, &reason).await;
            return Ok(ExecutionOutcome::Rejected(reason));
        }

        let wallet = self
            .exchange
            .get_wallet_balance()
            .await
            .context("Wallet balance unavailable")?;
        let size_percent = if wallet.total_equity > 0.0 {
            signal.position_size_usd / wallet.total_equity * 100.0
        } else {
            100.0
        };
        let check = self.gate.can_trade(size_percent).await?;
        if !check.can_trade {
            let reason = format!("Risk gate: {}", check.reason);
            self.reject(id, SignalStatus::Pending, &reason).await;
            return Ok(ExecutionOutcome::Rejected(reason));
        }
        for warning in &check.warnings {
            tracing::warn!("Signal #{} risk warning: {}", id, warning);
        }

        let verdict = self.filter.check(&signal.symbol, signal.direction).await;
        if let FilterVerdict::Against { fast, slow } = verdict {
            let reason = format!(
                "Market filter: EMA20 {:.4} vs EMA50 {:.4} against {}",
                fast, slow, signal.direction
            );
            self.reject(id, SignalStatus::Pending, &reason).await;
            return Ok(ExecutionOutcome::Rejected(reason));
        }

        if !self
            .store
            .transition_signal(id, SignalStatus::Pending, SignalStatus::Approved, None)
            .await?
        {
            tracing::info!("Signal #{} already claimed, skipping", id);
            return Ok(ExecutionOutcome::Lost);
        }

        match self.open_position(signal).await {
            Ok(mut execution) => {
                execution.signal_id = Some(id);
                // The order is live from here on: nothing below may fail the call
                let execution_id = self.record_execution(id, &execution).await;
                self.mark_executed(id).await;

                self.alerts
                    .emit(Alert::new(
                        AlertKind::TradeExecuted,
                        AlertSeverity::Info,
                        format!("Opened {} {}", execution.direction, execution.symbol),
                        format!(
                            "{} @ {:.4} | {}x (requested {}x) | ${:.2} margin | SL {:.4}",
                            execution.quantity,
                            execution.entry_price,
                            execution.actual_leverage,
                            execution.requested_leverage,
                            execution.margin_used,
                            execution.stop_loss.unwrap_or_default()
                        ),
                    ))
                    .await;

                Ok(ExecutionOutcome::Executed {
                    execution_id,
                    leverage: execution.actual_leverage,
                })
            }
            Err(e) => {
                let reason = format!("Execution failed: {:#}", e);
                tracing::warn!("Signal #{} {}", id, reason);
                self.reject(id, SignalStatus::Approved, &reason).await;
                Ok(ExecutionOutcome::Rejected(reason))
            }
        }
    }

    /// Save the execution record, retrying; alerts and returns None when the
    /// store keeps refusing. The position manager adopts the position then.
    async fn record_execution(&self, signal_id: i64, execution: &Execution) -> Option<i64> {
        let mut attempt = 1;
        loop {
            match self.store.insert_execution(execution).await {
                Ok(execution_id) => return Some(execution_id),
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    tracing::warn!(
                        "Signal #{} execution record not saved (attempt {}): {}",
                        signal_id,
                        attempt,
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(RECORD_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Signal #{} filled but the execution record failed to save: {}",
                        signal_id,
                        e
                    );
                    self.alerts
                        .emit(Alert::new(
                            AlertKind::ExecutionUnrecorded,
                            AlertSeverity::Critical,
                            format!("Unrecorded {} {}", execution.direction, execution.symbol),
                            format!(
                                "Signal #{} opened {} @ {:.4} ({}x) but the record was not saved: {}",
                                signal_id,
                                execution.quantity,
                                execution.entry_price,
                                execution.actual_leverage,
                                e
                            ),
                        ))
                        .await;
                    return None;
                }
            }
        }
    }

    /// `approved -> executed`, retrying; a signal left approved is picked up
    /// by the stale-claim sweep
    async fn mark_executed(&self, id: i64) {
        let mut attempt = 1;
        loop {
            match self
                .store
                .transition_signal(id, SignalStatus::Approved, SignalStatus::Executed, None)
                .await
            {
                Ok(true) => return,
                Ok(false) => {
                    tracing::warn!("Signal #{} no longer approved, not marked executed", id);
                    return;
                }
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    tracing::warn!(
                        "Signal #{} not marked executed (attempt {}): {}",
                        id,
                        attempt,
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(RECORD_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!("Signal #{} left approved after fill: {}", id, e);
                    return;
                }
            }
        }
    }

    /// Settle `approved` signals whose TTL ended over a minute ago: executed
    /// when a record or a matching exchange position shows the fill,
    /// rejected otherwise. Returns how many were settled.
    async fn resolve_stale_claims(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::seconds(STALE_CLAIM_GRACE_SECS);
        let stale = match self
            .store
            .signals_expired_in(SignalStatus::Approved, cutoff, PENDING_BATCH)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!("Stale claim sweep skipped: {}", e);
                return 0;
            }
        };

        let mut resolved = 0;
        for signal in stale {
            let Some(id) = signal.id else { continue };
            let (to, reason) = match self.claim_was_filled(id, &signal).await {
                Ok(true) => (SignalStatus::Executed, "Fill found after stale claim"),
                Ok(false) => (SignalStatus::Rejected, "Claim abandoned before any fill"),
                Err(e) => {
                    tracing::warn!("Signal #{} stale claim left for next tick: {:#}", id, e);
                    continue;
                }
            };
            match self
                .store
                .transition_signal(id, SignalStatus::Approved, to, Some(reason))
                .await
            {
                Ok(true) => {
                    tracing::warn!(
                        "Signal #{} ({}) stuck approved, now {}",
                        id,
                        signal.symbol,
                        to
                    );
                    resolved += 1;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Signal #{} stale claim not resolved: {}", id, e),
            }
        }
        resolved
    }

    async fn claim_was_filled(&self, id: i64, signal: &Signal) -> Result<bool> {
        if self.store.execution_for_signal(id).await?.is_some() {
            return Ok(true);
        }
        let positions = self.exchange.get_positions(Some(&signal.symbol)).await?;
        Ok(positions.iter().any(|p| p.direction() == signal.direction))
    }

    async fn reject(&self, id: i64, from: SignalStatus, reason: &str) {
        match self
            .store
            .transition_signal(id, from, SignalStatus::Rejected, Some(reason))
            .await
        {
            Ok(true) => tracing::info!("Signal #{} rejected: {}", id, reason),
            Ok(false) => tracing::debug!("Signal #{} no longer {}, not rejected", id, from),
            Err(e) => tracing::warn!("Failed to reject signal #{}: {}", id, e),
        }
    }

    /// Lot size and leverage bounds, fetched once per symbol
    async fn instrument(&self, symbol: &str) -> Result<InstrumentInfo> {
        if let Some(info) = self.instruments.get(symbol) {
            return Ok(info.clone());
        }
        let info = self.exchange.get_instrument(symbol).await?;
        self.instruments.insert(symbol.to_string(), info.clone());
        Ok(info)
    }

    /// Try the requested leverage, then each ladder rung below it. Only an
    /// exchange rejection moves down a rung; any other failure stops the
    /// negotiation. Returns the leverage accepted, or 0 when none was.
    pub async fn negotiate_leverage(&self, symbol: &str, requested: u32) -> u32 {
        let mut candidates = vec![requested];
        candidates.extend(
            self.settings
                .leverage_ladder
                .iter()
                .copied()
                .filter(|l| *l < requested),
        );
        candidates.dedup();

        for leverage in candidates {
            match self.exchange.set_leverage(symbol, leverage).await {
                Ok(()) => {
                    if leverage != requested {
                        tracing::info!(
                            "{} leverage {}x rejected, using {}x",
                            symbol,
                            requested,
                            leverage
                        );
                    }
                    return leverage;
                }
                Err(ExchangeError::Api { code, msg }) => tracing::debug!(
                    "{} leverage {}x refused ({}): {}",
                    symbol,
                    leverage,
                    code,
                    msg
                ),
                Err(e) => {
                    tracing::warn!(
                        "{} leverage negotiation aborted at {}x: {}",
                        symbol,
                        leverage,
                        e
                    );
                    return 0;
                }
            }
        }

        tracing::warn!("{} refused every leverage from {}x down", symbol, requested);
        0
    }

    async fn open_position(&self, signal: &Signal) -> Result<Execution> {
        let symbol = signal.symbol.as_str();
        let instrument = self.instrument(symbol).await?;

        let leverage = self.negotiate_leverage(symbol, signal.leverage).await;
        if leverage == 0 {
            bail!("No leverage accepted (requested {}x)", signal.leverage);
        }

        let ticker = self.exchange.get_ticker(symbol).await?;
        let price = if ticker.last_price > 0.0 {
            ticker.last_price
        } else {
            signal.entry_price
        };

        let notional_target = signal.position_size_usd * leverage as f64;
        let qty = round_down_to_step(notional_target / price, instrument.qty_step);
        if qty <= 0.0 || qty < instrument.min_order_qty {
            bail!(
                "Quantity {} below minimum order {} for ${:.2} at {}x",
                qty,
                instrument.min_order_qty,
                signal.position_size_usd,
                leverage
            );
        }

        let position_idx = self.exchange.position_idx(signal.direction);
        let stop_loss = round_to_tick(signal.stop_loss, instrument.tick_size);
        let final_target = round_to_tick(signal.take_profits[2], instrument.tick_size);
        let embedded_tp = (!self.settings.partial_take_profits).then_some(final_target);

        let order = OrderRequest::market(symbol, signal.direction.entry_side(), qty, position_idx)
            .with_stops(Some(stop_loss), embedded_tp);

        let ack = match self.exchange.place_order(&order).await {
            Ok(ack) => ack,
            Err(e @ ExchangeError::Network(_)) => {
                tracing::warn!("{} entry order got no response: {}", symbol, e);
                return Err(e.into());
            }
            Err(ExchangeError::Api { code, msg }) => {
                tracing::warn!("{} entry order rejected by exchange ({}): {}", symbol, code, msg);
                bail!("Order rejected ({}): {}", code, msg);
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Opened {} {} qty {} @ ~{:.4}, {}x, order {}",
            signal.direction,
            symbol,
            qty,
            price,
            leverage,
            ack.order_id
        );

        if self.settings.partial_take_profits {
            self.place_take_profit_ladder(signal, &instrument, qty, position_idx)
                .await;
        }

        let trailing_distance = round_to_tick(
            price * self.settings.trailing_distance_percent / 100.0,
            instrument.tick_size,
        );
        let activation = round_to_tick(
            price
                * (1.0
                    + signal.direction.sign() * self.settings.trailing_activation_percent / 100.0),
            instrument.tick_size,
        );
        let stop_request = TradingStopRequest {
            symbol: symbol.to_string(),
            position_idx,
            stop_loss: Some(stop_loss),
            take_profit: embedded_tp,
            trailing_stop: Some(trailing_distance),
            active_price: Some(activation),
        };
        if let Err(e) = self.exchange.set_trading_stop(&stop_request).await {
            tracing::warn!(
                "{} trading stop not set ({}); entry carries its own stop-loss",
                symbol,
                e
            );
        }

        let notional = qty * price;
        Ok(Execution {
            id: None,
            signal_id: signal.id,
            symbol: symbol.to_string(),
            side: signal.direction.entry_side(),
            direction: signal.direction,
            order_type: OrderType::Market,
            order_id: Some(ack.order_id),
            requested_leverage: signal.leverage,
            actual_leverage: leverage,
            quantity: qty,
            notional_usd: notional,
            margin_used: notional / leverage as f64,
            entry_price: price,
            exit_price: None,
            stop_loss: Some(stop_loss),
            take_profit: Some(final_target),
            realized_pnl: None,
            unrealized_pnl: 0.0,
            funding_fees: 0.0,
            trading_fees: 0.0,
            status: ExecutionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            excursion: Excursion::default(),
            close_reason: None,
        })
    }

    /// Reduce-only limits at TP1/TP2/TP3 for 40/30/30% of the entry. Legs
    /// below the minimum order size are skipped; failures are logged only.
    async fn place_take_profit_ladder(
        &self,
        signal: &Signal,
        instrument: &InstrumentInfo,
        qty: f64,
        position_idx: u8,
    ) {
        for (target, leg_qty) in signal
            .take_profits
            .iter()
            .zip(split_quantity(qty, instrument.qty_step))
        {
            if leg_qty <= 0.0 || leg_qty < instrument.min_order_qty {
                tracing::debug!("{} TP leg of {} below minimum, skipped", signal.symbol, leg_qty);
                continue;
            }
            let order = OrderRequest::reduce_only_limit(
                signal.symbol.clone(),
                signal.direction.exit_side(),
                leg_qty,
                round_to_tick(*target, instrument.tick_size),
                position_idx,
            );
            if let Err(e) = self.exchange.place_order(&order).await {
                tracing::warn!("{} take-profit at {:.4} not placed: {}", signal.symbol, target, e);
            }
        }
    }

    /// Run `run_once` every `period` until the parent token is cancelled
    pub fn spawn(self: Arc<Self>, period: Duration, parent: &CancellationToken) -> PeriodicTask {
        PeriodicTask::spawn("executor", period, parent, move |_| {
            let executor = self.clone();
            async move {
                match executor.run_once(Utc::now()).await {
                    Ok(summary) if summary != TickSummary::default() => {
                        tracing::info!(
                            "Executor tick: {} executed, {} rejected, {} lost, {} errors, {} expired, {} recovered",
                            summary.executed,
                            summary.rejected,
                            summary.lost,
                            summary.errors,
                            summary.expired,
                            summary.recovered
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Executor tick failed: {:#}", e),
                }
            }
        })
    }
}

/// Split `qty` into the 40/30/30 ladder in whole lot steps; the last leg
/// takes the rounding remainder
pub fn split_quantity(qty: f64, step: f64) -> [f64; 3] {
    if step <= 0.0 {
        return TAKE_PROFIT_SPLIT.map(|share| qty * share as f64 / 100.0);
    }
    let steps = (qty / step).round() as u64;
    let first = steps * TAKE_PROFIT_SPLIT[0] / 100;
    let second = steps * TAKE_PROFIT_SPLIT[1] / 100;
    let last = steps - first - second;
    [first, second, last].map(|n| round_to_tick(n as f64 * step, step))
}

#[async_trait]
impl PositionLiquidator for TradeExecutor {
    async fn close_all_positions(&self, reason: &str) -> Result<usize> {
        let positions = self.exchange.get_positions(None).await?;
        tracing::warn!("Closing all {} positions: {}", positions.len(), reason);

        let mut closed = 0;
        for position in &positions {
            let order = OrderRequest::market(
                position.symbol.clone(),
                position.direction().exit_side(),
                position.size,
                position.position_idx,
            )
            .reduce_only();

            match self.exchange.place_order(&order).await {
                Ok(_) => {
                    closed += 1;
                    tracing::info!(
                        "Closed {} {} ({})",
                        position.direction(),
                        position.symbol,
                        position.size
                    );
                }
                Err(e) => tracing::error!(
                    "Failed to close {} {}: {}",
                    position.direction(),
                    position.symbol,
                    e
                ),
            }
        }

        if let Err(e) = self.exchange.cancel_all_orders(None).await {
            tracing::error!("Failed to cancel resting orders: {}", e);
        }

        Ok(closed)
    }
}
