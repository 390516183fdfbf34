use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use trading_core::{
    Alert, AlertKind, AlertSeverity, AlertSink, Direction, Exchange, ExchangePosition, Excursion,
    Execution, ExecutionClose, ExecutionStatus, OrderType, PeriodicTask, StoreError, TradingStore,
    TradingStopRequest,
};

type PositionKey = (String, Direction);

/// In-memory view of one open position. Not persisted; rebuilt from the
/// execution record's entry price after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionState {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub execution_id: Option<i64>,
    pub opened_at: DateTime<Utc>,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub last_price: f64,
    pub trailing_active: bool,
    pub trailing_stop: Option<f64>,
    /// Last stop the exchange accepted
    pub pushed_stop: Option<f64>,
    pub excursion: Excursion,
}

impl PositionState {
    pub fn new(symbol: impl Into<String>, direction: Direction, entry_price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            entry_price,
            quantity: 0.0,
            execution_id: None,
            opened_at: Utc::now(),
            highest_price: entry_price,
            lowest_price: entry_price,
            last_price: entry_price,
            trailing_active: false,
            trailing_stop: None,
            pushed_stop: None,
            excursion: Excursion::default(),
        }
    }

    fn from_execution(execution: &Execution) -> Self {
        Self {
            quantity: execution.quantity,
            execution_id: execution.id,
            opened_at: execution.opened_at,
            ..Self::new(execution.symbol.clone(), execution.direction, execution.entry_price)
        }
    }

    /// Move in the position's favour, percent of entry
    pub fn move_percent(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.direction.sign() * (price - self.entry_price) / self.entry_price * 100.0
    }

    /// Record a price. Updates the extremes and MFE/MAE, arms the trailing
    /// stop once the move reaches `activation_percent`, and ratchets it
    /// `distance_percent` behind the best price. The stop only ever moves in
    /// the position's favour. Returns the new stop when it changed.
    pub fn observe(
        &mut self,
        price: f64,
        activation_percent: f64,
        distance_percent: f64,
    ) -> Option<f64> {
        if !(price.is_finite() && price > 0.0) {
            return None;
        }

        self.last_price = price;
        self.highest_price = self.highest_price.max(price);
        self.lowest_price = self.lowest_price.min(price);

        let moved = self.move_percent(price);
        if moved > self.excursion.mfe_percent {
            self.excursion.mfe_percent = moved;
            self.excursion.mfe_price = Some(price);
        }
        if moved < self.excursion.mae_percent {
            self.excursion.mae_percent = moved;
            self.excursion.mae_price = Some(price);
        }

        if !self.trailing_active && moved >= activation_percent {
            self.trailing_active = true;
            tracing::info!(
                "{} {} trailing stop armed at +{:.2}%",
                self.direction,
                self.symbol,
                moved
            );
        }
        if !self.trailing_active {
            return None;
        }

        let candidate = match self.direction {
            Direction::Long => self.highest_price * (1.0 - distance_percent / 100.0),
            Direction::Short => self.lowest_price * (1.0 + distance_percent / 100.0),
        };
        let next = match (self.direction, self.trailing_stop) {
            (_, None) => candidate,
            (Direction::Long, Some(current)) => current.max(candidate),
            (Direction::Short, Some(current)) => current.min(candidate),
        };

        if self.trailing_stop != Some(next) {
            self.trailing_stop = Some(next);
            Some(next)
        } else {
            None
        }
    }
}

/// What one poll did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSummary {
    pub tracked: usize,
    pub stops_moved: usize,
    pub closed: usize,
}

/// Follows open positions: excursions, trailing stops, and finalization
/// once a position disappears from the exchange.
pub struct PositionManager {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn TradingStore>,
    alerts: Arc<dyn AlertSink>,
    states: DashMap<PositionKey, PositionState>,
    activation_percent: f64,
    distance_percent: f64,
}

impl PositionManager {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn TradingStore>,
        alerts: Arc<dyn AlertSink>,
        activation_percent: f64,
        distance_percent: f64,
    ) -> Self {
        Self {
            exchange,
            store,
            alerts,
            states: DashMap::new(),
            activation_percent,
            distance_percent,
        }
    }

    pub fn state(&self, symbol: &str, direction: Direction) -> Option<PositionState> {
        self.states
            .get(&(symbol.to_string(), direction))
            .map(|s| s.clone())
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Seed runtime state from the open execution records, at entry price.
    /// Anything that closed while the process was down is finalized on the
    /// next poll.
    pub async fn rehydrate(&self) -> Result<usize> {
        let executions = self.store.open_executions().await?;
        for execution in &executions {
            self.states
                .entry((execution.symbol.clone(), execution.direction))
                .or_insert_with(|| PositionState::from_execution(execution));
        }
        if !executions.is_empty() {
            tracing::info!("Rehydrated {} open positions", executions.len());
        }
        Ok(executions.len())
    }

    pub async fn poll(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        let positions = self.exchange.get_positions(None).await?;
        let mut summary = PollSummary::default();
        let mut seen: HashSet<PositionKey> = HashSet::new();

        for position in &positions {
            let key = (position.symbol.clone(), position.direction());
            seen.insert(key.clone());

            if let Err(e) = self.track(key, position, now, &mut summary).await {
                tracing::warn!("{} position update failed: {:#}", position.symbol, e);
            }
        }

        let gone: Vec<PositionKey> = self
            .states
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !seen.contains(key))
            .collect();

        // State is dropped only once the close is written, so a failed
        // finalize is retried on the next poll
        for key in gone {
            let Some(state) = self.states.get(&key).map(|s| s.clone()) else {
                continue;
            };
            match self.finalize(&state, now).await {
                Ok(()) => {
                    self.states.remove(&key);
                    summary.closed += 1;
                }
                Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_))) => {
                    tracing::warn!(
                        "{} {} closed but its record is gone: {:#}",
                        state.direction,
                        state.symbol,
                        e
                    );
                    self.states.remove(&key);
                }
                Err(e) => tracing::warn!(
                    "Failed to finalize {} {}, will retry: {:#}",
                    state.direction,
                    state.symbol,
                    e
                ),
            }
        }

        summary.tracked = self.states.len();
        Ok(summary)
    }

    async fn track(
        &self,
        key: PositionKey,
        position: &ExchangePosition,
        now: DateTime<Utc>,
        summary: &mut PollSummary,
    ) -> Result<()> {
        if !self.states.contains_key(&key) {
            let state = match self
                .store
                .open_execution_for(&position.symbol, position.direction())
                .await?
            {
                Some(execution) => PositionState::from_execution(&execution),
                None => self.adopt(position, now).await,
            };
            self.states.entry(key.clone()).or_insert(state);
        }

        let price = if position.mark_price > 0.0 {
            position.mark_price
        } else {
            self.exchange.get_ticker(&position.symbol).await?.last_price
        };

        // Work on a copy so no map guard is held across the awaits below
        let mut state = match self.states.get(&key) {
            Some(s) => s.clone(),
            None => return Ok(()),
        };
        state.quantity = position.size;
        state.observe(price, self.activation_percent, self.distance_percent);

        if state.trailing_stop.is_some() && state.trailing_stop != state.pushed_stop {
            let request = TradingStopRequest {
                symbol: position.symbol.clone(),
                position_idx: position.position_idx,
                stop_loss: state.trailing_stop,
                ..TradingStopRequest::default()
            };
            match self.exchange.set_trading_stop(&request).await {
                Ok(()) => {
                    tracing::info!(
                        "{} {} stop moved to {:.4}",
                        state.direction,
                        state.symbol,
                        state.trailing_stop.unwrap_or_default()
                    );
                    state.pushed_stop = state.trailing_stop;
                    summary.stops_moved += 1;
                }
                Err(e) => tracing::warn!("{} stop update failed, will retry: {}", state.symbol, e),
            }
        }

        if let Some(id) = state.execution_id {
            self.store
                .update_excursion(id, &state.excursion, position.unrealized_pnl, state.pushed_stop)
                .await?;
        }

        self.states.insert(key, state);
        Ok(())
    }

    /// Start tracking a position that has no execution record, writing one
    /// from the exchange's view of it. Falls back to untracked state when
    /// the store refuses.
    async fn adopt(&self, position: &ExchangePosition, now: DateTime<Utc>) -> PositionState {
        let direction = position.direction();
        let leverage = position.leverage.max(1.0);
        let notional = position.size * position.entry_price;
        let mut execution = Execution {
            id: None,
            signal_id: None,
            symbol: position.symbol.clone(),
            side: direction.entry_side(),
            direction,
            order_type: OrderType::Market,
            order_id: None,
            requested_leverage: leverage.round() as u32,
            actual_leverage: leverage.round() as u32,
            quantity: position.size,
            notional_usd: notional,
            margin_used: notional / leverage,
            entry_price: position.entry_price,
            exit_price: None,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            realized_pnl: None,
            unrealized_pnl: position.unrealized_pnl,
            funding_fees: 0.0,
            trading_fees: 0.0,
            status: ExecutionStatus::Open,
            opened_at: now,
            closed_at: None,
            excursion: Excursion::default(),
            close_reason: None,
        };

        match self.store.insert_execution(&execution).await {
            Ok(id) => {
                execution.id = Some(id);
                tracing::warn!(
                    "Adopted {} {} with no execution record as #{}",
                    direction,
                    position.symbol,
                    id
                );
                PositionState::from_execution(&execution)
            }
            Err(e) => {
                tracing::error!(
                    "Tracking {} {} unrecorded, adoption failed: {}",
                    direction,
                    position.symbol,
                    e
                );
                PositionState {
                    opened_at: now,
                    ..PositionState::new(position.symbol.clone(), direction, position.entry_price)
                }
            }
        }
    }

    /// Write the final numbers for a position that is no longer open. Exit
    /// price and P&L come from the exchange's closed-PnL records, or from the
    /// last observed price when those are unavailable.
    async fn finalize(&self, state: &PositionState, now: DateTime<Utc>) -> Result<()> {
        let Some(id) = state.execution_id else {
            tracing::info!("{} {} closed (untracked)", state.direction, state.symbol);
            return Ok(());
        };

        let record = match self.exchange.get_closed_pnl(Some(&state.symbol), 20).await {
            Ok(records) => records
                .into_iter()
                .find(|r| r.direction == state.direction && r.created_at >= state.opened_at),
            Err(e) => {
                tracing::warn!("Closed P&L unavailable for {}: {}", state.symbol, e);
                None
            }
        };

        let (exit_price, realized_pnl, source) = match record {
            Some(r) => (r.avg_exit_price, r.closed_pnl, "exchange"),
            None => {
                let pnl = state.direction.sign()
                    * (state.last_price - state.entry_price)
                    * state.quantity;
                (state.last_price, pnl, "last price")
            }
        };

        let close_reason = if state.trailing_active {
            format!("Closed with trailing stop armed ({})", source)
        } else {
            format!("Closed on exchange ({})", source)
        };

        self.store
            .close_execution(
                id,
                &ExecutionClose {
                    status: ExecutionStatus::Closed,
                    exit_price,
                    realized_pnl,
                    trading_fees: 0.0,
                    closed_at: now,
                    excursion: state.excursion,
                    close_reason: close_reason.clone(),
                },
            )
            .await?;

        tracing::info!(
            "{} {} closed @ {:.4}, P&L ${:.2}, MFE {:.2}% MAE {:.2}%",
            state.direction,
            state.symbol,
            exit_price,
            realized_pnl,
            state.excursion.mfe_percent,
            state.excursion.mae_percent
        );

        self.alerts
            .emit(Alert::new(
                AlertKind::PositionClosed,
                AlertSeverity::Info,
                format!("Closed {} {}", state.direction, state.symbol),
                format!(
                    "Exit {:.4} | P&L ${:.2} | MFE {:.2}% | MAE {:.2}% | {}",
                    exit_price,
                    realized_pnl,
                    state.excursion.mfe_percent,
                    state.excursion.mae_percent,
                    close_reason
                ),
            ))
            .await;

        Ok(())
    }

    /// Run `poll` every `period` until the parent token is cancelled
    pub fn spawn(self: Arc<Self>, period: Duration, parent: &CancellationToken) -> PeriodicTask {
        PeriodicTask::spawn("position-manager", period, parent, move |_| {
            let manager = self.clone();
            async move {
                match manager.poll(Utc::now()).await {
                    Ok(summary) => tracing::debug!(
                        "Positions: {} tracked, {} stops moved, {} closed",
                        summary.tracked,
                        summary.stops_moved,
                        summary.closed
                    ),
                    Err(e) => tracing::warn!("Position poll failed: {:#}", e),
                }
            }
        })
    }
}
