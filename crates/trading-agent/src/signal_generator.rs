use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use kelly_position_sizer::{KellyPositionSizer, SizingRequest, StrategyPerformance};
use trading_core::{
    Alert, AlertKind, AlertSeverity, AlertSink, Direction, Layer, LayerContribution,
    LayerReading, Signal, SignalStatus, TradingStore,
};

use crate::config::TierConfig;
use crate::scorers::LayerScores;

/// Closed trades feeding the Kelly statistics
const PERFORMANCE_LOOKBACK: usize = 50;

/// Loss at the stop, as a percent of margin, before the floor and cap apply
const MARGIN_AT_RISK_PERCENT: f64 = 20.0;
const MIN_STOP_PERCENT: f64 = 0.5;
const MAX_STOP_PERCENT: f64 = 5.0;

/// Take-profit distances as multiples of the stop distance
pub const TAKE_PROFIT_MULTIPLES: [f64; 3] = [1.5, 2.5, 4.0];

/// Account context for one signal
#[derive(Debug, Clone, Copy)]
pub struct AccountState {
    pub balance: f64,
    /// Margin committed to open positions, USD
    pub current_exposure_usd: f64,
    /// Exchange leverage ceiling for the symbol, when known
    pub max_leverage: Option<u32>,
}

/// Fuses layer readings into a sized, priced, persisted signal
pub struct SignalGenerator {
    store: Arc<dyn TradingStore>,
    alerts: Arc<dyn AlertSink>,
    sizer: KellyPositionSizer,
    weights: Vec<(Layer, f64)>,
    ttl: chrono::Duration,
}

impl SignalGenerator {
    pub fn new(
        store: Arc<dyn TradingStore>,
        alerts: Arc<dyn AlertSink>,
        sizer: KellyPositionSizer,
        weights: Vec<(Layer, f64)>,
        ttl: Duration,
    ) -> Result<Self> {
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if (total - 1.0).abs() > 1e-9 {
            bail!("Layer weights must sum to 1.0 (got {})", total);
        }
        for layer in Layer::ALL {
            if !weights.iter().any(|(l, _)| *l == layer) {
                bail!("Missing weight for layer {}", layer);
            }
        }

        Ok(Self {
            store,
            alerts,
            sizer,
            weights,
            ttl: chrono::Duration::from_std(ttl).context("Signal TTL out of range")?,
        })
    }

    /// Σ score × weight over the six layers; a missing reading counts as neutral
    pub fn weighted_confidence(&self, scores: &LayerScores) -> f64 {
        self.weights
            .iter()
            .map(|(layer, weight)| score_of(scores, *layer) * weight)
            .sum()
    }

    /// Win rate and payoff from recent closed trades, or the prior when the
    /// history is short or unreadable
    pub async fn performance(&self) -> StrategyPerformance {
        match self.store.recent_closed_executions(PERFORMANCE_LOOKBACK).await {
            Ok(executions) => {
                let pnls: Vec<f64> = executions.iter().filter_map(|e| e.realized_pnl).collect();
                StrategyPerformance::from_trade_pnls(&pnls)
            }
            Err(e) => {
                tracing::warn!("Could not load trade history, sizing from prior: {}", e);
                StrategyPerformance::prior()
            }
        }
    }

    /// Build and persist a pending signal, or return None when the readings
    /// do not clear the tier's bar or sizing leaves nothing to trade.
    pub async fn generate(
        &self,
        symbol: &str,
        current_price: f64,
        scores: &LayerScores,
        tier: &TierConfig,
        account: &AccountState,
        now: DateTime<Utc>,
    ) -> Result<Option<Signal>> {
        if !(current_price.is_finite() && current_price > 0.0) {
            bail!("No usable price for {}", symbol);
        }

        let confidence = self.weighted_confidence(scores);
        if confidence < tier.threshold {
            tracing::debug!(
                "{} [{}] confidence {:.1} below threshold {:.0}",
                symbol,
                tier.name,
                confidence,
                tier.threshold
            );
            return Ok(None);
        }

        let strength = signal_strength(scores);
        let direction = resolve_direction(scores);

        let performance = self.performance().await;
        let sizing = self.sizer.calculate(
            &performance,
            &SizingRequest {
                account_balance: account.balance,
                confidence: confidence.clamp(0.0, 100.0),
                strength: strength.clamp(0.0, 100.0),
                current_exposure_usd: account.current_exposure_usd,
                account_max_leverage: account.max_leverage,
            },
        )?;
        for warning in &sizing.warnings {
            tracing::debug!("{} sizing: {}", symbol, warning);
        }
        if !sizing.is_tradeable() {
            tracing::info!(
                "{} [{}] qualified at {:.1} but sizing returned nothing ({})",
                symbol,
                tier.name,
                confidence,
                sizing.reasoning
            );
            return Ok(None);
        }

        let levels = PriceLevels::compute(current_price, direction, sizing.leverage);

        let mut signal = Signal {
            id: None,
            symbol: symbol.to_string(),
            direction,
            confidence,
            strength,
            entry_price: current_price,
            stop_loss: levels.stop_loss,
            take_profits: levels.take_profits,
            risk_reward: levels.risk_reward,
            position_size_usd: sizing.size_usd,
            leverage: sizing.leverage,
            layers: self.contributions(scores),
            tier: tier.name.clone(),
            created_at: now,
            expires_at: now + self.ttl,
            status: SignalStatus::Pending,
            status_reason: None,
        };

        let id = self.store.insert_signal(&signal).await?;
        signal.id = Some(id);

        tracing::info!(
            "Signal #{} {} {} [{}]: confidence {:.1}, strength {:.1}, ${:.2} @ {}x, SL {:.4}",
            id,
            direction,
            symbol,
            tier.name,
            confidence,
            strength,
            signal.position_size_usd,
            signal.leverage,
            signal.stop_loss
        );

        self.alerts
            .emit(Alert::new(
                AlertKind::SignalCreated,
                AlertSeverity::Info,
                format!("New {} signal: {}", direction, symbol),
                format!(
                    "Confidence {:.1} | Strength {:.1} | Entry {:.4} | SL {:.4} | TP {:.4}/{:.4}/{:.4} | ${:.2} @ {}x ({})",
                    confidence,
                    strength,
                    current_price,
                    signal.stop_loss,
                    signal.take_profits[0],
                    signal.take_profits[1],
                    signal.take_profits[2],
                    signal.position_size_usd,
                    signal.leverage,
                    tier.name
                ),
            ))
            .await;

        Ok(Some(signal))
    }

    fn contributions(&self, scores: &LayerScores) -> Vec<LayerContribution> {
        self.weights
            .iter()
            .map(|(layer, weight)| {
                let reading = scores.get(layer);
                LayerContribution {
                    layer: *layer,
                    score: score_of(scores, *layer),
                    weight: *weight,
                    reason: reading.map(|r| r.reason.clone()).unwrap_or_default(),
                    lean: reading.and_then(|r| r.lean),
                    degraded: reading.map(|r| r.degraded).unwrap_or(true),
                }
            })
            .collect()
    }
}

fn score_of(scores: &LayerScores, layer: Layer) -> f64 {
    scores
        .get(&layer)
        .map(|r| r.score)
        .unwrap_or(LayerReading::NEUTRAL)
}

/// Mean of the three highest layer scores
pub fn signal_strength(scores: &LayerScores) -> f64 {
    let mut values: Vec<f64> = scores.values().map(|r| r.score).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let top = &values[..values.len().min(3)];
    top.iter().sum::<f64>() / top.len() as f64
}

/// Weight of each layer in the direction vote; a negative weight votes
/// against the layer's own lean. Liquidations lean toward the side being
/// flushed, which is the side to avoid.
fn vote_weight(layer: Layer) -> f64 {
    match layer {
        Layer::Technical => 3.0,
        Layer::Ml => 3.0,
        Layer::OrderFlow => 2.0,
        Layer::Liquidation => -1.5,
        Layer::Sentiment => 1.0,
        Layer::Timing => 0.5,
    }
}

/// Σ vote weight × lean × conviction over the layers that lean at all.
/// Ties, including no lean anywhere, go long.
pub fn resolve_direction(scores: &LayerScores) -> Direction {
    let vote: f64 = scores
        .iter()
        .filter_map(|(layer, reading)| {
            reading
                .lean
                .map(|lean| vote_weight(*layer) * lean.sign() * reading.score)
        })
        .sum();
    if vote < 0.0 {
        Direction::Short
    } else {
        Direction::Long
    }
}

/// Stop distance in percent of entry: tighter as leverage rises so the loss
/// at the stop stays a bounded share of margin
pub fn stop_percent(leverage: u32) -> f64 {
    (MARGIN_AT_RISK_PERCENT / leverage.max(1) as f64).clamp(MIN_STOP_PERCENT, MAX_STOP_PERCENT)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevels {
    pub stop_loss: f64,
    pub take_profits: [f64; 3],
    /// Reward at the middle take-profit over risk at the stop
    pub risk_reward: f64,
}

impl PriceLevels {
    pub fn compute(entry: f64, direction: Direction, leverage: u32) -> Self {
        let distance = entry * stop_percent(leverage) / 100.0;
        let sign = direction.sign();
        let take_profits = TAKE_PROFIT_MULTIPLES.map(|m| entry + sign * distance * m);
        Self {
            stop_loss: entry - sign * distance,
            take_profits,
            risk_reward: TAKE_PROFIT_MULTIPLES[1],
        }
    }
}
