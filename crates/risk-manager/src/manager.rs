use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use trading_core::{
    Alert, AlertKind, AlertSeverity, AlertSink, Exchange, PeriodicTask, PositionLiquidator,
    RiskCheck, RiskMetrics, TradeGate, TradingStore,
};

use crate::models::*;

pub struct RiskManager {
    store: Arc<dyn TradingStore>,
    exchange: Arc<dyn Exchange>,
    alerts: Arc<dyn AlertSink>,
    limits: RiskLimits,
}

impl RiskManager {
    pub fn new(
        store: Arc<dyn TradingStore>,
        exchange: Arc<dyn Exchange>,
        alerts: Arc<dyn AlertSink>,
        limits: RiskLimits,
    ) -> Self {
        Self {
            store,
            exchange,
            alerts,
            limits,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Recompute today's metrics from the wallet, open positions and closed
    /// executions. Gate flags come from the stored record for the day, or
    /// from the previous day's record when an emergency stop is carried over.
    /// Nothing is persisted here.
    pub async fn calculate_metrics(&self, now: DateTime<Utc>) -> Result<RiskMetrics> {
        let date = now.date_naive();
        let wallet = self
            .exchange
            .get_wallet_balance()
            .await
            .context("Failed to fetch wallet balance")?;
        let positions = self
            .exchange
            .get_positions(None)
            .await
            .context("Failed to fetch open positions")?;
        let balance = wallet.total_equity;

        let mut metrics = match self.store.risk_metrics_for(date).await? {
            Some(existing) => existing,
            None => self.open_day(date, balance, now).await?,
        };

        metrics.current_balance = balance;
        metrics.daily_pnl = balance - metrics.starting_balance;
        metrics.daily_pnl_percent = percent_of(metrics.daily_pnl, metrics.starting_balance);

        metrics.peak_balance = metrics.peak_balance.max(balance);
        metrics.current_drawdown_percent =
            percent_of(metrics.peak_balance - balance, metrics.peak_balance).max(0.0);
        metrics.max_drawdown_percent = metrics
            .max_drawdown_percent
            .max(metrics.current_drawdown_percent);

        let closed = self.store.closed_executions_since(day_start(date)).await?;
        metrics.trades_count = closed.len() as u32;
        metrics.wins = closed
            .iter()
            .filter(|e| e.realized_pnl.unwrap_or(0.0) > 0.0)
            .count() as u32;
        metrics.losses = closed
            .iter()
            .filter(|e| e.realized_pnl.unwrap_or(0.0) < 0.0)
            .count() as u32;

        metrics.open_positions = positions.len() as u32;
        metrics.total_exposure_usd = positions.iter().map(|p| p.notional()).sum();
        metrics.max_single_exposure_usd = positions
            .iter()
            .map(|p| p.notional())
            .fold(0.0, f64::max);
        metrics.avg_leverage = if positions.is_empty() {
            0.0
        } else {
            positions.iter().map(|p| p.leverage).sum::<f64>() / positions.len() as f64
        };
        metrics.max_leverage = positions.iter().map(|p| p.leverage).fold(0.0, f64::max);

        metrics.daily_loss_limit_percent = self.limits.daily_loss_limit_percent;
        metrics.max_drawdown_limit_percent = self.limits.max_drawdown_percent;
        metrics.max_positions = self.limits.max_positions;
        metrics.max_position_size_percent = self.limits.max_position_size_percent;
        metrics.updated_at = now;

        Ok(metrics)
    }

    async fn open_day(&self, date: NaiveDate, balance: f64, now: DateTime<Utc>) -> Result<RiskMetrics> {
        let mut metrics = RiskMetrics::new_day(date, balance, now);

        if let Some(previous) = self.store.latest_risk_metrics(date).await? {
            if previous.emergency_stop_triggered {
                tracing::warn!(
                    "Carrying emergency stop from {} into {} (paused until {:?})",
                    previous.date,
                    date,
                    previous.paused_until
                );
                metrics.emergency_stop_triggered = true;
                metrics.trading_enabled = false;
                metrics.paused_until = previous.paused_until;
            }
        }

        tracing::info!("Opened risk day {} with balance ${:.2}", date, balance);
        Ok(metrics)
    }

    /// One pass of the risk loop: recompute, react to breached limits,
    /// persist. Returns the stored metrics and whatever changed.
    pub async fn enforce(
        &self,
        liquidator: &dyn PositionLiquidator,
        now: DateTime<Utc>,
    ) -> Result<(RiskMetrics, Vec<RiskAction>)> {
        let mut metrics = self.calculate_metrics(now).await?;
        let mut actions = Vec::new();

        if metrics.emergency_stop_triggered && !metrics.is_paused(now) {
            clear_emergency(&mut metrics);
            actions.push(RiskAction::EmergencyCleared);
            tracing::info!("Emergency pause elapsed; trading re-enabled");
            self.alerts
                .emit(Alert::new(
                    AlertKind::EmergencyCleared,
                    AlertSeverity::Info,
                    "Emergency stop cleared",
                    "Pause window elapsed; trading re-enabled",
                ))
                .await;
        }

        if !metrics.emergency_stop_triggered
            && metrics.daily_pnl_percent <= -self.limits.emergency_stop_percent
        {
            metrics.emergency_stop_triggered = true;
            metrics.trading_enabled = false;
            metrics.paused_until = Some(now + pause_duration(self.limits.emergency_pause));

            // Block admission before flattening so no new entry slips in
            self.store.upsert_risk_metrics(&metrics).await?;

            tracing::error!(
                "EMERGENCY STOP: daily P&L {:.2}% breached -{:.1}%",
                metrics.daily_pnl_percent,
                self.limits.emergency_stop_percent
            );
            let positions_closed = match liquidator.close_all_positions("emergency stop").await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Emergency close-all failed: {:#}", e);
                    0
                }
            };

            actions.push(RiskAction::EmergencyStop {
                daily_pnl_percent: metrics.daily_pnl_percent,
                positions_closed,
            });
            self.alerts
                .emit(
                    Alert::new(
                        AlertKind::EmergencyStop,
                        AlertSeverity::Emergency,
                        "Emergency stop triggered",
                        format!(
                            "Daily P&L {:.2}% (${:.2}). Closed {} positions; trading paused until {}",
                            metrics.daily_pnl_percent,
                            metrics.daily_pnl,
                            positions_closed,
                            metrics
                                .paused_until
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_default()
                        ),
                    )
                    .with_voice("Emergency stop triggered. All positions closed."),
                )
                .await;
        } else if metrics.trading_enabled
            && metrics.daily_pnl_percent <= -self.limits.daily_loss_limit_percent
        {
            metrics.trading_enabled = false;
            actions.push(RiskAction::DailyLossHalt {
                daily_pnl_percent: metrics.daily_pnl_percent,
            });
            tracing::warn!(
                "Daily loss limit hit ({:.2}%); trading disabled for {}",
                metrics.daily_pnl_percent,
                metrics.date
            );
            self.alerts
                .emit(Alert::new(
                    AlertKind::DailyLossLimit,
                    AlertSeverity::Warning,
                    "Daily loss limit reached",
                    format!(
                        "Daily P&L {:.2}% breached -{:.1}%; trading disabled for the day",
                        metrics.daily_pnl_percent, self.limits.daily_loss_limit_percent
                    ),
                ))
                .await;
        }

        if metrics.trading_enabled
            && metrics.current_drawdown_percent >= self.limits.max_drawdown_percent
        {
            metrics.trading_enabled = false;
            actions.push(RiskAction::DrawdownHalt {
                drawdown_percent: metrics.current_drawdown_percent,
            });
            tracing::warn!(
                "Drawdown limit hit ({:.2}%); trading disabled for {}",
                metrics.current_drawdown_percent,
                metrics.date
            );
            self.alerts
                .emit(Alert::new(
                    AlertKind::DrawdownLimit,
                    AlertSeverity::Critical,
                    "Max drawdown reached",
                    format!(
                        "Drawdown {:.2}% from peak ${:.2} breached {:.1}%",
                        metrics.current_drawdown_percent,
                        metrics.peak_balance,
                        self.limits.max_drawdown_percent
                    ),
                ))
                .await;
        }

        self.store.upsert_risk_metrics(&metrics).await?;
        Ok((metrics, actions))
    }

    /// Admission check for a new position of `proposed_size_percent` of
    /// the account balance.
    pub async fn check_trade(
        &self,
        proposed_size_percent: f64,
        now: DateTime<Utc>,
    ) -> Result<RiskCheck> {
        let metrics = self.calculate_metrics(now).await?;
        let limits = &self.limits;

        if metrics.emergency_stop_triggered {
            return Ok(match metrics.paused_until {
                Some(until) if now < until => {
                    RiskCheck::denied(format!("Emergency stop active until {}", until.to_rfc3339()))
                }
                _ => RiskCheck::denied("Emergency stop awaiting recovery"),
            });
        }
        if !metrics.trading_enabled {
            return Ok(RiskCheck::denied(format!(
                "Trading disabled for {}",
                metrics.date
            )));
        }
        if metrics.daily_pnl_percent <= -limits.daily_loss_limit_percent {
            return Ok(RiskCheck::denied(format!(
                "Daily loss {:.2}% at or beyond limit of {:.1}%",
                metrics.daily_pnl_percent, limits.daily_loss_limit_percent
            )));
        }
        if metrics.current_drawdown_percent >= limits.max_drawdown_percent {
            return Ok(RiskCheck::denied(format!(
                "Drawdown {:.2}% at or beyond limit of {:.1}%",
                metrics.current_drawdown_percent, limits.max_drawdown_percent
            )));
        }
        if metrics.open_positions >= limits.max_positions {
            return Ok(RiskCheck::denied(format!(
                "Max concurrent positions reached ({}/{})",
                metrics.open_positions, limits.max_positions
            )));
        }

        let near = |value: f64, limit: f64| limit > 0.0 && value >= limit * limits.warning_ratio;
        let mut warnings = Vec::new();

        if near(proposed_size_percent, limits.max_position_size_percent) {
            warnings.push(format!(
                "Position size {:.2}% near max {:.1}%",
                proposed_size_percent, limits.max_position_size_percent
            ));
        }
        if near(-metrics.daily_pnl_percent, limits.daily_loss_limit_percent) {
            warnings.push(format!(
                "Daily loss {:.2}% approaching limit of {:.1}%",
                metrics.daily_pnl_percent, limits.daily_loss_limit_percent
            ));
        }
        if near(metrics.current_drawdown_percent, limits.max_drawdown_percent) {
            warnings.push(format!(
                "Drawdown {:.2}% approaching limit of {:.1}%",
                metrics.current_drawdown_percent, limits.max_drawdown_percent
            ));
        }
        if near(metrics.open_positions as f64, limits.max_positions as f64) {
            warnings.push(format!(
                "{} of {} position slots in use",
                metrics.open_positions, limits.max_positions
            ));
        }

        Ok(RiskCheck::allowed(warnings))
    }

    /// Operator override: clear the emergency stop now, before its pause
    /// window has run out.
    pub async fn reset_emergency_stop(&self, now: DateTime<Utc>) -> Result<RiskMetrics> {
        let mut metrics = self.calculate_metrics(now).await?;
        if !metrics.emergency_stop_triggered {
            tracing::info!("No emergency stop to reset");
            return Ok(metrics);
        }

        clear_emergency(&mut metrics);
        self.store.upsert_risk_metrics(&metrics).await?;
        tracing::warn!("Emergency stop reset by operator");
        self.alerts
            .emit(Alert::new(
                AlertKind::EmergencyCleared,
                AlertSeverity::Warning,
                "Emergency stop reset",
                "Cleared by operator; trading re-enabled",
            ))
            .await;
        Ok(metrics)
    }

    /// Run `enforce` every `period` until the parent token is cancelled
    pub fn spawn(
        self: Arc<Self>,
        liquidator: Arc<dyn PositionLiquidator>,
        period: Duration,
        parent: &CancellationToken,
    ) -> PeriodicTask {
        PeriodicTask::spawn("risk-manager", period, parent, move |_| {
            let manager = self.clone();
            let liquidator = liquidator.clone();
            async move {
                match manager.enforce(liquidator.as_ref(), Utc::now()).await {
                    Ok((metrics, actions)) => {
                        tracing::debug!(
                            "Risk: balance ${:.2}, daily {:.2}%, drawdown {:.2}%, {} positions, ${:.0} exposure",
                            metrics.current_balance,
                            metrics.daily_pnl_percent,
                            metrics.current_drawdown_percent,
                            metrics.open_positions,
                            metrics.total_exposure_usd
                        );
                        for action in actions {
                            tracing::info!("Risk action: {:?}", action);
                        }
                    }
                    Err(e) => tracing::warn!("Risk check failed: {:#}", e),
                }
            }
        })
    }
}

#[async_trait]
impl TradeGate for RiskManager {
    async fn can_trade(&self, proposed_size_percent: f64) -> Result<RiskCheck> {
        self.check_trade(proposed_size_percent, Utc::now()).await
    }
}

fn clear_emergency(metrics: &mut RiskMetrics) {
    metrics.emergency_stop_triggered = false;
    metrics.trading_enabled = true;
    metrics.paused_until = None;
}

fn percent_of(value: f64, base: f64) -> f64 {
    if base > 0.0 {
        value / base * 100.0
    } else {
        0.0
    }
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    match date.and_hms_opt(0, 0, 0) {
        Some(midnight) => Utc.from_utc_datetime(&midnight),
        None => DateTime::<Utc>::MIN_UTC,
    }
}

fn pause_duration(pause: Duration) -> chrono::Duration {
    chrono::Duration::from_std(pause).unwrap_or_else(|_| chrono::Duration::hours(24))
}
