use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use exchange_client::{BybitClient, ExchangeConfig};
use tokio_util::sync::CancellationToken;
use trading_agent::telemetry::{self, StopReason, HEARTBEAT_INTERVAL};
use trading_agent::trade_executor::ExecutorSettings;
use trading_agent::{
    open_store, AgentConfig, AlertDispatcher, MarketFilter, RiskLimits, RiskManager, TradeExecutor,
};
use trading_core::{Alert, AlertKind, AlertSeverity, AlertSink, Exchange, PositionLiquidator};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    tracing::info!("Starting risk manager");

    let config = AgentConfig::from_env()?;
    let exchange_config = ExchangeConfig::from_env()?;
    let limits = RiskLimits::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Daily loss limit: {}%", limits.daily_loss_limit_percent);
    tracing::info!("  Emergency stop: {}%", limits.emergency_stop_percent);
    tracing::info!("  Max drawdown: {}%", limits.max_drawdown_percent);
    tracing::info!("  Max positions: {}", limits.max_positions);
    tracing::info!("  Emergency pause: {:?}", limits.emergency_pause);

    let shutdown = CancellationToken::new();
    telemetry::cancel_on_shutdown(shutdown.clone())?;

    if !exchange_config.has_credentials() {
        telemetry::idle_heartbeat(
            "EXCHANGE_API_KEY / EXCHANGE_API_SECRET not set",
            HEARTBEAT_INTERVAL,
            &shutdown,
        )
        .await;
        return Ok(());
    }

    let client = Arc::new(BybitClient::new(&exchange_config)?);
    let exchange: Arc<dyn Exchange> = client.clone();
    let store = open_store(&config).await?;
    let alerts: Arc<dyn AlertSink> = Arc::new(AlertDispatcher::from_config(store.clone(), &config)?);

    let risk = Arc::new(RiskManager::new(
        store.clone(),
        exchange.clone(),
        alerts.clone(),
        limits,
    ));

    // The executor here is only used to flatten the book on an emergency stop
    let liquidator: Arc<dyn PositionLiquidator> = Arc::new(TradeExecutor::new(
        exchange.clone(),
        store.clone(),
        risk.clone(),
        MarketFilter::new(exchange.clone(), false),
        alerts.clone(),
        ExecutorSettings::from(&config),
    ));

    // Operator reset: RISK_RESET_EMERGENCY=yes clears an active emergency stop at startup
    let reset_requested = std::env::var("RISK_RESET_EMERGENCY")
        .map(|v| v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false);
    if reset_requested {
        match risk.reset_emergency_stop(Utc::now()).await {
            Ok(metrics) => tracing::warn!(
                "Emergency stop reset by operator (trading enabled: {})",
                metrics.trading_enabled
            ),
            Err(e) => tracing::error!("Emergency stop reset failed: {:#}", e),
        }
    }

    let risk_task = risk.clone().spawn(liquidator, config.risk_poll, &shutdown);
    tracing::info!("Risk manager running every {:?}. Press Ctrl+C to stop.", config.risk_poll);

    let reason = telemetry::wait_for_stop(exchange.as_ref(), &shutdown).await;
    risk_task.shutdown().await;

    if reason == StopReason::CredentialsDegraded {
        alerts
            .emit(Alert::new(
                AlertKind::CredentialsDegraded,
                AlertSeverity::Critical,
                "Risk manager halted",
                format!(
                    "{} authentication failures; risk enforcement suspended until restart",
                    client.auth_tracker().recent_failures()
                ),
            ))
            .await;
        telemetry::idle_heartbeat("exchange credentials rejected", HEARTBEAT_INTERVAL, &shutdown)
            .await;
    }

    tracing::info!("Risk manager stopped");
    Ok(())
}
