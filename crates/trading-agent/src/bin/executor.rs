use std::sync::Arc;

use anyhow::{bail, Result};
use exchange_client::{BybitClient, ExchangeConfig};
use tokio_util::sync::CancellationToken;
use trading_agent::telemetry::{self, StopReason, HEARTBEAT_INTERVAL};
use trading_agent::trade_executor::ExecutorSettings;
use trading_agent::{
    open_store, AgentConfig, AlertDispatcher, MarketFilter, PositionManager, RiskLimits,
    RiskManager, TradeExecutor,
};
use trading_core::{Alert, AlertKind, AlertSeverity, AlertSink, Exchange};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    tracing::info!("Starting trade executor");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    let exchange_config = ExchangeConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Poll: executor {:?}, positions {:?}", config.executor_poll, config.position_poll);
    tracing::info!("  Leverage ladder: {:?}", config.leverage_ladder);
    tracing::info!(
        "  Trailing stop: {}% behind, armed at +{}%",
        config.trailing_distance_percent,
        config.trailing_activation_percent
    );

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

    // 3. Exchange, testnet by default; mainnet requires LIVE_TRADING_APPROVED=yes
    let client = Arc::new(BybitClient::new(&exchange_config)?);
    if !client.is_testnet() {
        let approved = std::env::var("LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            bail!(
                "EXCHANGE_BASE_URL points to mainnet ({}). Set LIVE_TRADING_APPROVED=yes to enable, \
                 or use the testnet endpoint.",
                client.base_url()
            );
        }
        tracing::warn!("LIVE TRADING MODE - REAL MONEY AT RISK ({})", client.base_url());
    } else {
        tracing::info!("Testnet mode ({})", client.base_url());
    }
    let exchange: Arc<dyn Exchange> = client.clone();

    // 4. Store, alerts, risk gate
    let store = open_store(&config).await?;
    let alerts: Arc<dyn AlertSink> = Arc::new(AlertDispatcher::from_config(store.clone(), &config)?);
    let risk = Arc::new(RiskManager::new(
        store.clone(),
        exchange.clone(),
        alerts.clone(),
        RiskLimits::from_env()?,
    ));

    // 5. Executor and position manager
    let executor = Arc::new(TradeExecutor::new(
        exchange.clone(),
        store.clone(),
        risk,
        MarketFilter::new(exchange.clone(), config.market_filter_enabled),
        alerts.clone(),
        ExecutorSettings::from(&config),
    ));
    let positions = Arc::new(PositionManager::new(
        exchange.clone(),
        store.clone(),
        alerts.clone(),
        config.trailing_activation_percent,
        config.trailing_distance_percent,
    ));
    if let Err(e) = positions.rehydrate().await {
        tracing::warn!("Failed to rehydrate open positions: {:#}", e);
    }

    // 6. Startup check (warn-only; the loops retry every tick)
    match exchange.get_wallet_balance().await {
        Ok(wallet) => tracing::info!(
            "Startup check: exchange OK (equity ${:.2}, available ${:.2})",
            wallet.total_equity,
            wallet.available_balance
        ),
        Err(e) => tracing::warn!("Startup check: wallet balance unavailable ({})", e),
    }

    let executor_task = executor.clone().spawn(config.executor_poll, &shutdown);
    let position_task = positions.clone().spawn(config.position_poll, &shutdown);
    tracing::info!("Trade executor running. Press Ctrl+C to stop.");

    let reason = telemetry::wait_for_stop(exchange.as_ref(), &shutdown).await;

    // Drain the in-flight ticks before exiting or idling
    executor_task.shutdown().await;
    position_task.shutdown().await;

    if reason == StopReason::CredentialsDegraded {
        alerts
            .emit(Alert::new(
                AlertKind::CredentialsDegraded,
                AlertSeverity::Critical,
                "Executor halted",
                format!(
                    "{} authentication failures; order placement suspended until restart",
                    client.auth_tracker().recent_failures()
                ),
            ))
            .await;
        telemetry::idle_heartbeat("exchange credentials rejected", HEARTBEAT_INTERVAL, &shutdown)
            .await;
    }

    tracing::info!("Trade executor stopped");
    Ok(())
}
