use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use exchange_client::{BybitClient, ExchangeConfig, LiquidationStream, LiquidationTracker};
use tokio_util::sync::CancellationToken;
use trading_agent::market_scanner::TierScanner;
use trading_agent::telemetry::{self, StopReason, HEARTBEAT_INTERVAL};
use trading_agent::{
    open_store, AgentConfig, AlertDispatcher, ScannerScheduler, ScorerSet, SignalGenerator,
};
use trading_core::{AlertSink, Exchange, PeriodicTask};

/// Window the liquidation layer looks back over
const LIQUIDATION_WINDOW: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    tracing::info!("Starting market scanner");

    let config = AgentConfig::from_env()?;
    let exchange_config = ExchangeConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    for tier in &config.tiers {
        tracing::info!(
            "  Tier {}: {} symbols every {:?}, threshold {:.0}",
            tier.name,
            tier.symbols.len(),
            tier.interval,
            tier.threshold
        );
    }

    let shutdown = CancellationToken::new();
    telemetry::cancel_on_shutdown(shutdown.clone())?;

    // Sizing needs the wallet, so the scanner needs credentials too
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

    // Optional liquidation feed over every tier's symbols
    let mut stream_handle = None;
    let liquidations = if config.liquidation_stream {
        let tracker = Arc::new(LiquidationTracker::new(LIQUIDATION_WINDOW));
        let mut symbols: Vec<String> = config
            .tiers
            .iter()
            .flat_map(|t| t.symbols.iter().cloned())
            .collect();
        symbols.sort();
        symbols.dedup();
        let stream = LiquidationStream::new(exchange_config.ws_url.clone(), symbols, tracker.clone());
        let token = shutdown.child_token();
        stream_handle = Some(tokio::spawn(async move { stream.run(token).await }));
        Some(tracker)
    } else {
        None
    };

    let scorers = ScorerSet::from_config(config.scorer_url.as_deref(), client.breakers(), liquidations)?;
    tracing::info!("{} layer scorers configured", scorers.len());

    let generator = Arc::new(SignalGenerator::new(
        store.clone(),
        alerts.clone(),
        config.sizer()?,
        config.layer_weights.clone(),
        config.signal_ttl,
    )?);

    let mut scheduler = ScannerScheduler::new(store.clone(), shutdown.clone());
    for tier in &config.tiers {
        scheduler.add_tier(TierScanner::new(
            tier.clone(),
            exchange.clone(),
            scorers.clone(),
            generator.clone(),
            config.scan_concurrency,
        ));
    }
    let scheduler = Arc::new(scheduler);
    scheduler.start_all()?;

    let metrics_scheduler = scheduler.clone();
    let metrics_task = PeriodicTask::spawn(
        "scanner-metrics",
        config.metrics_log_interval,
        &shutdown,
        move |_| {
            let scheduler = metrics_scheduler.clone();
            async move { scheduler.log_metrics() }
        },
    );

    tracing::info!("Scanner running {} tiers. Press Ctrl+C to stop.", scheduler.tiers().len());

    let reason = telemetry::wait_for_stop(exchange.as_ref(), &shutdown).await;

    scheduler.shutdown().await;
    metrics_task.shutdown().await;
    scheduler.log_metrics();

    if reason == StopReason::CredentialsDegraded {
        telemetry::idle_heartbeat("exchange credentials rejected", HEARTBEAT_INTERVAL, &shutdown)
            .await;
    }

    if let Some(handle) = stream_handle {
        shutdown.cancel();
        handle.await.ok();
    }

    tracing::info!("Market scanner stopped");
    Ok(())
}
