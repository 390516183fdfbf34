use std::time::Duration;

use anyhow::Result;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use trading_core::Exchange;

/// How often the degraded heartbeat logs
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

const CREDENTIAL_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Why a process stopped its loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    CredentialsDegraded,
}

/// Install the tracing subscriber. `RUST_LOG` picks the filter (default
/// `info`); `RUST_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));
}

/// Cancel `token` on SIGINT or SIGTERM
pub fn cancel_on_shutdown(token: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}

/// Idle until shutdown, logging a warning every `every`. Used once the
/// process can no longer do useful work but must not exit into a
/// supervisor restart loop.
pub async fn idle_heartbeat(reason: &str, every: Duration, shutdown: &CancellationToken) {
    tracing::error!("Entering degraded heartbeat mode: {}", reason);
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                tracing::warn!("Degraded: {} (idle until restart with valid configuration)", reason);
            }
        }
    }
}

/// Block until shutdown is requested or the exchange reports that repeated
/// auth failures have suspended authenticated calls
pub async fn wait_for_stop(exchange: &dyn Exchange, shutdown: &CancellationToken) -> StopReason {
    let mut check = tokio::time::interval(CREDENTIAL_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return StopReason::Shutdown,
            _ = check.tick() => {
                if exchange.credentials_degraded() {
                    return StopReason::CredentialsDegraded;
                }
            }
        }
    }
}
