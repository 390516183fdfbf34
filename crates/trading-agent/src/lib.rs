//! Signal-to-execution pipeline: tier scanners feed the signal generator,
//! the executor claims and places pending signals, the position manager
//! follows open trades, and alerts fan out through the dispatcher.

pub mod config;
pub mod discord_notifier;
pub mod market_filter;
pub mod market_scanner;
pub mod metrics;
pub mod position_manager;
pub mod scorers;
pub mod signal_generator;
pub mod telemetry;
pub mod trade_executor;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use trading_core::{MemoryStore, TradingStore};
use trading_store::SqlStore;

pub use config::{AgentConfig, TierConfig};
pub use discord_notifier::AlertDispatcher;
pub use market_filter::MarketFilter;
pub use market_scanner::{ScannerScheduler, TierScanner};
pub use metrics::TierMetrics;
pub use position_manager::PositionManager;
pub use risk_manager::{RiskLimits, RiskManager};
pub use scorers::ScorerSet;
pub use signal_generator::SignalGenerator;
pub use trade_executor::TradeExecutor;

/// Open the configured store, or fall back to an in-process one when no
/// `DATABASE_URL` is set. State in the fallback does not survive a restart
/// and is not shared with the other processes.
pub async fn open_store(config: &AgentConfig) -> anyhow::Result<Arc<dyn TradingStore>> {
    match &config.database_url {
        Some(url) => {
            let store = SqlStore::connect(url).await?;
            tracing::info!("Connected to trading database");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!(
                "DATABASE_URL not set; using in-memory store (state is process-local and lost on exit)"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
