use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use trading_core::{Exchange, PeriodicTask, ScanOutcome, TradingStore};

use crate::config::TierConfig;
use crate::metrics::TierMetrics;
use crate::scorers::{LayerScores, ScorerSet};
use crate::signal_generator::{AccountState, SignalGenerator};

enum SymbolResult {
    Signal,
    NoSignal,
    Failed,
    Abandoned,
}

/// Scans one tier's symbols: ticker, layer scores, then the generator.
/// Committed margin is carried through the pass so signals from the same
/// pass share one exposure budget.
pub struct TierScanner {
    tier: TierConfig,
    exchange: Arc<dyn Exchange>,
    scorers: ScorerSet,
    generator: Arc<SignalGenerator>,
    concurrency: usize,
}

impl TierScanner {
    pub fn new(
        tier: TierConfig,
        exchange: Arc<dyn Exchange>,
        scorers: ScorerSet,
        generator: Arc<SignalGenerator>,
        concurrency: usize,
    ) -> Self {
        Self {
            tier,
            exchange,
            scorers,
            generator,
            concurrency: concurrency.max(1),
        }
    }

    pub fn tier(&self) -> &TierConfig {
        &self.tier
    }

    /// Balance and committed margin. Margin per position is notional over
    /// the leverage it runs at.
    pub async fn account_state(&self) -> Result<AccountState> {
        let wallet = self.exchange.get_wallet_balance().await?;
        let positions = self.exchange.get_positions(None).await?;
        let current_exposure_usd = positions
            .iter()
            .map(|p| p.notional() / p.leverage.max(1.0))
            .sum();
        Ok(AccountState {
            balance: wallet.total_equity,
            current_exposure_usd,
            max_leverage: None,
        })
    }

    /// Ticker price and layer scores for one symbol. Fails once `cancel`
    /// has fired so nothing scored after a stop reaches the generator.
    async fn observe(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<(f64, LayerScores)> {
        let ticker = self.exchange.get_ticker(symbol).await?;
        let scores = self.scorers.score_all(symbol).await;

        if cancel.is_cancelled() {
            return Err(anyhow!("{} tier stopped", self.tier.name));
        }
        Ok((ticker.last_price, scores))
    }

    /// Observe a batch concurrently, then generate one symbol at a time so
    /// each signal's margin counts against the headroom of the next.
    async fn scan_batch(
        &self,
        batch: &[String],
        account: &mut AccountState,
        cancel: &CancellationToken,
    ) -> Vec<SymbolResult> {
        let observations = join_all(batch.iter().map(|symbol| async move {
            if cancel.is_cancelled() {
                return None;
            }
            Some(self.observe(symbol, cancel).await)
        }))
        .await;

        let mut results = Vec::with_capacity(batch.len());
        for (symbol, observation) in batch.iter().zip(observations) {
            let generated = match observation {
                None => {
                    results.push(SymbolResult::Abandoned);
                    continue;
                }
                Some(Ok(_)) if cancel.is_cancelled() => {
                    results.push(SymbolResult::Abandoned);
                    continue;
                }
                Some(Ok((price, scores))) => {
                    self.generator
                        .generate(symbol, price, &scores, &self.tier, account, Utc::now())
                        .await
                }
                Some(Err(e)) => Err(e),
            };

            let result = match generated {
                Ok(Some(signal)) => {
                    account.current_exposure_usd += signal.position_size_usd;
                    SymbolResult::Signal
                }
                Ok(None) => SymbolResult::NoSignal,
                Err(_) if cancel.is_cancelled() => SymbolResult::Abandoned,
                Err(e) => {
                    tracing::warn!("{} [{}] scan failed: {:#}", symbol, self.tier.name, e);
                    SymbolResult::Failed
                }
            };
            results.push(result);
        }
        results
    }

    /// One pass over every symbol in the tier. A failing symbol is logged
    /// and counted; it never aborts the pass. Returns None when the tier was
    /// stopped mid-pass, in which case the outcome is discarded.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Option<ScanOutcome> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let mut account = match self.account_state().await {
            Ok(account) => account,
            Err(e) => {
                tracing::warn!(
                    "{} pass skipped, account state unavailable: {:#}",
                    self.tier.name,
                    e
                );
                return Some(ScanOutcome {
                    tier: self.tier.name.clone(),
                    started_at,
                    duration_ms: timer.elapsed().as_millis() as u64,
                    symbols_scanned: 0,
                    signals_found: 0,
                    errors: 1,
                });
            }
        };

        // Bounded parallelism: symbols go out in batches of `concurrency`
        let mut results = Vec::with_capacity(self.tier.symbols.len());
        for batch in self.tier.symbols.chunks(self.concurrency) {
            results.extend(self.scan_batch(batch, &mut account, cancel).await);
        }

        if cancel.is_cancelled() {
            tracing::info!("{} pass interrupted by stop; results discarded", self.tier.name);
            return None;
        }

        let mut outcome = ScanOutcome {
            tier: self.tier.name.clone(),
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
            symbols_scanned: 0,
            signals_found: 0,
            errors: 0,
        };
        for result in &results {
            match result {
                SymbolResult::Signal => {
                    outcome.symbols_scanned += 1;
                    outcome.signals_found += 1;
                }
                SymbolResult::NoSignal => outcome.symbols_scanned += 1,
                SymbolResult::Failed => {
                    outcome.symbols_scanned += 1;
                    outcome.errors += 1;
                }
                SymbolResult::Abandoned => {}
            }
        }

        tracing::info!(
            "{} pass: {} symbols, {} signals, {} errors in {}ms",
            outcome.tier,
            outcome.symbols_scanned,
            outcome.signals_found,
            outcome.errors,
            outcome.duration_ms
        );
        Some(outcome)
    }
}

/// Runs each tier as its own periodic loop
pub struct ScannerScheduler {
    scanners: HashMap<String, Arc<TierScanner>>,
    running: DashMap<String, PeriodicTask>,
    metrics: Arc<DashMap<String, TierMetrics>>,
    store: Arc<dyn TradingStore>,
    token: CancellationToken,
}

impl ScannerScheduler {
    pub fn new(store: Arc<dyn TradingStore>, token: CancellationToken) -> Self {
        Self {
            scanners: HashMap::new(),
            running: DashMap::new(),
            metrics: Arc::new(DashMap::new()),
            store,
            token,
        }
    }

    pub fn add_tier(&mut self, scanner: TierScanner) {
        let name = scanner.tier().name.clone();
        self.metrics.insert(name.clone(), TierMetrics::new(name.clone()));
        self.scanners.insert(name, Arc::new(scanner));
    }

    pub fn tiers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scanners.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start a tier's loop. Returns Ok(false) when it is already running.
    pub fn start_tier(&self, name: &str) -> Result<bool> {
        let scanner = self
            .scanners
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown scanner tier '{}'", name))?;

        match self.running.entry(name.to_string()) {
            Entry::Occupied(entry) if entry.get().is_running() => {
                tracing::debug!("Tier {} already running", name);
                Ok(false)
            }
            Entry::Occupied(mut entry) => {
                entry.insert(self.spawn_tier(scanner));
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(self.spawn_tier(scanner));
                Ok(true)
            }
        }
    }

    pub fn start_all(&self) -> Result<()> {
        for name in self.tiers() {
            self.start_tier(&name)?;
        }
        Ok(())
    }

    /// Stop a tier and wait for its in-flight pass to wind down. Returns
    /// false when the tier was not running.
    pub async fn stop_tier(&self, name: &str) -> bool {
        match self.running.remove(name) {
            Some((_, task)) => {
                let was_running = task.is_running();
                task.shutdown().await;
                tracing::info!("Tier {} stopped", name);
                was_running
            }
            None => false,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running
            .get(name)
            .map(|task| task.is_running())
            .unwrap_or(false)
    }

    pub fn metrics(&self, name: &str) -> Option<TierMetrics> {
        self.metrics.get(name).map(|m| m.clone())
    }

    pub fn log_metrics(&self) {
        for name in self.tiers() {
            if let Some(m) = self.metrics.get(&name) {
                m.log_metrics();
            }
        }
    }

    pub async fn shutdown(&self) {
        for name in self.tiers() {
            self.stop_tier(&name).await;
        }
    }

    fn spawn_tier(&self, scanner: Arc<TierScanner>) -> PeriodicTask {
        let tier = scanner.tier().clone();
        let metrics = self.metrics.clone();
        let store = self.store.clone();

        tracing::info!(
            "Starting tier {}: {} symbols every {:?}, threshold {:.0}",
            tier.name,
            tier.symbols.len(),
            tier.interval,
            tier.threshold
        );

        PeriodicTask::spawn(
            format!("scanner-{}", tier.name),
            tier.interval,
            &self.token,
            move |cancel| {
                let scanner = scanner.clone();
                let metrics = metrics.clone();
                let store = store.clone();
                async move {
                    let name = scanner.tier().name.clone();
                    match scanner.run_pass(&cancel).await {
                        Some(outcome) => {
                            if let Some(mut m) = metrics.get_mut(&name) {
                                m.record_pass(&outcome);
                            }
                            if let Err(e) = store.record_scan(&outcome).await {
                                tracing::debug!("Failed to record {} scan outcome: {}", name, e);
                            }
                        }
                        None => {
                            if let Some(mut m) = metrics.get_mut(&name) {
                                m.record_discarded();
                            }
                        }
                    }
                }
            },
        )
    }
}
