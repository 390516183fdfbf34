use std::collections::VecDeque;

use trading_core::ScanOutcome;

/// Passes kept for the rolling duration average
const ROLLING_WINDOW: usize = 20;

/// Running counters for one scanner tier
#[derive(Debug, Clone)]
pub struct TierMetrics {
    pub tier: String,
    pub passes: u64,
    pub symbols_scanned: u64,
    pub signals_found: u64,
    pub errors: u64,
    /// Passes whose results were thrown away because the tier was stopping
    pub discarded_passes: u64,
    pub last_pass_ms: u64,

    recent_durations: VecDeque<u64>,
}

impl TierMetrics {
    pub fn new(tier: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            passes: 0,
            symbols_scanned: 0,
            signals_found: 0,
            errors: 0,
            discarded_passes: 0,
            last_pass_ms: 0,
            recent_durations: VecDeque::with_capacity(ROLLING_WINDOW),
        }
    }

    pub fn record_pass(&mut self, outcome: &ScanOutcome) {
        self.passes += 1;
        self.symbols_scanned += outcome.symbols_scanned as u64;
        self.signals_found += outcome.signals_found as u64;
        self.errors += outcome.errors as u64;
        self.last_pass_ms = outcome.duration_ms;

        self.recent_durations.push_back(outcome.duration_ms);
        if self.recent_durations.len() > ROLLING_WINDOW {
            self.recent_durations.pop_front();
        }
    }

    pub fn record_discarded(&mut self) {
        self.discarded_passes += 1;
    }

    /// Average pass duration over the last 20 passes
    pub fn avg_pass_ms(&self) -> f64 {
        if self.recent_durations.is_empty() {
            return 0.0;
        }
        self.recent_durations.iter().sum::<u64>() as f64 / self.recent_durations.len() as f64
    }

    /// Share of symbol scans that failed (0-100%)
    pub fn error_rate(&self) -> f64 {
        if self.symbols_scanned == 0 {
            return 0.0;
        }
        self.errors as f64 / self.symbols_scanned as f64 * 100.0
    }

    /// Emit structured telemetry via tracing
    pub fn log_metrics(&self) {
        tracing::info!(
            tier = %self.tier,
            passes = self.passes,
            symbols_scanned = self.symbols_scanned,
            signals_found = self.signals_found,
            errors = self.errors,
            discarded_passes = self.discarded_passes,
            error_rate = format!("{:.1}%", self.error_rate()),
            last_pass_ms = self.last_pass_ms,
            avg_pass_ms = format!("{:.0}", self.avg_pass_ms()),
            "Scanner tier metrics"
        );
    }
}
