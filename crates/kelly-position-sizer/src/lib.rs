use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Kelly Criterion fraction of capital to commit.
///
/// f* = p - (1 - p) / R, where p is the win rate and R = |avg_win / avg_loss|.
/// The result is clamped to [0, 1]; degenerate inputs (no losses recorded,
/// zero average win) yield the clamp bounds rather than NaN.
pub fn kelly_fraction(win_rate: f64, avg_win: f64, avg_loss: f64) -> f64 {
    if !win_rate.is_finite() || !avg_win.is_finite() || !avg_loss.is_finite() {
        return 0.0;
    }
    let p = win_rate.clamp(0.0, 1.0);
    let avg_win = avg_win.abs();
    let avg_loss = avg_loss.abs();

    if avg_win == 0.0 {
        return 0.0;
    }
    if avg_loss == 0.0 {
        // Nothing has ever been lost: edge is unbounded, any win rate > 0 saturates
        return if p > 0.0 { 1.0 } else { 0.0 };
    }

    let r = avg_win / avg_loss;
    (p - (1.0 - p) / r).clamp(0.0, 1.0)
}

/// Signal thresholds that unlock a leverage level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeverageTier {
    pub min_confidence: f64,
    pub min_strength: f64,
    pub leverage: u32,
}

impl LeverageTier {
    pub const fn new(min_confidence: f64, min_strength: f64, leverage: u32) -> Self {
        Self {
            min_confidence,
            min_strength,
            leverage,
        }
    }
}

/// Kelly Criterion position sizing calculator for leveraged positions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyPositionSizer {
    /// Fractional Kelly multiplier (0.5 = half-Kelly)
    pub kelly_multiplier: f64,

    /// Cap on the adjusted fraction, as percent of account balance
    pub max_position_size_percent: f64,

    /// Sizes below this (USD) are rejected outright
    pub min_position_usd: f64,

    /// Sizes above this (USD) are clamped
    pub max_position_usd: f64,

    /// Total committed margin may not exceed this percent of balance
    pub max_total_exposure_percent: f64,

    /// Checked in order; the first tier the signal satisfies wins
    pub leverage_tiers: Vec<LeverageTier>,

    pub default_leverage: u32,

    pub max_leverage: u32,
}

/// Historical outcome statistics feeding the Kelly formula
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPerformance {
    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    /// Average win amount (positive)
    pub avg_win: f64,

    /// Average loss amount (positive)
    pub avg_loss: f64,

    /// Number of trades in sample
    pub num_trades: usize,
}

impl StrategyPerformance {
    /// Below this many trades the sample is not trusted
    pub const MIN_SAMPLE: usize = 10;

    /// Conservative stand-in used until enough trades have closed
    pub fn prior() -> Self {
        Self {
            win_rate: 0.5,
            avg_win: 1.5,
            avg_loss: 1.0,
            num_trades: 0,
        }
    }

    /// Build statistics from realized P&L values. Zero-P&L trades count as
    /// neither win nor loss. Falls back to `prior()` for small samples.
    pub fn from_trade_pnls(pnls: &[f64]) -> Self {
        if pnls.len() < Self::MIN_SAMPLE {
            return Self {
                num_trades: pnls.len(),
                ..Self::prior()
            };
        }

        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).map(f64::abs).collect();
        let decided = wins.len() + losses.len();
        if decided == 0 {
            return Self {
                num_trades: pnls.len(),
                ..Self::prior()
            };
        }

        let mean = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };

        Self {
            win_rate: wins.len() as f64 / decided as f64,
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
            num_trades: pnls.len(),
        }
    }

    pub fn kelly_fraction(&self) -> f64 {
        kelly_fraction(self.win_rate, self.avg_win, self.avg_loss)
    }
}

/// Account and signal context for one sizing decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingRequest {
    pub account_balance: f64,
    /// Signal confidence, 0-100
    pub confidence: f64,
    /// Signal strength, 0-100
    pub strength: f64,
    /// Margin already committed to open positions, USD
    pub current_exposure_usd: f64,
    /// Exchange-side leverage ceiling for the instrument, if known
    pub account_max_leverage: Option<u32>,
}

/// Position sizing recommendation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSize {
    /// Kelly fraction before any adjustment
    pub raw_kelly_fraction: f64,

    /// Raw fraction after the Kelly multiplier and signal quality scaling
    pub adjusted_fraction: f64,

    /// Fraction actually used after the max-position cap
    pub fraction: f64,

    /// Margin to commit, USD; zero means do not trade
    pub size_usd: f64,

    pub leverage: u32,

    /// Clamps and reductions applied on the way; informational only
    pub warnings: Vec<String>,

    pub reasoning: String,
}

impl PositionSize {
    pub fn is_tradeable(&self) -> bool {
        self.size_usd > 0.0
    }
}

impl Default for KellyPositionSizer {
    fn default() -> Self {
        Self {
            kelly_multiplier: 0.5, // Use half-Kelly for safety
            max_position_size_percent: 10.0,
            min_position_usd: 10.0,
            max_position_usd: 1_000.0,
            max_total_exposure_percent: 50.0,
            leverage_tiers: vec![
                LeverageTier::new(90.0, 85.0, 20),
                LeverageTier::new(85.0, 80.0, 15),
                LeverageTier::new(80.0, 75.0, 10),
            ],
            default_leverage: 5,
            max_leverage: 25,
        }
    }
}

impl KellyPositionSizer {
    pub fn new(
        kelly_multiplier: f64,
        max_position_size_percent: f64,
        min_position_usd: f64,
        max_position_usd: f64,
        max_total_exposure_percent: f64,
    ) -> Result<Self> {
        let sizer = Self {
            kelly_multiplier,
            max_position_size_percent,
            min_position_usd,
            max_position_usd,
            max_total_exposure_percent,
            ..Self::default()
        };
        sizer.validate()?;
        Ok(sizer)
    }

    pub fn with_leverage(
        mut self,
        tiers: Vec<LeverageTier>,
        default_leverage: u32,
        max_leverage: u32,
    ) -> Result<Self> {
        self.leverage_tiers = tiers;
        self.default_leverage = default_leverage;
        self.max_leverage = max_leverage;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kelly_multiplier <= 0.0 || self.kelly_multiplier > 1.0 {
            bail!("kelly_multiplier must be between 0 and 1");
        }
        if self.max_position_size_percent <= 0.0 || self.max_position_size_percent > 100.0 {
            bail!("max_position_size_percent must be between 0 and 100");
        }
        if self.min_position_usd < 0.0 || self.min_position_usd > self.max_position_usd {
            bail!("min_position_usd must be >= 0 and <= max_position_usd");
        }
        if self.max_total_exposure_percent <= 0.0 || self.max_total_exposure_percent > 100.0 {
            bail!("max_total_exposure_percent must be between 0 and 100");
        }
        if self.default_leverage == 0 || self.max_leverage == 0 {
            bail!("leverage must be at least 1x");
        }
        Ok(())
    }

    /// Pick leverage for a signal from the tier table, clamped to both the
    /// sizer's and the account's ceilings.
    pub fn select_leverage(
        &self,
        confidence: f64,
        strength: f64,
        account_max_leverage: Option<u32>,
    ) -> u32 {
        let chosen = self
            .leverage_tiers
            .iter()
            .find(|t| confidence >= t.min_confidence && strength >= t.min_strength)
            .map(|t| t.leverage)
            .unwrap_or(self.default_leverage);

        let ceiling = account_max_leverage
            .map(|m| m.min(self.max_leverage))
            .unwrap_or(self.max_leverage);

        chosen.min(ceiling).max(1)
    }

    /// Size a position from trade statistics and signal quality
    pub fn calculate(
        &self,
        performance: &StrategyPerformance,
        request: &SizingRequest,
    ) -> Result<PositionSize> {
        if !request.account_balance.is_finite() || request.account_balance < 0.0 {
            bail!("Account balance must be a non-negative number");
        }
        if !(0.0..=100.0).contains(&request.confidence) {
            bail!("Confidence must be between 0 and 100");
        }
        if !(0.0..=100.0).contains(&request.strength) {
            bail!("Strength must be between 0 and 100");
        }

        let mut warnings = Vec::new();
        let balance = request.account_balance;

        let raw_kelly = performance.kelly_fraction();
        let fractional = raw_kelly * self.kelly_multiplier;
        let adjusted = fractional * (request.confidence / 100.0) * (request.strength / 100.0);

        let cap = self.max_position_size_percent / 100.0;
        let fraction = if adjusted > cap {
            warnings.push(format!(
                "Kelly fraction {:.2}% capped at max position size {:.2}%",
                adjusted * 100.0,
                self.max_position_size_percent
            ));
            cap
        } else {
            adjusted
        };

        let mut size = (balance * fraction).max(0.0);

        if size > self.max_position_usd {
            warnings.push(format!(
                "Size ${:.2} clamped to maximum ${:.2}",
                size, self.max_position_usd
            ));
            size = self.max_position_usd;
        }

        let max_exposure = balance * self.max_total_exposure_percent / 100.0;
        let headroom = max_exposure - request.current_exposure_usd;
        if size > headroom {
            if headroom <= 0.0 {
                warnings.push(format!(
                    "No exposure headroom (${:.2} committed of ${:.2} allowed)",
                    request.current_exposure_usd, max_exposure
                ));
                size = 0.0;
            } else {
                warnings.push(format!(
                    "Size ${:.2} reduced to ${:.2} to respect total exposure limit",
                    size, headroom
                ));
                size = headroom;
            }
        }

        if size > 0.0 && size < self.min_position_usd {
            warnings.push(format!(
                "Size ${:.2} below minimum ${:.2}; rejected",
                size, self.min_position_usd
            ));
            size = 0.0;
        }

        let leverage = self.select_leverage(
            request.confidence,
            request.strength,
            request.account_max_leverage,
        );

        let reasoning = format!(
            "Kelly: {:.2}% (raw: {:.2}%, win_rate: {:.1}%, avg_win/loss: {:.2}/{:.2}, n={}) x conf {:.0} x strength {:.0} -> ${:.2} @ {}x",
            fraction * 100.0,
            raw_kelly * 100.0,
            performance.win_rate * 100.0,
            performance.avg_win,
            performance.avg_loss,
            performance.num_trades,
            request.confidence,
            request.strength,
            size,
            leverage
        );

        Ok(PositionSize {
            raw_kelly_fraction: raw_kelly,
            adjusted_fraction: adjusted,
            fraction,
            size_usd: size,
            leverage,
            warnings,
            reasoning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn request(balance: f64, confidence: f64, strength: f64) -> SizingRequest {
        SizingRequest {
            account_balance: balance,
            confidence,
            strength,
            current_exposure_usd: 0.0,
            account_max_leverage: None,
        }
    }

    #[test]
    fn test_kelly_formula() {
        // 60% win rate, 2:1 payoff -> 0.6 - 0.4 / 2 = 0.4
        assert_relative_eq!(kelly_fraction(0.6, 100.0, 50.0), 0.4, epsilon = 1e-12);
        // Sign of avg_loss does not matter
        assert_relative_eq!(kelly_fraction(0.6, 100.0, -50.0), 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_kelly_no_edge_clamps_to_zero() {
        assert_eq!(kelly_fraction(0.5, 100.0, 100.0), 0.0);
        assert_eq!(kelly_fraction(0.2, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_kelly_monotonic_in_win_rate() {
        for &(avg_win, avg_loss) in &[(1.0, 1.0), (1.5, 1.0), (0.5, 2.0), (3.0, 0.2)] {
            let mut prev = -1.0;
            for i in 0..=100 {
                let f = kelly_fraction(i as f64 / 100.0, avg_win, avg_loss);
                assert!((0.0..=1.0).contains(&f));
                assert!(f >= prev, "not monotonic at p={} for R={}", i, avg_win / avg_loss);
                prev = f;
            }
        }
    }

    #[test]
    fn test_kelly_degenerate_inputs() {
        assert_eq!(kelly_fraction(0.7, 0.0, 1.0), 0.0);
        assert_eq!(kelly_fraction(0.7, 1.0, 0.0), 1.0);
        assert_eq!(kelly_fraction(f64::NAN, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_half_kelly_scaled_by_signal_quality() {
        let sizer = KellyPositionSizer::default();
        // raw Kelly 0.58 - 0.42 = 0.16, half-Kelly 0.08
        let performance = StrategyPerformance {
            win_rate: 0.58,
            avg_win: 1.0,
            avg_loss: 1.0,
            num_trades: 50,
        };

        let result = sizer.calculate(&performance, &request(1_000.0, 80.0, 70.0)).unwrap();

        // 0.08 x 0.8 x 0.7 = 0.0448 -> $44.80
        assert_relative_eq!(result.fraction, 0.0448, epsilon = 1e-9);
        assert_relative_eq!(result.size_usd, 44.80, epsilon = 1e-6);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_max_position_cap() {
        let sizer = KellyPositionSizer::default();
        let performance = StrategyPerformance {
            win_rate: 0.9,
            avg_win: 3.0,
            avg_loss: 1.0,
            num_trades: 100,
        };

        let result = sizer.calculate(&performance, &request(1_000.0, 100.0, 100.0)).unwrap();

        assert_relative_eq!(result.fraction, 0.10, epsilon = 1e-9);
        assert_relative_eq!(result.size_usd, 100.0, epsilon = 1e-9);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_below_minimum_rejected() {
        let sizer = KellyPositionSizer::default();
        let result = sizer
            .calculate(&StrategyPerformance::prior(), &request(100.0, 80.0, 80.0))
            .unwrap();

        assert_eq!(result.size_usd, 0.0);
        assert!(!result.is_tradeable());
        assert!(result.warnings.iter().any(|w| w.contains("below minimum")));
    }

    #[test]
    fn test_exposure_headroom() {
        let sizer = KellyPositionSizer::default();
        let performance = StrategyPerformance {
            win_rate: 0.9,
            avg_win: 3.0,
            avg_loss: 1.0,
            num_trades: 100,
        };

        let mut req = request(1_000.0, 100.0, 100.0);
        req.current_exposure_usd = 460.0;
        let reduced = sizer.calculate(&performance, &req).unwrap();
        assert_relative_eq!(reduced.size_usd, 40.0, epsilon = 1e-9);

        req.current_exposure_usd = 500.0;
        let blocked = sizer.calculate(&performance, &req).unwrap();
        assert_eq!(blocked.size_usd, 0.0);
        assert!(blocked.warnings.iter().any(|w| w.contains("No exposure headroom")));
    }

    #[test]
    fn test_leverage_tiers() {
        let sizer = KellyPositionSizer::default();
        assert_eq!(sizer.select_leverage(92.0, 90.0, None), 20);
        assert_eq!(sizer.select_leverage(92.0, 81.0, None), 15);
        assert_eq!(sizer.select_leverage(81.0, 76.0, None), 10);
        assert_eq!(sizer.select_leverage(79.0, 99.0, None), 5);
        // Account ceiling wins
        assert_eq!(sizer.select_leverage(92.0, 90.0, Some(12)), 12);
    }

    #[test]
    fn test_prior_for_small_samples() {
        let stats = StrategyPerformance::from_trade_pnls(&[5.0, -2.0, 3.0]);
        assert_eq!(stats.win_rate, 0.5);
        assert_eq!(stats.avg_win, 1.5);
        assert_eq!(stats.num_trades, 3);

        let pnls = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, -5.0, -5.0, -5.0, -5.0];
        let stats = StrategyPerformance::from_trade_pnls(&pnls);
        assert_relative_eq!(stats.win_rate, 0.6);
        assert_relative_eq!(stats.avg_win, 10.0);
        assert_relative_eq!(stats.avg_loss, 5.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(KellyPositionSizer::new(1.5, 10.0, 10.0, 1000.0, 50.0).is_err());
        assert!(KellyPositionSizer::new(0.5, 10.0, 2000.0, 1000.0, 50.0).is_err());
        assert!(KellyPositionSizer::new(0.5, 10.0, 10.0, 1000.0, 50.0).is_ok());
    }
}
