use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Account-level limits enforced by the risk loop and the admission gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Daily loss (percent of the day's starting balance) that disables trading
    pub daily_loss_limit_percent: f64,
    /// Daily loss that triggers the emergency stop; stricter than the daily limit
    pub emergency_stop_percent: f64,
    /// Drawdown from the day's peak balance that disables trading
    pub max_drawdown_percent: f64,
    pub max_positions: u32,
    pub max_position_size_percent: f64,
    /// How long an emergency stop blocks new trades
    pub emergency_pause: Duration,
    /// Fraction of a limit at which soft warnings start (0.7 = 70%)
    pub warning_ratio: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            daily_loss_limit_percent: 5.0,
            emergency_stop_percent: 10.0,
            max_drawdown_percent: 15.0,
            max_positions: 5,
            max_position_size_percent: 10.0,
            emergency_pause: Duration::from_secs(24 * 3600),
            warning_ratio: 0.7,
        }
    }
}

impl RiskLimits {
    pub fn from_env() -> Result<Self> {
        let limits = Self {
            daily_loss_limit_percent: std::env::var("DAILY_LOSS_LIMIT_PERCENT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("DAILY_LOSS_LIMIT_PERCENT must be a number")?,
            emergency_stop_percent: std::env::var("EMERGENCY_STOP_PERCENT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("EMERGENCY_STOP_PERCENT must be a number")?,
            max_drawdown_percent: std::env::var("MAX_DRAWDOWN_PERCENT")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .context("MAX_DRAWDOWN_PERCENT must be a number")?,
            max_positions: std::env::var("MAX_POSITIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("MAX_POSITIONS must be an integer")?,
            max_position_size_percent: std::env::var("MAX_POSITION_SIZE_PERCENT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("MAX_POSITION_SIZE_PERCENT must be a number")?,
            emergency_pause: Duration::from_secs(
                std::env::var("EMERGENCY_PAUSE_HOURS")
                    .unwrap_or_else(|_| "24".to_string())
                    .parse::<u64>()
                    .context("EMERGENCY_PAUSE_HOURS must be an integer")?
                    * 3600,
            ),
            warning_ratio: 0.7,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> Result<()> {
        if self.daily_loss_limit_percent <= 0.0 || self.max_drawdown_percent <= 0.0 {
            bail!("Loss and drawdown limits must be positive");
        }
        if self.emergency_stop_percent < self.daily_loss_limit_percent {
            bail!(
                "Emergency stop ({}%) must be at least the daily loss limit ({}%)",
                self.emergency_stop_percent,
                self.daily_loss_limit_percent
            );
        }
        if self.max_positions == 0 {
            bail!("MAX_POSITIONS must be at least 1");
        }
        if !(0.0..1.0).contains(&self.warning_ratio) {
            bail!("Warning ratio must be in [0, 1)");
        }
        Ok(())
    }
}

/// State change made by one enforcement pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskAction {
    DrawdownHalt { drawdown_percent: f64 },
    DailyLossHalt { daily_pnl_percent: f64 },
    EmergencyStop { daily_pnl_percent: f64, positions_closed: usize },
    EmergencyCleared,
}
