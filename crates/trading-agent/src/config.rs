use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kelly_position_sizer::KellyPositionSizer;
use serde::{Deserialize, Serialize};
use trading_core::Layer;

const TOP10_SYMBOLS: &str =
    "BTCUSDT,ETHUSDT,SOLUSDT,XRPUSDT,BNBUSDT,DOGEUSDT,ADAUSDT,AVAXUSDT,LINKUSDT,TONUSDT";
const TOP20_SYMBOLS: &str =
    "DOTUSDT,TRXUSDT,LTCUSDT,BCHUSDT,NEARUSDT,UNIUSDT,APTUSDT,ATOMUSDT,ETCUSDT,FILUSDT";
const TOP50_SYMBOLS: &str = "ARBUSDT,OPUSDT,INJUSDT,SUIUSDT,SEIUSDT,TIAUSDT,AAVEUSDT,MKRUSDT,\
     LDOUSDT,RNDRUSDT,IMXUSDT,STXUSDT,HBARUSDT,ICPUSDT,VETUSDT,ALGOUSDT,GRTUSDT,SANDUSDT,\
     MANAUSDT,AXSUSDT,FTMUSDT,EGLDUSDT,THETAUSDT,FLOWUSDT,XLMUSDT,KASUSDT,WLDUSDT,JUPUSDT,\
     PEPEUSDT,WIFUSDT";

/// One scanner tier: its symbols, cadence and confidence bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub symbols: Vec<String>,
    pub interval: Duration,
    /// Minimum weighted confidence (0-100) for a signal to be persisted
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Storage and alerts
    pub database_url: Option<String>,
    pub discord_webhook_url: String,

    // Scanner
    pub tiers: Vec<TierConfig>,
    pub layer_weights: Vec<(Layer, f64)>,
    pub scorer_url: Option<String>,
    pub liquidation_stream: bool,
    pub scan_concurrency: usize,
    pub metrics_log_interval: Duration,

    // Kelly sizing
    pub kelly_fraction: f64,
    pub max_position_size_percent: f64,
    pub min_position_usd: f64,
    pub max_position_usd: f64,
    pub max_total_exposure_percent: f64,
    pub default_leverage: u32,
    pub max_leverage: u32,

    // Executor
    pub executor_poll: Duration,
    pub signal_ttl: Duration,
    pub leverage_ladder: Vec<u32>,
    pub trailing_distance_percent: f64,
    pub trailing_activation_percent: f64,
    pub partial_take_profits: bool,
    pub market_filter_enabled: bool,

    // Position manager
    pub position_poll: Duration,

    // Risk loop
    pub risk_poll: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            discord_webhook_url: String::new(),
            tiers: vec![
                tier("top10", TOP10_SYMBOLS, 60, 78.0),
                tier("top20", TOP20_SYMBOLS, 120, 80.0),
                tier("top50", TOP50_SYMBOLS, 600, 82.0),
            ],
            layer_weights: Layer::ALL.iter().map(|l| (*l, l.default_weight())).collect(),
            scorer_url: None,
            liquidation_stream: false,
            scan_concurrency: 1,
            metrics_log_interval: Duration::from_secs(300),
            kelly_fraction: 0.5,
            max_position_size_percent: 10.0,
            min_position_usd: 10.0,
            max_position_usd: 1000.0,
            max_total_exposure_percent: 50.0,
            default_leverage: 5,
            max_leverage: 25,
            executor_poll: Duration::from_secs(5),
            signal_ttl: Duration::from_secs(300),
            leverage_ladder: vec![25, 20, 15, 12, 10],
            trailing_distance_percent: 1.5,
            trailing_activation_percent: 1.0,
            partial_take_profits: true,
            market_filter_enabled: true,
            position_poll: Duration::from_secs(5),
            risk_poll: Duration::from_secs(10),
        }
    }
}

fn tier(name: &str, symbols: &str, interval_secs: u64, threshold: f64) -> TierConfig {
    TierConfig {
        name: name.to_string(),
        symbols: split_list(symbols),
        interval: Duration::from_secs(interval_secs),
        threshold,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `key` from the environment, falling back to `default`
fn var<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .with_context(|| format!("{} has an invalid value", key))
}

fn secs(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(var(key, &default.to_string())?))
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let mut tiers = Vec::with_capacity(defaults.tiers.len());
        for default_tier in &defaults.tiers {
            let prefix = format!("TIER_{}", default_tier.name.to_uppercase());
            tiers.push(TierConfig {
                name: default_tier.name.clone(),
                symbols: env::var(format!("{}_SYMBOLS", prefix))
                    .map(|raw| split_list(&raw))
                    .unwrap_or_else(|_| default_tier.symbols.clone()),
                interval: secs(
                    &format!("{}_INTERVAL_SECS", prefix),
                    default_tier.interval.as_secs(),
                )?,
                threshold: var(
                    &format!("{}_THRESHOLD", prefix),
                    &default_tier.threshold.to_string(),
                )?,
            });
        }

        let leverage_ladder = env::var("LEVERAGE_FALLBACK_LADDER")
            .unwrap_or_else(|_| "25,20,15,12,10".to_string())
            .split(',')
            .map(|s| s.trim().parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("LEVERAGE_FALLBACK_LADDER must be a comma-separated list of integers")?;

        let config = Self {
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            discord_webhook_url: env::var("DISCORD_WEBHOOK_URL").unwrap_or_default(),

            tiers,
            layer_weights: defaults.layer_weights,
            scorer_url: env::var("SCORER_URL").ok().filter(|s| !s.is_empty()),
            liquidation_stream: var("LIQUIDATION_STREAM", "false")?,
            scan_concurrency: var("SCAN_CONCURRENCY", "1")?,
            metrics_log_interval: secs("METRICS_LOG_SECS", 300)?,

            kelly_fraction: var("KELLY_FRACTION", "0.5")?,
            max_position_size_percent: var("MAX_POSITION_SIZE_PERCENT", "10")?,
            min_position_usd: var("MIN_POSITION_USD", "10")?,
            max_position_usd: var("MAX_POSITION_USD", "1000")?,
            max_total_exposure_percent: var("MAX_TOTAL_EXPOSURE_PERCENT", "50")?,
            default_leverage: var("DEFAULT_LEVERAGE", "5")?,
            max_leverage: var("MAX_LEVERAGE", "25")?,

            executor_poll: secs("EXECUTOR_POLL_SECS", 5)?,
            signal_ttl: secs("SIGNAL_TTL_SECS", 300)?,
            leverage_ladder,
            trailing_distance_percent: var("TRAILING_DISTANCE_PERCENT", "1.5")?,
            trailing_activation_percent: var("TRAILING_ACTIVATION_PERCENT", "1.0")?,
            partial_take_profits: var("PARTIAL_TAKE_PROFITS", "true")?,
            market_filter_enabled: var("MARKET_FILTER_ENABLED", "true")?,

            position_poll: secs("POSITION_POLL_SECS", 5)?,
            risk_poll: secs("RISK_POLL_SECS", 10)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let weight_sum: f64 = self.layer_weights.iter().map(|(_, w)| w).sum();
        if (weight_sum - 1.0).abs() > 1e-9 {
            bail!("Layer weights must sum to 1.0 (got {})", weight_sum);
        }
        for t in &self.tiers {
            if !(0.0..=100.0).contains(&t.threshold) {
                bail!("Tier {} threshold must be between 0 and 100", t.name);
            }
            if t.interval.is_zero() {
                bail!("Tier {} interval must be positive", t.name);
            }
        }
        if self.leverage_ladder.is_empty() || self.leverage_ladder.contains(&0) {
            bail!("Leverage fallback ladder must list leverages of at least 1x");
        }
        if self.scan_concurrency == 0 {
            bail!("SCAN_CONCURRENCY must be at least 1");
        }
        if self.trailing_distance_percent <= 0.0 || self.trailing_activation_percent < 0.0 {
            bail!("Trailing stop distance must be positive and activation non-negative");
        }
        if self.signal_ttl.is_zero() {
            bail!("SIGNAL_TTL_SECS must be positive");
        }
        self.sizer()?;
        Ok(())
    }

    /// Kelly sizer built from the sizing settings
    pub fn sizer(&self) -> Result<KellyPositionSizer> {
        let base = KellyPositionSizer::new(
            self.kelly_fraction,
            self.max_position_size_percent,
            self.min_position_usd,
            self.max_position_usd,
            self.max_total_exposure_percent,
        )?;
        let tiers = base.leverage_tiers.clone();
        base.with_leverage(tiers, self.default_leverage, self.max_leverage)
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.name == name)
    }
}
