use std::sync::Arc;

use trading_core::{Direction, Exchange};

const FAST_PERIOD: usize = 20;
const SLOW_PERIOD: usize = 50;
const CANDLE_INTERVAL: &str = "60";
const CANDLE_LIMIT: u32 = 120;

/// Latest exponential moving average of `data`, seeded with the SMA of the
/// first `period` values. None when there is not enough data.
pub fn ema(data: &[f64], period: usize) -> Option<f64> {
    if period == 0 || data.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = data[..period].iter().sum::<f64>() / period as f64;
    Some(
        data[period..]
            .iter()
            .fold(seed, |prev, value| (value - prev) * multiplier + prev),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterVerdict {
    Aligned { fast: f64, slow: f64 },
    Against { fast: f64, slow: f64 },
    /// Candles missing or too short; the trade goes ahead
    Unavailable(String),
    Disabled,
}

impl FilterVerdict {
    pub fn allows(&self) -> bool {
        !matches!(self, FilterVerdict::Against { .. })
    }
}

/// Hourly EMA20/EMA50 trend check run before an entry. Longs need the fast
/// average above the slow one, shorts below. Fails open.
pub struct MarketFilter {
    exchange: Arc<dyn Exchange>,
    enabled: bool,
}

impl MarketFilter {
    pub fn new(exchange: Arc<dyn Exchange>, enabled: bool) -> Self {
        Self { exchange, enabled }
    }

    pub async fn check(&self, symbol: &str, direction: Direction) -> FilterVerdict {
        if !self.enabled {
            return FilterVerdict::Disabled;
        }

        let candles = match self
            .exchange
            .get_klines(symbol, CANDLE_INTERVAL, CANDLE_LIMIT)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                tracing::warn!("Market filter: no candles for {} ({}); allowing trade", symbol, e);
                return FilterVerdict::Unavailable(e.to_string());
            }
        };

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let (fast, slow) = match (ema(&closes, FAST_PERIOD), ema(&closes, SLOW_PERIOD)) {
            (Some(fast), Some(slow)) => (fast, slow),
            _ => {
                let reason = format!("only {} candles", closes.len());
                tracing::warn!("Market filter: {} for {}; allowing trade", reason, symbol);
                return FilterVerdict::Unavailable(reason);
            }
        };

        let aligned = match direction {
            Direction::Long => fast > slow,
            Direction::Short => fast < slow,
        };

        if aligned {
            FilterVerdict::Aligned { fast, slow }
        } else {
            FilterVerdict::Against { fast, slow }
        }
    }
}
