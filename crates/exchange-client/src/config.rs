use std::time::Duration;

use anyhow::{Context, Result};
use circuit_breaker::CircuitBreakerConfig;

pub const DEFAULT_BASE_URL: &str = "https://api-testnet.bybit.com";
pub const DEFAULT_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub ws_url: String,
    pub recv_window_ms: u64,
    /// Hedge mode keeps separate long (idx 1) and short (idx 2) slots
    pub hedge_mode: bool,
    pub auth_failure_threshold: usize,
    pub auth_failure_window: Duration,
    pub request_timeout: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            recv_window_ms: 5000,
            hedge_mode: true,
            auth_failure_threshold: 5,
            auth_failure_window: Duration::from_secs(600),
            request_timeout: Duration::from_secs(15),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ExchangeConfig {
    /// Read exchange settings from the environment. Credentials may be empty;
    /// public market data still works without them.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            api_key: std::env::var("EXCHANGE_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("EXCHANGE_API_SECRET").unwrap_or_default(),
            base_url: std::env::var("EXCHANGE_BASE_URL").unwrap_or(defaults.base_url),
            ws_url: std::env::var("EXCHANGE_WS_URL").unwrap_or(defaults.ws_url),
            recv_window_ms: std::env::var("EXCHANGE_RECV_WINDOW_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("EXCHANGE_RECV_WINDOW_MS must be an integer")?,
            hedge_mode: std::env::var("EXCHANGE_HEDGE_MODE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("EXCHANGE_HEDGE_MODE must be true or false")?,
            auth_failure_threshold: std::env::var("AUTH_FAILURE_THRESHOLD")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("AUTH_FAILURE_THRESHOLD must be an integer")?,
            auth_failure_window: Duration::from_secs(
                std::env::var("AUTH_FAILURE_WINDOW_SECS")
                    .unwrap_or_else(|_| "600".to_string())
                    .parse()
                    .context("AUTH_FAILURE_WINDOW_SECS must be an integer")?,
            ),
            request_timeout: defaults.request_timeout,
            breaker: defaults.breaker,
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}
