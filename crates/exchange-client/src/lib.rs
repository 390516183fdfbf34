pub mod auth;
pub mod client;
pub mod config;
pub mod models;
pub mod websocket;

pub use auth::{AuthFailureTracker, Credentials};
pub use client::BybitClient;
pub use config::ExchangeConfig;
pub use models::{format_decimal, round_down_to_step, round_to_tick};
pub use websocket::{Backoff, LiquidationEvent, LiquidationStream, LiquidationSummary, LiquidationTracker};
