use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use trading_core::Direction;

const PING_INTERVAL: Duration = Duration::from_secs(20);

/// A forced liquidation reported by the public stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub symbol: String,
    /// Direction of the position that was liquidated
    pub liquidated: Direction,
    pub price: f64,
    pub qty: f64,
    pub time: DateTime<Utc>,
}

impl LiquidationEvent {
    pub fn notional(&self) -> f64 {
        self.price * self.qty
    }
}

/// Liquidation totals for one symbol over the tracker window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LiquidationSummary {
    pub long_usd: f64,
    pub short_usd: f64,
    pub count: usize,
}

impl LiquidationSummary {
    /// Share of liquidated notional that came from longs, 0-1; None when empty
    pub fn long_share(&self) -> Option<f64> {
        let total = self.long_usd + self.short_usd;
        (total > 0.0).then(|| self.long_usd / total)
    }
}

/// Rolling per-symbol record of recent liquidations
#[derive(Debug)]
pub struct LiquidationTracker {
    window: chrono::Duration,
    events: DashMap<String, VecDeque<LiquidationEvent>>,
}

impl LiquidationTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1)),
            events: DashMap::new(),
        }
    }

    pub fn record(&self, event: LiquidationEvent) {
        let cutoff = event.time - self.window;
        let mut queue = self.events.entry(event.symbol.clone()).or_default();
        queue.push_back(event);
        while queue.front().map(|e| e.time < cutoff).unwrap_or(false) {
            queue.pop_front();
        }
    }

    pub fn summary(&self, symbol: &str, now: DateTime<Utc>) -> LiquidationSummary {
        let cutoff = now - self.window;
        let mut summary = LiquidationSummary::default();
        if let Some(queue) = self.events.get(symbol) {
            for event in queue.iter().filter(|e| e.time >= cutoff) {
                match event.liquidated {
                    Direction::Long => summary.long_usd += event.notional(),
                    Direction::Short => summary.short_usd += event.notional(),
                }
                summary.count += 1;
            }
        }
        summary
    }
}

/// Reconnect delay that doubles per failure up to a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns double, capped
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    data: Vec<RawLiquidation>,
}

#[derive(Debug, Deserialize)]
struct RawLiquidation {
    #[serde(rename = "T")]
    time: i64,
    #[serde(rename = "s")]
    symbol: String,
    /// "Buy" means a long position was liquidated
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    qty: String,
    #[serde(rename = "p")]
    price: String,
}

/// Parse one stream frame; non-liquidation frames (pongs, acks) yield nothing
pub fn parse_liquidations(text: &str) -> Vec<LiquidationEvent> {
    let msg: StreamMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    if !msg.topic.starts_with("allLiquidation.") {
        return Vec::new();
    }

    msg.data
        .into_iter()
        .filter_map(|raw| {
            let liquidated = match raw.side.as_str() {
                "Buy" => Direction::Long,
                "Sell" => Direction::Short,
                _ => return None,
            };
            Some(LiquidationEvent {
                symbol: raw.symbol,
                liquidated,
                price: raw.price.parse().ok()?,
                qty: raw.qty.parse().ok()?,
                time: Utc.timestamp_millis_opt(raw.time).single()?,
            })
        })
        .collect()
}

/// Public liquidation stream feeding a `LiquidationTracker`
pub struct LiquidationStream {
    url: String,
    symbols: Vec<String>,
    tracker: Arc<LiquidationTracker>,
}

impl LiquidationStream {
    pub fn new(url: impl Into<String>, symbols: Vec<String>, tracker: Arc<LiquidationTracker>) -> Self {
        Self {
            url: url.into(),
            symbols,
            tracker,
        }
    }

    pub fn tracker(&self) -> Arc<LiquidationTracker> {
        self.tracker.clone()
    }

    /// Run until cancelled, reconnecting with exponential backoff
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::default();

        loop {
            match self.connect_and_stream(&shutdown, &mut backoff).await {
                Ok(()) if shutdown.is_cancelled() => {
                    tracing::info!("Liquidation stream stopped");
                    return;
                }
                Ok(()) => tracing::info!("Liquidation stream closed by server"),
                Err(e) => tracing::warn!("Liquidation stream error: {}", e),
            }

            let delay = backoff.next_delay();
            tracing::info!("Reconnecting liquidation stream in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = shutdown.cancelled() => {
                    tracing::info!("Liquidation stream shutdown requested");
                    return;
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        shutdown: &CancellationToken,
        backoff: &mut Backoff,
    ) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();
        backoff.reset();
        tracing::info!("Connected to liquidation stream ({} symbols)", self.symbols.len());

        let args: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("allLiquidation.{}", s))
            .collect();
        let sub_msg = serde_json::json!({ "op": "subscribe", "args": args });
        write.send(Message::Text(sub_msg.to_string())).await?;

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for event in parse_liquidations(&text) {
                                tracing::debug!(
                                    "Liquidation {} {} {:.2} @ {}",
                                    event.symbol,
                                    event.liquidated,
                                    event.qty,
                                    event.price
                                );
                                self.tracker.record(event);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Text(r#"{"op":"ping"}"#.to_string())).await?;
                }
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}
