use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use exchange_client::LiquidationTracker;
use futures_util::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use trading_core::{Direction, Layer, LayerReading, LayerScorer};

/// One reading per layer, always all six
pub type LayerScores = BTreeMap<Layer, LayerReading>;

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: f64,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    direction: Option<Direction>,
}

/// Layer scorer backed by the external scoring service.
///
/// `GET {base}/score/{layer}?symbol=BTCUSDT` answering
/// `{"score": 72.5, "direction": "short", "reason": "..."}`. The score is
/// conviction; `direction` may be omitted when the layer has no view. Each layer has its own breaker so a
/// broken model does not take the others down with it.
pub struct HttpScorer {
    layer: Layer,
    client: Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
}

impl HttpScorer {
    pub fn new(layer: Layer, base_url: &str, breakers: &CircuitBreakerRegistry) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            layer,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            breaker: breakers.get(&format!("scorer-{}", layer)),
        })
    }
}

#[async_trait]
impl LayerScorer for HttpScorer {
    fn layer(&self) -> Layer {
        self.layer
    }

    async fn score(&self, symbol: &str) -> Result<LayerReading> {
        let url = format!("{}/score/{}", self.base_url, self.layer);
        let response = self
            .breaker
            .call_classified(
                || async {
                    self.client
                        .get(&url)
                        .query(&[("symbol", symbol)])
                        .send()
                        .await?
                        .error_for_status()?
                        .json::<ScoreResponse>()
                        .await
                },
                // A 4xx means the service does not know the symbol, not that it is down
                |e: &reqwest::Error| !e.status().map(|s| s.is_client_error()).unwrap_or(false),
            )
            .await?;

        let reading = LayerReading::new(response.score, response.reason);
        Ok(match response.direction {
            Some(direction) => reading.leaning(direction),
            None => reading,
        })
    }
}

/// Liquidation layer fed by the public liquidation stream.
///
/// Conviction is 50 + 50 * |long - short| / (long + short) over the tracker
/// window and the lean is the side being flushed. The generator votes this
/// layer with a negative weight, so flushed longs count against a long.
pub struct LiquidationScorer {
    tracker: Arc<LiquidationTracker>,
}

impl LiquidationScorer {
    pub fn new(tracker: Arc<LiquidationTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl LayerScorer for LiquidationScorer {
    fn layer(&self) -> Layer {
        Layer::Liquidation
    }

    async fn score(&self, symbol: &str) -> Result<LayerReading> {
        let summary = self.tracker.summary(symbol, Utc::now());
        let reading = match summary.long_share() {
            Some(long_share) => {
                let imbalance = 2.0 * long_share - 1.0;
                let reading = LayerReading::new(
                    50.0 + 50.0 * imbalance.abs(),
                    format!(
                        "{} liquidations: ${:.0} long / ${:.0} short",
                        summary.count, summary.long_usd, summary.short_usd
                    ),
                );
                if imbalance > 0.0 {
                    reading.leaning(Direction::Long)
                } else if imbalance < 0.0 {
                    reading.leaning(Direction::Short)
                } else {
                    reading
                }
            }
            None => LayerReading::new(LayerReading::NEUTRAL, "No liquidations in window"),
        };
        Ok(reading)
    }
}

/// The scorers consulted for every symbol.
///
/// Failure policy: a scorer that errors, or a layer with no scorer at all,
/// reads neutral (50) with `degraded` set. The pipeline never fails because
/// of a single layer.
#[derive(Default, Clone)]
pub struct ScorerSet {
    scorers: Vec<Arc<dyn LayerScorer>>,
}

impl ScorerSet {
    pub fn new(scorers: Vec<Arc<dyn LayerScorer>>) -> Self {
        Self { scorers }
    }

    /// HTTP scorers for every layer when `scorer_url` is set; the liquidation
    /// layer comes from the stream tracker instead when one is supplied.
    pub fn from_config(
        scorer_url: Option<&str>,
        breakers: &CircuitBreakerRegistry,
        liquidations: Option<Arc<LiquidationTracker>>,
    ) -> Result<Self> {
        let mut scorers: Vec<Arc<dyn LayerScorer>> = Vec::new();

        if let Some(tracker) = liquidations {
            scorers.push(Arc::new(LiquidationScorer::new(tracker)));
        }

        if let Some(url) = scorer_url {
            for layer in Layer::ALL {
                if scorers.iter().any(|s| s.layer() == layer) {
                    continue;
                }
                scorers.push(Arc::new(HttpScorer::new(layer, url, breakers)?));
            }
        }

        if scorers.is_empty() {
            tracing::warn!("No layer scorers configured; every layer will read neutral");
        }

        Ok(Self { scorers })
    }

    pub fn len(&self) -> usize {
        self.scorers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scorers.is_empty()
    }

    /// Score a symbol on every layer concurrently
    pub async fn score_all(&self, symbol: &str) -> LayerScores {
        let results = join_all(self.scorers.iter().map(|scorer| async move {
            let layer = scorer.layer();
            match scorer.score(symbol).await {
                Ok(reading) => (layer, reading),
                Err(e) => {
                    tracing::debug!("{} scorer failed for {}: {:#}", layer, symbol, e);
                    (layer, LayerReading::neutral(format!("Scorer unavailable: {}", e)))
                }
            }
        }))
        .await;

        let mut scores: LayerScores = results.into_iter().collect();
        for layer in Layer::ALL {
            scores
                .entry(layer)
                .or_insert_with(|| LayerReading::neutral("No scorer configured"));
        }
        scores
    }
}
