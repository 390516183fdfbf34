use async_trait::async_trait;
use chrono::Utc;
use circuit_breaker::{CircuitBreakerRegistry, CircuitError};
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use trading_core::{
    Candle, ClosedPnl, Direction, Exchange, ExchangeError, ExchangePosition, ExchangeResult,
    InstrumentInfo, OrderAck, OrderBook, OrderRequest, OrderType, Ticker, TradingStopRequest,
    WalletBalance,
};

use crate::auth::{sorted_query, AuthFailureTracker, Credentials};
use crate::config::ExchangeConfig;
use crate::models::*;

const CATEGORY: &str = "linear";
const SETTLE_COIN: &str = "USDT";

/// Endpoint families, each behind its own circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Market,
    Trade,
    Position,
    Account,
}

impl Group {
    fn as_str(&self) -> &'static str {
        match self {
            Group::Market => "market",
            Group::Trade => "trade",
            Group::Position => "position",
            Group::Account => "account",
        }
    }
}

/// Signed REST client for the v5 linear-perpetual API
pub struct BybitClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    recv_window_ms: u64,
    hedge_mode: bool,
    auth: AuthFailureTracker,
    breakers: CircuitBreakerRegistry,
    instruments: DashMap<String, InstrumentInfo>,
}

impl BybitClient {
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: Credentials::new(&config.api_key, &config.api_secret),
            recv_window_ms: config.recv_window_ms,
            hedge_mode: config.hedge_mode,
            auth: AuthFailureTracker::new(
                config.auth_failure_threshold,
                config.auth_failure_window,
            ),
            breakers: CircuitBreakerRegistry::new(config.breaker.clone()),
            instruments: DashMap::new(),
        })
    }

    /// Create client from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(&ExchangeConfig::from_env()?)
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn auth_tracker(&self) -> &AuthFailureTracker {
        &self.auth
    }

    /// Get the base URL (for logging/diagnostics)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_testnet(&self) -> bool {
        self.base_url.contains("testnet")
    }

    fn sign(&self, request: RequestBuilder, payload: &str) -> RequestBuilder {
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.credentials.sign(timestamp, self.recv_window_ms, payload);

        request
            .header("X-BAPI-API-KEY", &self.credentials.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-SIGN-TYPE", "2")
    }

    async fn get<T: DeserializeOwned>(
        &self,
        group: Group,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> ExchangeResult<T> {
        let query = sorted_query(params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        self.execute(group, signed, || {
            let request = self.client.get(&url);
            if signed {
                self.sign(request, &query)
            } else {
                request
            }
        })
        .await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        group: Group,
        path: &str,
        body: serde_json::Value,
    ) -> ExchangeResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let body = body.to_string();

        self.execute(group, true, || {
            let request = self
                .client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
            self.sign(request, &body)
        })
        .await
    }

    async fn execute<T, B>(&self, group: Group, signed: bool, build: B) -> ExchangeResult<T>
    where
        T: DeserializeOwned,
        B: FnOnce() -> RequestBuilder,
    {
        if signed {
            if self.credentials.is_empty() {
                return Err(ExchangeError::InvalidRequest(
                    "API credentials not configured".to_string(),
                ));
            }
            if self.auth.is_degraded() {
                return Err(ExchangeError::CredentialsDegraded);
            }
        }

        let breaker = self.breakers.get(group.as_str());
        let outcome = breaker
            .call_classified(
                || async move {
                    let response = build()
                        .send()
                        .await
                        .map_err(|e| ExchangeError::Network(e.to_string()))?;
                    decode::<T>(response).await
                },
                ExchangeError::is_transient,
            )
            .await;

        let result = match outcome {
            Ok(value) => Ok(value),
            Err(CircuitError::Open {
                name,
                retry_after_ms,
            }) => Err(ExchangeError::CircuitOpen {
                name,
                retry_after_ms,
            }),
            Err(CircuitError::Inner(e)) => Err(e),
        };

        if let Err(e) = &result {
            if e.is_auth() {
                tracing::warn!("Exchange rejected credentials on {} call: {}", group.as_str(), e);
                self.auth.record_failure();
            }
        }
        result
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> ExchangeResult<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ExchangeError::Network(e.to_string()))?;

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ExchangeError::Auth {
            code: status.as_u16() as i64,
            msg: body,
        });
    }
    if !status.is_success() {
        return Err(ExchangeError::Http {
            status: status.as_u16(),
            body,
        });
    }

    parse_envelope(&body)
}

/// Decode a `{retCode, retMsg, result}` reply. The return code is checked
/// before the result is typed, since error replies carry an empty result.
pub fn parse_envelope<T: DeserializeOwned>(body: &str) -> ExchangeResult<T> {
    let envelope: Envelope<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| ExchangeError::Decode(format!("{}: {}", e, truncate(body, 200))))?;
    let result = envelope.into_result()?;
    serde_json::from_value(result).map_err(|e| ExchangeError::Decode(e.to_string()))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn first<T>(list: ListResult<T>, what: &str, symbol: &str) -> ExchangeResult<T> {
    list.list
        .into_iter()
        .next()
        .ok_or_else(|| ExchangeError::InvalidRequest(format!("no {} for {}", what, symbol)))
}

#[async_trait]
impl Exchange for BybitClient {
    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        let list: ListResult<RawTicker> = self
            .get(
                Group::Market,
                "/v5/market/tickers",
                &[("category", CATEGORY.to_string()), ("symbol", symbol.to_string())],
                false,
            )
            .await?;
        first(list, "ticker", symbol).map(Ticker::from)
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        let list: ListResult<Vec<String>> = self
            .get(
                Group::Market,
                "/v5/market/kline",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
                false,
            )
            .await?;
        parse_klines(list.list)
    }

    async fn get_orderbook(&self, symbol: &str, depth: u32) -> ExchangeResult<OrderBook> {
        let book: RawOrderBook = self
            .get(
                Group::Market,
                "/v5/market/orderbook",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("limit", depth.to_string()),
                ],
                false,
            )
            .await?;
        Ok(book.into())
    }

    async fn get_instrument(&self, symbol: &str) -> ExchangeResult<InstrumentInfo> {
        if let Some(cached) = self.instruments.get(symbol) {
            return Ok(cached.clone());
        }

        let list: ListResult<RawInstrument> = self
            .get(
                Group::Market,
                "/v5/market/instruments-info",
                &[("category", CATEGORY.to_string()), ("symbol", symbol.to_string())],
                false,
            )
            .await?;
        let info: InstrumentInfo = first(list, "instrument", symbol)?.into();
        self.instruments.insert(symbol.to_string(), info.clone());
        Ok(info)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let result: ExchangeResult<serde_json::Value> = self
            .post(
                Group::Position,
                "/v5/position/set-leverage",
                json!({
                    "category": CATEGORY,
                    "symbol": symbol,
                    "buyLeverage": leverage.to_string(),
                    "sellLeverage": leverage.to_string(),
                }),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(ExchangeError::Api { code, .. }) if code == LEVERAGE_NOT_MODIFIED => {
                tracing::debug!("{} leverage already {}x", symbol, leverage);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn place_order(&self, order: &OrderRequest) -> ExchangeResult<OrderAck> {
        if order.qty.is_nan() || order.qty <= 0.0 {
            return Err(ExchangeError::InvalidRequest(format!(
                "order quantity must be positive, got {}",
                order.qty
            )));
        }
        if order.order_type == OrderType::Limit && order.price.is_none() {
            return Err(ExchangeError::InvalidRequest(
                "limit order requires a price".to_string(),
            ));
        }

        let body = CreateOrderBody {
            category: CATEGORY,
            symbol: order.symbol.clone(),
            side: order.side.as_str(),
            order_type: order.order_type.as_str(),
            qty: format_decimal(order.qty),
            price: order.price.map(format_decimal),
            position_idx: order.position_idx,
            reduce_only: order.reduce_only,
            time_in_force: match order.order_type {
                OrderType::Market => "IOC",
                OrderType::Limit => "GTC",
            },
            order_link_id: uuid::Uuid::new_v4().to_string(),
            stop_loss: order.stop_loss.map(format_decimal),
            take_profit: order.take_profit.map(format_decimal),
        };

        tracing::info!(
            "Submitting {} {} {} qty={} reduce_only={}",
            body.order_type,
            body.side,
            body.symbol,
            body.qty,
            body.reduce_only
        );

        let payload =
            serde_json::to_value(&body).map_err(|e| ExchangeError::Decode(e.to_string()))?;
        let ack: RawOrderAck = self.post(Group::Trade, "/v5/order/create", payload).await?;
        tracing::info!("Order accepted: {}", ack.order_id);
        Ok(ack.into())
    }

    async fn get_positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ExchangePosition>> {
        let mut params = vec![("category", CATEGORY.to_string())];
        match symbol {
            Some(s) => params.push(("symbol", s.to_string())),
            None => params.push(("settleCoin", SETTLE_COIN.to_string())),
        }

        let list: ListResult<RawPosition> = self
            .get(Group::Position, "/v5/position/list", &params, true)
            .await?;
        Ok(list.list.into_iter().filter_map(RawPosition::into_position).collect())
    }

    async fn get_wallet_balance(&self) -> ExchangeResult<WalletBalance> {
        let list: ListResult<RawWallet> = self
            .get(
                Group::Account,
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
                true,
            )
            .await?;
        first(list, "wallet", "UNIFIED").map(WalletBalance::from)
    }

    async fn set_trading_stop(&self, request: &TradingStopRequest) -> ExchangeResult<()> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "positionIdx": request.position_idx,
            "tpslMode": "Full",
        });
        let fields = [
            ("stopLoss", request.stop_loss),
            ("takeProfit", request.take_profit),
            ("trailingStop", request.trailing_stop),
            ("activePrice", request.active_price),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                body[key] = json!(format_decimal(v));
            }
        }

        let _: serde_json::Value = self
            .post(Group::Position, "/v5/position/trading-stop", body)
            .await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        let body = match symbol {
            Some(s) => json!({ "category": CATEGORY, "symbol": s }),
            None => json!({ "category": CATEGORY, "settleCoin": SETTLE_COIN }),
        };
        let _: serde_json::Value = self.post(Group::Trade, "/v5/order/cancel-all", body).await?;
        Ok(())
    }

    async fn get_closed_pnl(
        &self,
        symbol: Option<&str>,
        limit: u32,
    ) -> ExchangeResult<Vec<ClosedPnl>> {
        let mut params = vec![
            ("category", CATEGORY.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(s) = symbol {
            params.push(("symbol", s.to_string()));
        }

        let list: ListResult<RawClosedPnl> = self
            .get(Group::Position, "/v5/position/closed-pnl", &params, true)
            .await?;
        Ok(list
            .list
            .into_iter()
            .filter_map(RawClosedPnl::into_closed_pnl)
            .collect())
    }

    fn credentials_degraded(&self) -> bool {
        self.auth.is_degraded()
    }

    fn position_idx(&self, direction: Direction) -> u8 {
        if !self.hedge_mode {
            return 0;
        }
        match direction {
            Direction::Long => 1,
            Direction::Short => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_breaker::CircuitBreakerConfig;
    use std::time::Duration;

    fn offline_config() -> ExchangeConfig {
        ExchangeConfig {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            // Nothing listens on the discard port; connects fail fast.
            base_url: "http://127.0.0.1:9".to_string(),
            auth_failure_threshold: 2,
            request_timeout: Duration::from_secs(2),
            breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(60),
            },
            ..ExchangeConfig::default()
        }
    }

    #[test]
    fn error_envelope_is_checked_before_result_shape() {
        let err = parse_envelope::<RawOrderAck>(
            r#"{"retCode":110007,"retMsg":"ab not enough for new order","result":{}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ExchangeError::Api { code: 110007, .. }));

        let ack = parse_envelope::<RawOrderAck>(
            r#"{"retCode":0,"retMsg":"OK","result":{"orderId":"abc","orderLinkId":"x"}}"#,
        )
        .unwrap();
        assert_eq!(ack.order_id, "abc");

        assert!(matches!(
            parse_envelope::<RawOrderAck>("<html>bad gateway</html>"),
            Err(ExchangeError::Decode(_))
        ));
    }

    #[test]
    fn hedge_mode_position_index() {
        let hedged = BybitClient::new(&offline_config()).unwrap();
        assert_eq!(hedged.position_idx(Direction::Long), 1);
        assert_eq!(hedged.position_idx(Direction::Short), 2);

        let one_way = BybitClient::new(&ExchangeConfig {
            hedge_mode: false,
            ..offline_config()
        })
        .unwrap();
        assert_eq!(one_way.position_idx(Direction::Short), 0);
    }

    #[tokio::test]
    async fn network_failures_open_the_group_breaker() {
        let client = BybitClient::new(&offline_config()).unwrap();

        for _ in 0..2 {
            let err = client.get_ticker("BTCUSDT").await.unwrap_err();
            assert!(matches!(err, ExchangeError::Network(_)), "got {:?}", err);
        }

        let err = client.get_ticker("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, ExchangeError::CircuitOpen { .. }));
        assert!(client.breakers().any_open());

        // Other endpoint groups are unaffected
        let err = client.get_wallet_balance().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Network(_)));
    }

    #[tokio::test]
    async fn degraded_credentials_short_circuit_signed_calls() {
        let client = BybitClient::new(&offline_config()).unwrap();
        client.auth_tracker().record_failure();
        client.auth_tracker().record_failure();
        assert!(client.credentials_degraded());

        let err = client.get_positions(None).await.unwrap_err();
        assert!(matches!(err, ExchangeError::CredentialsDegraded));
    }

    #[tokio::test]
    async fn missing_credentials_rejected_locally() {
        let client = BybitClient::new(&ExchangeConfig {
            api_key: String::new(),
            ..offline_config()
        })
        .unwrap();
        let err = tokio_test::assert_err!(client.get_wallet_balance().await);
        assert!(matches!(err, ExchangeError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn non_positive_quantity_never_reaches_the_wire() {
        let client = BybitClient::new(&offline_config()).unwrap();
        let order = OrderRequest::market("BTCUSDT", trading_core::OrderSide::Buy, 0.0, 1);
        let err = tokio_test::assert_err!(client.place_order(&order).await);
        assert!(matches!(err, ExchangeError::InvalidRequest(_)));
    }
}
