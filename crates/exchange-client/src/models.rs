//! Wire types for the v5 REST API and their conversion into core types.
//!
//! The exchange encodes every number as a string; empty strings mean
//! "unset". Conversions parse leniently and treat unparseable fields as
//! absent rather than failing the whole response.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use trading_core::{
    Candle, ClosedPnl, ExchangeError, ExchangePosition, ExchangeResult, InstrumentInfo, OrderAck,
    OrderBook, OrderBookLevel, OrderSide, Ticker, WalletBalance,
};

/// Return codes that mean the credentials themselves were refused
pub const AUTH_RET_CODES: [i64; 4] = [10003, 10004, 10005, 33004];

/// "Leverage not modified": the requested leverage is already set
pub const LEVERAGE_NOT_MODIFIED: i64 = 110043;

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    pub result: Option<T>,
}

impl<T> Envelope<T> {
    pub fn into_result(self) -> ExchangeResult<T> {
        if self.ret_code != 0 {
            return Err(if AUTH_RET_CODES.contains(&self.ret_code) {
                ExchangeError::Auth {
                    code: self.ret_code,
                    msg: self.ret_msg,
                }
            } else {
                ExchangeError::Api {
                    code: self.ret_code,
                    msg: self.ret_msg,
                }
            });
        }
        self.result
            .ok_or_else(|| ExchangeError::Decode("missing result".to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

fn num(s: &str) -> Option<f64> {
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn num_or_zero(s: &str) -> f64 {
    num(s).unwrap_or(0.0)
}

/// Positive value or None; the exchange reports "0" for unset stops
fn price_opt(s: &str) -> Option<f64> {
    num(s).filter(|v| *v > 0.0)
}

fn millis(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTicker {
    pub symbol: String,
    #[serde(default)]
    pub last_price: String,
    #[serde(default)]
    pub mark_price: String,
    #[serde(default)]
    pub bid1_price: String,
    #[serde(default)]
    pub ask1_price: String,
    #[serde(default)]
    pub volume24h: String,
    #[serde(default)]
    pub turnover24h: String,
    #[serde(default)]
    pub price24h_pcnt: String,
    #[serde(default)]
    pub funding_rate: String,
}

impl From<RawTicker> for Ticker {
    fn from(t: RawTicker) -> Self {
        let last = num_or_zero(&t.last_price);
        Ticker {
            symbol: t.symbol,
            last_price: last,
            mark_price: num(&t.mark_price).unwrap_or(last),
            bid: num_or_zero(&t.bid1_price),
            ask: num_or_zero(&t.ask1_price),
            volume_24h: num_or_zero(&t.volume24h),
            turnover_24h: num_or_zero(&t.turnover24h),
            price_change_24h_percent: num_or_zero(&t.price24h_pcnt) * 100.0,
            funding_rate: num(&t.funding_rate),
        }
    }
}

/// Kline rows arrive as `[start, open, high, low, close, volume, turnover]`,
/// newest first.
pub fn parse_klines(rows: Vec<Vec<String>>) -> ExchangeResult<Vec<Candle>> {
    let mut candles = rows
        .into_iter()
        .map(|row| {
            if row.len() < 6 {
                return Err(ExchangeError::Decode(format!(
                    "kline row has {} fields",
                    row.len()
                )));
            }
            let open_time = millis(&row[0])
                .ok_or_else(|| ExchangeError::Decode(format!("bad kline time '{}'", row[0])))?;
            Ok(Candle {
                open_time,
                open: num_or_zero(&row[1]),
                high: num_or_zero(&row[2]),
                low: num_or_zero(&row[3]),
                close: num_or_zero(&row[4]),
                volume: num_or_zero(&row[5]),
            })
        })
        .collect::<ExchangeResult<Vec<_>>>()?;
    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOrderBook {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b", default)]
    pub bids: Vec<Vec<String>>,
    #[serde(rename = "a", default)]
    pub asks: Vec<Vec<String>>,
}

impl From<RawOrderBook> for OrderBook {
    fn from(b: RawOrderBook) -> Self {
        let levels = |rows: Vec<Vec<String>>| {
            rows.into_iter()
                .filter_map(|r| match r.as_slice() {
                    [price, size, ..] => Some(OrderBookLevel {
                        price: num(price)?,
                        size: num(size)?,
                    }),
                    _ => None,
                })
                .collect()
        };
        OrderBook {
            symbol: b.symbol,
            bids: levels(b.bids),
            asks: levels(b.asks),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLotSizeFilter {
    #[serde(default)]
    pub qty_step: String,
    #[serde(default)]
    pub min_order_qty: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLeverageFilter {
    #[serde(default)]
    pub max_leverage: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPriceFilter {
    #[serde(default)]
    pub tick_size: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInstrument {
    pub symbol: String,
    pub lot_size_filter: RawLotSizeFilter,
    pub leverage_filter: RawLeverageFilter,
    pub price_filter: RawPriceFilter,
}

impl From<RawInstrument> for InstrumentInfo {
    fn from(i: RawInstrument) -> Self {
        InstrumentInfo {
            symbol: i.symbol,
            qty_step: num_or_zero(&i.lot_size_filter.qty_step),
            min_order_qty: num_or_zero(&i.lot_size_filter.min_order_qty),
            max_leverage: num(&i.leverage_filter.max_leverage).unwrap_or(1.0),
            tick_size: num_or_zero(&i.price_filter.tick_size),
        }
    }
}

// ---------------------------------------------------------------------------
// Trading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderBody {
    pub category: &'static str,
    pub symbol: String,
    pub side: &'static str,
    pub order_type: &'static str,
    pub qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    pub position_idx: u8,
    pub reduce_only: bool,
    pub time_in_force: &'static str,
    pub order_link_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrderAck {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

impl From<RawOrderAck> for OrderAck {
    fn from(a: RawOrderAck) -> Self {
        OrderAck {
            order_id: a.order_id,
            order_link_id: Some(a.order_link_id).filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub mark_price: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(default)]
    pub unrealised_pnl: String,
    #[serde(default)]
    pub position_idx: u8,
    #[serde(default)]
    pub stop_loss: String,
    #[serde(default)]
    pub take_profit: String,
    #[serde(default)]
    pub trailing_stop: String,
}

impl RawPosition {
    /// Flat slots come back with an empty side and zero size
    pub fn into_position(self) -> Option<ExchangePosition> {
        let size = num_or_zero(&self.size);
        if size <= 0.0 {
            return None;
        }
        let side = self.side.parse::<OrderSide>().ok()?;
        let entry = num_or_zero(&self.avg_price);
        Some(ExchangePosition {
            symbol: self.symbol,
            side,
            size,
            entry_price: entry,
            mark_price: num(&self.mark_price).unwrap_or(entry),
            leverage: num(&self.leverage).unwrap_or(1.0),
            unrealized_pnl: num_or_zero(&self.unrealised_pnl),
            position_idx: self.position_idx,
            stop_loss: price_opt(&self.stop_loss),
            take_profit: price_opt(&self.take_profit),
            trailing_stop: price_opt(&self.trailing_stop),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWallet {
    #[serde(default)]
    pub total_equity: String,
    #[serde(default)]
    pub total_available_balance: String,
    #[serde(default)]
    pub total_perp_upl: String,
}

impl From<RawWallet> for WalletBalance {
    fn from(w: RawWallet) -> Self {
        WalletBalance {
            total_equity: num_or_zero(&w.total_equity),
            available_balance: num_or_zero(&w.total_available_balance),
            unrealized_pnl: num_or_zero(&w.total_perp_upl),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawClosedPnl {
    pub symbol: String,
    /// Side of the closing order
    pub side: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub avg_entry_price: String,
    #[serde(default)]
    pub avg_exit_price: String,
    #[serde(default)]
    pub closed_pnl: String,
    #[serde(default)]
    pub created_time: String,
}

impl RawClosedPnl {
    pub fn into_closed_pnl(self) -> Option<ClosedPnl> {
        // A Sell closes a long and a Buy closes a short.
        let closing = self.side.parse::<OrderSide>().ok()?;
        let direction = match closing {
            OrderSide::Sell => trading_core::Direction::Long,
            OrderSide::Buy => trading_core::Direction::Short,
        };
        Some(ClosedPnl {
            symbol: self.symbol,
            direction,
            qty: num_or_zero(&self.qty),
            avg_entry_price: num_or_zero(&self.avg_entry_price),
            avg_exit_price: num_or_zero(&self.avg_exit_price),
            closed_pnl: num_or_zero(&self.closed_pnl),
            created_at: millis(&self.created_time).unwrap_or_else(Utc::now),
        })
    }
}

// ---------------------------------------------------------------------------
// Number formatting
// ---------------------------------------------------------------------------

/// Plain decimal string with trailing zeros removed
pub fn format_decimal(value: f64) -> String {
    Decimal::from_f64(value)
        .map(|d| d.normalize().to_string())
        .unwrap_or_else(|| value.to_string())
}

/// Round a quantity down to a whole number of lot steps
pub fn round_down_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 || !qty.is_finite() || qty <= 0.0 {
        return qty.max(0.0);
    }
    match (Decimal::from_f64(qty), Decimal::from_f64(step)) {
        (Some(q), Some(s)) if !s.is_zero() => ((q / s).floor() * s)
            .normalize()
            .to_f64()
            .unwrap_or(0.0),
        _ => (qty / step).floor() * step,
    }
}

/// Round a price to the nearest tick
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 || !price.is_finite() {
        return price;
    }
    match (Decimal::from_f64(price), Decimal::from_f64(tick)) {
        (Some(p), Some(t)) if !t.is_zero() => ((p / t).round() * t)
            .normalize()
            .to_f64()
            .unwrap_or(price),
        _ => (price / tick).round() * tick,
    }
}
