use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseEnumError;

/// Trade direction of a signal or position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// +1.0 for long, -1.0 for short. Multiplying a price move by this gives
    /// the move in the position's favour.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn exit_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Direction::Long),
            "short" | "sell" => Ok(Direction::Short),
            other => Err(ParseEnumError::new("direction", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }

    /// Direction of the position this side holds when the order opens it
    pub fn direction(&self) -> Direction {
        match self {
            OrderSide::Buy => Direction::Long,
            OrderSide::Sell => Direction::Short,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(ParseEnumError::new("order side", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }
}

impl FromStr for OrderType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            other => Err(ParseEnumError::new("order type", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Approved,
    Executed,
    Rejected,
    Expired,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Approved => "approved",
            SignalStatus::Executed => "executed",
            SignalStatus::Rejected => "rejected",
            SignalStatus::Expired => "expired",
        }
    }

    /// Legal lifecycle edges: a signal leaves `pending` exactly once, and an
    /// `approved` signal always ends as `executed` or `rejected`.
    pub fn can_transition_to(&self, next: SignalStatus) -> bool {
        matches!(
            (self, next),
            (SignalStatus::Pending, SignalStatus::Approved)
                | (SignalStatus::Pending, SignalStatus::Rejected)
                | (SignalStatus::Pending, SignalStatus::Expired)
                | (SignalStatus::Approved, SignalStatus::Executed)
                | (SignalStatus::Approved, SignalStatus::Rejected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SignalStatus::Executed | SignalStatus::Rejected | SignalStatus::Expired
        )
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SignalStatus::Pending),
            "approved" => Ok(SignalStatus::Approved),
            "executed" => Ok(SignalStatus::Executed),
            "rejected" => Ok(SignalStatus::Rejected),
            "expired" => Ok(SignalStatus::Expired),
            other => Err(ParseEnumError::new("signal status", other)),
        }
    }
}

/// One independent scoring dimension fused into signal confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Technical,
    OrderFlow,
    Liquidation,
    Sentiment,
    Ml,
    Timing,
}

impl Layer {
    pub const ALL: [Layer; 6] = [
        Layer::Technical,
        Layer::OrderFlow,
        Layer::Liquidation,
        Layer::Sentiment,
        Layer::Ml,
        Layer::Timing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Technical => "technical",
            Layer::OrderFlow => "order_flow",
            Layer::Liquidation => "liquidation",
            Layer::Sentiment => "sentiment",
            Layer::Ml => "ml",
            Layer::Timing => "timing",
        }
    }

    /// Default fusion weight; the six defaults sum to 1.0
    pub fn default_weight(&self) -> f64 {
        match self {
            Layer::Technical => 0.35,
            Layer::OrderFlow => 0.20,
            Layer::Liquidation => 0.15,
            Layer::Sentiment => 0.10,
            Layer::Ml => 0.15,
            Layer::Timing => 0.05,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Layer::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("layer", s))
    }
}

/// Output of a layer scorer.
///
/// `score` is conviction, 0-100, and says nothing about side; `lean` is the
/// side the layer's evidence points to, None when it has no view. For the
/// liquidation layer the lean is the side being liquidated.
///
/// `degraded` is set when the scorer failed and the reading is the neutral
/// fallback rather than a real measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerReading {
    pub score: f64,
    pub reason: String,
    #[serde(default)]
    pub lean: Option<Direction>,
    #[serde(default)]
    pub degraded: bool,
}

impl LayerReading {
    pub const NEUTRAL: f64 = 50.0;

    pub fn new(score: f64, reason: impl Into<String>) -> Self {
        let score = if score.is_finite() {
            score.clamp(0.0, 100.0)
        } else {
            Self::NEUTRAL
        };
        Self {
            score,
            reason: reason.into(),
            lean: None,
            degraded: false,
        }
    }

    pub fn neutral(reason: impl Into<String>) -> Self {
        Self {
            score: Self::NEUTRAL,
            reason: reason.into(),
            lean: None,
            degraded: true,
        }
    }

    pub fn leaning(mut self, direction: Direction) -> Self {
        self.lean = Some(direction);
        self
    }
}

/// A layer's part in a persisted signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerContribution {
    pub layer: Layer,
    pub score: f64,
    pub weight: f64,
    pub reason: String,
    #[serde(default)]
    pub lean: Option<Direction>,
    #[serde(default)]
    pub degraded: bool,
}

/// A proposed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Option<i64>,
    pub symbol: String,
    pub direction: Direction,
    /// Weighted confidence, 0-100
    pub confidence: f64,
    /// Mean of the three strongest layer scores, 0-100
    pub strength: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: [f64; 3],
    pub risk_reward: f64,
    /// Margin to commit, USD
    pub position_size_usd: f64,
    pub leverage: u32,
    pub layers: Vec<LayerContribution>,
    pub tier: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SignalStatus,
    pub status_reason: Option<String>,
}

impl Signal {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Open,
    Closing,
    Closed,
    Cancelled,
    Liquidated,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Open => "open",
            ExecutionStatus::Closing => "closing",
            ExecutionStatus::Closed => "closed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Liquidated => "liquidated",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::Open | ExecutionStatus::Closing
        )
    }

    /// Ended with a fill on both sides, so it counts toward trade statistics
    pub fn is_settled(&self) -> bool {
        matches!(self, ExecutionStatus::Closed | ExecutionStatus::Liquidated)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "open" => Ok(ExecutionStatus::Open),
            "closing" => Ok(ExecutionStatus::Closing),
            "closed" => Ok(ExecutionStatus::Closed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "liquidated" => Ok(ExecutionStatus::Liquidated),
            other => Err(ParseEnumError::new("execution status", other)),
        }
    }
}

/// One open or closed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Option<i64>,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub side: OrderSide,
    pub direction: Direction,
    pub order_type: OrderType,
    pub order_id: Option<String>,
    pub requested_leverage: u32,
    /// Leverage the exchange accepted; all margin and P&L math uses this
    pub actual_leverage: u32,
    pub quantity: f64,
    pub notional_usd: f64,
    pub margin_used: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub unrealized_pnl: f64,
    pub funding_fees: f64,
    pub trading_fees: f64,
    pub status: ExecutionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub excursion: Excursion,
    pub close_reason: Option<String>,
}

/// Best and worst unrealized moves over a position's life, in percent of
/// entry price (MFE >= 0, MAE <= 0), plus the prices where they occurred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Excursion {
    pub mfe_percent: f64,
    pub mae_percent: f64,
    pub mfe_price: Option<f64>,
    pub mae_price: Option<f64>,
}

/// Final values written when a position closes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionClose {
    pub status: ExecutionStatus,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub trading_fees: f64,
    pub closed_at: DateTime<Utc>,
    pub excursion: Excursion,
    pub close_reason: String,
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

/// Risk snapshot for one trading day (UTC)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub date: NaiveDate,
    pub starting_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub daily_pnl: f64,
    pub daily_pnl_percent: f64,
    pub trades_count: u32,
    pub wins: u32,
    pub losses: u32,
    pub current_drawdown_percent: f64,
    pub max_drawdown_percent: f64,
    pub open_positions: u32,
    pub total_exposure_usd: f64,
    pub max_single_exposure_usd: f64,
    pub avg_leverage: f64,
    pub max_leverage: f64,
    pub daily_loss_limit_percent: f64,
    pub max_drawdown_limit_percent: f64,
    pub max_positions: u32,
    pub max_position_size_percent: f64,
    pub emergency_stop_triggered: bool,
    pub trading_enabled: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RiskMetrics {
    /// Empty record for a new day, trading enabled, no limits filled in
    pub fn new_day(date: NaiveDate, balance: f64, now: DateTime<Utc>) -> Self {
        Self {
            date,
            starting_balance: balance,
            current_balance: balance,
            peak_balance: balance,
            daily_pnl: 0.0,
            daily_pnl_percent: 0.0,
            trades_count: 0,
            wins: 0,
            losses: 0,
            current_drawdown_percent: 0.0,
            max_drawdown_percent: 0.0,
            open_positions: 0,
            total_exposure_usd: 0.0,
            max_single_exposure_usd: 0.0,
            avg_leverage: 0.0,
            max_leverage: 0.0,
            daily_loss_limit_percent: 0.0,
            max_drawdown_limit_percent: 0.0,
            max_positions: 0,
            max_position_size_percent: 0.0,
            emergency_stop_triggered: false,
            trading_enabled: true,
            paused_until: None,
            updated_at: now,
        }
    }

    /// Whether the emergency pause is still running at `now`
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.map(|until| now < until).unwrap_or(false)
    }
}

/// Outcome of the admission gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheck {
    pub can_trade: bool,
    pub reason: String,
    pub warnings: Vec<String>,
}

impl RiskCheck {
    pub fn allowed(warnings: Vec<String>) -> Self {
        Self {
            can_trade: true,
            reason: "Trade meets all risk criteria".to_string(),
            warnings,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            can_trade: false,
            reason: reason.into(),
            warnings: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
            AlertSeverity::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SignalCreated,
    TradeExecuted,
    PositionClosed,
    DrawdownLimit,
    DailyLossLimit,
    EmergencyStop,
    EmergencyCleared,
    CredentialsDegraded,
    /// A position is open on the exchange without an execution record
    ExecutionUnrecorded,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::SignalCreated => "signal_created",
            AlertKind::TradeExecuted => "trade_executed",
            AlertKind::PositionClosed => "position_closed",
            AlertKind::DrawdownLimit => "drawdown_limit",
            AlertKind::DailyLossLimit => "daily_loss_limit",
            AlertKind::EmergencyStop => "emergency_stop",
            AlertKind::EmergencyCleared => "emergency_cleared",
            AlertKind::CredentialsDegraded => "credentials_degraded",
            AlertKind::ExecutionUnrecorded => "execution_unrecorded",
        }
    }
}

/// Structured alert event handed to the alert sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub voice_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            title: title.into(),
            message: message.into(),
            voice_text: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_voice(mut self, text: impl Into<String>) -> Self {
        self.voice_text = Some(text.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Scanner observability
// ---------------------------------------------------------------------------

/// Result of one pass over a tier's symbol set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub tier: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub symbols_scanned: u32,
    pub signals_found: u32,
    pub errors: u32,
}

// ---------------------------------------------------------------------------
// Exchange data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub mark_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
    pub turnover_24h: f64,
    pub price_change_24h_percent: f64,
    pub funding_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

/// An open position as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub position_idx: u8,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub trailing_stop: Option<f64>,
}

impl ExchangePosition {
    pub fn direction(&self) -> Direction {
        self.side.direction()
    }

    pub fn notional(&self) -> f64 {
        self.size * self.mark_price
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBalance {
    pub total_equity: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub qty_step: f64,
    pub min_order_qty: f64,
    pub max_leverage: f64,
    pub tick_size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub position_idx: u8,
    pub reduce_only: bool,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, qty: f64, position_idx: u8) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            position_idx,
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn reduce_only_limit(
        symbol: impl Into<String>,
        side: OrderSide,
        qty: f64,
        price: f64,
        position_idx: u8,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            position_idx,
            reduce_only: true,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub order_link_id: Option<String>,
}

/// Combined stop-loss / take-profit / trailing-stop update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingStopRequest {
    pub symbol: String,
    pub position_idx: u8,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Trailing distance in price units
    pub trailing_stop: Option<f64>,
    /// Price at which the trailing stop activates
    pub active_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPnl {
    pub symbol: String,
    /// Direction of the position that was closed
    pub direction: Direction,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub avg_exit_price: f64,
    pub closed_pnl: f64,
    pub created_at: DateTime<Utc>,
}
