// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Modes and lifecycle
// ---------------------------------------------------------------------------

/// How orders produced by a bot are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
    Backtest,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
            Self::Backtest => write!(f, "backtest"),
        }
    }
}

/// Published lifecycle state of a bot worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    Running,
    Idle,
    Error,
    Stopped,
    Unknown,
}

impl Default for BotState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    /// Bar open time, milliseconds since the UNIX epoch.
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest quote for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    /// Last trade price.
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    /// Exchange timestamp, milliseconds since the UNIX epoch.
    pub ts: i64,
}

/// Book snapshot; `(price, quantity)` levels, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub ts: i64,
}

/// One tradable market in the exchange catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub active: bool,
    /// Minimum order notional in quote units, when the venue publishes one.
    #[serde(default)]
    pub min_notional: Option<f64>,
    /// 24 h quote-denominated volume, used for candidate ranking.
    #[serde(default)]
    pub quote_volume_24h: f64,
}

/// The full market catalogue keyed by symbol.
pub type MarketCatalogue = HashMap<String, MarketInfo>;

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Account balance in quote (USD) terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub total_usd: f64,
    pub available_usd: f64,
}

impl Default for Balance {
    fn default() -> Self {
        Self {
            total_usd: 0.0,
            available_usd: 0.0,
        }
    }
}

/// What the decision pipeline wants done with a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Long,
    Short,
    Wait,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

impl TradeAction {
    /// The position side this action opens, when it opens one.
    pub fn position_side(&self) -> Option<PositionSide> {
        match self {
            Self::Long => Some(PositionSide::Long),
            Self::Short => Some(PositionSide::Short),
            Self::Wait => None,
        }
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// An open position as reported by the exchange (or the paper layer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Position size in base units.
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: f64,
    pub margin_used: f64,
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub liquidation_price: Option<f64>,
}

impl Position {
    /// Unrealized PnL as a percentage of margin, signed by direction.
    pub fn unrealized_pnl_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let raw = (self.mark_price - self.entry_price) / self.entry_price * 100.0;
        match self.side {
            PositionSide::Long => raw * self.leverage,
            PositionSide::Short => -raw * self.leverage,
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// An order request handed to the exchange adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Amount in base units.
    pub amount: f64,
    /// Required for limit orders.
    #[serde(default)]
    pub price: Option<f64>,
    /// Venue-specific extras (reduce-only, leverage, stop price, ...).
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

/// An order acknowledged by the exchange (or simulated by the paper layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    #[serde(default)]
    pub price: Option<f64>,
    pub filled: f64,
    #[serde(default)]
    pub average_price: Option<f64>,
    #[serde(default)]
    pub fee_paid: f64,
    pub status: String,
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Trade history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A durable trade record: appended on open, updated in place on close.
///
/// Invariant: for each `(bot_id, symbol)` at most one row has
/// `status = open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    /// The pipeline action that produced this row ("long", "short", "close").
    pub action: String,
    pub entry_price: f64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    /// Amount in base units.
    pub amount: f64,
    pub leverage: f64,
    #[serde(default)]
    pub pnl_usd: Option<f64>,
    #[serde(default)]
    pub pnl_percent: Option<f64>,
    #[serde(default)]
    pub fee_paid: Option<f64>,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Cycle that produced the trade; part of the idempotence key.
    pub cycle_id: i64,
    #[serde(default)]
    pub order_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Published bot status
// ---------------------------------------------------------------------------

/// Eventually-consistent snapshot written by the worker after each cycle and
/// read by the control plane. Never shared in memory — always via the status
/// file, so a crashed worker leaves its last word behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStatus {
    pub bot_id: Uuid,
    pub is_running: bool,
    pub current_cycle: i64,
    #[serde(default)]
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub open_positions: usize,
    pub symbols_trading: Vec<String>,
    pub balance: Balance,
    #[serde(default)]
    pub last_decision: Option<String>,
    pub state: BotState,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl BotStatus {
    /// A blank status for a bot the supervisor has never run.
    pub fn unknown(bot_id: Uuid) -> Self {
        Self {
            bot_id,
            is_running: false,
            current_cycle: 0,
            last_cycle_at: None,
            open_positions: 0,
            symbols_trading: Vec::new(),
            balance: Balance::default(),
            last_decision: None,
            state: BotState::Unknown,
            last_error: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trading_mode_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&TradingMode::Paper).unwrap(), "\"paper\"");
        let m: TradingMode = serde_json::from_str("\"backtest\"").unwrap();
        assert_eq!(m, TradingMode::Backtest);
    }

    #[test]
    fn unrealized_pnl_pct_respects_side_and_leverage() {
        let mut pos = Position {
            symbol: "BTC/USDT".into(),
            side: PositionSide::Long,
            size: 1.0,
            entry_price: 100.0,
            mark_price: 105.0,
            leverage: 3.0,
            margin_used: 33.3,
            unrealized_pnl: 5.0,
            liquidation_price: None,
        };
        assert!((pos.unrealized_pnl_pct() - 15.0).abs() < 1e-9);

        pos.side = PositionSide::Short;
        assert!((pos.unrealized_pnl_pct() + 15.0).abs() < 1e-9);
    }

    #[test]
    fn unrealized_pnl_pct_zero_entry_guard() {
        let pos = Position {
            symbol: "X".into(),
            side: PositionSide::Long,
            size: 1.0,
            entry_price: 0.0,
            mark_price: 10.0,
            leverage: 1.0,
            margin_used: 0.0,
            unrealized_pnl: 0.0,
            liquidation_price: None,
        };
        assert_eq!(pos.unrealized_pnl_pct(), 0.0);
    }

    #[test]
    fn bot_status_roundtrip() {
        let status = BotStatus::unknown(Uuid::new_v4());
        let json = serde_json::to_string(&status).unwrap();
        let back: BotStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, BotState::Unknown);
        assert_eq!(back.current_cycle, 0);
    }
}
