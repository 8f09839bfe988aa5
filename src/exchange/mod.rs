// =============================================================================
// Exchange Layer — adapter seam, rate limiting, paper fills
// =============================================================================
//
// The engine never talks to a venue directly. It consumes the
// `ExchangeAdapter` trait; concrete wire protocols (signing, venue quirks)
// live behind it. This module ships:
//
//   - `rest_public`  — public-market-data adapter for Binance-shaped venues
//                      (order endpoints refuse; paper mode supplies fills)
//   - `paper`        — simulated fill layer composed over any live adapter
//   - `sim`          — deterministic synthetic venue for tests and backtest
//   - `client`       — token-bucket + retry + connection-pool wrapper
//   - `rate_limit`   — the shared per-exchange token bucket
// =============================================================================

pub mod client;
pub mod paper;
pub mod rate_limit;
pub mod rest_public;
pub mod sim;
pub mod ws_feed;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::types::{
    Balance, MarketCatalogue, Ohlcv, Order, OrderBook, OrderRequest, Position, Ticker,
};

// ---------------------------------------------------------------------------
// Streaming types
// ---------------------------------------------------------------------------

/// WebSocket channel kinds the stream manager can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamChannel {
    Ticker,
    Trades,
}

impl std::fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ticker => write!(f, "ticker"),
            Self::Trades => write!(f, "trades"),
        }
    }
}

/// A public trade from the trades stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicTrade {
    pub symbol: String,
    pub price: f64,
    pub amount: f64,
    pub is_buyer_maker: bool,
    pub ts: i64,
}

/// An event delivered by a live subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    Ticker(Ticker),
    Trade(PublicTrade),
}

// ---------------------------------------------------------------------------
// Exchange configuration (durable row)
// ---------------------------------------------------------------------------

fn default_fee_pct() -> f64 {
    0.05
}

fn default_slippage_pct() -> f64 {
    0.02
}

fn default_max_concurrent_requests() -> u32 {
    10
}

/// Durable configuration for one exchange connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub id: Uuid,
    pub name: String,
    /// Venue family: "binance", "bybit", "hyperliquid", "sim", ...
    pub kind: String,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Simulated slippage applied by the paper layer, percent of price.
    #[serde(default = "default_slippage_pct")]
    pub slippage_pct: f64,
    /// Commission applied by the paper layer, percent of notional.
    #[serde(default = "default_fee_pct")]
    pub fee_pct: f64,
    /// Override for the venue's REST quota (requests per minute).
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,
}

// ---------------------------------------------------------------------------
// The adapter seam
// ---------------------------------------------------------------------------

/// Abstract venue capabilities the core consumes. Implementations must be
/// cheap to share behind an `Arc`.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Stable identifier used in logs and metrics.
    fn id(&self) -> &str;

    async fn load_markets(&self) -> EngineResult<MarketCatalogue>;

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32)
        -> EngineResult<Vec<Ohlcv>>;

    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker>;

    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> EngineResult<OrderBook>;

    async fn fetch_open_interest(&self, symbol: &str) -> EngineResult<f64>;

    /// Current funding rate as a percentage (0.01 == 0.01 %).
    async fn fetch_funding_rate(&self, symbol: &str) -> EngineResult<f64>;

    async fn fetch_balance(&self) -> EngineResult<Balance>;

    async fn fetch_positions(&self) -> EngineResult<Vec<Position>>;

    async fn create_order(&self, request: &OrderRequest) -> EngineResult<Order>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()>;

    /// Run a live subscription, forwarding events into `events` until `stop`
    /// flips to `true` or the upstream closes. Implementations must return
    /// promptly after a stop signal (< 1 s).
    async fn watch(
        &self,
        symbol: &str,
        channel: StreamChannel,
        events: mpsc::Sender<StreamEvent>,
        stop: watch::Receiver<bool>,
    ) -> EngineResult<()>;
}

// ---------------------------------------------------------------------------
// Adapter construction
// ---------------------------------------------------------------------------

/// Build the adapter stack for a bot: a live (or synthetic) data source,
/// wrapped in the paper fill layer unless the bot runs live.
pub fn build_adapter(
    config: &ExchangeConfig,
    paper_mode: bool,
    starting_balance_usd: f64,
) -> EngineResult<std::sync::Arc<dyn ExchangeAdapter>> {
    use std::sync::Arc;

    let live: Arc<dyn ExchangeAdapter> = match config.kind.to_ascii_lowercase().as_str() {
        "sim" => Arc::new(sim::SimExchange::new(&config.name)),
        "binance" | "bybit" | "hyperliquid" | "custom" => {
            Arc::new(rest_public::PublicRestExchange::from_config(config)?)
        }
        other => {
            return Err(EngineError::Configuration(format!(
                "unknown exchange kind '{other}'"
            )))
        }
    };

    if paper_mode {
        Ok(Arc::new(paper::PaperExchange::new(
            live,
            config.slippage_pct,
            config.fee_pct,
            starting_balance_usd,
        )))
    } else {
        Ok(live)
    }
}
