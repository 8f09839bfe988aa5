// =============================================================================
// Sim Exchange — deterministic synthetic venue for tests and backtest seams
// =============================================================================
//
// Prices are a pure function of (symbol, bar index), so two runs over the
// same inputs observe identical market data. Tests poke failure modes in
// directly: `set_price`, `set_funding_rate`, `fail_next_subscribe`.
//
// Orders fill instantly at the current synthetic price. Accounting (balance,
// positions, fees) is NOT simulated here — that is the paper layer's job;
// composing `PaperExchange` over `SimExchange` is the standard test stack.
// =============================================================================

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::exchange::{ExchangeAdapter, PublicTrade, StreamChannel, StreamEvent};
use crate::types::{
    Balance, MarketCatalogue, MarketInfo, Ohlcv, Order, OrderBook, OrderRequest, Position, Ticker,
};

/// Fixed epoch for synthetic bar timestamps (2024-01-01T00:00:00Z, ms).
const SIM_EPOCH_MS: i64 = 1_704_067_200_000;

struct SimState {
    prices: HashMap<String, f64>,
    funding_rates: HashMap<String, f64>,
    open_interest: HashMap<String, f64>,
    fail_next_subscribe: HashSet<(String, StreamChannel)>,
    next_order_id: u64,
}

/// Deterministic synthetic exchange.
pub struct SimExchange {
    id: String,
    state: RwLock<SimState>,
}

impl SimExchange {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: RwLock::new(SimState {
                prices: HashMap::new(),
                funding_rates: HashMap::new(),
                open_interest: HashMap::new(),
                fail_next_subscribe: HashSet::new(),
                next_order_id: 1,
            }),
        }
    }

    /// Base price for a symbol: preset for the majors, derived from the
    /// symbol text for everything else so it is stable across runs.
    fn base_price(symbol: &str) -> f64 {
        match symbol {
            "BTC/USDT" => 40_000.0,
            "ETH/USDT" => 2_500.0,
            "SOL/USDT" => 100.0,
            "BNB/USDT" => 300.0,
            "XRP/USDT" => 0.60,
            other => {
                let h: u32 = other.bytes().fold(17u32, |acc, b| {
                    acc.wrapping_mul(31).wrapping_add(b as u32)
                });
                1.0 + (h % 1000) as f64 / 10.0
            }
        }
    }

    /// Price of bar `i` for a symbol: a gentle deterministic oscillation
    /// around the base with a slow upward drift.
    fn bar_close(symbol: &str, i: u32) -> f64 {
        let base = Self::base_price(symbol);
        let wave = (i as f64 / 10.0).sin() * 0.01;
        let drift = i as f64 * 0.0002;
        base * (1.0 + wave + drift)
    }

    fn timeframe_ms(timeframe: &str) -> i64 {
        let (digits, unit): (String, String) =
            timeframe.chars().partition(|c| c.is_ascii_digit());
        let n: i64 = digits.parse().unwrap_or(1);
        let unit_ms = match unit.as_str() {
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => 60_000,
        };
        n * unit_ms
    }

    // -------------------------------------------------------------------------
    // Test hooks
    // -------------------------------------------------------------------------

    /// Pin the live price of a symbol.
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state.write().prices.insert(symbol.to_string(), price);
    }

    /// Pin the funding rate (percent) of a symbol.
    pub fn set_funding_rate(&self, symbol: &str, rate_pct: f64) {
        self.state
            .write()
            .funding_rates
            .insert(symbol.to_string(), rate_pct);
    }

    /// Pin the open interest of a symbol.
    pub fn set_open_interest(&self, symbol: &str, oi: f64) {
        self.state
            .write()
            .open_interest
            .insert(symbol.to_string(), oi);
    }

    /// Make the next `watch` call for `(symbol, channel)` fail once.
    pub fn fail_next_subscribe(&self, symbol: &str, channel: StreamChannel) {
        self.state
            .write()
            .fail_next_subscribe
            .insert((symbol.to_string(), channel));
    }

    fn current_price(&self, symbol: &str) -> f64 {
        self.state
            .read()
            .prices
            .get(symbol)
            .copied()
            .unwrap_or_else(|| Self::bar_close(symbol, 200))
    }
}

#[async_trait]
impl ExchangeAdapter for SimExchange {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load_markets(&self) -> EngineResult<MarketCatalogue> {
        let presets = [
            ("BTC/USDT", 1_200_000_000.0),
            ("ETH/USDT", 800_000_000.0),
            ("SOL/USDT", 300_000_000.0),
            ("BNB/USDT", 150_000_000.0),
            ("XRP/USDT", 90_000_000.0),
        ];

        let mut catalogue = MarketCatalogue::new();
        for (symbol, volume) in presets {
            let (base, quote) = symbol.split_once('/').expect("preset symbols are well-formed");
            catalogue.insert(
                symbol.to_string(),
                MarketInfo {
                    symbol: symbol.to_string(),
                    base: base.to_string(),
                    quote: quote.to_string(),
                    active: true,
                    min_notional: Some(10.0),
                    quote_volume_24h: volume,
                },
            );
        }
        Ok(catalogue)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> EngineResult<Vec<Ohlcv>> {
        let step = Self::timeframe_ms(timeframe);
        let mut bars = Vec::with_capacity(limit as usize);
        for i in 0..limit {
            let close = Self::bar_close(symbol, i);
            let open = if i == 0 {
                close
            } else {
                Self::bar_close(symbol, i - 1)
            };
            let high = open.max(close) * 1.001;
            let low = open.min(close) * 0.999;
            bars.push(Ohlcv {
                ts: SIM_EPOCH_MS + step * i as i64,
                open,
                high,
                low,
                close,
                volume: 1_000.0 + (i % 10) as f64 * 100.0,
            });
        }
        Ok(bars)
    }

    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker> {
        let last = self.current_price(symbol);
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            bid: last * 0.9995,
            ask: last * 1.0005,
            ts: SIM_EPOCH_MS,
        })
    }

    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> EngineResult<OrderBook> {
        let mid = self.current_price(symbol);
        let levels = depth.min(50) as usize;
        let bids = (1..=levels)
            .map(|i| (mid * (1.0 - 0.0005 * i as f64), 1.0 + i as f64 * 0.1))
            .collect();
        let asks = (1..=levels)
            .map(|i| (mid * (1.0 + 0.0005 * i as f64), 1.0 + i as f64 * 0.1))
            .collect();
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids,
            asks,
            ts: SIM_EPOCH_MS,
        })
    }

    async fn fetch_open_interest(&self, symbol: &str) -> EngineResult<f64> {
        Ok(self
            .state
            .read()
            .open_interest
            .get(symbol)
            .copied()
            .unwrap_or(1_000_000.0))
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> EngineResult<f64> {
        Ok(self
            .state
            .read()
            .funding_rates
            .get(symbol)
            .copied()
            .unwrap_or(0.01))
    }

    async fn fetch_balance(&self) -> EngineResult<Balance> {
        Ok(Balance {
            total_usd: 10_000.0,
            available_usd: 10_000.0,
        })
    }

    async fn fetch_positions(&self) -> EngineResult<Vec<Position>> {
        Ok(Vec::new())
    }

    async fn create_order(&self, request: &OrderRequest) -> EngineResult<Order> {
        let price = request
            .price
            .unwrap_or_else(|| self.current_price(&request.symbol));
        let id = {
            let mut state = self.state.write();
            let id = state.next_order_id;
            state.next_order_id += 1;
            id
        };
        debug!(symbol = %request.symbol, side = %request.side, amount = request.amount, "sim order filled");
        Ok(Order {
            id: format!("sim-{id}"),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            amount: request.amount,
            price: request.price,
            filled: request.amount,
            average_price: Some(price),
            fee_paid: 0.0,
            status: "filled".to_string(),
            ts: SIM_EPOCH_MS,
        })
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn watch(
        &self,
        symbol: &str,
        channel: StreamChannel,
        events: mpsc::Sender<StreamEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> EngineResult<()> {
        // One-shot injected failure for reconnect tests.
        {
            let mut state = self.state.write();
            if state
                .fail_next_subscribe
                .remove(&(symbol.to_string(), channel))
            {
                return Err(EngineError::Transient(format!(
                    "injected subscribe failure for {symbol}/{channel}"
                )));
            }
        }

        let mut tick = tokio::time::interval(std::time::Duration::from_millis(100));
        let mut seq = 0u32;
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    seq += 1;
                    let last = self.current_price(symbol);
                    let event = match channel {
                        StreamChannel::Ticker => StreamEvent::Ticker(Ticker {
                            symbol: symbol.to_string(),
                            last,
                            bid: last * 0.9995,
                            ask: last * 1.0005,
                            ts: SIM_EPOCH_MS + seq as i64,
                        }),
                        StreamChannel::Trades => StreamEvent::Trade(PublicTrade {
                            symbol: symbol.to_string(),
                            price: last,
                            amount: 0.1,
                            is_buyer_maker: seq % 2 == 0,
                            ts: SIM_EPOCH_MS + seq as i64,
                        }),
                    };
                    if events.send(event).await.is_err() {
                        // Receiver gone — the subscription was torn down.
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SimExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimExchange").field("id", &self.id).finish()
    }
}
