// =============================================================================
// Paper Exchange — simulated fill layer over a live data adapter
// =============================================================================
//
// Paper mode composes the live adapter (real market data) with a local fill
// simulator: orders never leave the process, balances and positions are
// tracked here, and fills are priced off the live ticker with configured
// slippage plus the commission rate (0.05 % default).
//
// Accounting rules:
//   open  — margin = notional / leverage; available -= margin + fee
//   close — pnl realised into the balance; margin released
//
// At most one position per symbol; an opposite-side order with
// `reduce_only` closes (part of) the existing position.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::exchange::{ExchangeAdapter, StreamChannel, StreamEvent};
use crate::types::{
    Balance, MarketCatalogue, Ohlcv, Order, OrderBook, OrderRequest, OrderSide, Position,
    PositionSide, Ticker,
};

struct PaperAccount {
    balance: Balance,
    positions: HashMap<String, Position>,
}

/// Simulated-fill wrapper; market data passes straight through to `live`.
pub struct PaperExchange {
    live: Arc<dyn ExchangeAdapter>,
    slippage_pct: f64,
    fee_pct: f64,
    account: RwLock<PaperAccount>,
}

impl PaperExchange {
    pub fn new(
        live: Arc<dyn ExchangeAdapter>,
        slippage_pct: f64,
        fee_pct: f64,
        starting_balance_usd: f64,
    ) -> Self {
        info!(
            exchange = live.id(),
            starting_balance_usd, slippage_pct, fee_pct, "paper fill layer initialised"
        );
        Self {
            live,
            slippage_pct,
            fee_pct,
            account: RwLock::new(PaperAccount {
                balance: Balance {
                    total_usd: starting_balance_usd,
                    available_usd: starting_balance_usd,
                },
                positions: HashMap::new(),
            }),
        }
    }

    /// Fill price after slippage: buys pay up, sells receive less.
    fn slipped(&self, side: OrderSide, price: f64) -> f64 {
        let factor = self.slippage_pct / 100.0;
        match side {
            OrderSide::Buy => price * (1.0 + factor),
            OrderSide::Sell => price * (1.0 - factor),
        }
    }

    fn order_leverage(request: &OrderRequest) -> f64 {
        request
            .params
            .as_ref()
            .and_then(|p| p.get("leverage"))
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0)
            .max(1.0)
    }

    fn is_reduce_only(request: &OrderRequest) -> bool {
        request
            .params
            .as_ref()
            .and_then(|p| p.get("reduce_only"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn open_fill(
        &self,
        request: &OrderRequest,
        fill_price: f64,
        leverage: f64,
    ) -> EngineResult<f64> {
        let notional = fill_price * request.amount;
        let fee = notional * self.fee_pct / 100.0;
        let margin = notional / leverage;

        let mut account = self.account.write();
        if account.balance.available_usd < margin + fee {
            return Err(EngineError::Validation(format!(
                "insufficient paper balance: need {:.2}, have {:.2}",
                margin + fee,
                account.balance.available_usd
            )));
        }

        let side = match request.side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        let entry = account.positions.entry(request.symbol.clone());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut existing) => {
                let pos = existing.get_mut();
                if pos.side != side {
                    return Err(EngineError::Validation(format!(
                        "opposite-side open for {} while a {} position exists; close it first",
                        request.symbol, pos.side
                    )));
                }
                // Same-side add: average the entry.
                let total = pos.size + request.amount;
                pos.entry_price =
                    (pos.entry_price * pos.size + fill_price * request.amount) / total;
                pos.size = total;
                pos.margin_used += margin;
                pos.mark_price = fill_price;
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Position {
                    symbol: request.symbol.clone(),
                    side,
                    size: request.amount,
                    entry_price: fill_price,
                    mark_price: fill_price,
                    leverage,
                    margin_used: margin,
                    unrealized_pnl: 0.0,
                    liquidation_price: None,
                });
            }
        }

        account.balance.available_usd -= margin + fee;
        account.balance.total_usd -= fee;
        Ok(fee)
    }

    fn close_fill(&self, request: &OrderRequest, fill_price: f64) -> EngineResult<f64> {
        let mut account = self.account.write();
        let pos = account
            .positions
            .get_mut(&request.symbol)
            .ok_or_else(|| {
                EngineError::Validation(format!("no open paper position for {}", request.symbol))
            })?;

        let amount = request.amount.min(pos.size);
        let direction = match pos.side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        };
        let pnl = (fill_price - pos.entry_price) * amount * direction;
        let margin_released = pos.margin_used * (amount / pos.size);
        let fee = fill_price * amount * self.fee_pct / 100.0;

        pos.size -= amount;
        pos.margin_used -= margin_released;
        let fully_closed = pos.size <= f64::EPSILON;
        if fully_closed {
            account.positions.remove(&request.symbol);
        }

        account.balance.available_usd += margin_released + pnl - fee;
        account.balance.total_usd += pnl - fee;

        debug!(
            symbol = %request.symbol,
            pnl,
            fee,
            fully_closed,
            "paper position reduced"
        );
        Ok(fee)
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn id(&self) -> &str {
        self.live.id()
    }

    async fn load_markets(&self) -> EngineResult<MarketCatalogue> {
        self.live.load_markets().await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> EngineResult<Vec<Ohlcv>> {
        self.live.fetch_ohlcv(symbol, timeframe, limit).await
    }

    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker> {
        self.live.fetch_ticker(symbol).await
    }

    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> EngineResult<OrderBook> {
        self.live.fetch_order_book(symbol, depth).await
    }

    async fn fetch_open_interest(&self, symbol: &str) -> EngineResult<f64> {
        self.live.fetch_open_interest(symbol).await
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> EngineResult<f64> {
        self.live.fetch_funding_rate(symbol).await
    }

    async fn fetch_balance(&self) -> EngineResult<Balance> {
        Ok(self.account.read().balance)
    }

    async fn fetch_positions(&self) -> EngineResult<Vec<Position>> {
        // Refresh marks from the live ticker so PnL is current.
        let symbols: Vec<String> = self.account.read().positions.keys().cloned().collect();
        let mut marks = HashMap::new();
        for symbol in symbols {
            if let Ok(ticker) = self.live.fetch_ticker(&symbol).await {
                marks.insert(symbol, ticker.last);
            }
        }

        let mut account = self.account.write();
        for (symbol, pos) in account.positions.iter_mut() {
            if let Some(&mark) = marks.get(symbol) {
                pos.mark_price = mark;
                let direction = match pos.side {
                    PositionSide::Long => 1.0,
                    PositionSide::Short => -1.0,
                };
                pos.unrealized_pnl = (mark - pos.entry_price) * pos.size * direction;
            }
        }
        Ok(account.positions.values().cloned().collect())
    }

    async fn create_order(&self, request: &OrderRequest) -> EngineResult<Order> {
        let reference = match request.price {
            Some(price) => price,
            None => self.live.fetch_ticker(&request.symbol).await?.last,
        };
        let fill_price = self.slipped(request.side, reference);
        let leverage = Self::order_leverage(request);

        let fee = if Self::is_reduce_only(request) {
            self.close_fill(request, fill_price)?
        } else {
            self.open_fill(request, fill_price, leverage)?
        };

        Ok(Order {
            id: format!("paper-{}", Uuid::new_v4()),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            amount: request.amount,
            price: request.price,
            filled: request.amount,
            average_price: Some(fill_price),
            fee_paid: fee,
            status: "filled".to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> EngineResult<()> {
        // Paper fills are instantaneous; nothing rests to cancel.
        Ok(())
    }

    async fn watch(
        &self,
        symbol: &str,
        channel: StreamChannel,
        events: mpsc::Sender<StreamEvent>,
        stop: watch::Receiver<bool>,
    ) -> EngineResult<()> {
        self.live.watch(symbol, channel, events, stop).await
    }
}

impl std::fmt::Debug for PaperExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let account = self.account.read();
        f.debug_struct("PaperExchange")
            .field("exchange", &self.live.id())
            .field("balance", &account.balance)
            .field("positions", &account.positions.len())
            .finish()
    }
}
