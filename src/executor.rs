// =============================================================================
// Executor — risk-approved orders become fills and trade-history rows
// =============================================================================
//
// The executor is the only component that calls `create_order`. Because
// order placement is not idempotent at the exchange, every order is
// de-duplicated against trade history by `(cycle_id, symbol, action)`
// BEFORE it is issued — re-running a cycle from a checkpoint produces the
// same persisted trades and no new orders.
//
// Position discipline per symbol:
//   no open trade + long/short  -> open
//   open same side              -> skip (position already on)
//   open opposite side          -> close the open trade this cycle; a flip
//                                  completes on a later cycle's decision
//
// Trailing-stop proposals from the risk monitor are issued as reduce-only
// stop orders in live mode; paper mode records them (the simulated book
// has no resting orders to amend).
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cycle::{ApprovedOrder, CycleState, ExecutionOutcome};
use crate::error::EngineResult;
use crate::exchange::ExchangeAdapter;
use crate::store::TradeStore;
use crate::types::{
    OrderRequest, OrderSide, OrderType, PositionSide, TradeAction, TradeRecord, TradeStatus,
    TradingMode,
};

pub struct Executor {
    exchange: Arc<dyn ExchangeAdapter>,
    trades: Arc<dyn TradeStore>,
}

impl Executor {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, trades: Arc<dyn TradeStore>) -> Self {
        Self { exchange, trades }
    }

    /// Execute every approved order and trailing proposal in the state,
    /// recording outcomes into the symbol run records and refreshing
    /// balance and positions at the end.
    pub async fn execute(&self, state: &mut CycleState) -> EngineResult<()> {
        let orders = state.approved_orders.clone();
        for order in &orders {
            if let Err(e) = self.execute_one(state, order).await {
                // One symbol's failure never sinks the batch.
                warn!(symbol = %order.symbol, error = %e, "order execution failed");
                state.record_error("execution", e.kind(), e.to_string());
                state.run_mut(&order.symbol).execution = Some(ExecutionOutcome {
                    action: order.action,
                    order_id: None,
                    amount: 0.0,
                    fill_price: 0.0,
                    fee_paid: 0.0,
                    status: "error".into(),
                    skipped: Some(e.to_string()),
                });
            }
        }

        let proposals = state.trailing_proposals.clone();
        for proposal in &proposals {
            if state.config.trading_mode == TradingMode::Live {
                if let Err(e) = self.amend_stop(state, proposal).await {
                    warn!(symbol = %proposal.symbol, error = %e, "trailing stop amend failed");
                    state.record_error("execution", e.kind(), e.to_string());
                }
            } else {
                info!(
                    symbol = %proposal.symbol,
                    new_stop = proposal.new_stop_price,
                    "trailing stop recorded (paper mode has no resting orders)"
                );
            }
        }

        // Post-trade account snapshot for the status file and next nodes.
        state.balance = self.exchange.fetch_balance().await?;
        state.positions = self.exchange.fetch_positions().await?;
        Ok(())
    }

    async fn execute_one(&self, state: &mut CycleState, order: &ApprovedOrder) -> EngineResult<()> {
        let Some(open_side) = order.action.position_side() else {
            return Ok(()); // wait actions never reach the executor
        };
        let action_label = order.action.to_string();

        // De-dup before any wire traffic: a reprocessed cycle is a no-op.
        if self
            .trades
            .exists(state.bot_id, state.cycle_id, &order.symbol, &action_label)
            .await?
        {
            info!(
                symbol = %order.symbol,
                cycle = state.cycle_id,
                "duplicate order suppressed by (cycle, symbol, action) key"
            );
            state.run_mut(&order.symbol).execution = Some(ExecutionOutcome {
                action: order.action,
                order_id: None,
                amount: 0.0,
                fill_price: 0.0,
                fee_paid: 0.0,
                status: "skipped".into(),
                skipped: Some("duplicate of an already-executed order".into()),
            });
            return Ok(());
        }

        if let Some(open_trade) = self.trades.find_open(state.bot_id, &order.symbol).await? {
            if open_trade.side == open_side {
                state.run_mut(&order.symbol).execution = Some(ExecutionOutcome {
                    action: order.action,
                    order_id: None,
                    amount: 0.0,
                    fill_price: 0.0,
                    fee_paid: 0.0,
                    status: "skipped".into(),
                    skipped: Some(format!("{} position already open", open_trade.side)),
                });
                return Ok(());
            }
            // Opposite signal: close the standing trade this cycle.
            return self.close_open_trade(state, &open_trade).await;
        }

        self.open_position(state, order, open_side).await
    }

    async fn open_position(
        &self,
        state: &mut CycleState,
        order: &ApprovedOrder,
        side: PositionSide,
    ) -> EngineResult<()> {
        let ticker = self.exchange.fetch_ticker(&order.symbol).await?;
        if ticker.last <= 0.0 {
            return Err(crate::error::EngineError::Validation(format!(
                "no usable price for {}",
                order.symbol
            )));
        }

        // allocation is committed margin; notional scales with leverage.
        let notional = order.size_usd * order.leverage;
        let amount = notional / ticker.last;

        let request = OrderRequest {
            symbol: order.symbol.clone(),
            side: match side {
                PositionSide::Long => OrderSide::Buy,
                PositionSide::Short => OrderSide::Sell,
            },
            order_type: OrderType::Market,
            amount,
            price: None,
            params: Some(serde_json::json!({
                "leverage": order.leverage,
                "stop_loss_pct": order.stop_loss_pct,
                "take_profit_pct": order.take_profit_pct,
            })),
        };

        let fill = self.exchange.create_order(&request).await?;
        let fill_price = fill.average_price.unwrap_or(ticker.last);

        let trade = TradeRecord {
            id: Uuid::new_v4(),
            bot_id: state.bot_id,
            symbol: order.symbol.clone(),
            side,
            action: order.action.to_string(),
            entry_price: fill_price,
            exit_price: None,
            amount: fill.filled,
            leverage: order.leverage,
            pnl_usd: None,
            pnl_percent: None,
            fee_paid: Some(fill.fee_paid),
            status: TradeStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            cycle_id: state.cycle_id,
            order_id: Some(fill.id.clone()),
        };
        let inserted = self.trades.record_open(&trade).await?;
        if !inserted {
            // The fill went through but a parallel writer beat us to the
            // row; the unique key guarantees no double-count.
            warn!(symbol = %order.symbol, "trade row already present after fill");
        }

        info!(
            symbol = %order.symbol,
            side = %side,
            amount = fill.filled,
            fill_price,
            fee = fill.fee_paid,
            "position opened"
        );
        state.run_mut(&order.symbol).execution = Some(ExecutionOutcome {
            action: order.action,
            order_id: Some(fill.id),
            amount: fill.filled,
            fill_price,
            fee_paid: fill.fee_paid,
            status: "filled".into(),
            skipped: None,
        });
        Ok(())
    }

    async fn close_open_trade(
        &self,
        state: &mut CycleState,
        open_trade: &TradeRecord,
    ) -> EngineResult<()> {
        let request = OrderRequest {
            symbol: open_trade.symbol.clone(),
            side: match open_trade.side {
                PositionSide::Long => OrderSide::Sell,
                PositionSide::Short => OrderSide::Buy,
            },
            order_type: OrderType::Market,
            amount: open_trade.amount,
            price: None,
            params: Some(serde_json::json!({"reduce_only": true})),
        };

        let fill = self.exchange.create_order(&request).await?;
        let exit_price = fill
            .average_price
            .unwrap_or(open_trade.entry_price);

        let direction = match open_trade.side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        };
        let pnl_usd = (exit_price - open_trade.entry_price) * open_trade.amount * direction;
        let pnl_percent = if open_trade.entry_price > 0.0 {
            (exit_price - open_trade.entry_price) / open_trade.entry_price
                * 100.0
                * direction
                * open_trade.leverage
        } else {
            0.0
        };

        self.trades
            .close_trade(open_trade.id, exit_price, pnl_usd, pnl_percent, fill.fee_paid)
            .await?;

        info!(
            symbol = %open_trade.symbol,
            exit_price,
            pnl_usd,
            "position closed on opposite signal"
        );
        state.run_mut(&open_trade.symbol).execution = Some(ExecutionOutcome {
            action: TradeAction::Wait,
            order_id: Some(fill.id),
            amount: open_trade.amount,
            fill_price: exit_price,
            fee_paid: fill.fee_paid,
            status: "closed".into(),
            skipped: None,
        });
        Ok(())
    }

    /// Live-mode trailing amend: a reduce-only stop order replacing the
    /// previous protective stop.
    async fn amend_stop(
        &self,
        state: &CycleState,
        proposal: &crate::cycle::TrailingStopProposal,
    ) -> EngineResult<()> {
        let position = state
            .positions
            .iter()
            .find(|p| p.symbol == proposal.symbol);
        let Some(position) = position else {
            return Ok(()); // position left while the cycle ran
        };

        let request = OrderRequest {
            symbol: proposal.symbol.clone(),
            side: match proposal.side {
                PositionSide::Long => OrderSide::Sell,
                PositionSide::Short => OrderSide::Buy,
            },
            order_type: OrderType::Limit,
            amount: position.size,
            price: Some(proposal.new_stop_price),
            params: Some(serde_json::json!({
                "reduce_only": true,
                "stop_price": proposal.new_stop_price,
            })),
        };
        let order = self.exchange.create_order(&request).await?;
        info!(
            symbol = %proposal.symbol,
            stop = proposal.new_stop_price,
            order_id = %order.id,
            "trailing stop amended"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("exchange", &self.exchange.id())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::sim::SimExchange;
    use crate::store::MemoryTradeStore;

    fn bot_config() -> BotConfig {
        serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "t",
            "exchange_id": Uuid::new_v4(),
            "workflow_id": Uuid::new_v4()
        }))
        .unwrap()
    }

    fn approved(symbol: &str, action: TradeAction, size_usd: f64, leverage: f64) -> ApprovedOrder {
        ApprovedOrder {
            symbol: symbol.into(),
            action,
            allocation_pct: 5.0,
            leverage,
            size_usd,
            stop_loss_pct: 2.0,
            take_profit_pct: 6.0,
        }
    }

    fn stack(price: f64) -> (Arc<SimExchange>, Arc<PaperExchange>, Arc<MemoryTradeStore>) {
        let sim = Arc::new(SimExchange::new("sim"));
        sim.set_price("BTC/USDT", price);
        let paper = Arc::new(PaperExchange::new(sim.clone(), 0.0, 0.05, 10_000.0));
        (sim, paper, Arc::new(MemoryTradeStore::new()))
    }

    #[tokio::test]
    async fn paper_open_writes_one_trade_and_decrements_balance() {
        let (_, paper, trades) = stack(40_000.0);
        let executor = Executor::new(paper.clone(), trades.clone());

        let mut state = CycleState::new(1, bot_config());
        // 5 % of 10k = 500 USD margin at 3x.
        state.approved_orders = vec![approved("BTC/USDT", TradeAction::Long, 500.0, 3.0)];
        executor.execute(&mut state).await.unwrap();

        let all = trades.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TradeStatus::Open);
        assert_eq!(all[0].cycle_id, 1);
        assert!((all[0].leverage - 3.0).abs() < 1e-9);

        // Balance: margin 500 + fee on 1500 notional at 0.05 % = 0.75.
        assert!((state.balance.available_usd - (10_000.0 - 500.0 - 0.75)).abs() < 1e-6);
        assert_eq!(state.positions.len(), 1);
        assert_eq!(
            state.runs["BTC/USDT"].execution.as_ref().unwrap().status,
            "filled"
        );
    }

    #[tokio::test]
    async fn rerunning_the_cycle_is_idempotent() {
        let (_, paper, trades) = stack(40_000.0);
        let executor = Executor::new(paper.clone(), trades.clone());

        let mut state = CycleState::new(7, bot_config());
        state.approved_orders = vec![approved("BTC/USDT", TradeAction::Long, 500.0, 2.0)];
        executor.execute(&mut state).await.unwrap();

        // Recovery replays the same cycle: same (cycle, symbol, action).
        let mut replay = state.clone();
        executor.execute(&mut replay).await.unwrap();

        assert_eq!(trades.all().len(), 1);
        assert_eq!(
            replay.runs["BTC/USDT"].execution.as_ref().unwrap().status,
            "skipped"
        );
    }

    #[tokio::test]
    async fn same_side_signal_skips_when_position_open() {
        let (_, paper, trades) = stack(40_000.0);
        let executor = Executor::new(paper.clone(), trades.clone());

        let mut first = CycleState::new(1, bot_config());
        let bot_id = first.bot_id;
        first.approved_orders = vec![approved("BTC/USDT", TradeAction::Long, 500.0, 2.0)];
        executor.execute(&mut first).await.unwrap();

        let mut second = CycleState::new(2, bot_config());
        second.bot_id = bot_id;
        second.approved_orders = vec![approved("BTC/USDT", TradeAction::Long, 500.0, 2.0)];
        executor.execute(&mut second).await.unwrap();

        assert_eq!(trades.all().len(), 1);
        let outcome = second.runs["BTC/USDT"].execution.as_ref().unwrap();
        assert!(outcome.skipped.as_ref().unwrap().contains("already open"));
    }

    #[tokio::test]
    async fn opposite_signal_closes_with_pnl() {
        let (sim, paper, trades) = stack(40_000.0);
        let executor = Executor::new(paper.clone(), trades.clone());

        let mut first = CycleState::new(1, bot_config());
        let bot_id = first.bot_id;
        first.approved_orders = vec![approved("BTC/USDT", TradeAction::Long, 400.0, 1.0)];
        executor.execute(&mut first).await.unwrap();

        sim.set_price("BTC/USDT", 44_000.0); // +10 %
        let mut second = CycleState::new(2, bot_config());
        second.bot_id = bot_id;
        second.approved_orders = vec![approved("BTC/USDT", TradeAction::Short, 400.0, 1.0)];
        executor.execute(&mut second).await.unwrap();

        let all = trades.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TradeStatus::Closed);
        let pnl = all[0].pnl_usd.unwrap();
        assert!(pnl > 0.0, "long closed 10% higher must profit, got {pnl}");
        assert!((all[0].pnl_percent.unwrap() - 10.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn execution_error_is_recorded_not_fatal() {
        let (_, paper, trades) = stack(40_000.0);
        let executor = Executor::new(paper, trades.clone());

        let mut state = CycleState::new(1, bot_config());
        // Far beyond the paper balance: the fill layer rejects it.
        state.approved_orders = vec![approved("BTC/USDT", TradeAction::Long, 1_000_000.0, 1.0)];
        executor.execute(&mut state).await.unwrap();

        assert!(trades.all().is_empty());
        assert_eq!(state.errors.len(), 1);
        assert_eq!(
            state.runs["BTC/USDT"].execution.as_ref().unwrap().status,
            "error"
        );
    }
}
