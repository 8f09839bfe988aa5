// =============================================================================
// execution — orders out, trade history in
// =============================================================================
//
// Terminal node of the standard pipeline. When no `risk_check` node ran
// earlier (the approved-order list is empty but a decision exists), the
// risk table is applied inline first — an unchecked decision can never
// reach `create_order`.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::cycle::CycleState;
use crate::error::EngineResult;
use crate::executor::Executor;
use crate::workflow::plugins::risk_check;
use crate::workflow::registry::NodeMetadata;
use crate::workflow::runtime::{NodeError, PipelineNode, PluginContext};

pub fn metadata() -> NodeMetadata {
    NodeMetadata {
        name: "execution".to_string(),
        display_name: "Execution".to_string(),
        category: "trade".to_string(),
        insert_after: Some("risk_check".to_string()),
        suggested_order: 60,
        requires_llm: false,
        requires_trader: true,
    }
}

pub fn construct(_config: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
    Ok(Arc::new(ExecutionPlugin))
}

struct ExecutionPlugin;

#[async_trait]
impl PipelineNode for ExecutionPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata()
    }

    async fn run(
        &self,
        mut state: CycleState,
        ctx: &PluginContext,
    ) -> Result<CycleState, NodeError> {
        // Inline risk validation for workflows without a risk_check node.
        if state.approved_orders.is_empty() && state.decision.is_some() {
            risk_check::apply_risk_checks(&mut state);
        }
        if state.pause_reason.is_some() {
            return Ok(state); // breaker tripped — nothing executes
        }

        let executor = Executor::new(ctx.exchange.clone(), ctx.trades.clone());
        executor.execute(&mut state).await.map_err(NodeError::from)?;
        Ok(state)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::debate::outputs::{BatchDecision, PortfolioDecision};
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::sim::SimExchange;
    use crate::llm::fallback::PromptCache;
    use crate::llm::LlmFactory;
    use crate::market::cache::MarketCache;
    use crate::market::poll::PollProvider;
    use crate::store::{MemoryTradeStore, TradeStore};
    use crate::types::{Balance, TradeAction, TradeStatus};
    use std::time::Duration;
    use tokio::sync::watch;
    use uuid::Uuid;

    fn bot_config() -> BotConfig {
        serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "t",
            "exchange_id": Uuid::new_v4(),
            "workflow_id": Uuid::new_v4()
        }))
        .unwrap()
    }

    fn paper_context() -> (PluginContext, Arc<MemoryTradeStore>, watch::Sender<bool>) {
        let sim = Arc::new(SimExchange::new("sim"));
        sim.set_price("BTC/USDT", 40_000.0);
        let paper = Arc::new(PaperExchange::new(sim, 0.0, 0.05, 10_000.0));
        let cache = Arc::new(MarketCache::new());
        let poll = Arc::new(PollProvider::new(paper.clone(), cache.clone()));
        let trades = Arc::new(MemoryTradeStore::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let ctx = PluginContext {
            exchange: paper,
            poll,
            cache,
            llm: Arc::new(LlmFactory::new(Vec::new())),
            trades: trades.clone(),
            prompt_cache: Arc::new(PromptCache::new()),
            cancel: cancel_rx,
            node_timeout: Duration::from_secs(30),
        };
        (ctx, trades, cancel_tx)
    }

    fn state_with_decision() -> CycleState {
        let mut state = CycleState::new(1, bot_config());
        state.balance = Balance {
            total_usd: 10_000.0,
            available_usd: 10_000.0,
        };
        state.candidate_symbols = vec!["BTC/USDT".into()];
        state.decision = Some(BatchDecision {
            decisions: vec![PortfolioDecision {
                symbol: "BTC/USDT".into(),
                action: TradeAction::Long,
                allocation_pct: 5.0,
                leverage: Some(3.0),
                stop_loss_pct: 2.0,
                take_profit_pct: 6.0,
                confidence: 75.0,
                rationale: "test".into(),
            }],
            total_allocation_pct: 5.0,
            cash_reserve_pct: 95.0,
            strategy_rationale: "test".into(),
        });
        state
    }

    #[tokio::test]
    async fn decision_without_risk_node_is_validated_inline_and_filled() {
        let (ctx, trades, _cancel) = paper_context();
        let plugin = construct(serde_json::Value::Null).unwrap();

        let out = plugin.run(state_with_decision(), &ctx).await.unwrap();

        let all = trades.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TradeStatus::Open);
        // Margin 500 + fee 0.75 off the paper balance.
        assert!((out.balance.available_usd - (10_000.0 - 500.0 - 0.75)).abs() < 1e-6);
        assert_eq!(out.positions.len(), 1);
    }

    #[tokio::test]
    async fn rejected_decision_executes_nothing() {
        let (ctx, trades, _cancel) = paper_context();
        let plugin = construct(serde_json::Value::Null).unwrap();

        let mut state = state_with_decision();
        state.decision.as_mut().unwrap().decisions[0].allocation_pct = 50.0;

        let out = plugin.run(state, &ctx).await.unwrap();
        assert!(trades.all().is_empty());
        assert!(out
            .errors
            .iter()
            .any(|e| e.message.contains("per-symbol allocation exceeded")));
    }

    #[tokio::test]
    async fn pause_reason_short_circuits_execution() {
        let (ctx, trades, _cancel) = paper_context();
        let plugin = construct(serde_json::Value::Null).unwrap();

        let mut state = state_with_decision();
        state.pause_reason = Some("breaker tripped".into());
        state.approved_orders = vec![]; // decision present, but paused

        plugin.run(state, &ctx).await.unwrap();
        assert!(trades.all().is_empty());
    }
}
