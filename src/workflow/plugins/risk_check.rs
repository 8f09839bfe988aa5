// =============================================================================
// risk_check — explicit risk validation node
// =============================================================================
//
// Validates the batch decision against the bot's limits and proposes
// trailing stops. Optional in a workflow: the execution node performs the
// same validation inline when no approved orders are present, so no order
// can ever reach the exchange unchecked.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::info;

use crate::cycle::CycleState;
use crate::error::{EngineResult, ErrorKind};
use crate::risk_monitor::RiskMonitor;
use crate::workflow::registry::NodeMetadata;
use crate::workflow::runtime::{NodeError, PipelineNode, PluginContext};

pub fn metadata() -> NodeMetadata {
    NodeMetadata {
        name: "risk_check".to_string(),
        display_name: "Risk Check".to_string(),
        category: "risk".to_string(),
        insert_after: Some("batch_decision".to_string()),
        suggested_order: 50,
        requires_llm: false,
        requires_trader: false,
    }
}

pub fn construct(_config: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
    Ok(Arc::new(RiskCheckPlugin))
}

struct RiskCheckPlugin;

/// Funding rates per symbol out of the indicator snapshots.
fn funding_map(state: &CycleState) -> HashMap<String, f64> {
    state
        .runs
        .iter()
        .filter_map(|(symbol, run)| {
            run.indicators
                .as_ref()
                .and_then(|ind| ind.funding_rate_pct)
                .map(|rate| (symbol.clone(), rate))
        })
        .collect()
}

/// Shared by this node and the execution node's inline validation.
pub fn apply_risk_checks(state: &mut CycleState) {
    let Some(decision) = state.decision.clone() else {
        return;
    };
    let monitor = RiskMonitor::new(state.config.risk_limits.clone());
    let funding = funding_map(state);

    let verdict = monitor.validate(
        &decision,
        &state.balance,
        &state.positions,
        &funding,
        &state.performance,
    );

    for rejection in &verdict.rejected {
        state.record_error("risk_check", ErrorKind::Validation, rejection.reason.clone());
        state.skip_symbol(&rejection.symbol, rejection.reason.clone());
    }
    if let Some(reason) = &verdict.pause {
        state.pause_reason = Some(reason.clone());
    }

    state.trailing_proposals = monitor.propose_trailing_stops(&state.positions);
    info!(
        approved = verdict.approved.len(),
        rejected = verdict.rejected.len(),
        trailing = state.trailing_proposals.len(),
        "risk checks applied"
    );
    state.approved_orders = verdict.approved;
}

#[async_trait]
impl PipelineNode for RiskCheckPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata()
    }

    async fn run(
        &self,
        mut state: CycleState,
        _ctx: &PluginContext,
    ) -> Result<CycleState, NodeError> {
        apply_risk_checks(&mut state);
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
    use crate::types::{Balance, TradeAction};
    use crate::workflow::runtime::test_context;
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

    fn state_with_decision(allocation: f64) -> CycleState {
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
                allocation_pct: allocation,
                leverage: Some(3.0),
                stop_loss_pct: 2.0,
                take_profit_pct: 6.0,
                confidence: 70.0,
                rationale: "test".into(),
            }],
            total_allocation_pct: allocation,
            cash_reserve_pct: 100.0 - allocation,
            strategy_rationale: "test".into(),
        });
        state
    }

    #[tokio::test]
    async fn approved_orders_land_in_the_state() {
        let (ctx, _cancel) = test_context();
        let plugin = construct(serde_json::Value::Null).unwrap();
        let out = plugin.run(state_with_decision(5.0), &ctx).await.unwrap();
        assert_eq!(out.approved_orders.len(), 1);
        assert!((out.approved_orders[0].size_usd - 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn oversized_decision_is_rejected_and_recorded() {
        let (ctx, _cancel) = test_context();
        let plugin = construct(serde_json::Value::Null).unwrap();
        // 50 % against the default 30 % single-allocation cap.
        let out = plugin.run(state_with_decision(50.0), &ctx).await.unwrap();
        assert!(out.approved_orders.is_empty());
        assert!(out
            .errors
            .iter()
            .any(|e| e.message.contains("per-symbol allocation exceeded")));
        assert!(out.runs["BTC/USDT"].skipped.is_some());
    }

    #[tokio::test]
    async fn no_decision_is_a_quiet_pass() {
        let (ctx, _cancel) = test_context();
        let plugin = construct(serde_json::Value::Null).unwrap();
        let out = plugin
            .run(CycleState::new(1, bot_config()), &ctx)
            .await
            .unwrap();
        assert!(out.approved_orders.is_empty());
        assert!(out.errors.is_empty());
    }
}
