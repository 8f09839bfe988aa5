// =============================================================================
// batch_decision — the multi-role debate as a pipeline node
// =============================================================================
//
// Wires the debate engine into the workflow: per-role clients resolved from
// the LLM factory (role routing from the bot's debate settings, bot-level
// LLM as the default), artifacts written into the symbol run records and
// the cycle-level decision slot.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::cycle::CycleState;
use crate::debate::DebateEngine;
use crate::error::EngineResult;
use crate::workflow::registry::NodeMetadata;
use crate::workflow::runtime::{NodeError, PipelineNode, PluginContext};

pub fn metadata() -> NodeMetadata {
    NodeMetadata {
        name: "batch_decision".to_string(),
        display_name: "Debate Decision".to_string(),
        category: "ai".to_string(),
        insert_after: Some("quant_filter".to_string()),
        suggested_order: 40,
        requires_llm: true,
        requires_trader: false,
    }
}

pub fn construct(_config: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
    Ok(Arc::new(DebateNode))
}

struct DebateNode;

#[async_trait]
impl PipelineNode for DebateNode {
    fn metadata(&self) -> NodeMetadata {
        metadata()
    }

    async fn run(
        &self,
        mut state: CycleState,
        ctx: &PluginContext,
    ) -> Result<CycleState, NodeError> {
        // Missing LLM wiring is a configuration fault, not a skippable blip.
        let engine = DebateEngine::from_factory(
            &ctx.llm,
            state.config.debate.clone(),
            state.config.llm_id,
            ctx.prompt_cache.clone(),
        )
        .map_err(NodeError::from)?;

        let artifacts = engine.run(&state).await.map_err(NodeError::from)?;

        for output in &artifacts.analyst_outputs {
            state.run_mut(&output.symbol).analyst = Some(output.clone());
        }
        for round in &artifacts.bull_rounds {
            for suggestion in round {
                state
                    .run_mut(&suggestion.symbol)
                    .bull_rounds
                    .push(suggestion.clone());
            }
        }
        for round in &artifacts.bear_rounds {
            for suggestion in round {
                state
                    .run_mut(&suggestion.symbol)
                    .bear_rounds
                    .push(suggestion.clone());
            }
        }
        for decision in &artifacts.decision.decisions {
            state.run_mut(&decision.symbol).decision = Some(decision.clone());
        }
        for (symbol, reason) in &artifacts.dropped_symbols {
            state.skip_symbol(symbol, format!("analyst failed: {reason}"));
        }

        state.debate_summary = Some(artifacts.summary.clone());
        state.decision = Some(artifacts.decision);
        Ok(state)
    }
}
