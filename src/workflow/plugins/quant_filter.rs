// =============================================================================
// quant_filter — weighted scoring gate ahead of the AI stages
// =============================================================================
//
// Four component scores in [0, 100], combined with the bot's quant weights:
//
//   trend      EMA stack separation reinforced by ADX strength
//   momentum   RSI displacement from neutral plus rate of change
//   volume     last-bar volume against the rolling average
//   sentiment  funding-rate neutrality (crowded trades score low)
//
// Symbols scoring under `quant_threshold` are dropped before any LLM money
// is spent on them.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cycle::{CycleState, IndicatorSnapshot, QuantScore};
use crate::error::EngineResult;
use crate::workflow::registry::NodeMetadata;
use crate::workflow::runtime::{NodeError, PipelineNode, PluginContext};

pub fn metadata() -> NodeMetadata {
    NodeMetadata {
        name: "quant_filter".to_string(),
        display_name: "Quant Filter".to_string(),
        category: "signal".to_string(),
        insert_after: Some("market_state".to_string()),
        suggested_order: 30,
        requires_llm: false,
        requires_trader: false,
    }
}

pub fn construct(_config: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
    Ok(Arc::new(QuantFilterPlugin))
}

struct QuantFilterPlugin;

fn clamp(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

/// EMA separation (as a fraction of the slow EMA) reinforced by ADX.
fn trend_score(ind: &IndicatorSnapshot) -> f64 {
    let mut score = 50.0;
    if let (Some(fast), Some(slow)) = (ind.ema_fast, ind.ema_slow) {
        if slow > 0.0 {
            let separation = (fast - slow).abs() / slow;
            score += (separation * 2_000.0).min(25.0);
        }
    }
    if let Some(adx) = ind.adx {
        // ADX 20 is the ranging/trending boundary.
        score += ((adx - 20.0) * 1.25).clamp(-25.0, 25.0);
    }
    clamp(score)
}

/// RSI displacement from 50 plus the magnitude of the rate of change.
fn momentum_score(ind: &IndicatorSnapshot) -> f64 {
    let mut score = 40.0;
    if let Some(rsi) = ind.rsi {
        score += (rsi - 50.0).abs() * 1.2;
    }
    if let Some(roc) = ind.roc {
        score += (roc.abs() * 4.0).min(20.0);
    }
    clamp(score)
}

/// Last-bar volume against the rolling average.
fn volume_score(ind: &IndicatorSnapshot) -> f64 {
    if ind.volume_avg <= 0.0 {
        return 0.0;
    }
    let ratio = ind.volume_last / ind.volume_avg;
    if ratio >= 1.0 {
        clamp(50.0 + (ratio - 1.0) * 100.0)
    } else {
        clamp(ratio * 50.0)
    }
}

/// Funding near zero means the trade is not crowded; extreme funding
/// bleeds carry and signals one-sided positioning.
fn sentiment_score(ind: &IndicatorSnapshot) -> f64 {
    match ind.funding_rate_pct {
        Some(funding) => clamp(100.0 - funding.abs() * 1_000.0),
        // No funding data (spot venue): neutral.
        None => 50.0,
    }
}

#[async_trait]
impl PipelineNode for QuantFilterPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata()
    }

    async fn run(
        &self,
        mut state: CycleState,
        _ctx: &PluginContext,
    ) -> Result<CycleState, NodeError> {
        let weights = state.config.quant_weights.normalised();
        let threshold = state.config.quant_threshold;

        for symbol in state.active_symbols() {
            let Some(indicators) = state
                .runs
                .get(&symbol)
                .and_then(|run| run.indicators.clone())
            else {
                state.skip_symbol(&symbol, "no indicator data for scoring");
                continue;
            };

            let trend = trend_score(&indicators);
            let momentum = momentum_score(&indicators);
            let volume = volume_score(&indicators);
            let sentiment = sentiment_score(&indicators);
            let total = trend * weights.trend
                + momentum * weights.momentum
                + volume * weights.volume
                + sentiment * weights.sentiment;
            let passed = total >= threshold;

            debug!(
                symbol = %symbol,
                trend, momentum, volume, sentiment, total, passed,
                "quant score"
            );
            state.run_mut(&symbol).quant = Some(QuantScore {
                trend,
                momentum,
                volume,
                sentiment,
                total,
                passed,
            });
            if !passed {
                info!(symbol = %symbol, total, threshold, "quant filter dropped symbol");
                state.skip_symbol(
                    &symbol,
                    format!("quant score {total:.1} below threshold {threshold:.1}"),
                );
            }
        }
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
    use crate::workflow::runtime::test_context;
    use uuid::Uuid;

    fn bot_config(threshold: f64) -> BotConfig {
        serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "t",
            "exchange_id": Uuid::new_v4(),
            "workflow_id": Uuid::new_v4(),
            "quant_threshold": threshold
        }))
        .unwrap()
    }

    fn strong_snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            last_price: 40_000.0,
            ema_fast: Some(40_500.0),
            ema_slow: Some(39_500.0),
            rsi: Some(68.0),
            atr: Some(300.0),
            adx: Some(35.0),
            roc: Some(4.0),
            volume_last: 2_000.0,
            volume_avg: 1_000.0,
            funding_rate_pct: Some(0.01),
            open_interest: Some(1_000_000.0),
        }
    }

    fn weak_snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            last_price: 40_000.0,
            ema_fast: Some(40_000.0),
            ema_slow: Some(40_000.0),
            rsi: Some(50.0),
            atr: Some(50.0),
            adx: Some(10.0),
            roc: Some(0.1),
            volume_last: 200.0,
            volume_avg: 1_000.0,
            funding_rate_pct: Some(0.09),
            open_interest: None,
        }
    }

    #[tokio::test]
    async fn strong_symbol_passes_weak_symbol_drops() {
        let (ctx, _cancel) = test_context();
        let plugin = construct(serde_json::Value::Null).unwrap();

        let mut state = CycleState::new(1, bot_config(50.0));
        state.candidate_symbols = vec!["BTC/USDT".into(), "DOGE/USDT".into()];
        state.run_mut("BTC/USDT").indicators = Some(strong_snapshot());
        state.run_mut("DOGE/USDT").indicators = Some(weak_snapshot());

        let out = plugin.run(state, &ctx).await.unwrap();

        assert_eq!(out.active_symbols(), vec!["BTC/USDT".to_string()]);
        assert!(out.runs["BTC/USDT"].quant.as_ref().unwrap().passed);
        let dropped = &out.runs["DOGE/USDT"];
        assert!(!dropped.quant.as_ref().unwrap().passed);
        assert!(dropped.skipped.as_ref().unwrap().contains("below threshold"));
    }

    #[tokio::test]
    async fn missing_indicators_drop_the_symbol() {
        let (ctx, _cancel) = test_context();
        let plugin = construct(serde_json::Value::Null).unwrap();

        let mut state = CycleState::new(1, bot_config(50.0));
        state.candidate_symbols = vec!["BTC/USDT".into()];
        state.run_mut("BTC/USDT"); // no indicators attached

        let out = plugin.run(state, &ctx).await.unwrap();
        assert!(out.active_symbols().is_empty());
    }

    #[test]
    fn component_scores_are_bounded() {
        for snapshot in [strong_snapshot(), weak_snapshot()] {
            for score in [
                trend_score(&snapshot),
                momentum_score(&snapshot),
                volume_score(&snapshot),
                sentiment_score(&snapshot),
            ] {
                assert!((0.0..=100.0).contains(&score), "score {score} out of range");
            }
        }
    }

    #[test]
    fn sentiment_punishes_extreme_funding() {
        let mut snapshot = strong_snapshot();
        snapshot.funding_rate_pct = Some(0.01);
        let healthy = sentiment_score(&snapshot);
        snapshot.funding_rate_pct = Some(0.08);
        let crowded = sentiment_score(&snapshot);
        assert!(healthy > crowded);
    }
}
