// =============================================================================
// coins_pick — candidate symbol selection
// =============================================================================
//
// Picks up to `max_concurrent_symbols` active markets in the configured
// quote currency, ranked by 24 h volume. The pick is cached under the
// `coin_selection` namespace so symbols stay stable across the namespace's
// TTL instead of churning every cycle.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::cycle::CycleState;
use crate::error::EngineResult;
use crate::market::cache::ns;
use crate::workflow::registry::NodeMetadata;
use crate::workflow::runtime::{NodeError, PipelineNode, PluginContext};

fn default_quote() -> String {
    "USDT".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct CoinsPickConfig {
    #[serde(default = "default_quote")]
    quote: String,
    /// Symbols always included regardless of ranking.
    #[serde(default)]
    pinned: Vec<String>,
}

impl Default for CoinsPickConfig {
    fn default() -> Self {
        Self {
            quote: default_quote(),
            pinned: Vec::new(),
        }
    }
}

pub fn metadata() -> NodeMetadata {
    NodeMetadata {
        name: "coins_pick".to_string(),
        display_name: "Coin Selection".to_string(),
        category: "market".to_string(),
        insert_after: None,
        suggested_order: 10,
        requires_llm: false,
        requires_trader: false,
    }
}

pub fn construct(config: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
    let config: CoinsPickConfig = if config.is_null() {
        CoinsPickConfig::default()
    } else {
        serde_json::from_value(config).unwrap_or_default()
    };
    Ok(Arc::new(CoinsPickPlugin { config }))
}

struct CoinsPickPlugin {
    config: CoinsPickConfig,
}

#[async_trait]
impl PipelineNode for CoinsPickPlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata()
    }

    async fn run(
        &self,
        mut state: CycleState,
        ctx: &PluginContext,
    ) -> Result<CycleState, NodeError> {
        let limit = state.config.max_concurrent_symbols.max(1);
        let cache_key = format!("bot_{}", state.bot_id);

        let selection: Vec<String> =
            match ctx.cache.get_json::<Vec<String>>(ns::COIN_SELECTION, &cache_key) {
                Some(cached) => cached,
                None => {
                    let catalogue = ctx.poll.markets().await.map_err(NodeError::from)?;
                    let mut markets: Vec<_> = catalogue
                        .values()
                        .filter(|m| m.active && m.quote == self.config.quote)
                        .collect();
                    markets.sort_by(|a, b| {
                        b.quote_volume_24h
                            .partial_cmp(&a.quote_volume_24h)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });

                    let mut selection: Vec<String> = self.config.pinned.clone();
                    for market in markets {
                        if selection.len() >= limit {
                            break;
                        }
                        if !selection.contains(&market.symbol) {
                            selection.push(market.symbol.clone());
                        }
                    }
                    selection.truncate(limit);

                    ctx.cache
                        .set_json(ns::COIN_SELECTION, &cache_key, &selection)
                        .map_err(NodeError::from)?;
                    selection
                }
            };

        debug!(count = selection.len(), symbols = ?selection, "candidates selected");
        for symbol in &selection {
            state.run_mut(symbol);
        }
        state.candidate_symbols = selection;
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

    fn bot_config() -> BotConfig {
        serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "t",
            "exchange_id": Uuid::new_v4(),
            "workflow_id": Uuid::new_v4()
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn picks_top_volume_markets() {
        let (ctx, _cancel) = test_context();
        let plugin = construct(serde_json::Value::Null).unwrap();

        let state = CycleState::new(1, bot_config());
        let out = plugin.run(state, &ctx).await.unwrap();

        // max_concurrent_symbols default 3; sim catalogue ranks BTC first.
        assert_eq!(out.candidate_symbols.len(), 3);
        assert_eq!(out.candidate_symbols[0], "BTC/USDT");
        assert!(out.runs.contains_key("BTC/USDT"));
    }

    #[tokio::test]
    async fn selection_is_stable_within_the_cache_ttl() {
        let (ctx, _cancel) = test_context();
        let plugin = construct(serde_json::Value::Null).unwrap();

        let first = plugin.run(CycleState::new(1, bot_config()), &ctx).await.unwrap();
        let mut second_state = CycleState::new(2, bot_config());
        second_state.bot_id = first.bot_id;
        // Same bot key hits the cached selection.
        let cache_key = format!("bot_{}", first.bot_id);
        assert!(ctx
            .cache
            .get_json::<Vec<String>>(ns::COIN_SELECTION, &cache_key)
            .is_some());
        let second = plugin.run(second_state, &ctx).await.unwrap();
        assert_eq!(first.candidate_symbols, second.candidate_symbols);
    }

    #[tokio::test]
    async fn pinned_symbols_lead_the_selection() {
        let (ctx, _cancel) = test_context();
        let plugin = construct(serde_json::json!({"pinned": ["XRP/USDT"]})).unwrap();

        let out = plugin.run(CycleState::new(1, bot_config()), &ctx).await.unwrap();
        assert_eq!(out.candidate_symbols[0], "XRP/USDT");
    }
}
