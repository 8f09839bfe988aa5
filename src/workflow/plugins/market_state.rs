// =============================================================================
// market_state — per-symbol indicators from cached market data
// =============================================================================
//
// Fetches the configured timeframes for every candidate symbol (warming the
// cache for later nodes), computes the indicator snapshot on the primary
// timeframe, and attaches funding rate and open interest for the sentiment
// leg of the quant filter. Symbols fan out in parallel; one symbol's fetch
// failure drops that symbol, not the cycle.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use tracing::warn;

use crate::cycle::{CycleState, IndicatorSnapshot};
use crate::error::{EngineResult, ErrorKind};
use crate::indicators;
use crate::workflow::registry::NodeMetadata;
use crate::workflow::runtime::{NodeError, PipelineNode, PluginContext};

fn default_ema_fast() -> usize {
    9
}
fn default_ema_slow() -> usize {
    21
}
fn default_period() -> usize {
    14
}
fn default_volume_window() -> usize {
    20
}

/// Indicator parameters; read from the bot's `indicator_configs` blob with
/// per-field defaults so partial configs stay valid.
#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorParams {
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "default_period")]
    pub rsi: usize,
    #[serde(default = "default_period")]
    pub atr: usize,
    #[serde(default = "default_period")]
    pub adx: usize,
    #[serde(default = "default_period")]
    pub roc: usize,
    #[serde(default = "default_volume_window")]
    pub volume_window: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults deserialise")
    }
}

pub fn metadata() -> NodeMetadata {
    NodeMetadata {
        name: "market_state".to_string(),
        display_name: "Market State".to_string(),
        category: "market".to_string(),
        insert_after: Some("coins_pick".to_string()),
        suggested_order: 20,
        requires_llm: false,
        requires_trader: false,
    }
}

pub fn construct(_config: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
    Ok(Arc::new(MarketStatePlugin))
}

struct MarketStatePlugin;

impl MarketStatePlugin {
    async fn snapshot_symbol(
        ctx: &PluginContext,
        state: &CycleState,
        params: &IndicatorParams,
        symbol: &str,
    ) -> EngineResult<IndicatorSnapshot> {
        let timeframes = &state.config.timeframes;
        let primary_tf = timeframes.first().map(String::as_str).unwrap_or("3m");

        // Warm every configured timeframe; indicators run on the primary.
        let mut primary_bars = Vec::new();
        for timeframe in timeframes {
            let bars = ctx
                .poll
                .ohlcv(symbol, timeframe, state.config.ohlcv_limit(timeframe))
                .await?;
            if timeframe.as_str() == primary_tf {
                primary_bars = bars;
            }
        }
        if primary_bars.is_empty() {
            primary_bars = ctx
                .poll
                .ohlcv(symbol, primary_tf, state.config.ohlcv_limit(primary_tf))
                .await?;
        }

        let ticker = ctx.poll.ticker(symbol).await?;

        // Funding and open interest are best-effort: plenty of venues and
        // spot markets simply do not publish them.
        let funding_rate_pct = ctx.poll.funding_rate(symbol).await.ok();
        let open_interest = ctx.poll.open_interest(symbol).await.ok();

        let closes = indicators::closes(&primary_bars);
        let snapshot = IndicatorSnapshot {
            last_price: ticker.last,
            ema_fast: indicators::ema(&closes, params.ema_fast).last().copied(),
            ema_slow: indicators::ema(&closes, params.ema_slow).last().copied(),
            rsi: indicators::rsi(&closes, params.rsi),
            atr: indicators::atr(&primary_bars, params.atr),
            adx: indicators::adx(&primary_bars, params.adx),
            roc: indicators::roc(&closes, params.roc),
            volume_last: primary_bars.last().map(|b| b.volume).unwrap_or(0.0),
            volume_avg: indicators::average_volume(&primary_bars, params.volume_window)
                .unwrap_or(0.0),
            funding_rate_pct,
            open_interest,
        };
        Ok(snapshot)
    }
}

#[async_trait]
impl PipelineNode for MarketStatePlugin {
    fn metadata(&self) -> NodeMetadata {
        metadata()
    }

    async fn run(
        &self,
        mut state: CycleState,
        ctx: &PluginContext,
    ) -> Result<CycleState, NodeError> {
        let params: IndicatorParams =
            serde_json::from_value(state.config.indicator_configs.clone()).unwrap_or_default();
        let symbols = state.active_symbols();

        let snapshots = join_all(
            symbols
                .iter()
                .map(|symbol| Self::snapshot_symbol(ctx, &state, &params, symbol)),
        )
        .await;

        for (symbol, result) in symbols.iter().zip(snapshots) {
            match result {
                Ok(snapshot) => {
                    state.run_mut(symbol).indicators = Some(snapshot);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "market state fetch failed — dropping symbol");
                    state.record_error("market_state", ErrorKind::Transient, e.to_string());
                    state.skip_symbol(symbol, format!("market data unavailable: {e}"));
                }
            }
        }
        Ok(state)
    }
}
