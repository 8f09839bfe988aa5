// =============================================================================
// Debate Engine — analyst -> bull/bear rounds -> risk-manager synthesis
// =============================================================================
//
// Phase A  analysts fan out over the candidate symbols (parallel); a failed
//          analyst drops its symbol, never the cycle.
// Phase B  bull and bear argue concurrently for `max_rounds` rounds; within
//          each round both see the opposing view from the previous round.
// Phase C  the risk manager consumes everything — analyst views, both
//          sides' final suggestions, recent trade history, risk limits —
//          and emits the batch decision.
//
// Every LLM call is schema-constrained, temperature 0, bounded by
// `timeout_per_phase`, served through the per-cycle prompt cache, and
// degrades to a safe fallback (wait / empty decision) instead of erroring
// the cycle. Roles may route to distinct LLMs via `role_llm_ids`.
// =============================================================================

pub mod outputs;
pub mod prompts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DebateSettings;
use crate::cycle::CycleState;
use crate::error::{EngineError, EngineResult};
use crate::llm::fallback::PromptCache;
use crate::llm::{LlmClient, LlmFactory, LlmRequest};
use outputs::{
    AnalystOutput, BatchDecision, DebateArtifacts, DebateRole, TraderSuggestion,
};

pub struct DebateEngine {
    clients: HashMap<DebateRole, Arc<dyn LlmClient>>,
    settings: DebateSettings,
    prompt_cache: Arc<PromptCache>,
}

impl DebateEngine {
    /// Resolve per-role clients from the factory: explicit `role_llm_ids`
    /// first, the bot-level LLM as the default for the rest.
    pub fn from_factory(
        factory: &LlmFactory,
        settings: DebateSettings,
        default_llm_id: Option<Uuid>,
        prompt_cache: Arc<PromptCache>,
    ) -> EngineResult<Self> {
        let mut clients = HashMap::new();
        for role in [
            DebateRole::Analyst,
            DebateRole::Bull,
            DebateRole::Bear,
            DebateRole::RiskManager,
        ] {
            let id = settings
                .role_llm_ids
                .get(role.as_str())
                .copied()
                .or(default_llm_id)
                .ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "debate role '{role}' has no llm configured and the bot has no default"
                    ))
                })?;
            clients.insert(role, factory.client(id)?);
        }
        Ok(Self::with_clients(clients, settings, prompt_cache))
    }

    /// Direct wiring, used by tests and embedding callers.
    pub fn with_clients(
        clients: HashMap<DebateRole, Arc<dyn LlmClient>>,
        settings: DebateSettings,
        prompt_cache: Arc<PromptCache>,
    ) -> Self {
        Self {
            clients,
            settings,
            prompt_cache,
        }
    }

    fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_per_phase_s)
    }

    async fn call(
        &self,
        role: DebateRole,
        system: String,
        prompt: String,
        schema: serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        let client = self.clients.get(&role).ok_or_else(|| {
            EngineError::Configuration(format!("debate role '{role}' has no client"))
        })?;
        let request = LlmRequest {
            system: Some(system),
            prompt,
            schema: Some(schema),
            temperature: 0.0,
            timeout: self.phase_timeout(),
        };
        self.prompt_cache.complete_cached(client, &request).await
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Run the full debate over the cycle's active symbols.
    pub async fn run(&self, state: &CycleState) -> EngineResult<DebateArtifacts> {
        let symbols = state.active_symbols();
        if symbols.is_empty() {
            return Ok(DebateArtifacts {
                cycle_id: state.cycle_id,
                analyst_outputs: Vec::new(),
                bull_rounds: Vec::new(),
                bear_rounds: Vec::new(),
                decision: BatchDecision::safe_fallback("no symbols survived the filters"),
                dropped_symbols: Vec::new(),
                summary: "no candidates to debate".to_string(),
            });
        }

        // --- Phase A: analysts, one per symbol, in parallel ---------------
        let analyses = join_all(symbols.iter().map(|symbol| self.analyse(state, symbol))).await;

        let mut analyst_outputs = Vec::new();
        let mut dropped_symbols = Vec::new();
        for (symbol, result) in symbols.iter().zip(analyses) {
            match result {
                Ok(output) => analyst_outputs.push(output),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "analyst failed — dropping symbol");
                    dropped_symbols.push((symbol.clone(), e.to_string()));
                }
            }
        }

        // --- Phase B: bull/bear rounds per surviving symbol ---------------
        let rounds = self.settings.max_rounds.max(1);
        let mut bull_rounds: Vec<Vec<TraderSuggestion>> = vec![Vec::new(); rounds as usize];
        let mut bear_rounds: Vec<Vec<TraderSuggestion>> = vec![Vec::new(); rounds as usize];

        let debates = join_all(
            analyst_outputs
                .iter()
                .map(|analysis| self.debate_symbol(state, analysis, rounds)),
        )
        .await;

        for per_symbol in debates {
            for (round, (bull, bear)) in per_symbol.into_iter().enumerate() {
                bull_rounds[round].push(bull);
                bear_rounds[round].push(bear);
            }
        }

        // --- Phase C: synthesis -------------------------------------------
        let decision = self
            .synthesise(state, &analyst_outputs, &bull_rounds, &bear_rounds)
            .await;

        let summary = format!(
            "{} symbols debated over {} rounds, {} dropped; decision: {} entries, {:.1}% allocated",
            analyst_outputs.len(),
            rounds,
            dropped_symbols.len(),
            decision
                .decisions
                .iter()
                .filter(|d| d.action != crate::types::TradeAction::Wait)
                .count(),
            decision.total_allocation_pct,
        );
        info!(cycle = state.cycle_id, %summary, "debate complete");

        Ok(DebateArtifacts {
            cycle_id: state.cycle_id,
            analyst_outputs,
            bull_rounds,
            bear_rounds,
            decision,
            dropped_symbols,
            summary,
        })
    }

    // -------------------------------------------------------------------------
    // Phases
    // -------------------------------------------------------------------------

    async fn analyse(&self, state: &CycleState, symbol: &str) -> EngineResult<AnalystOutput> {
        let run = state.runs.get(symbol);
        let value = self
            .call(
                DebateRole::Analyst,
                prompts::analyst_system(),
                prompts::analyst_prompt(
                    symbol,
                    run.and_then(|r| r.indicators.as_ref()),
                    run.and_then(|r| r.quant.as_ref()),
                ),
                AnalystOutput::schema(),
            )
            .await?;

        let mut output: AnalystOutput = serde_json::from_value(value)
            .map_err(|e| EngineError::Validation(format!("analyst output malformed: {e}")))?;
        if output.symbol != symbol {
            warn!(expected = %symbol, got = %output.symbol, "analyst answered for the wrong symbol — correcting");
            output.symbol = symbol.to_string();
        }
        Ok(output.normalised())
    }

    /// Bull and bear argue for `rounds` rounds; each round they run
    /// concurrently and see the opponent's previous-round view. A failed
    /// call degrades to the safe 'wait' suggestion.
    async fn debate_symbol(
        &self,
        state: &CycleState,
        analysis: &AnalystOutput,
        rounds: u32,
    ) -> Vec<(TraderSuggestion, TraderSuggestion)> {
        let symbol = analysis.symbol.as_str();
        let history_limit = self.settings.trade_history_limit;
        let mut results = Vec::with_capacity(rounds as usize);
        let mut prev_bull: Option<TraderSuggestion> = None;
        let mut prev_bear: Option<TraderSuggestion> = None;

        for round in 1..=rounds {
            let bull_call = self.suggest(
                DebateRole::Bull,
                symbol,
                analysis,
                prev_bear.as_ref(),
                round,
                state,
                history_limit,
            );
            let bear_call = self.suggest(
                DebateRole::Bear,
                symbol,
                analysis,
                prev_bull.as_ref(),
                round,
                state,
                history_limit,
            );
            let (bull, bear) = tokio::join!(bull_call, bear_call);

            let bull = bull.unwrap_or_else(|e| {
                warn!(symbol, round, error = %e, "bull call degraded to fallback");
                TraderSuggestion::safe_fallback(symbol, &e.to_string())
            });
            let bear = bear.unwrap_or_else(|e| {
                warn!(symbol, round, error = %e, "bear call degraded to fallback");
                TraderSuggestion::safe_fallback(symbol, &e.to_string())
            });

            prev_bull = Some(bull.clone());
            prev_bear = Some(bear.clone());
            results.push((bull, bear));
        }
        results
    }

    #[allow(clippy::too_many_arguments)]
    async fn suggest(
        &self,
        role: DebateRole,
        symbol: &str,
        analysis: &AnalystOutput,
        opposing: Option<&TraderSuggestion>,
        round: u32,
        state: &CycleState,
        history_limit: usize,
    ) -> EngineResult<TraderSuggestion> {
        let value = self
            .call(
                role,
                prompts::trader_system(role == DebateRole::Bull),
                prompts::trader_prompt(
                    symbol,
                    Some(analysis),
                    opposing,
                    round,
                    &state.performance,
                    history_limit,
                ),
                TraderSuggestion::schema(),
            )
            .await?;

        let mut suggestion: TraderSuggestion = serde_json::from_value(value)
            .map_err(|e| EngineError::Validation(format!("{role} output malformed: {e}")))?;
        suggestion.symbol = symbol.to_string();
        suggestion.confidence = suggestion.confidence.clamp(0.0, 100.0);
        Ok(suggestion)
    }

    async fn synthesise(
        &self,
        state: &CycleState,
        analysts: &[AnalystOutput],
        bull_rounds: &[Vec<TraderSuggestion>],
        bear_rounds: &[Vec<TraderSuggestion>],
    ) -> BatchDecision {
        let empty: Vec<TraderSuggestion> = Vec::new();
        let bull_final = bull_rounds.last().unwrap_or(&empty);
        let bear_final = bear_rounds.last().unwrap_or(&empty);

        let result = self
            .call(
                DebateRole::RiskManager,
                prompts::risk_manager_system(),
                prompts::risk_manager_prompt(
                    analysts,
                    bull_final,
                    bear_final,
                    &state.performance,
                    &state.config.risk_limits,
                    self.settings.trade_history_limit,
                ),
                BatchDecision::schema(),
            )
            .await;

        match result {
            Ok(value) => match serde_json::from_value::<BatchDecision>(value) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(error = %e, "risk manager output malformed — safe fallback");
                    BatchDecision::safe_fallback(&format!("synthesis output malformed: {e}"))
                }
            },
            Err(e) => {
                warn!(error = %e, "risk manager call failed — safe fallback");
                BatchDecision::safe_fallback(&e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for DebateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebateEngine")
            .field("rounds", &self.settings.max_rounds)
            .field("timeout_per_phase_s", &self.settings.timeout_per_phase_s)
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
    use crate::llm::fallback::FallbackChain;
    use crate::types::TradeAction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn bot_config() -> BotConfig {
        serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "t",
            "exchange_id": Uuid::new_v4(),
            "workflow_id": Uuid::new_v4()
        }))
        .unwrap()
    }

    fn state_with_symbols(symbols: &[&str]) -> CycleState {
        let mut state = CycleState::new(1, bot_config());
        state.candidate_symbols = symbols.iter().map(|s| s.to_string()).collect();
        state
    }

    /// Returns a fixed JSON value for every call; optionally fails the
    /// first `failures` calls with a transient error.
    #[derive(Debug)]
    struct RoleClient {
        name: String,
        value: serde_json::Value,
        failures: AtomicU32,
    }

    impl RoleClient {
        fn new(name: &str, value: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                value,
                failures: AtomicU32::new(0),
            })
        }

        fn failing(name: &str, count: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                value: serde_json::Value::Null,
                failures: AtomicU32::new(count),
            })
        }

        fn scripted(name: &str, value: serde_json::Value, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                value,
                failures: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl LlmClient for RoleClient {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, _request: &LlmRequest) -> EngineResult<serde_json::Value> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Transient("http 503".into()));
            }
            Ok(self.value.clone())
        }
    }

    fn analyst_value(symbol: &str) -> serde_json::Value {
        serde_json::json!({
            "symbol": symbol,
            "trend": "bullish",
            "key_levels": [40000.0, 42000.0],
            "summary": "higher highs on rising volume"
        })
    }

    fn suggestion_value(action: &str, allocation: f64) -> serde_json::Value {
        serde_json::json!({
            "symbol": "placeholder",
            "action": action,
            "confidence": 70.0,
            "allocation_pct": allocation,
            "stop_loss_pct": 2.0,
            "take_profit_pct": 6.0,
            "reasoning": "scripted"
        })
    }

    fn decision_value(symbol: &str) -> serde_json::Value {
        serde_json::json!({
            "decisions": [{
                "symbol": symbol,
                "action": "long",
                "allocation_pct": 5.0,
                "leverage": 3.0,
                "stop_loss_pct": 2.0,
                "take_profit_pct": 6.0,
                "confidence": 72.0,
                "rationale": "bull case held up"
            }],
            "total_allocation_pct": 5.0,
            "cash_reserve_pct": 95.0,
            "strategy_rationale": "one conviction entry"
        })
    }

    fn engine_with(
        analyst: Arc<dyn LlmClient>,
        bull: Arc<dyn LlmClient>,
        bear: Arc<dyn LlmClient>,
        risk: Arc<dyn LlmClient>,
    ) -> DebateEngine {
        let mut clients: HashMap<DebateRole, Arc<dyn LlmClient>> = HashMap::new();
        clients.insert(DebateRole::Analyst, analyst);
        clients.insert(DebateRole::Bull, bull);
        clients.insert(DebateRole::Bear, bear);
        clients.insert(DebateRole::RiskManager, risk);
        DebateEngine::with_clients(
            clients,
            crate::config::DebateSettings::default(),
            Arc::new(PromptCache::new()),
        )
    }

    #[tokio::test]
    async fn full_debate_produces_a_decision() {
        let engine = engine_with(
            RoleClient::new("analyst", analyst_value("BTC/USDT")),
            RoleClient::new("bull", suggestion_value("long", 8.0)),
            RoleClient::new("bear", suggestion_value("wait", 0.0)),
            RoleClient::new("risk", decision_value("BTC/USDT")),
        );

        let artifacts = engine.run(&state_with_symbols(&["BTC/USDT"])).await.unwrap();
        assert_eq!(artifacts.analyst_outputs.len(), 1);
        assert_eq!(artifacts.bull_rounds.len(), 2); // default 2 rounds
        assert_eq!(artifacts.bull_rounds[0].len(), 1);
        assert_eq!(artifacts.decision.decisions.len(), 1);
        assert_eq!(artifacts.decision.decisions[0].action, TradeAction::Long);
        assert!(artifacts.dropped_symbols.is_empty());
    }

    #[tokio::test]
    async fn analyst_failure_drops_only_that_symbol() {
        // First analyst call fails, the second succeeds; exactly one
        // symbol survives into the debate.
        let analyst = RoleClient::scripted("analyst", analyst_value("ETH/USDT"), 1);
        let engine = engine_with(
            analyst,
            RoleClient::new("bull", suggestion_value("long", 5.0)),
            RoleClient::new("bear", suggestion_value("wait", 0.0)),
            RoleClient::new("risk", decision_value("ETH/USDT")),
        );

        let artifacts = engine
            .run(&state_with_symbols(&["BTC/USDT", "ETH/USDT"]))
            .await
            .unwrap();
        assert_eq!(artifacts.dropped_symbols.len(), 1);
        assert_eq!(artifacts.analyst_outputs.len(), 1);
    }

    #[tokio::test]
    async fn bull_fallback_keeps_the_cycle_alive() {
        // Primary bull 5xx, fallback answers: scenario of a healthy
        // degradation with no user-visible error.
        let failing_primary = RoleClient::failing("bull-primary", u32::MAX);
        let healthy_fallback = RoleClient::new("bull-fallback", suggestion_value("long", 4.0));
        let bull_chain: Arc<dyn LlmClient> = Arc::new(FallbackChain::new(
            failing_primary,
            vec![healthy_fallback as Arc<dyn LlmClient>],
        ));

        let engine = engine_with(
            RoleClient::new("analyst", analyst_value("BTC/USDT")),
            bull_chain,
            RoleClient::new("bear", suggestion_value("wait", 0.0)),
            RoleClient::new("risk", decision_value("BTC/USDT")),
        );

        let artifacts = engine.run(&state_with_symbols(&["BTC/USDT"])).await.unwrap();
        assert_eq!(artifacts.decision.decisions.len(), 1);
        // The bull suggestions came from the fallback, not the safe 'wait'.
        assert_eq!(artifacts.bull_rounds[0][0].action, TradeAction::Long);
    }

    #[tokio::test]
    async fn risk_manager_failure_degrades_to_empty_decision() {
        let engine = engine_with(
            RoleClient::new("analyst", analyst_value("BTC/USDT")),
            RoleClient::new("bull", suggestion_value("long", 5.0)),
            RoleClient::new("bear", suggestion_value("short", 5.0)),
            RoleClient::failing("risk", u32::MAX),
        );

        let artifacts = engine.run(&state_with_symbols(&["BTC/USDT"])).await.unwrap();
        assert!(artifacts.decision.decisions.is_empty());
        assert_eq!(artifacts.decision.cash_reserve_pct, 100.0);
        assert!(artifacts.decision.strategy_rationale.contains("fallback"));
    }

    #[tokio::test]
    async fn no_symbols_short_circuits() {
        let engine = engine_with(
            RoleClient::new("analyst", analyst_value("BTC/USDT")),
            RoleClient::new("bull", suggestion_value("long", 5.0)),
            RoleClient::new("bear", suggestion_value("wait", 0.0)),
            RoleClient::new("risk", decision_value("BTC/USDT")),
        );
        let artifacts = engine.run(&state_with_symbols(&[])).await.unwrap();
        assert!(artifacts.decision.decisions.is_empty());
        assert_eq!(artifacts.summary, "no candidates to debate");
    }
}
