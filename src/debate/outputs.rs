// =============================================================================
// Debate Outputs — typed records produced by each reasoning phase
// =============================================================================
//
// Every phase emits a schema-validated record; the schemas below are handed
// to the LLM adapters as native constraints (or folded into the prompt for
// providers without them). `key_levels` is either populated or absent —
// never an empty collection — so downstream prompts can rely on presence
// meaning substance.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::TradeAction;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateRole {
    Analyst,
    Bull,
    Bear,
    RiskManager,
}

impl DebateRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Bull => "bull",
            Self::Bear => "bear",
            Self::RiskManager => "risk_manager",
        }
    }
}

impl std::fmt::Display for DebateRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Phase A — analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendBias {
    Bullish,
    Bearish,
    Neutral,
}

/// Analyst verdict for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystOutput {
    pub symbol: String,
    pub trend: TrendBias,
    /// Support/resistance levels worth defending; absent when the analyst
    /// found none (never an empty list).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_levels: Option<Vec<f64>>,
    pub summary: String,
}

impl AnalystOutput {
    /// Normalise a deserialised output: an empty key-level list collapses
    /// to absent.
    pub fn normalised(mut self) -> Self {
        if matches!(&self.key_levels, Some(levels) if levels.is_empty()) {
            self.key_levels = None;
        }
        self
    }

    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["symbol", "trend", "summary"],
            "properties": {
                "symbol": {"type": "string"},
                "trend": {"type": "string", "enum": ["bullish", "bearish", "neutral"]},
                "key_levels": {"type": "array", "items": {"type": "number"}},
                "summary": {"type": "string"}
            },
            "additionalProperties": false
        })
    }
}

// ---------------------------------------------------------------------------
// Phase B — debate
// ---------------------------------------------------------------------------

/// A bull or bear round's suggestion for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderSuggestion {
    pub symbol: String,
    pub action: TradeAction,
    /// Confidence in [0, 100].
    pub confidence: f64,
    pub allocation_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub reasoning: String,
}

impl TraderSuggestion {
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": [
                "symbol", "action", "confidence", "allocation_pct",
                "stop_loss_pct", "take_profit_pct", "reasoning"
            ],
            "properties": {
                "symbol": {"type": "string"},
                "action": {"type": "string", "enum": ["long", "short", "wait"]},
                "confidence": {"type": "number", "minimum": 0, "maximum": 100},
                "allocation_pct": {"type": "number", "minimum": 0},
                "stop_loss_pct": {"type": "number", "minimum": 0},
                "take_profit_pct": {"type": "number", "minimum": 0},
                "reasoning": {"type": "string"}
            },
            "additionalProperties": false
        })
    }

    /// The neutral suggestion used when a phase times out or every adapter
    /// fails: sit out this cycle.
    pub fn safe_fallback(symbol: &str, reason: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            action: TradeAction::Wait,
            confidence: 0.0,
            allocation_pct: 0.0,
            stop_loss_pct: 0.0,
            take_profit_pct: 0.0,
            reasoning: format!("fallback: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase C — synthesis
// ---------------------------------------------------------------------------

/// The risk manager's final call for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioDecision {
    pub symbol: String,
    pub action: TradeAction,
    pub allocation_pct: f64,
    /// Absent leverage is rejected by the risk monitor unless defaulting is
    /// explicitly enabled in the bot's limits.
    #[serde(default)]
    pub leverage: Option<f64>,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub confidence: f64,
    pub rationale: String,
}

/// The batch decision covering every debated symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDecision {
    pub decisions: Vec<PortfolioDecision>,
    pub total_allocation_pct: f64,
    pub cash_reserve_pct: f64,
    pub strategy_rationale: String,
}

impl BatchDecision {
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": [
                "decisions", "total_allocation_pct", "cash_reserve_pct",
                "strategy_rationale"
            ],
            "properties": {
                "decisions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": [
                            "symbol", "action", "allocation_pct", "stop_loss_pct",
                            "take_profit_pct", "confidence", "rationale"
                        ],
                        "properties": {
                            "symbol": {"type": "string"},
                            "action": {"type": "string", "enum": ["long", "short", "wait"]},
                            "allocation_pct": {"type": "number", "minimum": 0},
                            "leverage": {"type": "number", "minimum": 1},
                            "stop_loss_pct": {"type": "number", "minimum": 0},
                            "take_profit_pct": {"type": "number", "minimum": 0},
                            "confidence": {"type": "number", "minimum": 0, "maximum": 100},
                            "rationale": {"type": "string"}
                        }
                    }
                },
                "total_allocation_pct": {"type": "number", "minimum": 0},
                "cash_reserve_pct": {"type": "number", "minimum": 0},
                "strategy_rationale": {"type": "string"}
            },
            "additionalProperties": false
        })
    }

    /// The empty decision used when synthesis fails outright.
    pub fn safe_fallback(reason: &str) -> Self {
        Self {
            decisions: Vec::new(),
            total_allocation_pct: 0.0,
            cash_reserve_pct: 100.0,
            strategy_rationale: format!("fallback: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Everything the debate produced in one cycle, preserved for the control
/// plane's `get_debate` and for post-mortem analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateArtifacts {
    pub cycle_id: i64,
    pub analyst_outputs: Vec<AnalystOutput>,
    /// Suggestions per round: `bull_rounds[r]` is round r+1's bull view.
    pub bull_rounds: Vec<Vec<TraderSuggestion>>,
    pub bear_rounds: Vec<Vec<TraderSuggestion>>,
    pub decision: BatchDecision,
    /// Symbols dropped during analysis and why.
    pub dropped_symbols: Vec<(String, String)>,
    /// Human-readable one-liner for the status file.
    pub summary: String,
}
