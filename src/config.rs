// =============================================================================
// Bot Configuration — durable per-bot settings loaded from the store
// =============================================================================
//
// A bot's configuration is mutable from the control plane and re-read at
// least once per cycle (the worker caches it with a short TTL). Changes take
// effect on the next cycle boundary; the in-flight cycle keeps its snapshot.
//
// Every field carries a serde default so that adding new fields never breaks
// deserialising an older stored row.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_cycle_interval_s() -> u64 {
    300
}

fn default_max_concurrent_symbols() -> usize {
    3
}

fn default_timeframes() -> Vec<String> {
    vec!["3m".to_string(), "4h".to_string()]
}

fn default_ohlcv_limits() -> BTreeMap<String, u32> {
    let mut limits = BTreeMap::new();
    limits.insert("3m".to_string(), 200);
    limits.insert("4h".to_string(), 100);
    limits
}

fn default_quant_threshold() -> f64 {
    50.0
}

fn default_weight_trend() -> f64 {
    0.35
}

fn default_weight_momentum() -> f64 {
    0.30
}

fn default_weight_volume() -> f64 {
    0.20
}

fn default_weight_sentiment() -> f64 {
    0.15
}

fn default_max_total_allocation_pct() -> f64 {
    80.0
}

fn default_max_single_allocation_pct() -> f64 {
    30.0
}

fn default_max_leverage() -> f64 {
    10.0
}

fn default_leverage() -> f64 {
    3.0
}

fn default_min_position_size_usd() -> f64 {
    10.0
}

fn default_max_position_size_usd() -> f64 {
    100_000.0
}

fn default_min_risk_reward_ratio() -> f64 {
    1.5
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_max_daily_loss_pct() -> f64 {
    5.0
}

fn default_max_drawdown_pct() -> f64 {
    15.0
}

fn default_max_funding_rate_pct() -> f64 {
    0.05
}

fn default_trailing_trigger_pct() -> f64 {
    2.0
}

fn default_trailing_distance_pct() -> f64 {
    1.0
}

fn default_trailing_lock_profit_pct() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_debate_rounds() -> u32 {
    2
}

fn default_debate_timeout_s() -> u64 {
    120
}

fn default_trade_history_limit() -> usize {
    10
}

// =============================================================================
// QuantWeights
// =============================================================================

/// Component weights for the quantitative pre-filter. The four weights are
/// expected to sum to 1.0; `normalised()` repairs drift from hand edits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuantWeights {
    #[serde(default = "default_weight_trend")]
    pub trend: f64,
    #[serde(default = "default_weight_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_volume")]
    pub volume: f64,
    #[serde(default = "default_weight_sentiment")]
    pub sentiment: f64,
}

impl Default for QuantWeights {
    fn default() -> Self {
        Self {
            trend: default_weight_trend(),
            momentum: default_weight_momentum(),
            volume: default_weight_volume(),
            sentiment: default_weight_sentiment(),
        }
    }
}

impl QuantWeights {
    /// Return a copy scaled so the components sum to 1.0. A degenerate
    /// all-zero weight set falls back to the defaults.
    pub fn normalised(&self) -> Self {
        let sum = self.trend + self.momentum + self.volume + self.sentiment;
        if sum <= 0.0 || !sum.is_finite() {
            return Self::default();
        }
        Self {
            trend: self.trend / sum,
            momentum: self.momentum / sum,
            volume: self.volume / sum,
            sentiment: self.sentiment / sum,
        }
    }
}

// =============================================================================
// RiskLimits
// =============================================================================

/// The closed set of risk options enforced by the risk monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    // --- Exposure ------------------------------------------------------------
    #[serde(default = "default_max_total_allocation_pct")]
    pub max_total_allocation_pct: f64,
    #[serde(default = "default_max_single_allocation_pct")]
    pub max_single_allocation_pct: f64,

    // --- Leverage ------------------------------------------------------------
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_leverage")]
    pub default_leverage: f64,
    /// When false (the default), a decision without an explicit leverage is
    /// rejected instead of silently taking `default_leverage`.
    #[serde(default)]
    pub allow_default_leverage: bool,

    // --- Sizing --------------------------------------------------------------
    #[serde(default = "default_min_position_size_usd")]
    pub min_position_size_usd: f64,
    #[serde(default = "default_max_position_size_usd")]
    pub max_position_size_usd: f64,
    #[serde(default = "default_min_risk_reward_ratio")]
    pub min_risk_reward_ratio: f64,

    // --- Breakers ------------------------------------------------------------
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,

    // --- Funding -------------------------------------------------------------
    #[serde(default = "default_max_funding_rate_pct")]
    pub max_funding_rate_pct: f64,
    #[serde(default = "default_true")]
    pub funding_rate_check_enabled: bool,

    // --- Trailing stop -------------------------------------------------------
    #[serde(default)]
    pub trailing_stop_enabled: bool,
    #[serde(default = "default_trailing_trigger_pct")]
    pub trailing_stop_trigger_pct: f64,
    #[serde(default = "default_trailing_distance_pct")]
    pub trailing_stop_distance_pct: f64,
    #[serde(default = "default_trailing_lock_profit_pct")]
    pub trailing_stop_lock_profit_pct: f64,

    // --- Policy switches ------------------------------------------------------
    #[serde(default = "default_true")]
    pub hard_stop_enabled: bool,
    #[serde(default = "default_true")]
    pub pause_on_consecutive_loss: bool,
    #[serde(default = "default_true")]
    pub pause_on_max_drawdown: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty RiskLimits deserialises from defaults")
    }
}

// =============================================================================
// DebateSettings
// =============================================================================

/// Per-bot debate engine tuning, stored in the node config of the debate
/// plugin or in the bot row itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateSettings {
    /// Cross-examination rounds between bull and bear.
    #[serde(default = "default_debate_rounds")]
    pub max_rounds: u32,
    /// Deadline for each debate phase, in seconds.
    #[serde(default = "default_debate_timeout_s")]
    pub timeout_per_phase_s: u64,
    /// How many recent trades are injected into the risk-manager prompt.
    #[serde(default = "default_trade_history_limit")]
    pub trade_history_limit: usize,
    /// Optional per-role LLM routing (role name -> llm_configs id).
    #[serde(default)]
    pub role_llm_ids: BTreeMap<String, Uuid>,
}

impl Default for DebateSettings {
    fn default() -> Self {
        Self {
            max_rounds: default_debate_rounds(),
            timeout_per_phase_s: default_debate_timeout_s(),
            trade_history_limit: default_trade_history_limit(),
            role_llm_ids: BTreeMap::new(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Durable configuration for one trading bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // --- Identity ------------------------------------------------------------
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub display_name: String,

    // --- Wiring --------------------------------------------------------------
    pub exchange_id: Uuid,
    pub workflow_id: Uuid,
    #[serde(default)]
    pub llm_id: Option<Uuid>,

    // --- Execution parameters -------------------------------------------------
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default = "default_cycle_interval_s")]
    pub cycle_interval_s: u64,
    #[serde(default = "default_max_concurrent_symbols")]
    pub max_concurrent_symbols: usize,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
    #[serde(default = "default_ohlcv_limits")]
    pub ohlcv_limits: BTreeMap<String, u32>,
    /// Opaque indicator parameters consumed by the market-state plugin.
    #[serde(default)]
    pub indicator_configs: serde_json::Value,

    // --- Quantitative filter --------------------------------------------------
    #[serde(default)]
    pub quant_weights: QuantWeights,
    #[serde(default = "default_quant_threshold")]
    pub quant_threshold: f64,

    // --- Risk ----------------------------------------------------------------
    #[serde(default)]
    pub risk_limits: RiskLimits,

    // --- Debate --------------------------------------------------------------
    #[serde(default)]
    pub debate: DebateSettings,

    // --- Tracing -------------------------------------------------------------
    /// Optional observability keys forwarded to LLM providers.
    #[serde(default)]
    pub tracing_keys: BTreeMap<String, String>,
}

impl BotConfig {
    /// OHLCV fetch limit for a timeframe, with a conservative fallback.
    pub fn ohlcv_limit(&self, timeframe: &str) -> u32 {
        self.ohlcv_limits.get(timeframe).copied().unwrap_or(100)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_limits_from_empty_json_uses_defaults() {
        let limits: RiskLimits = serde_json::from_str("{}").unwrap();
        assert!((limits.max_total_allocation_pct - 80.0).abs() < f64::EPSILON);
        assert!((limits.max_single_allocation_pct - 30.0).abs() < f64::EPSILON);
        assert!((limits.max_leverage - 10.0).abs() < f64::EPSILON);
        assert!(!limits.allow_default_leverage);
        assert!(limits.funding_rate_check_enabled);
        assert!(!limits.trailing_stop_enabled);
        assert!(limits.pause_on_consecutive_loss);
    }

    #[test]
    fn quant_weights_normalise_to_unit_sum() {
        let weights = QuantWeights {
            trend: 2.0,
            momentum: 1.0,
            volume: 1.0,
            sentiment: 0.0,
        };
        let n = weights.normalised();
        let sum = n.trend + n.momentum + n.volume + n.sentiment;
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((n.trend - 0.5).abs() < 1e-12);
    }

    #[test]
    fn quant_weights_degenerate_falls_back_to_defaults() {
        let weights = QuantWeights {
            trend: 0.0,
            momentum: 0.0,
            volume: 0.0,
            sentiment: 0.0,
        };
        let n = weights.normalised();
        assert!((n.trend - 0.35).abs() < 1e-12);
    }

    #[test]
    fn partial_bot_config_fills_defaults() {
        let json = format!(
            r#"{{
                "id": "{}",
                "name": "btc-scalper",
                "exchange_id": "{}",
                "workflow_id": "{}"
            }}"#,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let cfg: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paper);
        assert_eq!(cfg.cycle_interval_s, 300);
        assert_eq!(cfg.max_concurrent_symbols, 3);
        assert_eq!(cfg.timeframes, vec!["3m", "4h"]);
        assert_eq!(cfg.ohlcv_limit("3m"), 200);
        assert_eq!(cfg.ohlcv_limit("1d"), 100);
        assert_eq!(cfg.debate.max_rounds, 2);
        assert_eq!(cfg.debate.trade_history_limit, 10);
    }
}
