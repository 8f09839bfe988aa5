// =============================================================================
// Cycle State — the record threaded through every pipeline node
// =============================================================================
//
// One `CycleState` per cycle, owned by the worker that started it. Nodes
// treat it as a transformation input/output; the runtime checkpoints it
// after every node, and once the final checkpoint is written the state is
// read-only history.
//
// `cycle_id` is a monotonically increasing integer per bot. Symbol-level
// work lives in `runs` (a BTreeMap so serialised checkpoints list symbols
// in a stable order).
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BotConfig;
use crate::debate::outputs::{AnalystOutput, BatchDecision, PortfolioDecision, TraderSuggestion};
use crate::error::ErrorKind;
use crate::types::{Balance, Position, PositionSide, TradeAction, TradeRecord};

// ---------------------------------------------------------------------------
// Per-symbol artefacts
// ---------------------------------------------------------------------------

/// Indicator readings computed by the market-state node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub last_price: f64,
    #[serde(default)]
    pub ema_fast: Option<f64>,
    #[serde(default)]
    pub ema_slow: Option<f64>,
    #[serde(default)]
    pub rsi: Option<f64>,
    #[serde(default)]
    pub atr: Option<f64>,
    #[serde(default)]
    pub adx: Option<f64>,
    #[serde(default)]
    pub roc: Option<f64>,
    pub volume_last: f64,
    pub volume_avg: f64,
    #[serde(default)]
    pub funding_rate_pct: Option<f64>,
    #[serde(default)]
    pub open_interest: Option<f64>,
}

/// Component scores of the quantitative pre-filter, each in [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantScore {
    pub trend: f64,
    pub momentum: f64,
    pub volume: f64,
    pub sentiment: f64,
    pub total: f64,
    pub passed: bool,
}

/// Outcome of order execution for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub action: TradeAction,
    #[serde(default)]
    pub order_id: Option<String>,
    pub amount: f64,
    pub fill_price: f64,
    pub fee_paid: f64,
    pub status: String,
    #[serde(default)]
    pub skipped: Option<String>,
}

/// Everything the pipeline learned and decided about one symbol this cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolRun {
    pub symbol: String,
    #[serde(default)]
    pub indicators: Option<IndicatorSnapshot>,
    #[serde(default)]
    pub quant: Option<QuantScore>,
    #[serde(default)]
    pub analyst: Option<AnalystOutput>,
    #[serde(default)]
    pub bull_rounds: Vec<TraderSuggestion>,
    #[serde(default)]
    pub bear_rounds: Vec<TraderSuggestion>,
    #[serde(default)]
    pub decision: Option<PortfolioDecision>,
    #[serde(default)]
    pub execution: Option<ExecutionOutcome>,
    /// Set when the symbol dropped out of the pipeline, with the reason.
    #[serde(default)]
    pub skipped: Option<String>,
}

// ---------------------------------------------------------------------------
// Cycle-level records
// ---------------------------------------------------------------------------

/// A non-fatal failure recorded into the cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleError {
    pub node: String,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Rolling performance context injected into prompts and consulted by the
/// risk breakers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceWindow {
    pub recent_trades: Vec<TradeRecord>,
    /// Win rate over the window in [0, 1].
    pub win_rate: f64,
    pub consecutive_losses: u32,
    pub daily_pnl_usd: f64,
    pub drawdown_usd: f64,
}

impl PerformanceWindow {
    /// Derive the window from recent closed trades (newest first).
    pub fn from_trades(trades: Vec<TradeRecord>) -> Self {
        let closed: Vec<&TradeRecord> = trades
            .iter()
            .filter(|t| t.status == crate::types::TradeStatus::Closed)
            .collect();

        let wins = closed
            .iter()
            .filter(|t| t.pnl_usd.unwrap_or(0.0) > 0.0)
            .count();
        let win_rate = if closed.is_empty() {
            0.0
        } else {
            wins as f64 / closed.len() as f64
        };

        // Streak of losses from the most recent trade backwards.
        let mut consecutive_losses = 0;
        for trade in &closed {
            if trade.pnl_usd.unwrap_or(0.0) < 0.0 {
                consecutive_losses += 1;
            } else {
                break;
            }
        }

        // Daily PnL and peak-to-trough drawdown over the window.
        let today = Utc::now().date_naive();
        let daily_pnl: f64 = closed
            .iter()
            .filter(|t| t.closed_at.map(|c| c.date_naive()) == Some(today))
            .filter_map(|t| t.pnl_usd)
            .sum();

        let mut equity = 0.0f64;
        let mut peak = 0.0f64;
        let mut max_drawdown = 0.0f64;
        for trade in closed.iter().rev() {
            equity += trade.pnl_usd.unwrap_or(0.0);
            peak = peak.max(equity);
            max_drawdown = max_drawdown.max(peak - equity);
        }

        Self {
            win_rate,
            consecutive_losses,
            daily_pnl_usd: daily_pnl,
            drawdown_usd: max_drawdown,
            recent_trades: trades,
        }
    }
}

/// Per-position trailing-stop amendment proposed by the risk monitor. The
/// executor owns issuing the amend order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopProposal {
    pub symbol: String,
    pub side: PositionSide,
    pub new_stop_price: f64,
    /// Profit (percent of entry) guaranteed if the new stop fills.
    pub locked_profit_pct: f64,
}

/// An order that cleared every risk check and is ready for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedOrder {
    pub symbol: String,
    pub action: TradeAction,
    pub allocation_pct: f64,
    /// Resolved leverage (clamped or defaulted by the monitor).
    pub leverage: f64,
    pub size_usd: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

// ---------------------------------------------------------------------------
// CycleState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleState {
    pub cycle_id: i64,
    pub bot_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Frozen configuration; control-plane edits apply from the next cycle.
    pub config: BotConfig,
    #[serde(default)]
    pub candidate_symbols: Vec<String>,
    #[serde(default)]
    pub runs: BTreeMap<String, SymbolRun>,
    #[serde(default)]
    pub balance: Balance,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub performance: PerformanceWindow,
    #[serde(default)]
    pub decision: Option<BatchDecision>,
    #[serde(default)]
    pub approved_orders: Vec<ApprovedOrder>,
    #[serde(default)]
    pub trailing_proposals: Vec<TrailingStopProposal>,
    /// Set when a breaker asks the scheduler to pause the bot.
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub errors: Vec<CycleError>,
    #[serde(default)]
    pub debate_summary: Option<String>,
}

impl CycleState {
    pub fn new(cycle_id: i64, config: BotConfig) -> Self {
        Self {
            cycle_id,
            bot_id: config.id,
            started_at: Utc::now(),
            config,
            candidate_symbols: Vec::new(),
            runs: BTreeMap::new(),
            balance: Balance::default(),
            positions: Vec::new(),
            performance: PerformanceWindow::default(),
            decision: None,
            approved_orders: Vec::new(),
            trailing_proposals: Vec::new(),
            pause_reason: None,
            errors: Vec::new(),
            debate_summary: None,
        }
    }

    /// The run record for a symbol, created on first touch.
    pub fn run_mut(&mut self, symbol: &str) -> &mut SymbolRun {
        self.runs
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolRun {
                symbol: symbol.to_string(),
                ..SymbolRun::default()
            })
    }

    /// Record a non-fatal failure.
    pub fn record_error(&mut self, node: &str, kind: ErrorKind, message: impl Into<String>) {
        self.errors.push(CycleError {
            node: node.to_string(),
            kind,
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Drop a symbol from further processing with a reason.
    pub fn skip_symbol(&mut self, symbol: &str, reason: impl Into<String>) {
        let reason = reason.into();
        self.run_mut(symbol).skipped = Some(reason.clone());
        self.candidate_symbols.retain(|s| s != symbol);
    }

    /// Symbols still in play (candidates that were not skipped).
    pub fn active_symbols(&self) -> Vec<String> {
        self.candidate_symbols
            .iter()
            .filter(|s| {
                self.runs
                    .get(*s)
                    .map(|run| run.skipped.is_none())
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// JSON view of the state for edge-condition evaluation.
    pub fn to_condition_scope(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PositionSide, TradeStatus};

    fn bot_config() -> BotConfig {
        serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "test-bot",
            "exchange_id": Uuid::new_v4(),
            "workflow_id": Uuid::new_v4()
        }))
        .unwrap()
    }

    fn closed_trade(pnl: f64) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4(),
            bot_id: Uuid::new_v4(),
            symbol: "BTC/USDT".into(),
            side: PositionSide::Long,
            action: "long".into(),
            entry_price: 100.0,
            exit_price: Some(100.0 + pnl),
            amount: 1.0,
            leverage: 1.0,
            pnl_usd: Some(pnl),
            pnl_percent: Some(pnl),
            fee_paid: Some(0.1),
            status: TradeStatus::Closed,
            opened_at: Utc::now(),
            closed_at: Some(Utc::now()),
            cycle_id: 1,
            order_id: None,
        }
    }

    #[test]
    fn checkpoint_roundtrip_is_identity() {
        let mut state = CycleState::new(7, bot_config());
        state.candidate_symbols = vec!["BTC/USDT".into()];
        state.run_mut("BTC/USDT").quant = Some(QuantScore {
            trend: 80.0,
            momentum: 70.0,
            volume: 60.0,
            sentiment: 50.0,
            total: 68.0,
            passed: true,
        });
        state.record_error("market_state", ErrorKind::Transient, "one blip");

        let bytes = serde_json::to_vec(&state).unwrap();
        let back: CycleState = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(back.cycle_id, 7);
        assert_eq!(back.bot_id, state.bot_id);
        assert_eq!(back.candidate_symbols, state.candidate_symbols);
        assert_eq!(back.errors.len(), 1);
        assert!(back.runs["BTC/USDT"].quant.as_ref().unwrap().passed);

        // Serialising the deserialised state reproduces the same bytes:
        // runs is a BTreeMap, so field order is stable.
        let bytes2 = serde_json::to_vec(&back).unwrap();
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn skip_symbol_removes_from_active_set() {
        let mut state = CycleState::new(1, bot_config());
        state.candidate_symbols = vec!["BTC/USDT".into(), "ETH/USDT".into()];
        state.skip_symbol("ETH/USDT", "funding too high");

        assert_eq!(state.active_symbols(), vec!["BTC/USDT".to_string()]);
        assert_eq!(
            state.runs["ETH/USDT"].skipped.as_deref(),
            Some("funding too high")
        );
    }

    #[test]
    fn performance_window_counts_streak_from_latest() {
        // Newest first: two losses, then a win.
        let trades = vec![closed_trade(-5.0), closed_trade(-3.0), closed_trade(10.0)];
        let window = PerformanceWindow::from_trades(trades);
        assert_eq!(window.consecutive_losses, 2);
        assert!((window.win_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn performance_window_empty_is_zeroed() {
        let window = PerformanceWindow::from_trades(Vec::new());
        assert_eq!(window.win_rate, 0.0);
        assert_eq!(window.consecutive_losses, 0);
    }
}
