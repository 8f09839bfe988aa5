// =============================================================================
// Debate Prompts — context assembly for each role
// =============================================================================
//
// The engine's job is orchestration, not prose: these builders inject the
// market features, the opposing view, the recent trade record and the risk
// limits into each role's instructions. Operators override the role
// instructions themselves via prompt files referenced from node config;
// the defaults below keep a bot functional out of the box.
// =============================================================================

use crate::config::RiskLimits;
use crate::cycle::{IndicatorSnapshot, PerformanceWindow, QuantScore};
use crate::debate::outputs::{AnalystOutput, TraderSuggestion};
use crate::types::TradeStatus;

// ---------------------------------------------------------------------------
// Shared fragments
// ---------------------------------------------------------------------------

/// Render the recent trade record, aggregate win rate and loss streak the
/// way every role sees it.
pub fn trade_history_block(window: &PerformanceWindow, limit: usize) -> String {
    let mut block = String::new();

    if window.recent_trades.is_empty() {
        block.push_str("No trade history yet.\n");
    } else {
        block.push_str("Recent trades (newest first):\n");
        for trade in window.recent_trades.iter().take(limit) {
            match trade.status {
                TradeStatus::Closed => block.push_str(&format!(
                    "- {} {} {:.6} @ {:.4} -> {:.4}, pnl {:+.2} USD\n",
                    trade.symbol,
                    trade.side,
                    trade.amount,
                    trade.entry_price,
                    trade.exit_price.unwrap_or(trade.entry_price),
                    trade.pnl_usd.unwrap_or(0.0),
                )),
                TradeStatus::Open => block.push_str(&format!(
                    "- {} {} {:.6} @ {:.4} (still open)\n",
                    trade.symbol, trade.side, trade.amount, trade.entry_price,
                )),
            }
        }
    }

    block.push_str(&format!(
        "Win rate: {:.0}%. Consecutive losses: {}.\n",
        window.win_rate * 100.0,
        window.consecutive_losses
    ));
    if window.consecutive_losses >= 3 {
        block.push_str("Warning: the account is on a losing streak — weigh caution heavily.\n");
    }
    block
}

fn indicator_block(indicators: Option<&IndicatorSnapshot>) -> String {
    let Some(ind) = indicators else {
        return "No indicator data available.\n".to_string();
    };
    let mut block = format!("Last price: {:.6}\n", ind.last_price);
    if let Some(v) = ind.ema_fast {
        block.push_str(&format!("EMA fast: {v:.6}\n"));
    }
    if let Some(v) = ind.ema_slow {
        block.push_str(&format!("EMA slow: {v:.6}\n"));
    }
    if let Some(v) = ind.rsi {
        block.push_str(&format!("RSI: {v:.2}\n"));
    }
    if let Some(v) = ind.adx {
        block.push_str(&format!("ADX: {v:.2}\n"));
    }
    if let Some(v) = ind.atr {
        block.push_str(&format!("ATR: {v:.6}\n"));
    }
    if let Some(v) = ind.roc {
        block.push_str(&format!("ROC: {v:+.2}%\n"));
    }
    block.push_str(&format!(
        "Volume: last {:.2} vs avg {:.2}\n",
        ind.volume_last, ind.volume_avg
    ));
    if let Some(v) = ind.funding_rate_pct {
        block.push_str(&format!("Funding rate: {v:+.4}%\n"));
    }
    if let Some(v) = ind.open_interest {
        block.push_str(&format!("Open interest: {v:.0}\n"));
    }
    block
}

fn quant_block(quant: Option<&QuantScore>) -> String {
    match quant {
        Some(q) => format!(
            "Quant filter: total {:.1} (trend {:.1}, momentum {:.1}, volume {:.1}, sentiment {:.1})\n",
            q.total, q.trend, q.momentum, q.volume, q.sentiment
        ),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Phase A — analyst
// ---------------------------------------------------------------------------

pub fn analyst_system() -> String {
    "You are a market analyst for a crypto trading desk. Assess the trend of one \
     symbol from the supplied indicators. Be specific and terse; your output feeds \
     an automated pipeline."
        .to_string()
}

pub fn analyst_prompt(
    symbol: &str,
    indicators: Option<&IndicatorSnapshot>,
    quant: Option<&QuantScore>,
) -> String {
    format!(
        "Symbol: {symbol}\n\n{}{}\nClassify the trend (bullish / bearish / neutral), list any \
         key price levels worth defending (omit the field if none), and summarise your view \
         in two sentences.",
        indicator_block(indicators),
        quant_block(quant),
    )
}

// ---------------------------------------------------------------------------
// Phase B — bull / bear
// ---------------------------------------------------------------------------

pub fn trader_system(bullish: bool) -> String {
    if bullish {
        "You are the bull in a structured trading debate. Argue the strongest \
         reasonable case FOR taking a position, but concede to 'wait' when the \
         setup is genuinely poor."
            .to_string()
    } else {
        "You are the bear in a structured trading debate. Argue the strongest \
         reasonable case AGAINST the position, or for a short, but concede to \
         'wait' when the setup is genuinely poor."
            .to_string()
    }
}

pub fn trader_prompt(
    symbol: &str,
    analyst: Option<&AnalystOutput>,
    opposing: Option<&TraderSuggestion>,
    round: u32,
    window: &PerformanceWindow,
    history_limit: usize,
) -> String {
    let mut prompt = format!("Round {round} for {symbol}.\n\n");

    if let Some(analysis) = analyst {
        prompt.push_str(&format!(
            "Analyst view: trend {:?}. {}\n",
            analysis.trend, analysis.summary
        ));
        if let Some(levels) = &analysis.key_levels {
            prompt.push_str(&format!("Key levels: {levels:?}\n"));
        }
    }

    match opposing {
        Some(view) => prompt.push_str(&format!(
            "\nOpposing view from the previous round: action {}, confidence {:.0}, \
             allocation {:.1}%. Their reasoning: {}\nRebut or concede explicitly.\n",
            view.action, view.confidence, view.allocation_pct, view.reasoning
        )),
        None => prompt.push_str("\nThis is the opening round; no opposing view yet.\n"),
    }

    prompt.push('\n');
    prompt.push_str(&trade_history_block(window, history_limit));
    prompt.push_str(
        "\nPropose action (long / short / wait), confidence 0-100, allocation percent, \
         stop-loss percent, take-profit percent and your reasoning.",
    );
    prompt
}

// ---------------------------------------------------------------------------
// Phase C — risk manager
// ---------------------------------------------------------------------------

pub fn risk_manager_system() -> String {
    "You are the risk manager with final authority over the portfolio. Synthesise \
     the analyst views and the bull/bear debate into at most one decision per \
     symbol, sized within the account's risk limits. Prefer missing a trade over \
     violating a limit."
        .to_string()
}

pub fn risk_manager_prompt(
    analysts: &[AnalystOutput],
    bull_final: &[TraderSuggestion],
    bear_final: &[TraderSuggestion],
    window: &PerformanceWindow,
    limits: &RiskLimits,
    history_limit: usize,
) -> String {
    let mut prompt = String::from("Analyst views:\n");
    for a in analysts {
        prompt.push_str(&format!("- {}: {:?} — {}\n", a.symbol, a.trend, a.summary));
    }

    prompt.push_str("\nBull final positions:\n");
    for s in bull_final {
        prompt.push_str(&format!(
            "- {}: {} conf {:.0} alloc {:.1}% sl {:.1}% tp {:.1}% — {}\n",
            s.symbol,
            s.action,
            s.confidence,
            s.allocation_pct,
            s.stop_loss_pct,
            s.take_profit_pct,
            s.reasoning
        ));
    }
    prompt.push_str("\nBear final positions:\n");
    for s in bear_final {
        prompt.push_str(&format!(
            "- {}: {} conf {:.0} alloc {:.1}% sl {:.1}% tp {:.1}% — {}\n",
            s.symbol,
            s.action,
            s.confidence,
            s.allocation_pct,
            s.stop_loss_pct,
            s.take_profit_pct,
            s.reasoning
        ));
    }

    prompt.push('\n');
    prompt.push_str(&trade_history_block(window, history_limit));

    prompt.push_str(&format!(
        "\nRisk limits: total allocation <= {:.1}%, single allocation <= {:.1}%, \
         leverage <= {:.1}x, min risk/reward {:.1}. Always set an explicit leverage \
         on every non-wait decision.\n\nProduce the batch decision.",
        limits.max_total_allocation_pct,
        limits.max_single_allocation_pct,
        limits.max_leverage,
        limits.min_risk_reward_ratio,
    ));
    prompt
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PositionSide, TradeRecord};
    use chrono::Utc;
    use uuid::Uuid;

    fn window_with_losses(n: u32) -> PerformanceWindow {
        let trades = (0..n)
            .map(|i| TradeRecord {
                id: Uuid::new_v4(),
                bot_id: Uuid::new_v4(),
                symbol: "BTC/USDT".into(),
                side: PositionSide::Long,
                action: "long".into(),
                entry_price: 100.0,
                exit_price: Some(95.0),
                amount: 1.0,
                leverage: 1.0,
                pnl_usd: Some(-5.0),
                pnl_percent: Some(-5.0),
                fee_paid: None,
                status: TradeStatus::Closed,
                opened_at: Utc::now(),
                closed_at: Some(Utc::now()),
                cycle_id: i as i64,
                order_id: None,
            })
            .collect();
        PerformanceWindow::from_trades(trades)
    }

    #[test]
    fn history_block_mentions_streak_warning() {
        let block = trade_history_block(&window_with_losses(4), 10);
        assert!(block.contains("Consecutive losses: 4"));
        assert!(block.contains("losing streak"));
    }

    #[test]
    fn history_block_respects_limit() {
        let block = trade_history_block(&window_with_losses(8), 3);
        assert_eq!(block.matches("BTC/USDT").count(), 3);
    }

    #[test]
    fn trader_prompt_carries_opposing_view() {
        let opposing = TraderSuggestion {
            symbol: "BTC/USDT".into(),
            action: crate::types::TradeAction::Short,
            confidence: 80.0,
            allocation_pct: 10.0,
            stop_loss_pct: 2.0,
            take_profit_pct: 5.0,
            reasoning: "distribution at the highs".into(),
        };
        let prompt = trader_prompt(
            "BTC/USDT",
            None,
            Some(&opposing),
            2,
            &PerformanceWindow::default(),
            10,
        );
        assert!(prompt.contains("Opposing view"));
        assert!(prompt.contains("distribution at the highs"));
    }

    #[test]
    fn risk_manager_prompt_names_the_limits() {
        let limits = RiskLimits::default();
        let prompt = risk_manager_prompt(
            &[],
            &[],
            &[],
            &PerformanceWindow::default(),
            &limits,
            10,
        );
        assert!(prompt.contains("total allocation <= 80.0%"));
        assert!(prompt.contains("leverage <= 10.0x"));
    }
}
