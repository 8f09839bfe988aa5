// =============================================================================
// Risk Monitor — every order passes the table before the executor sees it
// =============================================================================
//
// Checks, in order:
//
//   breaker: consecutive losses      -> pause bot (when enabled)
//   breaker: drawdown                -> pause bot (when enabled)
//   breaker: daily loss              -> reject everything this cycle
//   total allocation <= max_total    -> reject batch
//   per-symbol alloc <= max_single   -> reject that symbol
//   leverage <= max_leverage         -> clamp to max
//   missing leverage                 -> reject unless defaulting enabled
//   size in [min_usd, max_usd]       -> reject that symbol
//   risk/reward >= min ratio         -> reject that symbol
//   funding rate <= max              -> reject that symbol (when enabled)
//
// The monitor also proposes trailing-stop amendments for open positions in
// profit; proposals are written into CycleState and the executor owns
// issuing the amend order.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskLimits;
use crate::cycle::{ApprovedOrder, PerformanceWindow, TrailingStopProposal};
use crate::debate::outputs::BatchDecision;
use crate::types::{Balance, Position, PositionSide, TradeAction};

/// A decision the monitor refused, with the operator-facing reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedDecision {
    pub symbol: String,
    pub reason: String,
}

/// The monitor's output for one batch decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub approved: Vec<ApprovedOrder>,
    pub rejected: Vec<RejectedDecision>,
    /// Set when a breaker demands the scheduler pause the bot.
    pub pause: Option<String>,
}

pub struct RiskMonitor {
    limits: RiskLimits,
}

impl RiskMonitor {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    /// Validate a batch decision against the limits and the account state.
    ///
    /// `funding_rates` maps symbol -> current funding rate in percent.
    pub fn validate(
        &self,
        decision: &BatchDecision,
        balance: &Balance,
        positions: &[Position],
        funding_rates: &HashMap<String, f64>,
        performance: &PerformanceWindow,
    ) -> RiskVerdict {
        let limits = &self.limits;
        let mut verdict = RiskVerdict::default();

        // --- Breakers first: they outrank any individual decision --------
        if performance.consecutive_losses >= limits.max_consecutive_losses {
            let message = format!(
                "consecutive-loss breaker tripped: {} losses (limit {})",
                performance.consecutive_losses, limits.max_consecutive_losses
            );
            warn!("{message}");
            if limits.pause_on_consecutive_loss {
                verdict.pause = Some(message);
                return verdict;
            }
        }

        let drawdown_pct = if balance.total_usd > 0.0 {
            performance.drawdown_usd / balance.total_usd * 100.0
        } else {
            0.0
        };
        if drawdown_pct >= limits.max_drawdown_pct {
            let message = format!(
                "drawdown breaker tripped: {drawdown_pct:.2}% (limit {:.2}%)",
                limits.max_drawdown_pct
            );
            warn!("{message}");
            if limits.pause_on_max_drawdown {
                verdict.pause = Some(message);
                return verdict;
            }
        }

        let daily_loss_pct = if balance.total_usd > 0.0 {
            (-performance.daily_pnl_usd) / balance.total_usd * 100.0
        } else {
            0.0
        };
        if daily_loss_pct >= limits.max_daily_loss_pct {
            let reason = format!(
                "daily-loss breaker tripped: {daily_loss_pct:.2}% lost (limit {:.2}%)",
                limits.max_daily_loss_pct
            );
            warn!("{reason}");
            for d in &decision.decisions {
                verdict.rejected.push(RejectedDecision {
                    symbol: d.symbol.clone(),
                    reason: reason.clone(),
                });
            }
            return verdict;
        }

        // --- Total allocation, existing exposure included ----------------
        let existing_pct = if balance.total_usd > 0.0 {
            positions.iter().map(|p| p.margin_used).sum::<f64>() / balance.total_usd * 100.0
        } else {
            0.0
        };
        let requested_pct: f64 = decision
            .decisions
            .iter()
            .filter(|d| d.action != TradeAction::Wait)
            .map(|d| d.allocation_pct)
            .sum();

        if existing_pct + requested_pct > limits.max_total_allocation_pct {
            let reason = format!(
                "total allocation exceeded: {:.2}% requested + {:.2}% held > {:.2}% cap",
                requested_pct, existing_pct, limits.max_total_allocation_pct
            );
            warn!("{reason}");
            for d in &decision.decisions {
                verdict.rejected.push(RejectedDecision {
                    symbol: d.symbol.clone(),
                    reason: reason.clone(),
                });
            }
            return verdict;
        }

        // --- Per-symbol checks -------------------------------------------
        for d in &decision.decisions {
            if d.action == TradeAction::Wait {
                continue;
            }

            if d.allocation_pct > limits.max_single_allocation_pct {
                verdict.rejected.push(RejectedDecision {
                    symbol: d.symbol.clone(),
                    reason: format!(
                        "per-symbol allocation exceeded: {:.2}% > {:.2}%",
                        d.allocation_pct, limits.max_single_allocation_pct
                    ),
                });
                continue;
            }

            // Leverage: clamp overshoot, reject absence unless defaulting
            // is explicitly enabled.
            let leverage = match d.leverage {
                Some(leverage) if leverage > limits.max_leverage => {
                    info!(
                        symbol = %d.symbol,
                        requested = leverage,
                        clamped = limits.max_leverage,
                        "leverage clamped to limit"
                    );
                    limits.max_leverage
                }
                Some(leverage) if leverage >= 1.0 => leverage,
                Some(bad) => {
                    verdict.rejected.push(RejectedDecision {
                        symbol: d.symbol.clone(),
                        reason: format!("leverage {bad} below 1x"),
                    });
                    continue;
                }
                None if limits.allow_default_leverage => limits.default_leverage,
                None => {
                    verdict.rejected.push(RejectedDecision {
                        symbol: d.symbol.clone(),
                        reason: "decision carries no leverage and defaulting is disabled".into(),
                    });
                    continue;
                }
            };

            let size_usd = balance.total_usd * d.allocation_pct / 100.0;
            if size_usd < limits.min_position_size_usd || size_usd > limits.max_position_size_usd {
                verdict.rejected.push(RejectedDecision {
                    symbol: d.symbol.clone(),
                    reason: format!(
                        "position size {size_usd:.2} USD outside [{:.2}, {:.2}]",
                        limits.min_position_size_usd, limits.max_position_size_usd
                    ),
                });
                continue;
            }

            if d.stop_loss_pct <= 0.0 {
                verdict.rejected.push(RejectedDecision {
                    symbol: d.symbol.clone(),
                    reason: "decision carries no stop loss".into(),
                });
                continue;
            }
            let risk_reward = d.take_profit_pct / d.stop_loss_pct;
            if risk_reward < limits.min_risk_reward_ratio {
                verdict.rejected.push(RejectedDecision {
                    symbol: d.symbol.clone(),
                    reason: format!(
                        "risk/reward {risk_reward:.2} below minimum {:.2}",
                        limits.min_risk_reward_ratio
                    ),
                });
                continue;
            }

            if limits.funding_rate_check_enabled {
                let funding = funding_rates.get(&d.symbol).copied().unwrap_or(0.0);
                if funding.abs() > limits.max_funding_rate_pct {
                    verdict.rejected.push(RejectedDecision {
                        symbol: d.symbol.clone(),
                        reason: format!(
                            "skipped: funding rate {funding:.4}% above {:.4}%",
                            limits.max_funding_rate_pct
                        ),
                    });
                    continue;
                }
            }

            verdict.approved.push(ApprovedOrder {
                symbol: d.symbol.clone(),
                action: d.action,
                allocation_pct: d.allocation_pct,
                leverage,
                size_usd,
                stop_loss_pct: d.stop_loss_pct,
                take_profit_pct: d.take_profit_pct,
            });
        }

        verdict
    }

    // -------------------------------------------------------------------------
    // Trailing stop
    // -------------------------------------------------------------------------

    /// Propose stop amendments for positions whose raw price move has
    /// crossed the trigger. The stop trails the mark by `distance_pct` and
    /// never locks less than `lock_profit_pct` of the entry.
    pub fn propose_trailing_stops(&self, positions: &[Position]) -> Vec<TrailingStopProposal> {
        let limits = &self.limits;
        if !limits.trailing_stop_enabled {
            return Vec::new();
        }

        let mut proposals = Vec::new();
        for pos in positions {
            if pos.entry_price <= 0.0 || pos.mark_price <= 0.0 {
                continue;
            }
            let direction = match pos.side {
                PositionSide::Long => 1.0,
                PositionSide::Short => -1.0,
            };
            let move_pct = (pos.mark_price - pos.entry_price) / pos.entry_price * 100.0 * direction;
            if move_pct < limits.trailing_stop_trigger_pct {
                continue;
            }

            let trail = match pos.side {
                PositionSide::Long => {
                    pos.mark_price * (1.0 - limits.trailing_stop_distance_pct / 100.0)
                }
                PositionSide::Short => {
                    pos.mark_price * (1.0 + limits.trailing_stop_distance_pct / 100.0)
                }
            };
            let floor = match pos.side {
                PositionSide::Long => {
                    pos.entry_price * (1.0 + limits.trailing_stop_lock_profit_pct / 100.0)
                }
                PositionSide::Short => {
                    pos.entry_price * (1.0 - limits.trailing_stop_lock_profit_pct / 100.0)
                }
            };
            let new_stop = match pos.side {
                PositionSide::Long => trail.max(floor),
                PositionSide::Short => trail.min(floor),
            };
            let locked_profit_pct =
                (new_stop - pos.entry_price) / pos.entry_price * 100.0 * direction;

            info!(
                symbol = %pos.symbol,
                side = %pos.side,
                new_stop,
                locked_profit_pct,
                "trailing stop proposed"
            );
            proposals.push(TrailingStopProposal {
                symbol: pos.symbol.clone(),
                side: pos.side,
                new_stop_price: new_stop,
                locked_profit_pct,
            });
        }
        proposals
    }
}

impl std::fmt::Debug for RiskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskMonitor")
            .field("max_total_allocation_pct", &self.limits.max_total_allocation_pct)
            .field("max_leverage", &self.limits.max_leverage)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::outputs::PortfolioDecision;

    fn limits() -> RiskLimits {
        RiskLimits::default()
    }

    fn balance() -> Balance {
        Balance {
            total_usd: 10_000.0,
            available_usd: 10_000.0,
        }
    }

    fn decision(symbol: &str, allocation: f64, leverage: Option<f64>) -> PortfolioDecision {
        PortfolioDecision {
            symbol: symbol.into(),
            action: TradeAction::Long,
            allocation_pct: allocation,
            leverage,
            stop_loss_pct: 2.0,
            take_profit_pct: 6.0,
            confidence: 70.0,
            rationale: "test".into(),
        }
    }

    fn batch(decisions: Vec<PortfolioDecision>) -> BatchDecision {
        let total = decisions.iter().map(|d| d.allocation_pct).sum();
        BatchDecision {
            decisions,
            total_allocation_pct: total,
            cash_reserve_pct: 100.0 - total,
            strategy_rationale: "test".into(),
        }
    }

    #[test]
    fn happy_path_approves_and_sizes() {
        let monitor = RiskMonitor::new(limits());
        let verdict = monitor.validate(
            &batch(vec![decision("BTC/USDT", 5.0, Some(3.0))]),
            &balance(),
            &[],
            &HashMap::new(),
            &PerformanceWindow::default(),
        );
        assert!(verdict.pause.is_none());
        assert_eq!(verdict.approved.len(), 1);
        let order = &verdict.approved[0];
        assert!((order.size_usd - 500.0).abs() < 1e-9);
        assert!((order.leverage - 3.0).abs() < 1e-9);
    }

    #[test]
    fn per_symbol_allocation_rejects_that_symbol_only() {
        let monitor = RiskMonitor::new(limits());
        let verdict = monitor.validate(
            &batch(vec![
                decision("BTC/USDT", 50.0, Some(3.0)),
                decision("ETH/USDT", 5.0, Some(2.0)),
            ]),
            &balance(),
            &[],
            &HashMap::new(),
            &PerformanceWindow::default(),
        );
        assert_eq!(verdict.approved.len(), 1);
        assert_eq!(verdict.approved[0].symbol, "ETH/USDT");
        assert_eq!(verdict.rejected.len(), 1);
        assert!(verdict.rejected[0]
            .reason
            .contains("per-symbol allocation exceeded"));
    }

    #[test]
    fn total_allocation_rejects_the_batch() {
        let mut custom = limits();
        custom.max_single_allocation_pct = 60.0;
        let monitor = RiskMonitor::new(custom);
        let verdict = monitor.validate(
            &batch(vec![
                decision("BTC/USDT", 50.0, Some(2.0)),
                decision("ETH/USDT", 50.0, Some(2.0)),
            ]),
            &balance(),
            &[],
            &HashMap::new(),
            &PerformanceWindow::default(),
        );
        assert!(verdict.approved.is_empty());
        assert_eq!(verdict.rejected.len(), 2);
        assert!(verdict.rejected[0].reason.contains("total allocation"));
    }

    #[test]
    fn leverage_is_clamped_not_rejected() {
        let monitor = RiskMonitor::new(limits());
        let verdict = monitor.validate(
            &batch(vec![decision("BTC/USDT", 5.0, Some(50.0))]),
            &balance(),
            &[],
            &HashMap::new(),
            &PerformanceWindow::default(),
        );
        assert_eq!(verdict.approved.len(), 1);
        assert!((verdict.approved[0].leverage - 10.0).abs() < 1e-9);
    }

    #[test]
    fn missing_leverage_rejected_unless_defaulting_enabled() {
        let monitor = RiskMonitor::new(limits());
        let verdict = monitor.validate(
            &batch(vec![decision("BTC/USDT", 5.0, None)]),
            &balance(),
            &[],
            &HashMap::new(),
            &PerformanceWindow::default(),
        );
        assert!(verdict.approved.is_empty());
        assert!(verdict.rejected[0].reason.contains("no leverage"));

        let mut permissive = limits();
        permissive.allow_default_leverage = true;
        let monitor = RiskMonitor::new(permissive);
        let verdict = monitor.validate(
            &batch(vec![decision("BTC/USDT", 5.0, None)]),
            &balance(),
            &[],
            &HashMap::new(),
            &PerformanceWindow::default(),
        );
        assert_eq!(verdict.approved.len(), 1);
        assert!((verdict.approved[0].leverage - 3.0).abs() < 1e-9);
    }

    #[test]
    fn size_band_rejects_dust_and_whales() {
        let monitor = RiskMonitor::new(limits());
        // 0.05 % of 10k = 5 USD < 10 USD minimum.
        let verdict = monitor.validate(
            &batch(vec![decision("BTC/USDT", 0.05, Some(2.0))]),
            &balance(),
            &[],
            &HashMap::new(),
            &PerformanceWindow::default(),
        );
        assert!(verdict.approved.is_empty());
        assert!(verdict.rejected[0].reason.contains("outside"));
    }

    #[test]
    fn poor_risk_reward_is_rejected() {
        let monitor = RiskMonitor::new(limits());
        let mut d = decision("BTC/USDT", 5.0, Some(2.0));
        d.take_profit_pct = 2.0; // rr = 1.0 < 1.5
        let verdict = monitor.validate(
            &batch(vec![d]),
            &balance(),
            &[],
            &HashMap::new(),
            &PerformanceWindow::default(),
        );
        assert!(verdict.rejected[0].reason.contains("risk/reward"));
    }

    #[test]
    fn funding_guard_drops_the_symbol() {
        let monitor = RiskMonitor::new(limits());
        let mut funding = HashMap::new();
        funding.insert("BTC/USDT".to_string(), 0.08);
        let verdict = monitor.validate(
            &batch(vec![decision("BTC/USDT", 5.0, Some(2.0))]),
            &balance(),
            &[],
            &funding,
            &PerformanceWindow::default(),
        );
        assert!(verdict.approved.is_empty());
        assert!(verdict.rejected[0].reason.contains("skipped: funding"));
    }

    #[test]
    fn funding_guard_respects_the_switch() {
        let mut relaxed = limits();
        relaxed.funding_rate_check_enabled = false;
        let monitor = RiskMonitor::new(relaxed);
        let mut funding = HashMap::new();
        funding.insert("BTC/USDT".to_string(), 0.5);
        let verdict = monitor.validate(
            &batch(vec![decision("BTC/USDT", 5.0, Some(2.0))]),
            &balance(),
            &[],
            &funding,
            &PerformanceWindow::default(),
        );
        assert_eq!(verdict.approved.len(), 1);
    }

    #[test]
    fn consecutive_loss_breaker_pauses() {
        let monitor = RiskMonitor::new(limits());
        let performance = PerformanceWindow {
            consecutive_losses: 5,
            ..PerformanceWindow::default()
        };
        let verdict = monitor.validate(
            &batch(vec![decision("BTC/USDT", 5.0, Some(2.0))]),
            &balance(),
            &[],
            &HashMap::new(),
            &performance,
        );
        assert!(verdict.pause.is_some());
        assert!(verdict.approved.is_empty());
    }

    #[test]
    fn wait_decisions_pass_through_silently() {
        let monitor = RiskMonitor::new(limits());
        let mut d = decision("BTC/USDT", 0.0, None);
        d.action = TradeAction::Wait;
        let verdict = monitor.validate(
            &batch(vec![d]),
            &balance(),
            &[],
            &HashMap::new(),
            &PerformanceWindow::default(),
        );
        assert!(verdict.approved.is_empty());
        assert!(verdict.rejected.is_empty());
    }

    #[test]
    fn trailing_stop_triggers_above_threshold() {
        let mut enabled = limits();
        enabled.trailing_stop_enabled = true;
        let monitor = RiskMonitor::new(enabled);

        let position = Position {
            symbol: "BTC/USDT".into(),
            side: PositionSide::Long,
            size: 0.1,
            entry_price: 100.0,
            mark_price: 105.0, // +5 % > 2 % trigger
            leverage: 3.0,
            margin_used: 100.0,
            unrealized_pnl: 0.5,
            liquidation_price: None,
        };
        let proposals = monitor.propose_trailing_stops(&[position]);
        assert_eq!(proposals.len(), 1);
        // Stop trails 1 % under the mark: 103.95, above the 0.5 % lock.
        assert!((proposals[0].new_stop_price - 103.95).abs() < 1e-9);
        assert!(proposals[0].locked_profit_pct >= 0.5);
    }

    #[test]
    fn trailing_stop_lock_floor_wins_near_the_trigger() {
        let mut enabled = limits();
        enabled.trailing_stop_enabled = true;
        enabled.trailing_stop_distance_pct = 3.0;
        let monitor = RiskMonitor::new(enabled);

        let position = Position {
            symbol: "ETH/USDT".into(),
            side: PositionSide::Long,
            size: 1.0,
            entry_price: 100.0,
            mark_price: 102.0, // trail would be 98.94, below the lock floor
            leverage: 1.0,
            margin_used: 100.0,
            unrealized_pnl: 2.0,
            liquidation_price: None,
        };
        let proposals = monitor.propose_trailing_stops(&[position]);
        assert_eq!(proposals.len(), 1);
        assert!((proposals[0].new_stop_price - 100.5).abs() < 1e-9);
    }

    #[test]
    fn trailing_stop_disabled_proposes_nothing() {
        let monitor = RiskMonitor::new(limits());
        let position = Position {
            symbol: "BTC/USDT".into(),
            side: PositionSide::Long,
            size: 0.1,
            entry_price: 100.0,
            mark_price: 120.0,
            leverage: 1.0,
            margin_used: 100.0,
            unrealized_pnl: 2.0,
            liquidation_price: None,
        };
        assert!(monitor.propose_trailing_stops(&[position]).is_empty());
    }
}
