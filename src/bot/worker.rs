// =============================================================================
// Bot Worker — one long-lived task driving READY -> LOOP -> SLEEP -> ...
// =============================================================================
//
// Lifecycle per iteration:
//
//   1. Re-read BotConfig (TTL-cached; edits land on the next boundary).
//   2. Allocate cycle_id = previous + 1, materialise a fresh CycleState
//      with live balance, positions and the performance window.
//   3. Freeze the workflow and run the pipeline.
//   4. Non-fatal errors are recorded and the loop continues; fatal errors
//      park the bot in `error`.
//   5. Reconcile stream subscriptions against the active symbol set.
//   6. Sleep max(0, interval - elapsed); an overrun cycle rolls straight
//      into the next one (backpressure, no sleep). Cancellation pre-empts
//      the sleep immediately.
//   7. Every N cycles (default 50) a maintenance pass refreshes the store
//      session and sweeps the cache.
//
// The worker owns its cache, stream manager and exchange stack; all of it
// dies with the worker. Status leaves through the publisher only.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bot::logs::BotLogger;
use crate::bot::status::StatusPublisher;
use crate::config::BotConfig;
use crate::cycle::{CycleState, PerformanceWindow};
use crate::error::{EngineError, EngineResult};
use crate::exchange::client::RateLimitedExchange;
use crate::exchange::{build_adapter, ExchangeAdapter, StreamChannel};
use crate::llm::fallback::PromptCache;
use crate::llm::LlmFactory;
use crate::market::cache::{CacheTtls, MarketCache};
use crate::market::poll::PollProvider;
use crate::market::stream::StreamManager;
use crate::settings::Settings;
use crate::store::{CheckpointSink, ControlStore, TradeStore};
use crate::types::{BotState, BotStatus, Position, TradingMode};
use crate::workflow::registry::PluginRegistry;
use crate::workflow::runtime::{PipelineRuntime, PluginContext};

/// Paper accounts start with this balance when the venue cannot be probed.
const DEFAULT_PAPER_BALANCE_USD: f64 = 10_000.0;

/// Trades pulled into the rolling performance window each cycle.
const PERFORMANCE_WINDOW_TRADES: i64 = 50;

/// Everything a worker borrows from the process.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn ControlStore>,
    pub trades: Arc<dyn TradeStore>,
    pub checkpoints: Arc<dyn CheckpointSink>,
    pub registry: Arc<PluginRegistry>,
    pub settings: Settings,
    pub status: Arc<StatusPublisher>,
}

/// The per-worker runtime stack built during one-time initialisation.
struct WorkerStack {
    exchange: Arc<dyn ExchangeAdapter>,
    cache: Arc<MarketCache>,
    poll: Arc<PollProvider>,
    stream: StreamManager,
    llm: Arc<LlmFactory>,
    runtime: PipelineRuntime,
    logger: BotLogger,
}

/// Drive one bot until cancelled or dead. All outcomes leave through the
/// status publisher; the function itself never panics on engine errors.
pub async fn run_bot_worker(bot_id: Uuid, deps: WorkerDeps, mut cancel: watch::Receiver<bool>) {
    let publish_terminal = |state: BotState, cycle: i64, last_error: Option<String>| {
        let mut status = BotStatus::unknown(bot_id);
        status.state = state;
        status.current_cycle = cycle;
        status.last_error = last_error;
        if let Err(e) = deps.status.publish(&status) {
            error!(%bot_id, error = %e, "failed to publish terminal status");
        }
    };

    // ── One-time initialisation ──────────────────────────────────────────
    let (mut config, stack) = match init_worker(bot_id, &deps).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(%bot_id, error = %e, "worker initialisation failed");
            publish_terminal(BotState::Error, 0, Some(e.to_string()));
            return;
        }
    };

    let mut cycle = match deps.store.last_cycle_id(bot_id).await {
        Ok(last) => last.unwrap_or(0),
        Err(e) => {
            warn!(%bot_id, error = %e, "could not read last cycle id — starting from 0");
            0
        }
    };

    stack
        .logger
        .line(&format!("worker ready (resuming after cycle {cycle})"));
    info!(%bot_id, resumed_cycle = cycle, "worker READY");

    let mut config_read_at = Instant::now();
    let config_ttl = Duration::from_secs(deps.settings.config_cache_ttl_s);
    let mut terminal: Option<(BotState, Option<String>)> = None;

    // ── Main loop ────────────────────────────────────────────────────────
    loop {
        if *cancel.borrow() {
            terminal = Some((BotState::Stopped, None));
            break;
        }

        // Config re-read on the TTL boundary; edits apply from this cycle.
        if config_read_at.elapsed() >= config_ttl {
            match deps.store.get_bot(bot_id).await {
                Ok(Some(fresh)) => {
                    config = fresh;
                    config_read_at = Instant::now();
                }
                Ok(None) => {
                    terminal = Some((
                        BotState::Error,
                        Some("bot configuration deleted while running".into()),
                    ));
                    break;
                }
                Err(e) if e.is_fatal() => {
                    terminal = Some((BotState::Error, Some(e.to_string())));
                    break;
                }
                Err(e) => {
                    warn!(%bot_id, error = %e, "config re-read failed — keeping cached config");
                }
            }
        }

        cycle += 1;
        let started = Instant::now();

        let outcome = run_one_cycle(bot_id, cycle, &config, &deps, &stack, &cancel).await;

        match outcome {
            Ok(CycleOutcome::Completed(final_state)) => {
                let active = final_state.active_symbols();
                // A cycle that approved nothing is best explained by why
                // its symbols were dropped, not by the debate summary.
                let decision_note = if final_state.approved_orders.is_empty() {
                    first_skip_note(&final_state).or_else(|| final_state.debate_summary.clone())
                } else {
                    final_state.debate_summary.clone()
                };

                publish_cycle(
                    &deps,
                    &stack,
                    bot_id,
                    cycle,
                    &final_state,
                    decision_note,
                )
                .await;

                stack.logger.line(&format!(
                    "cycle {cycle} complete: {} symbols active, {} errors",
                    active.len(),
                    final_state.errors.len()
                ));

                if let Some(reason) = final_state.pause_reason {
                    stack.logger.line(&format!("paused by risk breaker: {reason}"));
                    terminal = Some((BotState::Stopped, Some(reason)));
                    break;
                }
            }
            Ok(CycleOutcome::Skipped(reason)) => {
                warn!(%bot_id, cycle, %reason, "cycle skipped");
                stack.logger.line(&format!("cycle {cycle} skipped: {reason}"));
            }
            Err(EngineError::Cancelled) => {
                terminal = Some((BotState::Stopped, None));
                break;
            }
            Err(e) if e.is_fatal() => {
                error!(%bot_id, cycle, error = %e, "fatal cycle error");
                stack.logger.line(&format!("fatal error: {e}"));
                terminal = Some((BotState::Error, Some(e.to_string())));
                break;
            }
            Err(e) => {
                warn!(%bot_id, cycle, error = %e, "cycle failed — continuing");
                stack.logger.line(&format!("cycle {cycle} failed: {e}"));
            }
        }

        // Maintenance pass every N cycles.
        if deps.settings.maintenance_every_cycles > 0
            && cycle % deps.settings.maintenance_every_cycles as i64 == 0
        {
            if let Err(e) = maintenance_pass(bot_id, &deps, &stack).await {
                if e.is_fatal() {
                    terminal = Some((BotState::Error, Some(e.to_string())));
                    break;
                }
                warn!(%bot_id, error = %e, "maintenance pass failed");
            }
        }

        // Sleep out the remainder of the interval. An overrun cycle starts
        // the next one immediately; cancellation pre-empts the sleep.
        let interval = Duration::from_secs(config.cycle_interval_s);
        let remaining = interval.saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        terminal = Some((BotState::Stopped, None));
                        break;
                    }
                }
            }
        }
    }

    // ── Drain ────────────────────────────────────────────────────────────
    stack.stream.shutdown().await;
    let (state, last_error) = terminal.unwrap_or((BotState::Stopped, None));
    stack.logger.line(&format!("worker exiting with state {state}"));
    publish_terminal(state, cycle, last_error);
    info!(%bot_id, %state, "worker exited");
}

// ---------------------------------------------------------------------------
// Initialisation
// ---------------------------------------------------------------------------

async fn init_worker(bot_id: Uuid, deps: &WorkerDeps) -> EngineResult<(BotConfig, WorkerStack)> {
    let config = deps
        .store
        .get_bot(bot_id)
        .await?
        .ok_or_else(|| EngineError::Configuration(format!("bot {bot_id} does not exist")))?;

    let exchange_config = deps
        .store
        .get_exchange(config.exchange_id)
        .await?
        .ok_or_else(|| {
            EngineError::Configuration(format!(
                "exchange {} for bot '{}' does not exist",
                config.exchange_id, config.name
            ))
        })?;

    let paper_mode = config.trading_mode != TradingMode::Live;
    let adapter = build_adapter(&exchange_config, paper_mode, DEFAULT_PAPER_BALANCE_USD)?;
    let exchange: Arc<dyn ExchangeAdapter> =
        Arc::new(RateLimitedExchange::new(adapter, &exchange_config));

    let ttl_overrides = deps.store.cache_ttl_overrides().await.unwrap_or_default();
    let cache = Arc::new(MarketCache::with_ttls(CacheTtls::with_overrides(
        ttl_overrides,
    )));
    let poll = Arc::new(PollProvider::new(exchange.clone(), cache.clone()));
    let stream = StreamManager::new(exchange.clone(), cache.clone());
    let llm = Arc::new(LlmFactory::new(deps.store.list_llm_configs().await?));
    let runtime = PipelineRuntime::new(deps.registry.clone(), deps.checkpoints.clone());
    let logger = BotLogger::open(&deps.settings.logs_dir, bot_id)?;

    // Exchange handshake: catalogue load plus a balance probe. A venue that
    // cannot answer either is not tradable.
    let catalogue = poll.markets().await?;
    let balance = exchange.fetch_balance().await?;
    info!(
        %bot_id,
        markets = catalogue.len(),
        balance_usd = balance.total_usd,
        mode = %config.trading_mode,
        "exchange handshake complete"
    );
    logger.line(&format!(
        "initialised on {} ({} markets, {:.2} USD, {} mode)",
        exchange.id(),
        catalogue.len(),
        balance.total_usd,
        config.trading_mode
    ));

    Ok((
        config,
        WorkerStack {
            exchange,
            cache,
            poll,
            stream,
            llm,
            runtime,
            logger,
        },
    ))
}

// ---------------------------------------------------------------------------
// One cycle
// ---------------------------------------------------------------------------

enum CycleOutcome {
    Completed(CycleState),
    /// The cycle could not even start (e.g. transient balance failure).
    Skipped(String),
}

async fn run_one_cycle(
    bot_id: Uuid,
    cycle: i64,
    config: &BotConfig,
    deps: &WorkerDeps,
    stack: &WorkerStack,
    cancel: &watch::Receiver<bool>,
) -> EngineResult<CycleOutcome> {
    // Account probe: without balance, sizing is garbage — skip the cycle on
    // transient failure, die on fatal.
    let balance = match stack.exchange.fetch_balance().await {
        Ok(balance) => balance,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => return Ok(CycleOutcome::Skipped(format!("balance probe failed: {e}"))),
    };
    let positions = stack.exchange.fetch_positions().await.unwrap_or_default();

    let recent = deps
        .trades
        .recent(bot_id, PERFORMANCE_WINDOW_TRADES)
        .await
        .unwrap_or_default();

    let mut state = CycleState::new(cycle, config.clone());
    state.balance = balance;
    state.positions = positions;
    state.performance = PerformanceWindow::from_trades(recent);

    // Freeze the workflow for this cycle; mid-cycle edits are invisible.
    let graph = deps
        .store
        .get_workflow(config.workflow_id)
        .await?
        .ok_or_else(|| {
            EngineError::Configuration(format!(
                "workflow {} for bot '{}' does not exist",
                config.workflow_id, config.name
            ))
        })?;
    let snapshot = graph.snapshot()?;

    let ctx = PluginContext {
        exchange: stack.exchange.clone(),
        poll: stack.poll.clone(),
        cache: stack.cache.clone(),
        llm: stack.llm.clone(),
        trades: deps.trades.clone(),
        prompt_cache: Arc::new(PromptCache::new()),
        cancel: cancel.clone(),
        node_timeout: Duration::from_secs(deps.settings.node_timeout_s),
    };

    let final_state = stack.runtime.run(&snapshot, state, &ctx).await?;

    // Subscription reconcile: symbols trading plus symbols with open
    // positions, over both live channels.
    let desired: HashSet<String> = final_state
        .active_symbols()
        .into_iter()
        .chain(final_state.positions.iter().map(|p| p.symbol.clone()))
        .collect();
    let stats = stack
        .stream
        .reconcile(&desired, &[StreamChannel::Ticker, StreamChannel::Trades])
        .await;
    info!(
        %bot_id,
        cycle,
        subscriptions = stats.active,
        failed = stats.failed_retries,
        "subscriptions reconciled"
    );

    Ok(CycleOutcome::Completed(final_state))
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

fn first_skip_note(state: &CycleState) -> Option<String> {
    state
        .runs
        .values()
        .find_map(|run| run.skipped.as_ref().map(|s| format!("{}: {s}", run.symbol)))
}

async fn publish_cycle(
    deps: &WorkerDeps,
    stack: &WorkerStack,
    bot_id: Uuid,
    cycle: i64,
    state: &CycleState,
    last_decision: Option<String>,
) {
    // Mark-price fallback: positions without a mark get the last trade
    // price before anyone reads them.
    let mut positions: Vec<Position> = state.positions.clone();
    for pos in &mut positions {
        if pos.mark_price == 0.0 {
            warn!(symbol = %pos.symbol, "mark price missing — falling back to last trade price");
            if let Ok(ticker) = stack.poll.ticker(&pos.symbol).await {
                pos.mark_price = ticker.last;
            }
        }
    }

    let status = BotStatus {
        bot_id,
        is_running: true,
        current_cycle: cycle,
        last_cycle_at: Some(Utc::now()),
        open_positions: positions.len(),
        symbols_trading: state.active_symbols(),
        balance: state.balance,
        last_decision,
        state: if state.decision.is_some() {
            BotState::Running
        } else {
            BotState::Idle
        },
        last_error: state.errors.last().map(|e| e.message.clone()),
    };

    if let Err(e) = deps.status.publish(&status) {
        warn!(%bot_id, error = %e, "status publish failed");
    }
    if let Err(e) = deps.status.publish_positions(bot_id, &positions) {
        warn!(%bot_id, error = %e, "positions publish failed");
    }

    if state.debate_summary.is_some() {
        let debate = serde_json::json!({
            "cycle_id": state.cycle_id,
            "summary": state.debate_summary,
            "decision": state.decision,
            "symbols": state.runs.values().map(|run| serde_json::json!({
                "symbol": run.symbol,
                "analyst": run.analyst,
                "bull_rounds": run.bull_rounds,
                "bear_rounds": run.bear_rounds,
                "decision": run.decision,
                "skipped": run.skipped,
            })).collect::<Vec<_>>(),
        });
        if let Err(e) = deps.status.publish_debate(bot_id, &debate) {
            warn!(%bot_id, error = %e, "debate publish failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

async fn maintenance_pass(
    bot_id: Uuid,
    deps: &WorkerDeps,
    stack: &WorkerStack,
) -> EngineResult<()> {
    deps.store.refresh_session().await?;
    let swept = stack.cache.sweep_expired();
    info!(%bot_id, swept, "maintenance pass complete");
    stack
        .logger
        .line(&format!("maintenance: session refreshed, {swept} cache entries swept"));
    Ok(())
}
