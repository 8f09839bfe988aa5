// =============================================================================
// In-Memory Store Doubles — trade history and checkpoints without Postgres
// =============================================================================
//
// Behaviour-faithful stand-ins used by unit tests and the backtest seam.
// They uphold the same invariants as the Pg implementations: one open trade
// per `(bot_id, symbol)`, idempotent opens on `(bot_id, cycle_id, symbol,
// action)`, write-once checkpoints.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::BotConfig;
use crate::cycle::CycleState;
use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangeConfig;
use crate::llm::LlmConfig;
use crate::store::{CheckpointSink, ControlStore, TradeStore};
use crate::types::{TradeRecord, TradeStatus};
use crate::workflow::graph::WorkflowGraph;

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTradeStore {
    trades: Mutex<Vec<TradeRecord>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored trade, oldest first (test inspection).
    pub fn all(&self) -> Vec<TradeRecord> {
        self.trades.lock().clone()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn record_open(&self, trade: &TradeRecord) -> EngineResult<bool> {
        let mut trades = self.trades.lock();

        let duplicate = trades.iter().any(|t| {
            t.bot_id == trade.bot_id
                && t.cycle_id == trade.cycle_id
                && t.symbol == trade.symbol
                && t.action == trade.action
        });
        if duplicate {
            return Ok(false);
        }

        let open_exists = trades.iter().any(|t| {
            t.bot_id == trade.bot_id && t.symbol == trade.symbol && t.status == TradeStatus::Open
        });
        if open_exists {
            return Err(EngineError::Validation(format!(
                "an open trade already exists for {}",
                trade.symbol
            )));
        }

        trades.push(trade.clone());
        Ok(true)
    }

    async fn close_trade(
        &self,
        id: Uuid,
        exit_price: f64,
        pnl_usd: f64,
        pnl_percent: f64,
        fee_paid: f64,
    ) -> EngineResult<()> {
        let mut trades = self.trades.lock();
        if let Some(trade) = trades
            .iter_mut()
            .find(|t| t.id == id && t.status == TradeStatus::Open)
        {
            trade.exit_price = Some(exit_price);
            trade.pnl_usd = Some(pnl_usd);
            trade.pnl_percent = Some(pnl_percent);
            trade.fee_paid = Some(trade.fee_paid.unwrap_or(0.0) + fee_paid);
            trade.status = TradeStatus::Closed;
            trade.closed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn find_open(&self, bot_id: Uuid, symbol: &str) -> EngineResult<Option<TradeRecord>> {
        Ok(self
            .trades
            .lock()
            .iter()
            .find(|t| t.bot_id == bot_id && t.symbol == symbol && t.status == TradeStatus::Open)
            .cloned())
    }

    async fn recent(&self, bot_id: Uuid, limit: i64) -> EngineResult<Vec<TradeRecord>> {
        let trades = self.trades.lock();
        let mut recent: Vec<TradeRecord> = trades
            .iter()
            .filter(|t| t.bot_id == bot_id)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        recent.truncate(limit.max(0) as usize);
        Ok(recent)
    }

    async fn exists(
        &self,
        bot_id: Uuid,
        cycle_id: i64,
        symbol: &str,
        action: &str,
    ) -> EngineResult<bool> {
        Ok(self.trades.lock().iter().any(|t| {
            t.bot_id == bot_id
                && t.cycle_id == cycle_id
                && t.symbol == symbol
                && t.action == action
        }))
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCheckpointStore {
    // (thread_id, cycle_id, node_name) -> serialised state, insertion order
    // tracked separately for nodes_for_cycle.
    entries: Mutex<HashMap<(String, i64, String), Vec<u8>>>,
    order: Mutex<Vec<(String, i64, String)>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored bytes (test inspection of immutability).
    pub fn raw(&self, thread_id: &str, cycle_id: i64, node_name: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .get(&(thread_id.to_string(), cycle_id, node_name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpointStore {
    async fn put(
        &self,
        thread_id: &str,
        cycle_id: i64,
        node_name: &str,
        state: &CycleState,
    ) -> EngineResult<()> {
        let key = (thread_id.to_string(), cycle_id, node_name.to_string());
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            // Write-once: the first write wins, forever.
            return Ok(());
        }
        let blob = serde_json::to_vec(state)
            .map_err(|e| EngineError::Validation(format!("cycle state serialise: {e}")))?;
        entries.insert(key.clone(), blob);
        self.order.lock().push(key);
        Ok(())
    }

    async fn load(
        &self,
        thread_id: &str,
        cycle_id: i64,
        node_name: &str,
    ) -> EngineResult<Option<CycleState>> {
        let entries = self.entries.lock();
        let key = (thread_id.to_string(), cycle_id, node_name.to_string());
        match entries.get(&key) {
            Some(blob) => {
                let state = serde_json::from_slice(blob).map_err(|e| {
                    EngineError::Fatal(format!("checkpoint state unparseable: {e}"))
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn nodes_for_cycle(
        &self,
        thread_id: &str,
        cycle_id: i64,
    ) -> EngineResult<Vec<String>> {
        Ok(self
            .order
            .lock()
            .iter()
            .filter(|(t, c, _)| t == thread_id && *c == cycle_id)
            .map(|(_, _, node)| node.clone())
            .collect())
    }

    async fn latest_cycle(&self, thread_id: &str) -> EngineResult<Option<i64>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|(t, _, _)| t == thread_id)
            .map(|(_, c, _)| *c)
            .max())
    }
}

// ---------------------------------------------------------------------------
// Control store
// ---------------------------------------------------------------------------

/// In-memory control store: bots, exchanges, workflows and LLM configs in
/// maps, trade history delegated to an embedded [`MemoryTradeStore`].
#[derive(Default)]
pub struct MemoryControlStore {
    pub bots: Mutex<HashMap<Uuid, BotConfig>>,
    pub exchanges: Mutex<HashMap<Uuid, ExchangeConfig>>,
    pub workflows: Mutex<HashMap<Uuid, WorkflowGraph>>,
    pub llms: Mutex<Vec<LlmConfig>>,
    trades: MemoryTradeStore,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_bot(&self, config: BotConfig) {
        self.bots.lock().insert(config.id, config);
    }

    pub fn insert_exchange(&self, config: ExchangeConfig) {
        self.exchanges.lock().insert(config.id, config);
    }

    pub fn insert_workflow(&self, graph: WorkflowGraph) {
        self.workflows.lock().insert(graph.id, graph);
    }

    pub fn trades(&self) -> &MemoryTradeStore {
        &self.trades
    }
}

#[async_trait]
impl TradeStore for MemoryControlStore {
    async fn record_open(&self, trade: &TradeRecord) -> EngineResult<bool> {
        self.trades.record_open(trade).await
    }

    async fn close_trade(
        &self,
        id: Uuid,
        exit_price: f64,
        pnl_usd: f64,
        pnl_percent: f64,
        fee_paid: f64,
    ) -> EngineResult<()> {
        self.trades
            .close_trade(id, exit_price, pnl_usd, pnl_percent, fee_paid)
            .await
    }

    async fn find_open(&self, bot_id: Uuid, symbol: &str) -> EngineResult<Option<TradeRecord>> {
        self.trades.find_open(bot_id, symbol).await
    }

    async fn recent(&self, bot_id: Uuid, limit: i64) -> EngineResult<Vec<TradeRecord>> {
        self.trades.recent(bot_id, limit).await
    }

    async fn exists(
        &self,
        bot_id: Uuid,
        cycle_id: i64,
        symbol: &str,
        action: &str,
    ) -> EngineResult<bool> {
        self.trades.exists(bot_id, cycle_id, symbol, action).await
    }
}

#[async_trait]
impl ControlStore for MemoryControlStore {
    async fn list_bots(&self) -> EngineResult<Vec<BotConfig>> {
        Ok(self.bots.lock().values().cloned().collect())
    }

    async fn get_bot(&self, id: Uuid) -> EngineResult<Option<BotConfig>> {
        Ok(self.bots.lock().get(&id).cloned())
    }

    async fn upsert_bot(&self, config: &BotConfig) -> EngineResult<()> {
        self.insert_bot(config.clone());
        Ok(())
    }

    async fn delete_bot(&self, id: Uuid) -> EngineResult<bool> {
        Ok(self.bots.lock().remove(&id).is_some())
    }

    async fn get_exchange(&self, id: Uuid) -> EngineResult<Option<ExchangeConfig>> {
        Ok(self.exchanges.lock().get(&id).cloned())
    }

    async fn get_workflow(&self, id: Uuid) -> EngineResult<Option<WorkflowGraph>> {
        Ok(self.workflows.lock().get(&id).cloned())
    }

    async fn list_llm_configs(&self) -> EngineResult<Vec<LlmConfig>> {
        Ok(self.llms.lock().clone())
    }

    async fn last_cycle_id(&self, bot_id: Uuid) -> EngineResult<Option<i64>> {
        Ok(self
            .trades
            .all()
            .iter()
            .filter(|t| t.bot_id == bot_id)
            .map(|t| t.cycle_id)
            .max())
    }

    async fn refresh_session(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn cache_ttl_overrides(&self) -> EngineResult<HashMap<String, u64>> {
        Ok(HashMap::new())
    }
}
