// =============================================================================
// Durable Store — PostgreSQL persistence for bots, workflows, trades
// =============================================================================
//
// The store owns BotConfig / Workflow / TradeHistory; everything else in
// the process is derived or ephemeral. One `PgPool` per process; each bot
// worker clones a `Store` handle (pooled, cheap) and treats it as its own
// session, refreshing it on the maintenance pass.
//
// Two seams are traits so the pipeline is testable without a database:
//
//   - `TradeStore`     — trade history reads/writes (Pg + in-memory)
//   - `CheckpointSink` — cycle-state checkpoints    (Pg + in-memory)
// =============================================================================

pub mod checkpoints;
pub mod memory;
pub mod repository;
pub mod schema;

pub use checkpoints::{CheckpointSink, PgCheckpointStore};
pub use memory::{MemoryCheckpointStore, MemoryControlStore, MemoryTradeStore};
pub use repository::Store;

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::BotConfig;
use crate::error::EngineResult;
use crate::exchange::ExchangeConfig;
use crate::llm::LlmConfig;
use crate::types::TradeRecord;
use crate::workflow::graph::WorkflowGraph;

/// Trade-history persistence seam.
///
/// Invariants the implementations uphold:
///   - at most one `open` row per `(bot_id, symbol)`
///   - `record_open` is idempotent on `(bot_id, cycle_id, symbol, action)`
///     and reports whether a row was actually inserted
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Insert an open trade. Returns `false` when the idempotence key
    /// already exists (reprocessed cycle) and nothing was written.
    async fn record_open(&self, trade: &TradeRecord) -> EngineResult<bool>;

    /// Close an open trade in place.
    async fn close_trade(
        &self,
        id: Uuid,
        exit_price: f64,
        pnl_usd: f64,
        pnl_percent: f64,
        fee_paid: f64,
    ) -> EngineResult<()>;

    /// The open trade for a symbol, if any.
    async fn find_open(&self, bot_id: Uuid, symbol: &str) -> EngineResult<Option<TradeRecord>>;

    /// Most recent trades (open and closed), newest first.
    async fn recent(&self, bot_id: Uuid, limit: i64) -> EngineResult<Vec<TradeRecord>>;

    /// Whether a trade already exists for the executor's de-dup key.
    async fn exists(
        &self,
        bot_id: Uuid,
        cycle_id: i64,
        symbol: &str,
        action: &str,
    ) -> EngineResult<bool>;
}

/// The reads and session plumbing a bot worker and the control plane need
/// from the durable store. `Store` implements this against PostgreSQL;
/// tests use the in-memory double.
#[async_trait]
pub trait ControlStore: TradeStore {
    async fn list_bots(&self) -> EngineResult<Vec<BotConfig>>;
    async fn get_bot(&self, id: Uuid) -> EngineResult<Option<BotConfig>>;
    async fn upsert_bot(&self, config: &BotConfig) -> EngineResult<()>;
    async fn delete_bot(&self, id: Uuid) -> EngineResult<bool>;

    async fn get_exchange(&self, id: Uuid) -> EngineResult<Option<ExchangeConfig>>;
    async fn get_workflow(&self, id: Uuid) -> EngineResult<Option<WorkflowGraph>>;
    async fn list_llm_configs(&self) -> EngineResult<Vec<LlmConfig>>;

    /// Restart continuity: the last cycle id this bot ever recorded.
    async fn last_cycle_id(&self, bot_id: Uuid) -> EngineResult<Option<i64>>;

    /// Session health probe used by the maintenance pass.
    async fn refresh_session(&self) -> EngineResult<()>;

    /// Cache TTL overrides from the system config table.
    async fn cache_ttl_overrides(&self) -> EngineResult<HashMap<String, u64>>;
}
