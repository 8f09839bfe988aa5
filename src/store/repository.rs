// =============================================================================
// Repository — high-level, application-specific store access
// =============================================================================
//
// Encapsulates every SQL statement in the engine. Typed configuration
// (bot / exchange / llm) is stored as a JSONB blob and parsed through the
// closed structs in `config.rs` — unknown keys survive round trips, schema
// drift warns instead of failing.
//
// Workflow writes are transactional: the workflow row, its nodes and its
// edges update atomically or not at all.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BotConfig;
use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangeConfig;
use crate::llm::LlmConfig;
use crate::store::{ControlStore, TradeStore};
use crate::types::{PositionSide, TradeRecord, TradeStatus};
use crate::workflow::graph::{WorkflowEdge, WorkflowGraph, WorkflowNode};
use crate::workflow::registry::NodeMetadata;

/// Pooled store handle; clone freely, one logical session per bot worker.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect with engine-standard pool settings.
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;
        info!("database connection pool established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Session health probe used by the maintenance pass; a dead pool
    /// surfaces here instead of mid-pipeline.
    pub async fn refresh_session(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bots
    // -------------------------------------------------------------------------

    pub async fn list_bots(&self) -> EngineResult<Vec<BotConfig>> {
        let rows = sqlx::query("SELECT config FROM bots ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let mut bots = Vec::with_capacity(rows.len());
        for row in rows {
            let config: serde_json::Value = row.try_get("config")?;
            match serde_json::from_value::<BotConfig>(config) {
                Ok(bot) => bots.push(bot),
                Err(e) => warn!(error = %e, "skipping bot row with unparseable config"),
            }
        }
        Ok(bots)
    }

    pub async fn get_bot(&self, id: Uuid) -> EngineResult<Option<BotConfig>> {
        let row = sqlx::query("SELECT config FROM bots WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let config: serde_json::Value = row.try_get("config")?;
                let bot = serde_json::from_value(config).map_err(|e| {
                    EngineError::Configuration(format!("bot {id} config unparseable: {e}"))
                })?;
                Ok(Some(bot))
            }
            None => Ok(None),
        }
    }

    pub async fn upsert_bot(&self, config: &BotConfig) -> EngineResult<()> {
        let blob = serde_json::to_value(config)
            .map_err(|e| EngineError::Validation(format!("bot config serialise: {e}")))?;
        sqlx::query(
            r#"INSERT INTO bots (id, name, config)
               VALUES ($1, $2, $3)
               ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name, config = EXCLUDED.config, updated_at = now()"#,
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(&blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_bot(&self, id: Uuid) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM bots WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // -------------------------------------------------------------------------
    // Exchanges / LLM configs
    // -------------------------------------------------------------------------

    pub async fn get_exchange(&self, id: Uuid) -> EngineResult<Option<ExchangeConfig>> {
        let row = sqlx::query("SELECT config FROM exchanges WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let config: serde_json::Value = row.try_get("config")?;
                let exchange = serde_json::from_value(config).map_err(|e| {
                    EngineError::Configuration(format!("exchange {id} config unparseable: {e}"))
                })?;
                Ok(Some(exchange))
            }
            None => Ok(None),
        }
    }

    pub async fn upsert_exchange(&self, config: &ExchangeConfig) -> EngineResult<()> {
        let blob = serde_json::to_value(config)
            .map_err(|e| EngineError::Validation(format!("exchange config serialise: {e}")))?;
        sqlx::query(
            r#"INSERT INTO exchanges (id, name, config)
               VALUES ($1, $2, $3)
               ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name, config = EXCLUDED.config"#,
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(&blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_llm_configs(&self) -> EngineResult<Vec<LlmConfig>> {
        let rows = sqlx::query("SELECT config FROM llm_configs ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            let config: serde_json::Value = row.try_get("config")?;
            match serde_json::from_value::<LlmConfig>(config) {
                Ok(llm) => configs.push(llm),
                Err(e) => warn!(error = %e, "skipping llm row with unparseable config"),
            }
        }
        Ok(configs)
    }

    pub async fn upsert_llm_config(&self, config: &LlmConfig) -> EngineResult<()> {
        let blob = serde_json::to_value(config)
            .map_err(|e| EngineError::Validation(format!("llm config serialise: {e}")))?;
        sqlx::query(
            r#"INSERT INTO llm_configs (id, name, config)
               VALUES ($1, $2, $3)
               ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name, config = EXCLUDED.config"#,
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(&blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Workflows
    // -------------------------------------------------------------------------

    pub async fn get_workflow(&self, id: Uuid) -> EngineResult<Option<WorkflowGraph>> {
        let workflow = sqlx::query("SELECT id, name, user_edited FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(workflow) = workflow else {
            return Ok(None);
        };

        let node_rows = sqlx::query(
            r#"SELECT id, plugin_name, execution_order, enabled, config
               FROM workflow_nodes WHERE workflow_id = $1
               ORDER BY execution_order"#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let edge_rows = sqlx::query(
            "SELECT from_node, to_node, condition FROM workflow_edges WHERE workflow_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let nodes = node_rows
            .into_iter()
            .map(|row| -> EngineResult<WorkflowNode> {
                Ok(WorkflowNode {
                    id: row.try_get("id")?,
                    plugin_name: row.try_get("plugin_name")?,
                    execution_order: row.try_get("execution_order")?,
                    enabled: row.try_get("enabled")?,
                    config: row.try_get("config")?,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let edges = edge_rows
            .into_iter()
            .map(|row| -> EngineResult<WorkflowEdge> {
                Ok(WorkflowEdge {
                    from: row.try_get("from_node")?,
                    to: row.try_get("to_node")?,
                    condition: row.try_get("condition")?,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Some(WorkflowGraph {
            id: workflow.try_get("id")?,
            name: workflow.try_get("name")?,
            user_edited: workflow.try_get("user_edited")?,
            nodes,
            edges,
        }))
    }

    /// Replace a workflow atomically (row + nodes + edges in one
    /// transaction).
    ///
    /// `from_auto_sync` marks writes originating from the plugin auto-sync
    /// task: those must never overwrite a workflow a human has edited.
    pub async fn save_workflow(
        &self,
        graph: &WorkflowGraph,
        from_auto_sync: bool,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<bool> =
            sqlx::query_scalar("SELECT user_edited FROM workflows WHERE id = $1 FOR UPDATE")
                .bind(graph.id)
                .fetch_optional(&mut *tx)
                .await?;

        if from_auto_sync && existing == Some(true) {
            warn!(workflow = %graph.name, "auto-sync skipped user-edited workflow");
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            r#"INSERT INTO workflows (id, name, user_edited)
               VALUES ($1, $2, $3)
               ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name, user_edited = EXCLUDED.user_edited,
                   updated_at = now()"#,
        )
        .bind(graph.id)
        .bind(&graph.name)
        .bind(graph.user_edited || (!from_auto_sync && existing.is_some()))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM workflow_nodes WHERE workflow_id = $1")
            .bind(graph.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow_edges WHERE workflow_id = $1")
            .bind(graph.id)
            .execute(&mut *tx)
            .await?;

        for node in &graph.nodes {
            sqlx::query(
                r#"INSERT INTO workflow_nodes
                   (id, workflow_id, plugin_name, execution_order, enabled, config)
                   VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(node.id)
            .bind(graph.id)
            .bind(&node.plugin_name)
            .bind(node.execution_order)
            .bind(node.enabled)
            .bind(&node.config)
            .execute(&mut *tx)
            .await?;
        }

        for edge in &graph.edges {
            sqlx::query(
                r#"INSERT INTO workflow_edges (id, workflow_id, from_node, to_node, condition)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(Uuid::new_v4())
            .bind(graph.id)
            .bind(edge.from)
            .bind(edge.to)
            .bind(&edge.condition)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Publish the registry's node metadata into `node_configs` so the
    /// workflow editor can offer every installed plugin.
    pub async fn sync_plugin_nodes(&self, metadata: &[NodeMetadata]) -> EngineResult<()> {
        for meta in metadata {
            let blob = serde_json::to_value(meta)
                .map_err(|e| EngineError::Validation(format!("node metadata serialise: {e}")))?;
            sqlx::query(
                r#"INSERT INTO node_configs (plugin_name, metadata)
                   VALUES ($1, $2)
                   ON CONFLICT (plugin_name) DO UPDATE SET metadata = EXCLUDED.metadata"#,
            )
            .bind(&meta.name)
            .bind(&blob)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // System configs
    // -------------------------------------------------------------------------

    pub async fn get_system_config(&self, key: &str) -> EngineResult<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT value FROM system_configs WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    pub async fn set_system_config(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"INSERT INTO system_configs (key, value) VALUES ($1, $2)
               ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value"#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cache TTL overrides from `system_configs.cache_ttls`
    /// (namespace -> seconds).
    pub async fn cache_ttl_overrides(&self) -> EngineResult<HashMap<String, u64>> {
        match self.get_system_config("cache_ttls").await? {
            Some(value) => {
                let overrides: HashMap<String, u64> =
                    serde_json::from_value(value).unwrap_or_else(|e| {
                        warn!(error = %e, "cache_ttls system config unparseable — ignoring");
                        HashMap::new()
                    });
                Ok(overrides)
            }
            None => Ok(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Cycle continuity
    // -------------------------------------------------------------------------

    /// The last cycle this bot completed, from the checkpoint family (with
    /// trade history as the fallback witness). Restart continuity: the next
    /// cycle id is this plus one.
    pub async fn last_cycle_id(&self, bot_id: Uuid) -> EngineResult<Option<i64>> {
        let thread_id = format!("bot_{bot_id}");
        let from_checkpoints: Option<i64> =
            sqlx::query_scalar("SELECT MAX(checkpoint_id) FROM checkpoints WHERE thread_id = $1")
                .bind(&thread_id)
                .fetch_one(&self.pool)
                .await?;

        if from_checkpoints.is_some() {
            return Ok(from_checkpoints);
        }

        let from_trades: Option<i64> =
            sqlx::query_scalar("SELECT MAX(cycle_id) FROM trade_history WHERE bot_id = $1")
                .bind(bot_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(from_trades)
    }
}

// ---------------------------------------------------------------------------
// Trade history
// ---------------------------------------------------------------------------

fn trade_from_row(row: &PgRow) -> EngineResult<TradeRecord> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    let opened_at: DateTime<Utc> = row.try_get("opened_at")?;
    let closed_at: Option<DateTime<Utc>> = row.try_get("closed_at")?;

    Ok(TradeRecord {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        symbol: row.try_get("symbol")?,
        side: match side.as_str() {
            "long" => PositionSide::Long,
            "short" => PositionSide::Short,
            other => {
                return Err(EngineError::Validation(format!(
                    "trade row has unknown side '{other}'"
                )))
            }
        },
        action: row.try_get("action")?,
        entry_price: row.try_get("entry_price")?,
        exit_price: row.try_get("exit_price")?,
        amount: row.try_get("amount")?,
        leverage: row.try_get("leverage")?,
        pnl_usd: row.try_get("pnl_usd")?,
        pnl_percent: row.try_get("pnl_percent")?,
        fee_paid: row.try_get("fee_paid")?,
        status: match status.as_str() {
            "open" => TradeStatus::Open,
            "closed" => TradeStatus::Closed,
            other => {
                return Err(EngineError::Validation(format!(
                    "trade row has unknown status '{other}'"
                )))
            }
        },
        opened_at,
        closed_at,
        cycle_id: row.try_get("cycle_id")?,
        order_id: row.try_get("order_id")?,
    })
}

#[async_trait]
impl TradeStore for Store {
    async fn record_open(&self, trade: &TradeRecord) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO trade_history
               (id, bot_id, cycle_id, symbol, side, action, entry_price, amount,
                leverage, fee_paid, status, opened_at, order_id)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
               ON CONFLICT (bot_id, cycle_id, symbol, action) DO NOTHING"#,
        )
        .bind(trade.id)
        .bind(trade.bot_id)
        .bind(trade.cycle_id)
        .bind(&trade.symbol)
        .bind(trade.side.to_string())
        .bind(&trade.action)
        .bind(trade.entry_price)
        .bind(trade.amount)
        .bind(trade.leverage)
        .bind(trade.fee_paid)
        .bind(trade.status.to_string())
        .bind(trade.opened_at)
        .bind(&trade.order_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn close_trade(
        &self,
        id: Uuid,
        exit_price: f64,
        pnl_usd: f64,
        pnl_percent: f64,
        fee_paid: f64,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"UPDATE trade_history
               SET exit_price = $2, pnl_usd = $3, pnl_percent = $4,
                   fee_paid = COALESCE(fee_paid, 0) + $5,
                   status = 'closed', closed_at = now()
               WHERE id = $1 AND status = 'open'"#,
        )
        .bind(id)
        .bind(exit_price)
        .bind(pnl_usd)
        .bind(pnl_percent)
        .bind(fee_paid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_open(&self, bot_id: Uuid, symbol: &str) -> EngineResult<Option<TradeRecord>> {
        let row = sqlx::query(
            "SELECT * FROM trade_history WHERE bot_id = $1 AND symbol = $2 AND status = 'open'",
        )
        .bind(bot_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn recent(&self, bot_id: Uuid, limit: i64) -> EngineResult<Vec<TradeRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM trade_history WHERE bot_id = $1 ORDER BY opened_at DESC LIMIT $2",
        )
        .bind(bot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn exists(
        &self,
        bot_id: Uuid,
        cycle_id: i64,
        symbol: &str,
        action: &str,
    ) -> EngineResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(
                 SELECT 1 FROM trade_history
                 WHERE bot_id = $1 AND cycle_id = $2 AND symbol = $3 AND action = $4
               )"#,
        )
        .bind(bot_id)
        .bind(cycle_id)
        .bind(symbol)
        .bind(action)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl ControlStore for Store {
    async fn list_bots(&self) -> EngineResult<Vec<BotConfig>> {
        Store::list_bots(self).await
    }

    async fn get_bot(&self, id: Uuid) -> EngineResult<Option<BotConfig>> {
        Store::get_bot(self, id).await
    }

    async fn upsert_bot(&self, config: &BotConfig) -> EngineResult<()> {
        Store::upsert_bot(self, config).await
    }

    async fn delete_bot(&self, id: Uuid) -> EngineResult<bool> {
        Store::delete_bot(self, id).await
    }

    async fn get_exchange(&self, id: Uuid) -> EngineResult<Option<ExchangeConfig>> {
        Store::get_exchange(self, id).await
    }

    async fn get_workflow(&self, id: Uuid) -> EngineResult<Option<WorkflowGraph>> {
        Store::get_workflow(self, id).await
    }

    async fn list_llm_configs(&self) -> EngineResult<Vec<LlmConfig>> {
        Store::list_llm_configs(self).await
    }

    async fn last_cycle_id(&self, bot_id: Uuid) -> EngineResult<Option<i64>> {
        Store::last_cycle_id(self, bot_id).await
    }

    async fn refresh_session(&self) -> EngineResult<()> {
        Store::refresh_session(self).await
    }

    async fn cache_ttl_overrides(&self) -> EngineResult<HashMap<String, u64>> {
        Store::cache_ttl_overrides(self).await
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
