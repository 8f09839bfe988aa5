// =============================================================================
// Checkpoint Store — immutable cycle-state snapshots per node boundary
// =============================================================================
//
// Keyed by `(thread_id, checkpoint_id, node_name)` where thread_id is
// `bot_{id}` and checkpoint_id is the cycle id. A checkpoint is written
// exactly once: `put` is `INSERT ... ON CONFLICT DO NOTHING`, which makes a
// retried write idempotent and an attempted rewrite a silent no-op — the
// first write wins, forever. Rewinding to any `(cycle_id, node_name)`
// returns exactly the state the next node saw.
// =============================================================================

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::debug;

use crate::cycle::CycleState;
use crate::error::{EngineError, EngineResult};

/// Checkpoint persistence seam; the pipeline runtime only sees this trait.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Write a checkpoint. Idempotent: re-putting an existing key is a
    /// no-op and never overwrites.
    async fn put(
        &self,
        thread_id: &str,
        cycle_id: i64,
        node_name: &str,
        state: &CycleState,
    ) -> EngineResult<()>;

    /// Read a checkpoint back, byte-faithful to what was stored.
    async fn load(
        &self,
        thread_id: &str,
        cycle_id: i64,
        node_name: &str,
    ) -> EngineResult<Option<CycleState>>;

    /// Node names checkpointed for a cycle, in write order.
    async fn nodes_for_cycle(&self, thread_id: &str, cycle_id: i64)
        -> EngineResult<Vec<String>>;

    /// Highest cycle id ever checkpointed for a thread.
    async fn latest_cycle(&self, thread_id: &str) -> EngineResult<Option<i64>>;
}

// ---------------------------------------------------------------------------
// PostgreSQL implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointSink for PgCheckpointStore {
    async fn put(
        &self,
        thread_id: &str,
        cycle_id: i64,
        node_name: &str,
        state: &CycleState,
    ) -> EngineResult<()> {
        let blob = serde_json::to_value(state)
            .map_err(|e| EngineError::Validation(format!("cycle state serialise: {e}")))?;

        sqlx::query(
            r#"INSERT INTO checkpoints (thread_id, checkpoint_id, node_name, state)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (thread_id, checkpoint_id, node_name) DO NOTHING"#,
        )
        .bind(thread_id)
        .bind(cycle_id)
        .bind(node_name)
        .bind(&blob)
        .execute(&self.pool)
        .await?;

        debug!(thread_id, cycle_id, node_name, "checkpoint written");
        Ok(())
    }

    async fn load(
        &self,
        thread_id: &str,
        cycle_id: i64,
        node_name: &str,
    ) -> EngineResult<Option<CycleState>> {
        let row = sqlx::query(
            r#"SELECT state FROM checkpoints
               WHERE thread_id = $1 AND checkpoint_id = $2 AND node_name = $3"#,
        )
        .bind(thread_id)
        .bind(cycle_id)
        .bind(node_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let blob: serde_json::Value = row.try_get("state")?;
                let state = serde_json::from_value(blob).map_err(|e| {
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
        let rows = sqlx::query(
            r#"SELECT node_name FROM checkpoints
               WHERE thread_id = $1 AND checkpoint_id = $2
               ORDER BY created_at"#,
        )
        .bind(thread_id)
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("node_name").map_err(Into::into))
            .collect()
    }

    async fn latest_cycle(&self, thread_id: &str) -> EngineResult<Option<i64>> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(checkpoint_id) FROM checkpoints WHERE thread_id = $1")
                .bind(thread_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }
}

impl std::fmt::Debug for PgCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgCheckpointStore").finish_non_exhaustive()
    }
}
