// =============================================================================
// Schema Bootstrap — advisory-locked, fast-pathed, once per process family
// =============================================================================
//
// Multiple engine processes may share one database. The bootstrap:
//
//   1. Fast path: probe `to_regclass('public.bots')` — when the primary
//      table exists, no lock is ever taken.
//   2. Otherwise take `pg_advisory_lock` on a key owned by this schema,
//      re-probe under the lock (another process may have won the race),
//      and only then run the DDL.
//
// The lock is session-scoped: it is released explicitly and, failing that,
// when the connection drops.
// =============================================================================

use sqlx::postgres::PgPool;
use tracing::{debug, info};

use crate::error::EngineResult;

/// Advisory-lock key for schema DDL; any stable value works as long as
/// every process family member uses the same one.
const SCHEMA_LOCK_KEY: i64 = 0x4d52_4944_4941_4e01;

const DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS bots (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        config      JSONB NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS exchanges (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        config      JSONB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS llm_configs (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        config      JSONB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS workflows (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL,
        user_edited BOOLEAN NOT NULL DEFAULT FALSE,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS workflow_nodes (
        id              UUID PRIMARY KEY,
        workflow_id     UUID NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
        plugin_name     TEXT NOT NULL,
        execution_order INTEGER NOT NULL DEFAULT 0,
        enabled         BOOLEAN NOT NULL DEFAULT TRUE,
        config          JSONB NOT NULL DEFAULT '{}'::jsonb
    )"#,
    r#"CREATE TABLE IF NOT EXISTS workflow_edges (
        id          UUID PRIMARY KEY,
        workflow_id UUID NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
        from_node   UUID NOT NULL,
        to_node     UUID NOT NULL,
        condition   TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS node_configs (
        plugin_name TEXT PRIMARY KEY,
        metadata    JSONB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS trade_history (
        id          UUID PRIMARY KEY,
        bot_id      UUID NOT NULL,
        cycle_id    BIGINT NOT NULL,
        symbol      TEXT NOT NULL,
        side        TEXT NOT NULL,
        action      TEXT NOT NULL,
        entry_price DOUBLE PRECISION NOT NULL,
        exit_price  DOUBLE PRECISION,
        amount      DOUBLE PRECISION NOT NULL,
        leverage    DOUBLE PRECISION NOT NULL DEFAULT 1,
        pnl_usd     DOUBLE PRECISION,
        pnl_percent DOUBLE PRECISION,
        fee_paid    DOUBLE PRECISION,
        status      TEXT NOT NULL,
        opened_at   TIMESTAMPTZ NOT NULL,
        closed_at   TIMESTAMPTZ,
        order_id    TEXT,
        UNIQUE (bot_id, cycle_id, symbol, action)
    )"#,
    // At most one open row per (bot_id, symbol).
    r#"CREATE UNIQUE INDEX IF NOT EXISTS trade_history_one_open
        ON trade_history (bot_id, symbol) WHERE status = 'open'"#,
    r#"CREATE TABLE IF NOT EXISTS system_configs (
        key   TEXT PRIMARY KEY,
        value JSONB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS checkpoints (
        thread_id     TEXT NOT NULL,
        checkpoint_id BIGINT NOT NULL,
        node_name     TEXT NOT NULL,
        state         JSONB NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (thread_id, checkpoint_id, node_name)
    )"#,
];

/// Probe whether the primary table exists.
async fn primary_table_exists(pool: &PgPool) -> EngineResult<bool> {
    let regclass: Option<String> =
        sqlx::query_scalar("SELECT to_regclass('public.bots')::text")
            .fetch_one(pool)
            .await?;
    Ok(regclass.is_some())
}

/// Ensure the schema exists, guarded so DDL runs at most once per process
/// family.
pub async fn bootstrap(pool: &PgPool) -> EngineResult<()> {
    if primary_table_exists(pool).await? {
        debug!("schema already present — bootstrap fast path");
        return Ok(());
    }

    // Dedicated connection: the advisory lock is tied to the session.
    let mut conn = pool.acquire().await?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *conn)
        .await?;

    // Another process may have bootstrapped while we waited for the lock.
    let regclass: Option<String> =
        sqlx::query_scalar("SELECT to_regclass('public.bots')::text")
            .fetch_one(&mut *conn)
            .await?;

    let result: EngineResult<()> = if regclass.is_none() {
        info!("bootstrapping database schema");
        let mut outcome = Ok(());
        for statement in DDL {
            if let Err(e) = sqlx::query(statement).execute(&mut *conn).await {
                outcome = Err(e.into());
                break;
            }
        }
        outcome
    } else {
        debug!("schema created by a sibling process while waiting for the lock");
        Ok(())
    };

    // Always release, even after a DDL failure.
    let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *conn)
        .await;
    if unlock.is_err() {
        // Detach the connection from the pool and drop it: the session dies
        // and takes the advisory lock with it.
        drop(conn.detach());
    }

    result
}
