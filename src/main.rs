// =============================================================================
// Meridian Trade Orchestrator — Main Entry Point
// =============================================================================
//
// Boot order matters: the durable store comes up first (schema bootstrap is
// advisory-locked, so process families race safely), then the plugin
// registry publishes its node catalogue, then the supervisor and the
// control-plane API. Bots do NOT auto-start — the control plane starts
// them explicitly.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod bot;
mod config;
mod cycle;
mod debate;
mod error;
mod exchange;
mod executor;
mod indicators;
mod llm;
mod market;
mod risk_monitor;
mod settings;
mod store;
mod types;
mod workflow;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bot::{BotSupervisor, StatusPublisher};
use crate::settings::Settings;
use crate::store::{schema, PgCheckpointStore, Store};
use crate::workflow::registry::PluginRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trade Orchestrator — Starting Up        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = Settings::load("settings.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        Settings::default()
    });

    // ── 2. Durable store ─────────────────────────────────────────────────
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let store = Store::connect(&database_url).await?;
    schema::bootstrap(store.pool()).await?;
    info!("durable store ready");

    // ── 3. Plugin registry & node catalogue sync ─────────────────────────
    let registry = Arc::new(PluginRegistry::with_builtins());
    store.sync_plugin_nodes(&registry.metadata_list()).await?;
    info!(plugins = registry.metadata_list().len(), "plugin registry published");

    // ── 4. Supervisor ────────────────────────────────────────────────────
    let checkpoints = Arc::new(PgCheckpointStore::new(store.pool().clone()));
    let status = Arc::new(StatusPublisher::new(&settings.status_dir)?);
    let supervisor = Arc::new(BotSupervisor::new(
        Arc::new(store),
        checkpoints,
        registry,
        settings.clone(),
        status,
    ));

    // ── 5. Control-plane API ─────────────────────────────────────────────
    let bind_addr = settings.bind_addr.clone();
    let api_supervisor = supervisor.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_supervisor);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind control-plane listener");
        info!(addr = %bind_addr, "control-plane API listening");
        axum::serve(listener, app)
            .await
            .expect("control-plane server failed");
    });

    info!("all subsystems running — bots start on request. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — draining workers");
    supervisor.shutdown().await;

    info!("Meridian shut down complete.");
    Ok(())
}
