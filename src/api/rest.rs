// =============================================================================
// Control-Plane REST API — Axum 0.7
// =============================================================================
//
// The seam between the supervisor and the presentation layer. All endpoints
// live under `/api/v1/`. Health requires no authentication; everything else
// goes through the Bearer-token extractor.
//
// Lifecycle endpoints are idempotent: starting a running bot or stopping a
// stopped one is a no-op success, so the UI can retry blindly.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::bot::logs::BotLogger;
use crate::bot::{BotSupervisor, StartOutcome, StopOutcome};
use crate::config::BotConfig;
use crate::error::{EngineError, ErrorKind};

// =============================================================================
// Router construction
// =============================================================================

/// Build the control-plane router with CORS middleware and shared state.
pub fn router(supervisor: Arc<BotSupervisor>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Bot CRUD ────────────────────────────────────────────────
        .route("/api/v1/bots", get(list_bots))
        .route("/api/v1/bots", post(create_bot))
        .route("/api/v1/bots/:id", get(get_bot))
        .route("/api/v1/bots/:id", put(update_bot))
        .route("/api/v1/bots/:id", delete(delete_bot))
        // ── Lifecycle ───────────────────────────────────────────────
        .route("/api/v1/bots/:id/start", post(start_bot))
        .route("/api/v1/bots/:id/stop", post(stop_bot))
        .route("/api/v1/bots/:id/restart", post(restart_bot))
        .route("/api/v1/bots/:id/status", get(bot_status))
        // ── Live reads ──────────────────────────────────────────────
        .route("/api/v1/bots/:id/positions", get(bot_positions))
        .route("/api/v1/bots/:id/balance", get(bot_balance))
        .route("/api/v1/bots/:id/debate", get(bot_debate))
        .route("/api/v1/bots/:id/logs", get(bot_logs))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(supervisor)
}

// =============================================================================
// Error mapping
// =============================================================================

fn error_response(e: EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Configuration => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Transient | ErrorKind::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Fatal | ErrorKind::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

fn not_found(what: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("{what} not found") })),
    )
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Bot CRUD
// =============================================================================

async fn list_bots(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
) -> impl IntoResponse {
    match supervisor.store().list_bots().await {
        Ok(bots) => {
            let with_state: Vec<serde_json::Value> = bots
                .iter()
                .map(|bot| {
                    serde_json::json!({
                        "config": bot,
                        "is_running": supervisor.is_running(bot.id),
                    })
                })
                .collect();
            Json(with_state).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

async fn create_bot(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Json(config): Json<BotConfig>,
) -> impl IntoResponse {
    match supervisor.store().upsert_bot(&config).await {
        Ok(()) => {
            info!(bot = %config.name, "bot created");
            (StatusCode::CREATED, Json(config)).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

async fn get_bot(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match supervisor.store().get_bot(id).await {
        Ok(Some(bot)) => Json(bot).into_response(),
        Ok(None) => not_found("bot").into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn update_bot(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
    Json(mut config): Json<BotConfig>,
) -> impl IntoResponse {
    config.id = id;
    match supervisor.store().get_bot(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("bot").into_response(),
        Err(e) => return error_response(e).into_response(),
    }
    match supervisor.store().upsert_bot(&config).await {
        // Changes take effect on the worker's next config re-read.
        Ok(()) => Json(config).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn delete_bot(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    // A deleted bot must not keep trading.
    supervisor.stop(id).await.ok();
    match supervisor.store().delete_bot(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found("bot").into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

async fn start_bot(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match supervisor.store().get_bot(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("bot").into_response(),
        Err(e) => return error_response(e).into_response(),
    }
    match supervisor.start(id).await {
        Ok(outcome) => Json(serde_json::json!({
            "started": true,
            "already_running": outcome == StartOutcome::AlreadyRunning,
        }))
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn stop_bot(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match supervisor.stop(id).await {
        Ok(outcome) => Json(serde_json::json!({
            "stopped": true,
            "was_running": outcome == StopOutcome::Stopped,
        }))
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn restart_bot(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match supervisor.store().get_bot(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("bot").into_response(),
        Err(e) => return error_response(e).into_response(),
    }
    match supervisor.restart(id).await {
        Ok(_) => Json(serde_json::json!({ "restarted": true })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn bot_status(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    Json(supervisor.status(id))
}

// =============================================================================
// Live reads
// =============================================================================

async fn bot_positions(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    // Published by the worker each cycle with the mark-price fallback
    // already applied.
    Json(supervisor.status_publisher().read_positions(id))
}

async fn bot_balance(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    Json(supervisor.status(id).balance)
}

async fn bot_debate(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    // Most recent cycle's debate artifacts, or null.
    Json(supervisor.status_publisher().read_debate(id))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_lines")]
    lines: usize,
}

fn default_log_lines() -> usize {
    200
}

async fn bot_logs(
    _auth: AuthBearer,
    State(supervisor): State<Arc<BotSupervisor>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let lines = BotLogger::tail(&supervisor.settings().logs_dir, id, query.lines.min(5_000));
    Json(lines)
}
