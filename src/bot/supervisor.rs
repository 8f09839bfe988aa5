// =============================================================================
// Bot Supervisor — registry of workers, lifecycle control, fault isolation
// =============================================================================
//
// One worker task per running bot. Every bot is independent: a panicking
// worker is caught at the task boundary, its status is parked in `error`,
// and no other bot notices.
//
// Lifecycle operations are idempotent the way the control plane expects:
// starting a running bot and stopping a stopped bot both succeed as
// no-ops. `stop` waits out a bounded drain deadline, then force-kills.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bot::status::StatusPublisher;
use crate::bot::worker::{run_bot_worker, WorkerDeps};
use crate::error::{EngineError, EngineResult};
use crate::settings::Settings;
use crate::store::{CheckpointSink, ControlStore, TradeStore};
use crate::types::{BotState, BotStatus};
use crate::workflow::registry::PluginRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// No-op success: the bot was already running.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// No-op success: nothing was running.
    NotRunning,
}

struct WorkerHandle {
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct BotSupervisor {
    deps: WorkerDeps,
    workers: Mutex<HashMap<Uuid, WorkerHandle>>,
}

impl BotSupervisor {
    /// Build a supervisor over any store that can serve both the control
    /// reads and the trade history.
    pub fn new<S>(
        store: Arc<S>,
        checkpoints: Arc<dyn CheckpointSink>,
        registry: Arc<PluginRegistry>,
        settings: Settings,
        status: Arc<StatusPublisher>,
    ) -> Self
    where
        S: ControlStore + 'static,
    {
        let deps = WorkerDeps {
            store: store.clone() as Arc<dyn ControlStore>,
            trades: store as Arc<dyn TradeStore>,
            checkpoints,
            registry,
            settings,
            status,
        };
        Self {
            deps,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ControlStore> {
        &self.deps.store
    }

    pub fn status_publisher(&self) -> &Arc<StatusPublisher> {
        &self.deps.status
    }

    pub fn settings(&self) -> &Settings {
        &self.deps.settings
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start a bot worker. The worker performs its own initialisation
    /// (exchange handshake, catalogue load, balance probe) and reports
    /// through the status publisher.
    pub async fn start(&self, bot_id: Uuid) -> EngineResult<StartOutcome> {
        // Reject unknown bots up front so the control plane gets a clean 404.
        if self.deps.store.get_bot(bot_id).await?.is_none() {
            return Err(EngineError::Validation(format!("bot {bot_id} does not exist")));
        }

        let mut workers = self.workers.lock();
        if let Some(handle) = workers.get(&bot_id) {
            if !handle.join.is_finished() {
                info!(%bot_id, "start requested but bot already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            workers.remove(&bot_id);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let deps = self.deps.clone();
        let status = self.deps.status.clone();

        // Fault isolation: the worker's panic stops at this boundary. The
        // worker handles its own engine errors; this catches the rest.
        let join = tokio::spawn(async move {
            let worker = std::panic::AssertUnwindSafe(run_bot_worker(bot_id, deps, cancel_rx));
            if let Err(panic) = worker.catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                error!(%bot_id, %message, "worker panicked — parking bot in error state");

                let mut parked = BotStatus::unknown(bot_id);
                parked.state = BotState::Error;
                parked.last_error = Some(format!("worker panicked: {message}"));
                if let Err(e) = status.publish(&parked) {
                    error!(%bot_id, error = %e, "failed to publish panic status");
                }
            }
        });

        workers.insert(
            bot_id,
            WorkerHandle {
                cancel: cancel_tx,
                join,
            },
        );
        info!(%bot_id, "worker started");
        Ok(StartOutcome::Started)
    }

    /// Stop a bot: signal cancellation, await the drain up to the deadline,
    /// force-kill past it. Repeated stops are no-op successes.
    pub async fn stop(&self, bot_id: Uuid) -> EngineResult<StopOutcome> {
        let handle = {
            let mut workers = self.workers.lock();
            workers.remove(&bot_id)
        };

        let Some(handle) = handle else {
            return Ok(StopOutcome::NotRunning);
        };
        if handle.join.is_finished() {
            return Ok(StopOutcome::NotRunning);
        }

        handle.cancel.send(true).ok();
        let deadline = Duration::from_secs(self.deps.settings.stop_drain_deadline_s.max(1));
        let force_kill = handle.join.abort_handle();

        match tokio::time::timeout(deadline, handle.join).await {
            Ok(_) => {
                info!(%bot_id, "worker drained and stopped");
            }
            Err(_) => {
                warn!(
                    %bot_id,
                    deadline_s = deadline.as_secs(),
                    "drain deadline exceeded — force-killing worker"
                );
                force_kill.abort();
            }
        }

        // Flush the last word in case the worker died without publishing.
        let mut status = self.deps.status.read(bot_id);
        if status.is_running {
            status.is_running = false;
            status.state = BotState::Stopped;
            self.deps.status.publish(&status).ok();
        }
        Ok(StopOutcome::Stopped)
    }

    /// Restart preserves cycle-counter continuity through the durable
    /// store: the new worker resumes after the last recorded cycle.
    pub async fn restart(&self, bot_id: Uuid) -> EngineResult<StartOutcome> {
        self.stop(bot_id).await?;
        self.start(bot_id).await
    }

    /// The most recent published status for a bot.
    pub fn status(&self, bot_id: Uuid) -> BotStatus {
        let mut status = self.deps.status.read(bot_id);
        // Cross-check liveness against the registry: a published "running"
        // from a dead task must not fool the control plane.
        let alive = {
            let workers = self.workers.lock();
            workers
                .get(&bot_id)
                .map(|h| !h.join.is_finished())
                .unwrap_or(false)
        };
        if status.is_running && !alive {
            status.is_running = false;
            if status.state == BotState::Running || status.state == BotState::Idle {
                status.state = BotState::Stopped;
            }
        }
        status
    }

    /// Whether a worker task is currently alive for the bot.
    pub fn is_running(&self, bot_id: Uuid) -> bool {
        let workers = self.workers.lock();
        workers
            .get(&bot_id)
            .map(|h| !h.join.is_finished())
            .unwrap_or(false)
    }

    /// Stop every worker (process shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = {
            let workers = self.workers.lock();
            workers.keys().copied().collect()
        };
        for bot_id in ids {
            self.stop(bot_id).await.ok();
        }
        info!("supervisor shut down");
    }
}

impl std::fmt::Debug for BotSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotSupervisor")
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}
