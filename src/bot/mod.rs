// =============================================================================
// Bot Layer — supervisor, per-bot workers, status publishing, log files
// =============================================================================

pub mod logs;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use status::StatusPublisher;
pub use supervisor::{BotSupervisor, StartOutcome, StopOutcome};

// =============================================================================
// Lifecycle tests (in-memory store + sim exchange, real workers)
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::exchange::ExchangeConfig;
    use crate::settings::Settings;
    use crate::store::checkpoints::CheckpointSink;
    use crate::store::{MemoryCheckpointStore, MemoryControlStore};
    use crate::types::BotState;
    use crate::workflow::graph::{WorkflowEdge, WorkflowGraph, WorkflowNode};
    use crate::workflow::registry::PluginRegistry;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    fn standard_workflow() -> WorkflowGraph {
        let nodes: Vec<WorkflowNode> = ["coins_pick", "market_state", "quant_filter", "execution"]
            .iter()
            .enumerate()
            .map(|(i, name)| WorkflowNode {
                id: Uuid::new_v4(),
                plugin_name: name.to_string(),
                execution_order: (i + 1) as i32,
                enabled: true,
                config: serde_json::json!({}),
            })
            .collect();
        let edges = nodes
            .windows(2)
            .map(|w| WorkflowEdge {
                from: w[0].id,
                to: w[1].id,
                condition: None,
            })
            .collect();
        WorkflowGraph {
            id: Uuid::new_v4(),
            name: "standard".into(),
            user_edited: false,
            nodes,
            edges,
        }
    }

    struct Harness {
        supervisor: Arc<BotSupervisor>,
        store: Arc<MemoryControlStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
        dir: std::path::PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("meridian-bot-{}", Uuid::new_v4()));
            let settings = Settings {
                status_dir: dir.join("status").to_string_lossy().into_owned(),
                logs_dir: dir.join("logs").to_string_lossy().into_owned(),
                stop_drain_deadline_s: 3,
                ..Settings::default()
            };

            let store = Arc::new(MemoryControlStore::new());
            let checkpoints = Arc::new(MemoryCheckpointStore::new());
            let status = Arc::new(StatusPublisher::new(&settings.status_dir).unwrap());
            let supervisor = Arc::new(BotSupervisor::new(
                store.clone(),
                checkpoints.clone(),
                Arc::new(PluginRegistry::with_builtins()),
                settings,
                status,
            ));
            Self {
                supervisor,
                store,
                checkpoints,
                dir,
            }
        }

        /// Insert a paper bot on the sim exchange with the standard
        /// workflow; returns its id.
        fn seed_bot(&self, name: &str, cycle_interval_s: u64, workflow: WorkflowGraph) -> Uuid {
            let exchange = ExchangeConfig {
                id: Uuid::new_v4(),
                name: format!("sim-{name}"),
                kind: "sim".into(),
                testnet: false,
                base_url: None,
                ws_url: None,
                api_key: None,
                api_secret: None,
                slippage_pct: 0.0,
                fee_pct: 0.05,
                rate_limit_per_minute: Some(100_000),
                max_concurrent_requests: 10,
            };
            let workflow_id = workflow.id;
            self.store.insert_exchange(exchange.clone());
            self.store.insert_workflow(workflow);

            let bot: BotConfig = serde_json::from_value(serde_json::json!({
                "id": Uuid::new_v4(),
                "name": name,
                "exchange_id": exchange.id,
                "workflow_id": workflow_id,
                "cycle_interval_s": cycle_interval_s,
                "trading_mode": "paper"
            }))
            .unwrap();
            let bot_id = bot.id;
            self.store.insert_bot(bot);
            bot_id
        }

        /// Poll until the bot's published cycle reaches `target`.
        async fn wait_for_cycle(&self, bot_id: Uuid, target: i64, budget: Duration) -> bool {
            let started = Instant::now();
            while started.elapsed() < budget {
                if self.supervisor.status(bot_id).current_cycle >= target {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            false
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn paper_bot_cycles_and_checkpoints_monotonically() {
        let harness = Harness::new();
        let bot_id = harness.seed_bot("cycler", 1, standard_workflow());

        assert_eq!(
            harness.supervisor.start(bot_id).await.unwrap(),
            StartOutcome::Started
        );
        assert!(
            harness
                .wait_for_cycle(bot_id, 2, Duration::from_secs(15))
                .await,
            "bot never reached cycle 2"
        );

        // Cycle ids strictly increase and every cycle checkpointed nodes.
        let thread_id = format!("bot_{bot_id}");
        let latest = harness
            .checkpoints
            .latest_cycle(&thread_id)
            .await
            .unwrap()
            .unwrap();
        assert!(latest >= 2);
        for cycle in 1..=latest.min(2) {
            let nodes = harness
                .checkpoints
                .nodes_for_cycle(&thread_id, cycle)
                .await
                .unwrap();
            assert!(!nodes.is_empty(), "cycle {cycle} wrote no checkpoints");
            assert_eq!(nodes[0], "coins_pick");
        }

        harness.supervisor.stop(bot_id).await.unwrap();
        let status = harness.supervisor.status(bot_id);
        assert!(!status.is_running);
        assert_eq!(status.state, BotState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_and_stop_are_idempotent() {
        let harness = Harness::new();
        let bot_id = harness.seed_bot("idem", 60, standard_workflow());

        assert_eq!(
            harness.supervisor.start(bot_id).await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(
            harness.supervisor.start(bot_id).await.unwrap(),
            StartOutcome::AlreadyRunning
        );

        assert_eq!(
            harness.supervisor.stop(bot_id).await.unwrap(),
            StopOutcome::Stopped
        );
        assert_eq!(
            harness.supervisor.stop(bot_id).await.unwrap(),
            StopOutcome::NotRunning
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_preempts_the_sleep_quickly() {
        let harness = Harness::new();
        // Long interval so the worker is asleep when stop arrives.
        let bot_id = harness.seed_bot("sleeper", 300, standard_workflow());

        harness.supervisor.start(bot_id).await.unwrap();
        assert!(
            harness
                .wait_for_cycle(bot_id, 1, Duration::from_secs(15))
                .await,
            "bot never finished its first cycle"
        );

        let stop_started = Instant::now();
        harness.supervisor.stop(bot_id).await.unwrap();
        assert!(
            stop_started.elapsed() < Duration::from_secs(2),
            "stop took {:?}, cancellation did not preempt the sleep",
            stop_started.elapsed()
        );
        assert_eq!(harness.supervisor.status(bot_id).state, BotState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broken_bot_does_not_disturb_its_neighbour() {
        let harness = Harness::new();

        // Bot X: workflow names a plugin that does not exist.
        let broken_workflow = WorkflowGraph {
            id: Uuid::new_v4(),
            name: "broken".into(),
            user_edited: false,
            nodes: vec![WorkflowNode {
                id: Uuid::new_v4(),
                plugin_name: "no_such_plugin".into(),
                execution_order: 1,
                enabled: true,
                config: serde_json::json!({}),
            }],
            edges: Vec::new(),
        };
        let broken_id = harness.seed_bot("broken", 1, broken_workflow);
        let healthy_id = harness.seed_bot("healthy", 1, standard_workflow());

        harness.supervisor.start(broken_id).await.unwrap();
        harness.supervisor.start(healthy_id).await.unwrap();

        // The healthy bot keeps producing cycles while the broken one
        // parks itself in error.
        assert!(
            harness
                .wait_for_cycle(healthy_id, 2, Duration::from_secs(15))
                .await,
            "healthy bot stopped cycling"
        );

        let deadline = Instant::now();
        loop {
            let status = harness.supervisor.status(broken_id);
            if status.state == BotState::Error {
                assert!(status.last_error.unwrap().contains("no_such_plugin"));
                break;
            }
            assert!(
                deadline.elapsed() < Duration::from_secs(10),
                "broken bot never reported error state"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        harness.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn starting_an_unknown_bot_is_a_validation_error() {
        let harness = Harness::new();
        let err = harness.supervisor.start(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
