// =============================================================================
// Pipeline Runtime — topological execution with per-node checkpoints
// =============================================================================
//
// Given a frozen workflow snapshot and an initial CycleState, the runtime
// walks the enabled nodes in topological order. A node is executed when an
// inbound edge from an executed node matched (or it is a start node); its
// outbound edges are evaluated against the state it produced.
//
// Node contract: a node is a transformation `state -> state'`, not a
// side-effecting callback. Failures are typed:
//
//   Recoverable — recorded into the state; the graph continues along this
//                 node's unconditional (default) edges.
//   Fatal       — the cycle aborts.
//
// After every node (success or recoverable failure) a checkpoint is
// written under `(bot_{id}, cycle_id, node_name)` — the failed state is
// retained on purpose. Cancellation is honoured between nodes and at every
// node's suspension points; nothing is checkpointed past the cancellation
// point.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cycle::CycleState;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::exchange::ExchangeAdapter;
use crate::llm::fallback::PromptCache;
use crate::llm::LlmFactory;
use crate::market::cache::MarketCache;
use crate::market::poll::PollProvider;
use crate::store::{CheckpointSink, TradeStore};
use crate::workflow::condition;
use crate::workflow::graph::WorkflowSnapshot;
use crate::workflow::registry::{NodeMetadata, PluginRegistry};

// ---------------------------------------------------------------------------
// Node contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFailure {
    Recoverable,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct NodeError {
    pub kind: NodeFailure,
    pub message: String,
}

impl NodeError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            kind: NodeFailure::Recoverable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: NodeFailure::Fatal,
            message: message.into(),
        }
    }
}

impl From<EngineError> for NodeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Fatal(_) | EngineError::Configuration(_) | EngineError::Cancelled => {
                Self::fatal(e.to_string())
            }
            other => Self::recoverable(other.to_string()),
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// A pipeline node: metadata plus a pure-ish transformation on CycleState.
#[async_trait]
pub trait PipelineNode: Send + Sync {
    fn metadata(&self) -> NodeMetadata;

    async fn run(&self, state: CycleState, ctx: &PluginContext)
        -> Result<CycleState, NodeError>;
}

// ---------------------------------------------------------------------------
// Plugin context
// ---------------------------------------------------------------------------

/// Shared services threaded into every node invocation. Built once per
/// cycle by the worker; the prompt cache dies with the cycle.
#[derive(Clone)]
pub struct PluginContext {
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub poll: Arc<PollProvider>,
    pub cache: Arc<MarketCache>,
    pub llm: Arc<LlmFactory>,
    pub trades: Arc<dyn TradeStore>,
    pub prompt_cache: Arc<PromptCache>,
    pub cancel: watch::Receiver<bool>,
    pub node_timeout: Duration,
}

impl PluginContext {
    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct PipelineRuntime {
    registry: Arc<PluginRegistry>,
    checkpoints: Arc<dyn CheckpointSink>,
}

impl PipelineRuntime {
    pub fn new(registry: Arc<PluginRegistry>, checkpoints: Arc<dyn CheckpointSink>) -> Self {
        Self {
            registry,
            checkpoints,
        }
    }

    /// Execute one cycle over the snapshot. Returns the final state, or an
    /// error when the cycle aborted (fatal node failure, bad wiring,
    /// cancellation).
    pub async fn run(
        &self,
        snapshot: &WorkflowSnapshot,
        mut state: CycleState,
        ctx: &PluginContext,
    ) -> EngineResult<CycleState> {
        if snapshot.is_empty() {
            debug!(cycle = state.cycle_id, "workflow has no enabled nodes — empty cycle");
            return Ok(state);
        }

        let thread_id = format!("bot_{}", state.bot_id);
        let cycle_id = state.cycle_id;
        let mut activated: HashSet<Uuid> = snapshot.start_nodes.clone();

        for node in &snapshot.nodes {
            if !activated.contains(&node.id) {
                continue;
            }
            if ctx.cancelled() {
                info!(cycle = cycle_id, node = %node.plugin_name, "cycle cancelled before node");
                return Err(EngineError::Cancelled);
            }

            // Unknown plugin or bad node config: wiring error, park the bot.
            let plugin = self
                .registry
                .instantiate(&node.plugin_name, node.config.clone())?;

            let timeout = node
                .config
                .get("timeout_s")
                .and_then(|v| v.as_u64())
                .map(Duration::from_secs)
                .unwrap_or(ctx.node_timeout);

            debug!(cycle = cycle_id, node = %node.plugin_name, "node starting");
            let started = std::time::Instant::now();

            let mut cancel = ctx.cancel.clone();
            let outcome: Result<CycleState, NodeError> = tokio::select! {
                biased;

                _ = cancel.changed() => {
                    if ctx.cancelled() {
                        info!(cycle = cycle_id, node = %node.plugin_name, "cycle cancelled mid-node");
                        return Err(EngineError::Cancelled);
                    }
                    // Spurious wake: rerun the node from scratch is wrong,
                    // so treat as a recoverable blip instead.
                    Err(NodeError::recoverable("cancellation signal flickered"))
                }

                result = tokio::time::timeout(timeout, plugin.run(state.clone(), ctx)) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(NodeError::recoverable(format!(
                            "node '{}' exceeded its {}s budget",
                            node.plugin_name,
                            timeout.as_secs()
                        ))),
                    }
                }
            };

            let mut node_failed = false;
            match outcome {
                Ok(new_state) => {
                    state = new_state;
                    debug!(
                        cycle = cycle_id,
                        node = %node.plugin_name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "node complete"
                    );
                }
                Err(node_error) if node_error.kind == NodeFailure::Recoverable => {
                    warn!(
                        cycle = cycle_id,
                        node = %node.plugin_name,
                        error = %node_error.message,
                        "recoverable node failure — continuing along default edges"
                    );
                    state.record_error(
                        &node.plugin_name,
                        ErrorKind::Validation,
                        node_error.message.clone(),
                    );
                    node_failed = true;
                }
                Err(node_error) => {
                    error!(
                        cycle = cycle_id,
                        node = %node.plugin_name,
                        error = %node_error.message,
                        "fatal node failure — aborting cycle"
                    );
                    // Retain the failing state for post-mortems.
                    self.checkpoints
                        .put(&thread_id, cycle_id, &node.plugin_name, &state)
                        .await?;
                    return Err(EngineError::Fatal(format!(
                        "node '{}' failed: {}",
                        node.plugin_name, node_error.message
                    )));
                }
            }

            // Checkpoint after the node completes (failed state included).
            // Cancellation beyond this point must not lose the write, so the
            // put itself is not raced against the stop signal.
            self.checkpoints
                .put(&thread_id, cycle_id, &node.plugin_name, &state)
                .await?;

            // Evaluate outbound edges against the post-node state. On a
            // recoverable failure only the unconditional (default) edges
            // fire. When nothing matches, this branch ends gracefully.
            if let Some(edges) = snapshot.outgoing.get(&node.id) {
                let scope = state.to_condition_scope();
                for edge in edges {
                    let take = match &edge.condition {
                        None => true,
                        Some(_) if node_failed => false,
                        Some(expr) => condition::evaluate(expr, &scope),
                    };
                    if take {
                        activated.insert(edge.to);
                    }
                }
            }
        }

        Ok(state)
    }
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// A plugin context wired to the sim exchange and in-memory stores; used by
/// the runtime, plugin and debate tests.
#[cfg(test)]
pub fn test_context() -> (PluginContext, watch::Sender<bool>) {
    use crate::exchange::sim::SimExchange;
    use crate::store::MemoryTradeStore;

    let exchange = Arc::new(SimExchange::new("sim"));
    let cache = Arc::new(MarketCache::new());
    let poll = Arc::new(PollProvider::new(exchange.clone(), cache.clone()));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let ctx = PluginContext {
        exchange,
        poll,
        cache,
        llm: Arc::new(LlmFactory::new(Vec::new())),
        trades: Arc::new(MemoryTradeStore::new()),
        prompt_cache: Arc::new(PromptCache::new()),
        cancel: cancel_rx,
        node_timeout: Duration::from_secs(30),
    };
    (ctx, cancel_tx)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::store::MemoryCheckpointStore;
    use crate::workflow::graph::{WorkflowEdge, WorkflowGraph, WorkflowNode};

    fn bot_config() -> BotConfig {
        serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "t",
            "exchange_id": Uuid::new_v4(),
            "workflow_id": Uuid::new_v4()
        }))
        .unwrap()
    }

    fn meta(name: &str) -> NodeMetadata {
        NodeMetadata {
            name: name.to_string(),
            display_name: name.to_string(),
            category: "test".to_string(),
            insert_after: None,
            suggested_order: 0,
            requires_llm: false,
            requires_trader: false,
        }
    }

    /// Appends its name to `candidate_symbols` so execution order is
    /// observable in the final state.
    struct MarkerNode(String);

    #[async_trait]
    impl PipelineNode for MarkerNode {
        fn metadata(&self) -> NodeMetadata {
            meta(&self.0)
        }

        async fn run(
            &self,
            mut state: CycleState,
            _ctx: &PluginContext,
        ) -> Result<CycleState, NodeError> {
            state.candidate_symbols.push(self.0.clone());
            Ok(state)
        }
    }

    struct FailingNode {
        name: String,
        kind: NodeFailure,
    }

    #[async_trait]
    impl PipelineNode for FailingNode {
        fn metadata(&self) -> NodeMetadata {
            meta(&self.name)
        }

        async fn run(
            &self,
            _state: CycleState,
            _ctx: &PluginContext,
        ) -> Result<CycleState, NodeError> {
            Err(NodeError {
                kind: self.kind,
                message: "scripted failure".into(),
            })
        }
    }

    fn marker_a(_: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
        Ok(Arc::new(MarkerNode("a".into())))
    }
    fn marker_b(_: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
        Ok(Arc::new(MarkerNode("b".into())))
    }
    fn marker_c(_: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
        Ok(Arc::new(MarkerNode("c".into())))
    }
    fn recoverable_fail(_: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
        Ok(Arc::new(FailingNode {
            name: "flaky".into(),
            kind: NodeFailure::Recoverable,
        }))
    }
    fn fatal_fail(_: serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>> {
        Ok(Arc::new(FailingNode {
            name: "broken".into(),
            kind: NodeFailure::Fatal,
        }))
    }

    fn registry() -> Arc<PluginRegistry> {
        let mut registry = PluginRegistry::new();
        registry.register(meta("a"), marker_a);
        registry.register(meta("b"), marker_b);
        registry.register(meta("c"), marker_c);
        registry.register(meta("flaky"), recoverable_fail);
        registry.register(meta("broken"), fatal_fail);
        Arc::new(registry)
    }

    fn node(plugin: &str, order: i32) -> WorkflowNode {
        WorkflowNode {
            id: Uuid::new_v4(),
            plugin_name: plugin.to_string(),
            execution_order: order,
            enabled: true,
            config: serde_json::json!({}),
        }
    }

    fn graph_of(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> WorkflowGraph {
        WorkflowGraph {
            id: Uuid::new_v4(),
            name: "test".into(),
            user_edited: false,
            nodes,
            edges,
        }
    }

    #[tokio::test]
    async fn linear_pipeline_runs_in_order_and_checkpoints() {
        let nodes = vec![node("a", 1), node("b", 2), node("c", 3)];
        let edges = nodes
            .windows(2)
            .map(|w| WorkflowEdge {
                from: w[0].id,
                to: w[1].id,
                condition: None,
            })
            .collect();
        let snapshot = graph_of(nodes, edges).snapshot().unwrap();

        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let runtime = PipelineRuntime::new(registry(), checkpoints.clone());
        let (ctx, _cancel) = test_context();

        let state = CycleState::new(1, bot_config());
        let thread_id = format!("bot_{}", state.bot_id);
        let out = runtime.run(&snapshot, state, &ctx).await.unwrap();

        assert_eq!(out.candidate_symbols, vec!["a", "b", "c"]);
        assert_eq!(
            checkpoints.nodes_for_cycle(&thread_id, 1).await.unwrap(),
            vec!["a", "b", "c"]
        );

        // Rewinding to (cycle, "b") yields the state node "c" saw.
        let rewound = checkpoints.load(&thread_id, 1, "b").await.unwrap().unwrap();
        assert_eq!(rewound.candidate_symbols, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn recoverable_failure_is_recorded_and_continues() {
        let nodes = vec![node("a", 1), node("flaky", 2), node("c", 3)];
        let edges = vec![
            WorkflowEdge { from: nodes[0].id, to: nodes[1].id, condition: None },
            WorkflowEdge { from: nodes[1].id, to: nodes[2].id, condition: None },
        ];
        let snapshot = graph_of(nodes, edges).snapshot().unwrap();

        let runtime = PipelineRuntime::new(registry(), Arc::new(MemoryCheckpointStore::new()));
        let (ctx, _cancel) = test_context();
        let out = runtime
            .run(&snapshot, CycleState::new(1, bot_config()), &ctx)
            .await
            .unwrap();

        // "flaky" contributed nothing, but "c" still ran.
        assert_eq!(out.candidate_symbols, vec!["a", "c"]);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].node, "flaky");
    }

    #[tokio::test]
    async fn recoverable_failure_skips_conditional_edges() {
        let nodes = vec![node("flaky", 1), node("b", 2), node("c", 3)];
        let edges = vec![
            WorkflowEdge {
                from: nodes[0].id,
                to: nodes[1].id,
                condition: Some("cycle_id == 1".into()),
            },
            WorkflowEdge { from: nodes[0].id, to: nodes[2].id, condition: None },
        ];
        let snapshot = graph_of(nodes, edges).snapshot().unwrap();

        let runtime = PipelineRuntime::new(registry(), Arc::new(MemoryCheckpointStore::new()));
        let (ctx, _cancel) = test_context();
        let out = runtime
            .run(&snapshot, CycleState::new(1, bot_config()), &ctx)
            .await
            .unwrap();

        // Only the default edge fired after the failure.
        assert_eq!(out.candidate_symbols, vec!["c"]);
    }

    #[tokio::test]
    async fn fatal_failure_aborts_and_checkpoints_the_wreckage() {
        let nodes = vec![node("a", 1), node("broken", 2), node("c", 3)];
        let edges = vec![
            WorkflowEdge { from: nodes[0].id, to: nodes[1].id, condition: None },
            WorkflowEdge { from: nodes[1].id, to: nodes[2].id, condition: None },
        ];
        let snapshot = graph_of(nodes, edges).snapshot().unwrap();

        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let runtime = PipelineRuntime::new(registry(), checkpoints.clone());
        let (ctx, _cancel) = test_context();

        let state = CycleState::new(1, bot_config());
        let thread_id = format!("bot_{}", state.bot_id);
        let err = runtime.run(&snapshot, state, &ctx).await.unwrap_err();
        assert!(err.is_fatal());

        // The failing node's checkpoint retains the last good state.
        let wreck = checkpoints
            .load(&thread_id, 1, "broken")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wreck.candidate_symbols, vec!["a"]);
    }

    #[tokio::test]
    async fn conditional_edge_gates_the_branch() {
        let nodes = vec![node("a", 1), node("b", 2), node("c", 3)];
        let edges = vec![
            WorkflowEdge {
                from: nodes[0].id,
                to: nodes[1].id,
                condition: Some("cycle_id == 999".into()),
            },
            WorkflowEdge {
                from: nodes[0].id,
                to: nodes[2].id,
                condition: Some("cycle_id == 5".into()),
            },
        ];
        let snapshot = graph_of(nodes, edges).snapshot().unwrap();

        let runtime = PipelineRuntime::new(registry(), Arc::new(MemoryCheckpointStore::new()));
        let (ctx, _cancel) = test_context();
        let out = runtime
            .run(&snapshot, CycleState::new(5, bot_config()), &ctx)
            .await
            .unwrap();

        assert_eq!(out.candidate_symbols, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn unknown_plugin_is_a_configuration_error() {
        let nodes = vec![node("no_such_plugin", 1)];
        let snapshot = graph_of(nodes, Vec::new()).snapshot().unwrap();

        let runtime = PipelineRuntime::new(registry(), Arc::new(MemoryCheckpointStore::new()));
        let (ctx, _cancel) = test_context();
        let err = runtime
            .run(&snapshot, CycleState::new(1, bot_config()), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn pre_set_cancellation_stops_before_the_first_node() {
        let nodes = vec![node("a", 1)];
        let snapshot = graph_of(nodes, Vec::new()).snapshot().unwrap();

        let runtime = PipelineRuntime::new(registry(), Arc::new(MemoryCheckpointStore::new()));
        let (ctx, cancel) = test_context();
        cancel.send(true).unwrap();

        let err = runtime
            .run(&snapshot, CycleState::new(1, bot_config()), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
