// =============================================================================
// Workflow Graph — nodes, edges, validation, per-cycle snapshots
// =============================================================================
//
// A workflow is a directed acyclic graph. A node binds a plugin name to an
// execution order, an enabled flag, and an opaque config map; an edge
// optionally carries a condition expression over the cycle state.
//
// START and END are implicit: every enabled node with no inbound edge is a
// start node, every terminal fans into END. The control plane may rewrite
// the graph at any time; the runtime freezes a `WorkflowSnapshot` at the
// start of each cycle so in-flight cycles never observe a mid-cycle edit.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Durable graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: Uuid,
    pub plugin_name: String,
    pub execution_order: i32,
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: Uuid,
    pub to: Uuid,
    /// Boolean expression over the cycle state; absent means unconditional.
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: Uuid,
    pub name: String,
    /// Set once a human edits the graph; the plugin auto-sync task must not
    /// overwrite a marked workflow.
    #[serde(default)]
    pub user_edited: bool,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A validated, frozen view of the enabled subgraph, in execution order.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub workflow_id: Uuid,
    /// Enabled nodes in topological order (`execution_order` tie-break).
    pub nodes: Vec<WorkflowNode>,
    /// Outgoing edges per node, sorted by the target's execution order.
    pub outgoing: HashMap<Uuid, Vec<WorkflowEdge>>,
    /// Nodes with no inbound edge — the implicit START fan-out.
    pub start_nodes: HashSet<Uuid>,
}

impl WorkflowGraph {
    /// Freeze the enabled subgraph for one cycle, validating it on the way.
    ///
    /// Fails with a configuration error on dangling edge endpoints or
    /// cycles. Edges touching disabled nodes are dropped, matching the
    /// semantics of disabling a node in the editor.
    pub fn snapshot(&self) -> EngineResult<WorkflowSnapshot> {
        let enabled: HashMap<Uuid, &WorkflowNode> = self
            .nodes
            .iter()
            .filter(|n| n.enabled)
            .map(|n| (n.id, n))
            .collect();

        // Dangling endpoints on *known* nodes are a wiring error; endpoints
        // on disabled nodes silently drop the edge.
        let known: HashSet<Uuid> = self.nodes.iter().map(|n| n.id).collect();
        for edge in &self.edges {
            if !known.contains(&edge.from) || !known.contains(&edge.to) {
                return Err(EngineError::Configuration(format!(
                    "workflow '{}' has an edge referencing a missing node ({} -> {})",
                    self.name, edge.from, edge.to
                )));
            }
        }

        let live_edges: Vec<&WorkflowEdge> = self
            .edges
            .iter()
            .filter(|e| enabled.contains_key(&e.from) && enabled.contains_key(&e.to))
            .collect();

        // Kahn's algorithm with a deterministic tie-break: ready nodes are
        // taken in (execution_order, plugin_name) order.
        let mut inbound: HashMap<Uuid, usize> = enabled.keys().map(|&id| (id, 0)).collect();
        for edge in &live_edges {
            *inbound.get_mut(&edge.to).expect("live edge targets enabled node") += 1;
        }

        let mut ready: Vec<Uuid> = inbound
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        let start_nodes: HashSet<Uuid> = ready.iter().copied().collect();

        let sort_key = |id: &Uuid| {
            let node = enabled[id];
            (node.execution_order, node.plugin_name.clone())
        };
        ready.sort_by_key(sort_key);
        let mut queue: VecDeque<Uuid> = ready.into();

        let mut ordered = Vec::with_capacity(enabled.len());
        let mut inbound_left = inbound;
        while let Some(id) = queue.pop_front() {
            ordered.push(enabled[&id].clone());
            let mut newly_ready = Vec::new();
            for edge in live_edges.iter().filter(|e| e.from == id) {
                let count = inbound_left
                    .get_mut(&edge.to)
                    .expect("live edge targets enabled node");
                *count -= 1;
                if *count == 0 {
                    newly_ready.push(edge.to);
                }
            }
            newly_ready.sort_by_key(sort_key);
            queue.extend(newly_ready);
        }

        if ordered.len() != enabled.len() {
            return Err(EngineError::Configuration(format!(
                "workflow '{}' contains a cycle",
                self.name
            )));
        }

        // Outgoing adjacency, successors in target execution order.
        let mut outgoing: HashMap<Uuid, Vec<WorkflowEdge>> = HashMap::new();
        for edge in &live_edges {
            outgoing.entry(edge.from).or_default().push((*edge).clone());
        }
        for edges in outgoing.values_mut() {
            edges.sort_by_key(|e| enabled[&e.to].execution_order);
        }

        Ok(WorkflowSnapshot {
            workflow_id: self.id,
            nodes: ordered,
            outgoing,
            start_nodes,
        })
    }
}

impl WorkflowSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn node(plugin: &str, order: i32) -> WorkflowNode {
        WorkflowNode {
            id: Uuid::new_v4(),
            plugin_name: plugin.to_string(),
            execution_order: order,
            enabled: true,
            config: serde_json::Value::Null,
        }
    }

    fn graph(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> WorkflowGraph {
        WorkflowGraph {
            id: Uuid::new_v4(),
            name: "test".into(),
            user_edited: false,
            nodes,
            edges,
        }
    }

    fn chain_edges(nodes: &[WorkflowNode]) -> Vec<WorkflowEdge> {
        nodes
            .windows(2)
            .map(|w| WorkflowEdge {
                from: w[0].id,
                to: w[1].id,
                condition: None,
            })
            .collect()
    }

    #[test]
    fn linear_chain_keeps_order() {
        let nodes = vec![node("coins_pick", 1), node("market_state", 2), node("execution", 3)];
        let edges = chain_edges(&nodes);
        let expected: Vec<String> = nodes.iter().map(|n| n.plugin_name.clone()).collect();

        let snapshot = graph(nodes, edges).snapshot().unwrap();
        let got: Vec<String> = snapshot.nodes.iter().map(|n| n.plugin_name.clone()).collect();
        assert_eq!(got, expected);
        assert_eq!(snapshot.start_nodes.len(), 1);
    }

    #[test]
    fn cycle_is_rejected() {
        let a = node("a", 1);
        let b = node("b", 2);
        let edges = vec![
            WorkflowEdge { from: a.id, to: b.id, condition: None },
            WorkflowEdge { from: b.id, to: a.id, condition: None },
        ];
        let err = graph(vec![a, b], edges).snapshot().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let a = node("a", 1);
        let edges = vec![WorkflowEdge {
            from: a.id,
            to: Uuid::new_v4(),
            condition: None,
        }];
        let err = graph(vec![a], edges).snapshot().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn disabled_node_drops_its_edges() {
        let a = node("a", 1);
        let mut b = node("b", 2);
        let c = node("c", 3);
        b.enabled = false;
        let edges = vec![
            WorkflowEdge { from: a.id, to: b.id, condition: None },
            WorkflowEdge { from: b.id, to: c.id, condition: None },
        ];
        let snapshot = graph(vec![a.clone(), b, c.clone()], edges).snapshot().unwrap();
        assert_eq!(snapshot.nodes.len(), 2);
        // With b gone, both a and c become start nodes.
        assert!(snapshot.start_nodes.contains(&a.id));
        assert!(snapshot.start_nodes.contains(&c.id));
    }

    #[test]
    fn parallel_branches_respect_execution_order() {
        let root = node("root", 1);
        let high = node("high", 10);
        let low = node("low", 2);
        let edges = vec![
            WorkflowEdge { from: root.id, to: high.id, condition: None },
            WorkflowEdge { from: root.id, to: low.id, condition: None },
        ];
        let snapshot = graph(vec![root, high, low], edges).snapshot().unwrap();
        let order: Vec<&str> = snapshot.nodes.iter().map(|n| n.plugin_name.as_str()).collect();
        assert_eq!(order, vec!["root", "low", "high"]);

        // Outgoing successors sorted by target order too.
        let out = &snapshot.outgoing[&snapshot.nodes[0].id];
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn empty_workflow_snapshots_empty() {
        let snapshot = graph(Vec::new(), Vec::new()).snapshot().unwrap();
        assert!(snapshot.is_empty());
    }
}
