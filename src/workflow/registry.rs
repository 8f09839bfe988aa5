// =============================================================================
// Plugin Registry — name -> constructor map populated at startup
// =============================================================================
//
// The registry is an explicit value built in main and injected where
// needed; there is no process-global. Each entry pairs the node metadata
// (what the workflow editor shows) with a constructor that turns the
// node's opaque config into a ready plugin instance.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::workflow::runtime::PipelineNode;

/// Metadata describing a registered plugin to the workflow editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub name: String,
    pub display_name: String,
    pub category: String,
    /// Editor hint: which plugin this one naturally follows.
    #[serde(default)]
    pub insert_after: Option<String>,
    pub suggested_order: i32,
    #[serde(default)]
    pub requires_llm: bool,
    #[serde(default)]
    pub requires_trader: bool,
}

/// Builds a plugin instance from a node's opaque config.
pub type NodeConstructor = fn(serde_json::Value) -> EngineResult<Arc<dyn PipelineNode>>;

pub struct PluginRegistry {
    entries: HashMap<String, (NodeMetadata, NodeConstructor)>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The registry with every built-in plugin installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::workflow::plugins::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, metadata: NodeMetadata, constructor: NodeConstructor) {
        self.entries
            .insert(metadata.name.clone(), (metadata, constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Instantiate a plugin for one cycle. An unknown name is a wiring
    /// error that parks the bot, not a skippable hiccup.
    pub fn instantiate(
        &self,
        name: &str,
        config: serde_json::Value,
    ) -> EngineResult<Arc<dyn PipelineNode>> {
        let (_, constructor) = self
            .entries
            .get(name)
            .ok_or_else(|| EngineError::Configuration(format!("unknown plugin '{name}'")))?;
        constructor(config)
    }

    pub fn metadata(&self, name: &str) -> Option<&NodeMetadata> {
        self.entries.get(name).map(|(meta, _)| meta)
    }

    /// Every registered plugin's metadata, sorted by suggested order.
    pub fn metadata_list(&self) -> Vec<NodeMetadata> {
        let mut list: Vec<NodeMetadata> =
            self.entries.values().map(|(meta, _)| meta.clone()).collect();
        list.sort_by_key(|m| m.suggested_order);
        list
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
