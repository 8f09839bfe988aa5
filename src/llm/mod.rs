// =============================================================================
// LLM Layer — provider adapters behind one structured-output seam
// =============================================================================
//
// `complete(prompt, schema, temperature, timeout) -> structured output`.
//
// Providers covered: OpenAI-compatible chat endpoints (which includes any
// HTTP provider configured by base_url + api_key + model), Anthropic
// Messages, and local Ollama. Every call is expected to yield JSON matching
// the supplied schema; a response that does not parse is a Validation error
// so the fallback machinery can take over.
//
// Error taxonomy is parseable by construction: auth failures surface as
// Configuration, provider 5xx/429 as Transient, schema misses as
// Validation, deadline expiry as Timeout.
// =============================================================================

pub mod anthropic;
pub mod fallback;
pub mod ollama;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Request / configuration
// ---------------------------------------------------------------------------

/// One completion request. `schema` is a JSON Schema the output must
/// satisfy; providers that support native schema constraints receive it
/// verbatim, the rest get it folded into the instructions.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub schema: Option<serde_json::Value>,
    pub temperature: f32,
    pub timeout: Duration,
}

impl LlmRequest {
    /// Deterministic request with the engine's default deadline.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            schema: None,
            temperature: 0.0,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Openai,
    Anthropic,
    Ollama,
    /// Any OpenAI-compatible endpoint reachable by base_url + api_key.
    Custom,
}

fn default_temperature() -> f32 {
    0.0
}

fn default_timeout_s() -> u64 {
    120
}

/// Durable LLM wiring (one row of `llm_configs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub id: Uuid,
    pub name: String,
    pub provider: LlmProvider,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    /// Adapters tried in order when this one fails.
    #[serde(default)]
    pub fallback_ids: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// The client seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    /// Human-readable identity for logs and debate artifacts.
    fn name(&self) -> &str;

    /// Run one completion and return the parsed structured output.
    async fn complete(&self, request: &LlmRequest) -> EngineResult<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// Schema validation
// ---------------------------------------------------------------------------

/// Check a value against the parts of JSON Schema the engine relies on:
/// top-level type `object` and the `required` key list. Providers enforce
/// the full schema where they can; this is the engine-side backstop.
pub fn validate_against_schema(
    value: &serde_json::Value,
    schema: &serde_json::Value,
) -> EngineResult<()> {
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") && !value.is_object() {
        return Err(EngineError::Validation(format!(
            "structured output is not an object: {value}"
        )));
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required {
            if let Some(name) = field.as_str() {
                if value.get(name).is_none() {
                    return Err(EngineError::Validation(format!(
                        "structured output missing required field '{name}'"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Extract the first JSON object from model text. Tolerates code fences and
/// leading prose, which smaller models produce even at temperature 0.
pub fn extract_json(text: &str) -> EngineResult<serde_json::Value> {
    let trimmed = text.trim();

    // Fast path: the whole body is JSON.
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // Strip a ```json ... ``` fence.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str(after[..end].trim()) {
                return Ok(value);
            }
        }
    }

    // Last resort: the outermost brace pair.
    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if open < close {
            if let Ok(value) = serde_json::from_str(&trimmed[open..=close]) {
                return Ok(value);
            }
        }
    }

    Err(EngineError::Validation(format!(
        "no parseable JSON in model output: {}",
        &text.chars().take(200).collect::<String>()
    )))
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds clients from `llm_configs` rows, resolving fallback chains and
/// memoising constructed clients per id.
pub struct LlmFactory {
    configs: HashMap<Uuid, LlmConfig>,
    built: RwLock<HashMap<Uuid, Arc<dyn LlmClient>>>,
}

impl LlmFactory {
    pub fn new(configs: Vec<LlmConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.id, c)).collect(),
            built: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self, id: Uuid) -> Option<&LlmConfig> {
        self.configs.get(&id)
    }

    /// Resolve a client with its configured fallback chain.
    pub fn client(&self, id: Uuid) -> EngineResult<Arc<dyn LlmClient>> {
        if let Some(existing) = self.built.read().get(&id) {
            return Ok(existing.clone());
        }

        let config = self.configs.get(&id).ok_or_else(|| {
            EngineError::Configuration(format!("llm config {id} does not exist"))
        })?;

        let primary = self.build_bare(config)?;
        let mut fallbacks = Vec::with_capacity(config.fallback_ids.len());
        for fallback_id in &config.fallback_ids {
            let fallback_config = self.configs.get(fallback_id).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "llm config {id} references missing fallback {fallback_id}"
                ))
            })?;
            fallbacks.push(self.build_bare(fallback_config)?);
        }

        let client: Arc<dyn LlmClient> =
            Arc::new(fallback::FallbackChain::new(primary, fallbacks));
        self.built.write().insert(id, client.clone());
        Ok(client)
    }

    /// Construct a provider client without its fallback chain.
    fn build_bare(&self, config: &LlmConfig) -> EngineResult<Arc<dyn LlmClient>> {
        let client: Arc<dyn LlmClient> = match config.provider {
            LlmProvider::Openai | LlmProvider::Custom => {
                Arc::new(openai::OpenAiClient::new(config)?)
            }
            LlmProvider::Anthropic => Arc::new(anthropic::AnthropicClient::new(config)?),
            LlmProvider::Ollama => Arc::new(ollama::OllamaClient::new(config)?),
        };
        Ok(client)
    }
}

impl std::fmt::Debug for LlmFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmFactory")
            .field("configs", &self.configs.len())
            .finish()
    }
}
