// =============================================================================
// Ollama Client — local models over /api/chat
// =============================================================================
//
// No auth. Ollama's `format: "json"` flag constrains decoding to valid
// JSON; the schema itself travels in the system prompt since local models
// cannot enforce it natively.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::llm::{extract_json, validate_against_schema, LlmClient, LlmConfig, LlmRequest};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaClient {
    name: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_s))
            .build()
            .map_err(|e| EngineError::Configuration(format!("failed to build http client: {e}")))?;

        Ok(Self {
            name: config.name.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: config.model_name.clone(),
            client,
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &LlmRequest) -> EngineResult<serde_json::Value> {
        let mut messages = Vec::new();
        let mut system = request.system.clone().unwrap_or_default();
        if let Some(schema) = &request.schema {
            system.push_str(&format!(
                "\n\nRespond with a single JSON object matching this schema, and nothing else:\n{schema}"
            ));
        }
        if !system.is_empty() {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "format": "json",
            "options": {"temperature": request.temperature},
        });

        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(request.timeout)
                } else {
                    EngineError::Transient(format!("ollama request failed: {e}"))
                }
            })?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("ollama response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(EngineError::from_http_status(
                status.as_u16(),
                payload.to_string(),
            ));
        }

        let content = payload["message"]["content"].as_str().ok_or_else(|| {
            EngineError::Validation(format!("ollama response missing content: {payload}"))
        })?;

        debug!(model = %self.model, chars = content.len(), "ollama completion received");

        let value = extract_json(content)?;
        if let Some(schema) = &request.schema {
            validate_against_schema(&value, schema)?;
        }
        Ok(value)
    }
}

impl std::fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}
