// =============================================================================
// Anthropic Messages Client
// =============================================================================
//
// Speaks `POST {base}/v1/messages` with the `x-api-key` header scheme.
// Anthropic has no response_format constraint, so the schema is folded into
// the system prompt and the reply is parsed as JSON on the way out.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::llm::{extract_json, validate_against_schema, LlmClient, LlmConfig, LlmRequest};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig) -> EngineResult<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            EngineError::Configuration(format!("llm '{}' has no api key", config.name))
        })?;

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
            api_key,
            model: config.model_name.clone(),
            client,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &LlmRequest) -> EngineResult<serde_json::Value> {
        let mut system = request.system.clone().unwrap_or_default();
        if let Some(schema) = &request.schema {
            system.push_str(&format!(
                "\n\nRespond with a single JSON object matching this schema, and nothing else:\n{schema}"
            ));
        }

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": request.temperature,
            "system": system,
            "messages": [{"role": "user", "content": request.prompt}],
        });

        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(request.timeout)
                } else {
                    EngineError::Transient(format!("anthropic request failed: {e}"))
                }
            })?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("anthropic response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(EngineError::from_http_status(
                status.as_u16(),
                payload.to_string(),
            ));
        }

        let content = payload["content"][0]["text"].as_str().ok_or_else(|| {
            EngineError::Validation(format!("anthropic response missing text: {payload}"))
        })?;

        debug!(model = %self.model, chars = content.len(), "anthropic completion received");

        let value = extract_json(content)?;
        if let Some(schema) = &request.schema {
            validate_against_schema(&value, schema)?;
        }
        Ok(value)
    }
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
