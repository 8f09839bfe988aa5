// =============================================================================
// OpenAI-Compatible Chat Client
// =============================================================================
//
// Speaks `POST {base}/chat/completions`. Any vendor exposing the same wire
// shape (vLLM, LiteLLM, OpenRouter, self-hosted gateways) is configured as
// provider "custom" with its own base_url; nothing here is OpenAI-specific
// beyond the payload shape.
//
// Structured output: the JSON schema rides in `response_format` as a
// `json_schema` constraint, and the instructions repeat the requirement for
// gateways that ignore response_format.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::llm::{extract_json, validate_against_schema, LlmClient, LlmConfig, LlmRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiClient {
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
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &LlmRequest) -> EngineResult<serde_json::Value> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if let Some(schema) = &request.schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "structured_output",
                    "schema": schema,
                    "strict": true
                }
            });
        }

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(request.timeout)
                } else {
                    EngineError::Transient(format!("openai request failed: {e}"))
                }
            })?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("openai response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(EngineError::from_http_status(
                status.as_u16(),
                payload.to_string(),
            ));
        }

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                EngineError::Validation(format!("openai response missing content: {payload}"))
            })?;

        debug!(model = %self.model, chars = content.len(), "openai completion received");

        let value = extract_json(content)?;
        if let Some(schema) = &request.schema {
            validate_against_schema(&value, schema)?;
        }
        Ok(value)
    }
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
