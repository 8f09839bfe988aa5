// =============================================================================
// Fallback Chain + Prompt Cache — resilience wrappers for LLM calls
// =============================================================================
//
// Call shape: primary -> with_fallbacks(f1, f2, ...) -> timeout.
//
// Each adapter in the chain gets the request's full deadline; Timeout is a
// first-class error kind, so an expired primary falls through to the first
// fallback like any other failure. Configuration errors (revoked key, bad
// wiring) also fall through — a healthy fallback should not be blocked by a
// misconfigured primary — but they are logged louder.
//
// The prompt cache memoises identical requests within one cycle. It is
// created fresh per cycle and never reused across cycles.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::llm::{LlmClient, LlmRequest};

// ---------------------------------------------------------------------------
// Fallback chain
// ---------------------------------------------------------------------------

pub struct FallbackChain {
    name: String,
    chain: Vec<Arc<dyn LlmClient>>,
}

impl FallbackChain {
    pub fn new(primary: Arc<dyn LlmClient>, fallbacks: Vec<Arc<dyn LlmClient>>) -> Self {
        let name = primary.name().to_string();
        let mut chain = Vec::with_capacity(1 + fallbacks.len());
        chain.push(primary);
        chain.extend(fallbacks);
        Self { name, chain }
    }
}

#[async_trait]
impl LlmClient for FallbackChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &LlmRequest) -> EngineResult<serde_json::Value> {
        let mut last_error = EngineError::Configuration("empty llm fallback chain".into());

        for (index, client) in self.chain.iter().enumerate() {
            let attempt = tokio::time::timeout(request.timeout, client.complete(request)).await;
            let result = match attempt {
                Ok(inner) => inner,
                Err(_) => Err(EngineError::Timeout(request.timeout)),
            };

            match result {
                Ok(value) => {
                    if index > 0 {
                        info!(
                            primary = %self.chain[0].name(),
                            served_by = %client.name(),
                            "llm fallback served the request"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        client = %client.name(),
                        position = index,
                        error = %e,
                        "llm call failed — trying next in chain"
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("primary", &self.name)
            .field("depth", &self.chain.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-cycle prompt cache
// ---------------------------------------------------------------------------

/// Memoises structured outputs for identical prompts within a single cycle.
pub struct PromptCache {
    entries: Mutex<HashMap<u64, serde_json::Value>>,
}

impl PromptCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(client_name: &str, request: &LlmRequest) -> u64 {
        let mut hasher = DefaultHasher::new();
        client_name.hash(&mut hasher);
        request.system.hash(&mut hasher);
        request.prompt.hash(&mut hasher);
        if let Some(schema) = &request.schema {
            schema.to_string().hash(&mut hasher);
        }
        request.temperature.to_bits().hash(&mut hasher);
        hasher.finish()
    }

    /// Serve from cache or run the call and remember the result.
    pub async fn complete_cached(
        &self,
        client: &Arc<dyn LlmClient>,
        request: &LlmRequest,
    ) -> EngineResult<serde_json::Value> {
        let key = Self::key(client.name(), request);
        if let Some(hit) = self.entries.lock().get(&key) {
            return Ok(hit.clone());
        }

        let value = client.complete(request).await?;
        self.entries.lock().insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for PromptCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Scripted client: fails `failures` times, then returns `value`.
    #[derive(Debug)]
    struct ScriptedClient {
        name: String,
        failures: u32,
        calls: AtomicU32,
        value: serde_json::Value,
        error: fn() -> EngineError,
    }

    impl ScriptedClient {
        fn ok(name: &str, value: serde_json::Value) -> Self {
            Self {
                name: name.into(),
                failures: 0,
                calls: AtomicU32::new(0),
                value,
                error: || EngineError::Transient("unused".into()),
            }
        }

        fn failing(name: &str, error: fn() -> EngineError) -> Self {
            Self {
                name: name.into(),
                failures: u32::MAX,
                calls: AtomicU32::new(0),
                value: serde_json::Value::Null,
                error,
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, _request: &LlmRequest) -> EngineResult<serde_json::Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err((self.error)())
            } else {
                Ok(self.value.clone())
            }
        }
    }

    #[tokio::test]
    async fn primary_success_skips_fallbacks() {
        let primary = Arc::new(ScriptedClient::ok("primary", serde_json::json!({"v": 1})));
        let fallback = Arc::new(ScriptedClient::ok("fallback", serde_json::json!({"v": 2})));
        let chain = FallbackChain::new(primary, vec![fallback.clone() as Arc<dyn LlmClient>]);

        let out = chain.complete(&LlmRequest::new("hi")).await.unwrap();
        assert_eq!(out["v"], 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn five_hundred_falls_back() {
        let primary = Arc::new(ScriptedClient::failing("primary", || {
            EngineError::Transient("http 502".into())
        }));
        let fallback: Arc<dyn LlmClient> =
            Arc::new(ScriptedClient::ok("fallback", serde_json::json!({"v": 2})));
        let chain = FallbackChain::new(primary, vec![fallback]);

        let out = chain.complete(&LlmRequest::new("hi")).await.unwrap();
        assert_eq!(out["v"], 2);
    }

    #[tokio::test]
    async fn exhausted_chain_returns_last_error() {
        let primary = Arc::new(ScriptedClient::failing("primary", || {
            EngineError::Transient("a".into())
        }));
        let fallback: Arc<dyn LlmClient> = Arc::new(ScriptedClient::failing("fallback", || {
            EngineError::Validation("schema".into())
        }));
        let chain = FallbackChain::new(primary, vec![fallback]);

        let err = chain.complete(&LlmRequest::new("hi")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    /// Client that never resolves, to exercise the timeout wrapper.
    #[derive(Debug)]
    struct HangingClient;

    #[async_trait]
    impl LlmClient for HangingClient {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn complete(&self, _request: &LlmRequest) -> EngineResult<serde_json::Value> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_through_to_fallback() {
        let primary: Arc<dyn LlmClient> = Arc::new(HangingClient);
        let fallback: Arc<dyn LlmClient> =
            Arc::new(ScriptedClient::ok("fallback", serde_json::json!({"v": 9})));
        let chain = FallbackChain::new(primary, vec![fallback]);

        let mut request = LlmRequest::new("hi");
        request.timeout = Duration::from_millis(100);
        let out = chain.complete(&request).await.unwrap();
        assert_eq!(out["v"], 9);
    }

    #[tokio::test]
    async fn prompt_cache_deduplicates_identical_requests() {
        let client = Arc::new(ScriptedClient::ok("primary", serde_json::json!({"v": 7})));
        let as_dyn: Arc<dyn LlmClient> = client.clone();
        let cache = PromptCache::new();

        let request = LlmRequest::new("same prompt");
        cache.complete_cached(&as_dyn, &request).await.unwrap();
        cache.complete_cached(&as_dyn, &request).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);

        let other = LlmRequest::new("different prompt");
        cache.complete_cached(&as_dyn, &other).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }
}
