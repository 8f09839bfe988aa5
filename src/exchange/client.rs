// =============================================================================
// Rate-Limited Exchange Client — token bucket, connection pool, retries
// =============================================================================
//
// Every REST capability of the wrapped adapter passes through three gates:
//
//   1. The shared per-exchange token bucket (§ rate_limit). A starved
//      pipeline blocks here rather than dropping requests.
//   2. A connection-pool semaphore capping in-flight requests regardless of
//      token availability (default 10).
//   3. A retry loop: exponential backoff with jitter on Transient/Timeout,
//      immediate give-up on Validation/Configuration/Fatal.
//
// `create_order` is NOT idempotent at the exchange level, so it is never
// retried here — de-duplication and reissue policy belong to the executor.
// Persistent `watch` subscriptions bypass the bucket entirely; they are not
// REST calls.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::exchange::rate_limit::{RateQuota, TokenBucket};
use crate::exchange::{ExchangeAdapter, ExchangeConfig, StreamChannel, StreamEvent};
use crate::types::{
    Balance, MarketCatalogue, Ohlcv, Order, OrderBook, OrderRequest, Position, Ticker,
};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), with jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_backoff);
        let jitter_ms = if capped.as_millis() > 1 {
            rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2)
        } else {
            0
        };
        capped + Duration::from_millis(jitter_ms)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// The rate-limited face of an exchange adapter. Implements
/// `ExchangeAdapter` itself so downstream code cannot tell the difference.
pub struct RateLimitedExchange {
    inner: Arc<dyn ExchangeAdapter>,
    bucket: Arc<TokenBucket>,
    pool: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl RateLimitedExchange {
    /// Build from an exchange config: quota from the venue table unless the
    /// row overrides it.
    pub fn new(inner: Arc<dyn ExchangeAdapter>, config: &ExchangeConfig) -> Self {
        let quota = match config.rate_limit_per_minute {
            Some(per_minute) => RateQuota::per_minute(per_minute),
            None => RateQuota::for_exchange(&config.kind),
        };
        Self::with_parts(
            inner,
            Arc::new(TokenBucket::new(quota)),
            config.max_concurrent_requests.max(1) as usize,
            RetryPolicy::default(),
        )
    }

    pub fn with_parts(
        inner: Arc<dyn ExchangeAdapter>,
        bucket: Arc<TokenBucket>,
        pool_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            bucket,
            pool: Arc::new(Semaphore::new(pool_size)),
            retry,
        }
    }

    /// The shared bucket, for stats and adaptive resizing.
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    /// Apply a server-provided rate hint (requests per minute).
    pub async fn apply_rate_hint(&self, per_minute: u32) {
        self.bucket.resize(RateQuota::per_minute(per_minute)).await;
    }

    /// Run one guarded call: token, permit, retry loop.
    async fn guarded<'a, T, F>(
        &'a self,
        op: &'static str,
        max_attempts: u32,
        make: F,
    ) -> EngineResult<T>
    where
        F: Fn() -> BoxFuture<'a, EngineResult<T>>,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            self.bucket.acquire().await;
            let _permit = self
                .pool
                .acquire()
                .await
                .expect("connection pool semaphore is never closed");

            match make().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    attempt += 1;
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        op,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient exchange error — retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    debug!(op, error = %e, "exchange call failed");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl ExchangeAdapter for RateLimitedExchange {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn load_markets(&self) -> EngineResult<MarketCatalogue> {
        self.guarded("load_markets", self.retry.max_attempts, || {
            Box::pin(self.inner.load_markets())
        })
        .await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> EngineResult<Vec<Ohlcv>> {
        self.guarded("fetch_ohlcv", self.retry.max_attempts, || {
            Box::pin(self.inner.fetch_ohlcv(symbol, timeframe, limit))
        })
        .await
    }

    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker> {
        self.guarded("fetch_ticker", self.retry.max_attempts, || {
            Box::pin(self.inner.fetch_ticker(symbol))
        })
        .await
    }

    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> EngineResult<OrderBook> {
        self.guarded("fetch_order_book", self.retry.max_attempts, || {
            Box::pin(self.inner.fetch_order_book(symbol, depth))
        })
        .await
    }

    async fn fetch_open_interest(&self, symbol: &str) -> EngineResult<f64> {
        self.guarded("fetch_open_interest", self.retry.max_attempts, || {
            Box::pin(self.inner.fetch_open_interest(symbol))
        })
        .await
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> EngineResult<f64> {
        self.guarded("fetch_funding_rate", self.retry.max_attempts, || {
            Box::pin(self.inner.fetch_funding_rate(symbol))
        })
        .await
    }

    async fn fetch_balance(&self) -> EngineResult<Balance> {
        self.guarded("fetch_balance", self.retry.max_attempts, || {
            Box::pin(self.inner.fetch_balance())
        })
        .await
    }

    async fn fetch_positions(&self) -> EngineResult<Vec<Position>> {
        self.guarded("fetch_positions", self.retry.max_attempts, || {
            Box::pin(self.inner.fetch_positions())
        })
        .await
    }

    async fn create_order(&self, request: &OrderRequest) -> EngineResult<Order> {
        // Single attempt: order placement must not be blind-retried.
        self.guarded("create_order", 1, || {
            Box::pin(self.inner.create_order(request))
        })
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()> {
        self.guarded("cancel_order", self.retry.max_attempts, || {
            Box::pin(self.inner.cancel_order(symbol, order_id))
        })
        .await
    }

    async fn watch(
        &self,
        symbol: &str,
        channel: StreamChannel,
        events: mpsc::Sender<StreamEvent>,
        stop: watch::Receiver<bool>,
    ) -> EngineResult<()> {
        // Persistent subscriptions are not REST calls; no token, no permit.
        self.inner.watch(symbol, channel, events, stop).await
    }
}

impl std::fmt::Debug for RateLimitedExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedExchange")
            .field("exchange", &self.inner.id())
            .finish()
    }
}
