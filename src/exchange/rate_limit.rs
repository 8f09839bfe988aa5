// =============================================================================
// Rate Limiter — per-exchange token bucket in front of every REST call
// =============================================================================
//
// Each exchange gets one shared bucket sized by venue policy:
//
//   Binance      1200 requests / minute
//   Bybit         120 requests / minute
//   Hyperliquid   600 requests / minute
//   (fallback)     60 requests / minute
//
// `acquire` blocks until a token is available; a starved pipeline waits
// rather than dropping requests. Cancellation is honoured because a blocked
// acquire is an ordinary await — dropping the future releases nothing it
// has not taken.
//
// An adaptive mode accepts a server-provided rate hint and re-sizes the
// bucket in place; in-flight waiters observe the new size on their next
// window roll.
// =============================================================================

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Quotas
// ---------------------------------------------------------------------------

/// A venue's REST quota: `per_window` calls every `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub per_window: u32,
    pub window: Duration,
}

impl RateQuota {
    /// Quota for a known exchange kind; unknown venues get the conservative
    /// fallback of 60/minute.
    pub fn for_exchange(kind: &str) -> Self {
        let per_minute = match kind.to_ascii_lowercase().as_str() {
            "binance" => 1200,
            "bybit" => 120,
            "hyperliquid" => 600,
            _ => 60,
        };
        Self {
            per_window: per_minute,
            window: Duration::from_secs(60),
        }
    }

    pub fn per_minute(per_minute: u32) -> Self {
        Self {
            per_window: per_minute,
            window: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

struct Inner {
    capacity: u32,
    tokens: u32,
    window: Duration,
    window_start: Instant,
}

impl Inner {
    /// Advance to the current window, restoring the full token budget when
    /// one or more window boundaries have passed.
    fn roll(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= self.window {
            // Skip whole windows at once after idle periods.
            let windows = (elapsed.as_millis() / self.window.as_millis().max(1)) as u32;
            self.window_start += self.window * windows;
            self.tokens = self.capacity;
        }
    }

    fn time_to_next_window(&self) -> Duration {
        let now = Instant::now();
        let end = self.window_start + self.window;
        end.saturating_duration_since(now)
    }
}

/// Shared token bucket; clone the surrounding `Arc` freely.
pub struct TokenBucket {
    inner: Mutex<Inner>,
}

impl TokenBucket {
    pub fn new(quota: RateQuota) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: quota.per_window.max(1),
                tokens: quota.per_window.max(1),
                window: quota.window,
                window_start: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for the next window when the budget for the
    /// current one is spent. Cancel-safe: dropping the future while it
    /// sleeps consumes nothing.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                inner.roll();
                if inner.tokens > 0 {
                    inner.tokens -= 1;
                    return;
                }
                inner.time_to_next_window()
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter exhausted — waiting for refill");
            // Never spin: even a zero wait yields to the scheduler.
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Non-blocking variant; `true` when a token was taken.
    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.roll();
        if inner.tokens > 0 {
            inner.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens still available in the current window.
    pub async fn available(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        inner.roll();
        inner.tokens
    }

    /// Adaptive resize from a server-provided hint. Shrinking also clamps
    /// the tokens left in the current window.
    pub async fn resize(&self, quota: RateQuota) {
        let mut inner = self.inner.lock().await;
        let capacity = quota.per_window.max(1);
        if capacity < inner.capacity {
            warn!(
                old = inner.capacity,
                new = capacity,
                "rate limiter shrunk by server hint"
            );
        }
        inner.capacity = capacity;
        inner.window = quota.window;
        inner.tokens = inner.tokens.min(capacity);
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_table() {
        assert_eq!(RateQuota::for_exchange("binance").per_window, 1200);
        assert_eq!(RateQuota::for_exchange("Bybit").per_window, 120);
        assert_eq!(RateQuota::for_exchange("hyperliquid").per_window, 600);
        assert_eq!(RateQuota::for_exchange("kraken").per_window, 60);
    }

    #[tokio::test]
    async fn burst_up_to_capacity_then_blocks() {
        let bucket = TokenBucket::new(RateQuota {
            per_window: 3,
            window: Duration::from_secs(60),
        });
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        // Quota spent — nothing dispatches until the window rolls.
        assert!(!bucket.try_acquire().await);
        assert_eq!(bucket.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_roll_restores_budget() {
        let bucket = TokenBucket::new(RateQuota {
            per_window: 2,
            window: Duration::from_secs(1),
        });
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_refill() {
        let bucket = TokenBucket::new(RateQuota {
            per_window: 1,
            window: Duration::from_secs(1),
        });
        bucket.acquire().await;

        let started = tokio::time::Instant::now();
        bucket.acquire().await; // must wait ~1 s (auto-advanced by paused clock)
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn resize_clamps_current_tokens() {
        let bucket = TokenBucket::new(RateQuota {
            per_window: 100,
            window: Duration::from_secs(60),
        });
        bucket.resize(RateQuota::per_minute(5)).await;
        assert!(bucket.available().await <= 5);
    }
}
