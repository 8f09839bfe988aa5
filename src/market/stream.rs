// =============================================================================
// Stream Manager — WebSocket subscriptions with per-cycle reconciliation
// =============================================================================
//
// Tracks one subscription per `(symbol, channel)` through the state machine
//
//   pending -> active -> failed -> retry_scheduled -> active | dead
//
// Each cycle the scheduler hands in the desired symbol set D (symbols
// trading plus symbols with open positions); the manager computes
//
//   to_subscribe   = (D - C) ∪ (D ∩ F)      new plus previously-failed
//   to_unsubscribe = C - D
//
// and applies both under the per-subscription lock. The lock guards only
// the connect/disconnect transition — it is never held across the life of
// the stream. Lock objects for entries outside C ∪ F are dropped during the
// pass, so the table cannot grow without bound. Reconciliation is
// idempotent: a second pass with the same D does nothing.
//
// Events flow into the market cache (latest ticker / latest trade), where
// the pipeline reads them without touching the REST quota.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::exchange::{ExchangeAdapter, StreamChannel, StreamEvent};
use crate::market::cache::{ns, MarketCache};

/// Consecutive failures after which a subscription is parked as dead until
/// the symbol leaves and re-enters the desired set.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

// ---------------------------------------------------------------------------
// Subscription table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub channel: StreamChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Active,
    Failed,
    RetryScheduled,
    Dead,
}

/// State shared between the manager and the subscription's pump task.
struct SubShared {
    state: SyncMutex<SubscriptionState>,
    /// Guards connect/disconnect transitions for this subscription only.
    transition: AsyncMutex<()>,
    consecutive_failures: SyncMutex<u32>,
}

struct SubEntry {
    shared: Arc<SubShared>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Statistics published after each reconcile pass.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub active: usize,
    pub failed_retries: usize,
    pub last_reconcile_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct StreamManager {
    exchange: Arc<dyn ExchangeAdapter>,
    cache: Arc<MarketCache>,
    table: SyncMutex<HashMap<SubscriptionKey, SubEntry>>,
    reconciles: AtomicU64,
    last_reconcile_at: SyncMutex<Option<DateTime<Utc>>>,
}

impl StreamManager {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, cache: Arc<MarketCache>) -> Self {
        Self {
            exchange,
            cache,
            table: SyncMutex::new(HashMap::new()),
            reconciles: AtomicU64::new(0),
            last_reconcile_at: SyncMutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Bring the subscription table in line with `desired` symbols over the
    /// given channels. Safe to call every cycle; a no-change pass is cheap.
    pub async fn reconcile(
        &self,
        desired: &HashSet<String>,
        channels: &[StreamChannel],
    ) -> StreamStats {
        let desired_keys: HashSet<SubscriptionKey> = desired
            .iter()
            .flat_map(|symbol| {
                channels.iter().map(move |&channel| SubscriptionKey {
                    symbol: symbol.clone(),
                    channel,
                })
            })
            .collect();

        // The live set C. Failed entries (F) are disjoint from C, so the
        // spec's (D - C) ∪ (D ∩ F) collapses to "desired and not live" —
        // a desired key in F falls through to the subscribe path, which is
        // exactly the retry.
        let current: HashSet<SubscriptionKey> = {
            let table = self.table.lock();
            table
                .iter()
                .filter(|(_, entry)| {
                    matches!(
                        *entry.shared.state.lock(),
                        SubscriptionState::Active | SubscriptionState::Pending
                    )
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        let to_subscribe: Vec<SubscriptionKey> = desired_keys
            .iter()
            .filter(|k| !current.contains(*k))
            .cloned()
            .collect();
        let to_unsubscribe: Vec<SubscriptionKey> = current
            .iter()
            .filter(|k| !desired_keys.contains(*k))
            .cloned()
            .collect();

        for key in to_subscribe {
            self.subscribe(key).await;
        }
        for key in to_unsubscribe {
            self.unsubscribe(&key).await;
        }

        // GC: drop table entries (and their lock objects) for subscriptions
        // no longer desired — failed ones included, since only D ∩ F is ever
        // retried.
        {
            let mut table = self.table.lock();
            table.retain(|key, entry| {
                if desired_keys.contains(key) {
                    return true;
                }
                entry.stop.send(true).ok();
                if let Some(task) = entry.task.take() {
                    task.abort();
                }
                false
            });
        }

        self.reconciles.fetch_add(1, Ordering::Relaxed);
        *self.last_reconcile_at.lock() = Some(Utc::now());
        let stats = self.stats();
        debug!(
            active = stats.active,
            failed = stats.failed_retries,
            "subscription reconcile complete"
        );
        stats
    }

    /// Start (or restart) one subscription under its transition lock.
    async fn subscribe(&self, key: SubscriptionKey) {
        // Fetch or create the entry skeleton; the lock object must outlive
        // the table guard so the transition happens outside it.
        let shared = {
            let mut table = self.table.lock();
            let entry = table.entry(key.clone()).or_insert_with(|| {
                let (stop, _) = watch::channel(false);
                SubEntry {
                    shared: Arc::new(SubShared {
                        state: SyncMutex::new(SubscriptionState::Pending),
                        transition: AsyncMutex::new(()),
                        consecutive_failures: SyncMutex::new(0),
                    }),
                    stop,
                    task: None,
                }
            });
            entry.shared.clone()
        };

        let _guard = shared.transition.lock().await;

        // A concurrent reconcile may have already brought this up.
        if *shared.state.lock() == SubscriptionState::Active {
            return;
        }

        // A previously-failed entry is retried through retry_scheduled; once
        // it has failed too many times in a row it is parked dead.
        if *shared.consecutive_failures.lock() >= MAX_CONSECUTIVE_FAILURES {
            *shared.state.lock() = SubscriptionState::Dead;
            warn!(symbol = %key.symbol, channel = %key.channel, "subscription parked dead after repeated failures");
            return;
        }
        if *shared.state.lock() == SubscriptionState::Failed {
            *shared.state.lock() = SubscriptionState::RetryScheduled;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel::<StreamEvent>(256);

        // Mark active before the task starts so a fast failure is never
        // overwritten back to active.
        *shared.state.lock() = SubscriptionState::Active;

        let exchange = self.exchange.clone();
        let cache = self.cache.clone();
        let task_shared = shared.clone();
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            // First delivered event proves the stream is live; reset the
            // failure streak so old outages do not park a healthy stream.
            let pump_shared = task_shared.clone();
            let pump = async move {
                let mut events_rx = events_rx;
                let mut first = true;
                while let Some(event) = events_rx.recv().await {
                    if first {
                        *pump_shared.consecutive_failures.lock() = 0;
                        first = false;
                    }
                    store_event(&cache, event);
                }
            };
            let feed = exchange.watch(
                &task_key.symbol,
                task_key.channel,
                events_tx,
                stop_rx,
            );

            let (feed_result, _) = tokio::join!(feed, pump);
            match feed_result {
                Ok(()) => {
                    // Clean end: unsubscribe or remote close.
                    let mut state = task_shared.state.lock();
                    if *state == SubscriptionState::Active {
                        *state = SubscriptionState::Pending;
                    }
                }
                Err(e) => {
                    warn!(symbol = %task_key.symbol, channel = %task_key.channel, error = %e, "subscription failed");
                    *task_shared.state.lock() = SubscriptionState::Failed;
                    *task_shared.consecutive_failures.lock() += 1;
                }
            }
        });

        {
            let mut table = self.table.lock();
            if let Some(entry) = table.get_mut(&key) {
                entry.stop = stop_tx;
                entry.task = Some(task);
            }
        }
        info!(symbol = %key.symbol, channel = %key.channel, "subscription started");
    }

    /// Stop one subscription under its transition lock and drop the entry.
    async fn unsubscribe(&self, key: &SubscriptionKey) {
        let removed = {
            let mut table = self.table.lock();
            table.remove(key)
        };

        if let Some(mut entry) = removed {
            let _guard = entry.shared.transition.lock().await;
            entry.stop.send(true).ok();
            if let Some(task) = entry.task.take() {
                // The feed returns promptly on the stop signal; abort is the
                // backstop for a wedged transport.
                task.abort();
            }
            info!(symbol = %key.symbol, channel = %key.channel, "subscription stopped");
        }
    }

    /// A subscription's current state, when tracked.
    pub fn state_of(&self, symbol: &str, channel: StreamChannel) -> Option<SubscriptionState> {
        let table = self.table.lock();
        table
            .get(&SubscriptionKey {
                symbol: symbol.to_string(),
                channel,
            })
            .map(|entry| *entry.shared.state.lock())
    }

    pub fn stats(&self) -> StreamStats {
        let table = self.table.lock();
        let mut active = 0;
        let mut failed_retries = 0;
        for entry in table.values() {
            match *entry.shared.state.lock() {
                SubscriptionState::Active | SubscriptionState::Pending => active += 1,
                SubscriptionState::Failed | SubscriptionState::RetryScheduled => {
                    failed_retries += 1
                }
                SubscriptionState::Dead => {}
            }
        }
        StreamStats {
            active,
            failed_retries,
            last_reconcile_at: *self.last_reconcile_at.lock(),
        }
    }

    /// Tear down every subscription (worker shutdown).
    pub async fn shutdown(&self) {
        let keys: Vec<SubscriptionKey> = {
            let table = self.table.lock();
            table.keys().cloned().collect()
        };
        for key in keys {
            self.unsubscribe(&key).await;
        }
        info!("stream manager shut down");
    }
}

/// Write one stream event into the market cache.
fn store_event(cache: &MarketCache, event: StreamEvent) {
    match event {
        StreamEvent::Ticker(ticker) => {
            let symbol = ticker.symbol.clone();
            let _ = cache.set_json(ns::TICKERS, &symbol, &ticker);
        }
        StreamEvent::Trade(trade) => {
            let symbol = trade.symbol.clone();
            let _ = cache.set_json(ns::TRADES, &symbol, &trade);
        }
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("StreamManager")
            .field("active", &stats.active)
            .field("failed_retries", &stats.failed_retries)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::sim::SimExchange;
    use std::time::Duration;

    fn manager() -> (Arc<SimExchange>, StreamManager) {
        let sim = Arc::new(SimExchange::new("sim"));
        let cache = Arc::new(MarketCache::new());
        (sim.clone(), StreamManager::new(sim, cache))
    }

    fn symbols(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn reconcile_subscribes_desired_set() {
        let (_, manager) = manager();
        let stats = manager
            .reconcile(&symbols(&["BTC/USDT", "ETH/USDT"]), &[StreamChannel::Ticker])
            .await;
        assert_eq!(stats.active, 2);
        assert_eq!(stats.failed_retries, 0);
        assert!(stats.last_reconcile_at.is_some());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (_, manager) = manager();
        let desired = symbols(&["BTC/USDT"]);
        let first = manager.reconcile(&desired, &[StreamChannel::Ticker]).await;
        let second = manager.reconcile(&desired, &[StreamChannel::Ticker]).await;
        assert_eq!(first.active, second.active);
        assert_eq!(second.active, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn leavers_are_unsubscribed_and_gced() {
        let (_, manager) = manager();
        manager
            .reconcile(&symbols(&["BTC/USDT", "ETH/USDT"]), &[StreamChannel::Ticker])
            .await;
        let stats = manager
            .reconcile(&symbols(&["BTC/USDT"]), &[StreamChannel::Ticker])
            .await;
        assert_eq!(stats.active, 1);
        // The lock object for ETH/USDT must be gone from the table.
        assert!(manager.state_of("ETH/USDT", StreamChannel::Ticker).is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_subscription_is_retried_next_pass() {
        let (sim, manager) = manager();
        sim.fail_next_subscribe("ETH/USDT", StreamChannel::Ticker);

        let desired = symbols(&["ETH/USDT"]);
        manager.reconcile(&desired, &[StreamChannel::Ticker]).await;

        // Let the failed watch task record its failure.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = manager.stats();
        assert_eq!(stats.failed_retries, 1);

        // Next cycle's reconcile retries and recovers.
        manager.reconcile(&desired, &[StreamChannel::Ticker]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = manager.stats();
        assert_eq!(stats.failed_retries, 0);
        assert_eq!(
            manager.state_of("ETH/USDT", StreamChannel::Ticker),
            Some(SubscriptionState::Active)
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn events_land_in_the_cache() {
        let sim = Arc::new(SimExchange::new("sim"));
        sim.set_price("BTC/USDT", 42_000.0);
        let cache = Arc::new(MarketCache::new());
        let manager = StreamManager::new(sim, cache.clone());

        manager
            .reconcile(&symbols(&["BTC/USDT"]), &[StreamChannel::Ticker])
            .await;
        // The sim emits a tick every 100 ms.
        tokio::time::sleep(Duration::from_millis(250)).await;

        let ticker: crate::types::Ticker = cache
            .get_json(ns::TICKERS, "BTC/USDT")
            .expect("ticker should be cached by the pump");
        assert!((ticker.last - 42_000.0).abs() < 1e-9);
        manager.shutdown().await;
    }
}
