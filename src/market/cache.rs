// =============================================================================
// Market Cache — namespaced TTL cache absorbing bursty pipeline reads
// =============================================================================
//
// Maps `(namespace, key)` to an opaque payload with an expiry deadline.
// Namespaces carry semantics: "tickers", "ohlcv_3m", "orderbook", ... — each
// has its own TTL. Entries are created by the ingestion layer, read by the
// pipeline, and evicted either on an expired read or by the periodic sweep.
//
// The sweep is driven by a min-heap of expiry deadlines, so a pass over a
// map with nothing expired costs a single heap peek rather than a full scan.
// A refreshed entry leaves a stale deadline in the heap; the sweep
// re-validates against the live map before evicting.
//
// Thread safety: parking_lot::RwLock over the entry map (many readers, one
// writer), a separate Mutex for the deadline heap, atomics for counters.
// =============================================================================

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

/// Well-known cache namespaces.
pub mod ns {
    pub const TICKERS: &str = "tickers";
    pub const ORDERBOOK: &str = "orderbook";
    pub const TRADES: &str = "trades";
    pub const MARKETS: &str = "markets";
    pub const OPEN_INTERESTS: &str = "open_interests";
    pub const FUNDING_RATES: &str = "funding_rates";
    pub const COIN_SELECTION: &str = "coin_selection";
    /// Historical bars for replay; written once, then immutable.
    pub const BACKTEST_OHLCV: &str = "backtest_ohlcv";

    /// Namespace for OHLCV bars of a given timeframe, e.g. `ohlcv_3m`.
    pub fn ohlcv(timeframe: &str) -> String {
        format!("ohlcv_{timeframe}")
    }
}

// ---------------------------------------------------------------------------
// TTL table
// ---------------------------------------------------------------------------

/// Per-namespace TTLs in seconds. Values may be overridden from the
/// `system_configs` table at startup.
#[derive(Debug, Clone)]
pub struct CacheTtls {
    overrides: HashMap<String, u64>,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }
}

impl CacheTtls {
    /// Build a TTL table from explicit overrides (namespace -> seconds).
    pub fn with_overrides(overrides: HashMap<String, u64>) -> Self {
        Self { overrides }
    }

    /// Resolve the TTL for a namespace.
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        if let Some(&secs) = self.overrides.get(namespace) {
            return Duration::from_secs(secs);
        }
        let secs = match namespace {
            ns::TICKERS => 10,
            ns::ORDERBOOK => 60,
            ns::TRADES => 60,
            ns::MARKETS => 3600,
            ns::OPEN_INTERESTS => 600,
            ns::FUNDING_RATES => 600,
            ns::COIN_SELECTION => 600,
            ns::BACKTEST_OHLCV => 7 * 24 * 3600,
            "ohlcv_3m" => 300,
            "ohlcv_4h" => 3600,
            other if other.starts_with("ohlcv_") => 300,
            _ => 60,
        };
        Duration::from_secs(secs)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct StoredEntry {
    payload: Vec<u8>,
    expires_at: Instant,
}

/// Counters exposed for the maintenance pass and the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Namespaced TTL cache shared between the ingestion layer and the pipeline.
pub struct MarketCache {
    entries: RwLock<HashMap<(String, String), StoredEntry>>,
    deadlines: Mutex<BinaryHeap<Reverse<(Instant, String, String)>>>,
    ttls: CacheTtls,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MarketCache {
    /// Create a cache using the default TTL table.
    pub fn new() -> Self {
        Self::with_ttls(CacheTtls::default())
    }

    /// Create a cache with an explicit TTL table.
    pub fn with_ttls(ttls: CacheTtls) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            deadlines: Mutex::new(BinaryHeap::new()),
            ttls,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Fetch a payload. Returns `None` for absent *or expired* entries; an
    /// expired entry is evicted on the spot, so a returned value is always
    /// one whose expiry was in the future at call time.
    pub fn get(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        let map_key = (namespace.to_string(), key.to_string());
        let now = Instant::now();

        {
            let entries = self.entries.read();
            match entries.get(&map_key) {
                Some(entry) if entry.expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.payload.clone());
                }
                Some(_) => {} // expired — fall through to evict
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Evict-on-access for the expired entry.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(&map_key) {
            if entry.expires_at <= now {
                entries.remove(&map_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Typed read: deserialise the payload as JSON.
    pub fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let bytes = self.get(namespace, key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(namespace, key, error = %e, "cache payload failed to deserialise — dropping");
                self.remove(namespace, key);
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store a payload under the namespace's configured TTL.
    ///
    /// The `backtest_ohlcv` namespace is immutable after first write: a
    /// second `set` for an existing key is ignored with a warning.
    pub fn set(&self, namespace: &str, key: &str, payload: Vec<u8>) {
        let ttl = self.ttls.ttl_for(namespace);
        self.set_with_ttl(namespace, key, payload, ttl);
    }

    /// Store a payload with an explicit TTL.
    pub fn set_with_ttl(&self, namespace: &str, key: &str, payload: Vec<u8>, ttl: Duration) {
        let map_key = (namespace.to_string(), key.to_string());
        let expires_at = Instant::now() + ttl;

        {
            let mut entries = self.entries.write();
            if namespace == ns::BACKTEST_OHLCV && entries.contains_key(&map_key) {
                warn!(key, "backtest_ohlcv is immutable after write — ignoring overwrite");
                return;
            }
            entries.insert(
                map_key.clone(),
                StoredEntry {
                    payload,
                    expires_at,
                },
            );
        }

        self.deadlines
            .lock()
            .push(Reverse((expires_at, map_key.0, map_key.1)));
    }

    /// Typed write: serialise the value as JSON under the namespace TTL.
    pub fn set_json<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> EngineResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| EngineError::Validation(format!("cache serialise: {e}")))?;
        self.set(namespace, key, bytes);
        Ok(())
    }

    /// Remove a single entry unconditionally.
    pub fn remove(&self, namespace: &str, key: &str) {
        let map_key = (namespace.to_string(), key.to_string());
        if self.entries.write().remove(&map_key).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    // -------------------------------------------------------------------------
    // Sweep
    // -------------------------------------------------------------------------

    /// Evict every entry whose deadline has passed. Returns the number of
    /// entries removed. When nothing is expired this is a single heap peek —
    /// the pass never scans the whole map.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut deadlines = self.deadlines.lock();

        while let Some(Reverse((deadline, _, _))) = deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Reverse((_, namespace, key)) = deadlines.pop().expect("peeked entry exists");

            // The deadline may be stale: the entry could have been refreshed
            // (its newer deadline sits elsewhere in the heap) or already
            // evicted on access.
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get(&(namespace.clone(), key.clone())) {
                if entry.expires_at <= now {
                    entries.remove(&(namespace, key));
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "cache sweep evicted expired entries");
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MarketCache")
            .field("entries", &stats.entries)
            .field("hits", &stats.hits)
            .field("misses", &stats.misses)
            .finish()
    }
}
