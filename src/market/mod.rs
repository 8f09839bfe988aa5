// =============================================================================
// Market Ingestion — poll provider, stream manager, TTL cache
// =============================================================================
//
// Two providers behind one read surface:
//
//   - `poll`   — on-demand REST reads (OHLCV, funding, open interest, books,
//                balance) through the rate limiter, read-through cached.
//   - `stream` — persistent WebSocket subscriptions for tickers and trades
//                of the active symbol set, reconciled every cycle.
//
// Both feed the shared `cache`, which absorbs bursty demand from the
// pipeline so repeated reads within a cycle cost nothing.
// =============================================================================

pub mod cache;
pub mod poll;
pub mod stream;
