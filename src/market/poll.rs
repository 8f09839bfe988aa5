// =============================================================================
// Poll Provider — read-through cached REST reads
// =============================================================================
//
// Every read consults the cache first; a miss goes out through the
// rate-limited exchange client and the result is cached under the
// namespace's TTL. Balance is the exception — it is always fetched live,
// because stale balance corrupts sizing decisions.
// =============================================================================

use std::sync::Arc;

use tracing::debug;

use crate::error::EngineResult;
use crate::exchange::ExchangeAdapter;
use crate::market::cache::{ns, MarketCache};
use crate::types::{Balance, MarketCatalogue, Ohlcv, OrderBook, Ticker};

/// Cached REST reads for the pipeline.
pub struct PollProvider {
    exchange: Arc<dyn ExchangeAdapter>,
    cache: Arc<MarketCache>,
}

impl PollProvider {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, cache: Arc<MarketCache>) -> Self {
        Self { exchange, cache }
    }

    /// The shared cache, for plugins that key their own namespaces.
    pub fn cache(&self) -> &Arc<MarketCache> {
        &self.cache
    }

    pub async fn ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> EngineResult<Vec<Ohlcv>> {
        let namespace = ns::ohlcv(timeframe);
        let key = format!("{symbol}:{limit}");
        if let Some(bars) = self.cache.get_json::<Vec<Ohlcv>>(&namespace, &key) {
            return Ok(bars);
        }
        let bars = self.exchange.fetch_ohlcv(symbol, timeframe, limit).await?;
        self.cache.set_json(&namespace, &key, &bars)?;
        debug!(symbol, timeframe, count = bars.len(), "ohlcv filled into cache");
        Ok(bars)
    }

    pub async fn ticker(&self, symbol: &str) -> EngineResult<Ticker> {
        if let Some(ticker) = self.cache.get_json::<Ticker>(ns::TICKERS, symbol) {
            return Ok(ticker);
        }
        let ticker = self.exchange.fetch_ticker(symbol).await?;
        self.cache.set_json(ns::TICKERS, symbol, &ticker)?;
        Ok(ticker)
    }

    pub async fn order_book(&self, symbol: &str, depth: u32) -> EngineResult<OrderBook> {
        let key = format!("{symbol}:{depth}");
        if let Some(book) = self.cache.get_json::<OrderBook>(ns::ORDERBOOK, &key) {
            return Ok(book);
        }
        let book = self.exchange.fetch_order_book(symbol, depth).await?;
        self.cache.set_json(ns::ORDERBOOK, &key, &book)?;
        Ok(book)
    }

    pub async fn funding_rate(&self, symbol: &str) -> EngineResult<f64> {
        if let Some(rate) = self.cache.get_json::<f64>(ns::FUNDING_RATES, symbol) {
            return Ok(rate);
        }
        let rate = self.exchange.fetch_funding_rate(symbol).await?;
        self.cache.set_json(ns::FUNDING_RATES, symbol, &rate)?;
        Ok(rate)
    }

    pub async fn open_interest(&self, symbol: &str) -> EngineResult<f64> {
        if let Some(oi) = self.cache.get_json::<f64>(ns::OPEN_INTERESTS, symbol) {
            return Ok(oi);
        }
        let oi = self.exchange.fetch_open_interest(symbol).await?;
        self.cache.set_json(ns::OPEN_INTERESTS, symbol, &oi)?;
        Ok(oi)
    }

    pub async fn markets(&self) -> EngineResult<MarketCatalogue> {
        if let Some(catalogue) = self.cache.get_json::<MarketCatalogue>(ns::MARKETS, "catalogue") {
            return Ok(catalogue);
        }
        let catalogue = self.exchange.load_markets().await?;
        self.cache.set_json(ns::MARKETS, "catalogue", &catalogue)?;
        Ok(catalogue)
    }

    /// Always live — never cached.
    pub async fn balance(&self) -> EngineResult<Balance> {
        self.exchange.fetch_balance().await
    }
}

impl std::fmt::Debug for PollProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollProvider")
            .field("exchange", &self.exchange.id())
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

    fn provider() -> (Arc<SimExchange>, PollProvider) {
        let sim = Arc::new(SimExchange::new("sim"));
        let cache = Arc::new(MarketCache::new());
        (sim.clone(), PollProvider::new(sim, cache))
    }

    #[tokio::test]
    async fn ohlcv_reads_through_the_cache() {
        let (_, provider) = provider();
        let first = provider.ohlcv("BTC/USDT", "3m", 50).await.unwrap();
        let second = provider.ohlcv("BTC/USDT", "3m", 50).await.unwrap();
        assert_eq!(first, second);
        let stats = provider.cache().stats();
        assert!(stats.hits >= 1, "second read should hit the cache");
    }

    #[tokio::test]
    async fn ticker_cached_under_symbol_key() {
        let (sim, provider) = provider();
        sim.set_price("BTC/USDT", 41_000.0);
        let t1 = provider.ticker("BTC/USDT").await.unwrap();
        // Pin a new price; the cached quote is still served until expiry.
        sim.set_price("BTC/USDT", 99_000.0);
        let t2 = provider.ticker("BTC/USDT").await.unwrap();
        assert_eq!(t1.last, t2.last);
    }

    #[tokio::test]
    async fn markets_catalogue_is_cached() {
        let (_, provider) = provider();
        let first = provider.markets().await.unwrap();
        assert!(first.contains_key("BTC/USDT"));
        let second = provider.markets().await.unwrap();
        assert_eq!(first.len(), second.len());
    }
}
