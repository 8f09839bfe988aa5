// =============================================================================
// Public REST Exchange — market data for Binance-shaped venues
// =============================================================================
//
// Read-only adapter over the public REST and WebSocket surfaces of a
// Binance-compatible venue. It supplies the ingestion layer with catalogue,
// bars, quotes, books, funding and open interest; the order capabilities
// refuse with a configuration error because signed trading belongs to a
// venue execution adapter composed in by the operator. Paper bots wrap this
// adapter with the simulated fill layer, which is exactly the composition
// the engine uses by default.
// =============================================================================

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::error::{EngineError, EngineResult};
use crate::exchange::{ws_feed, ExchangeAdapter, ExchangeConfig, PublicTrade, StreamChannel, StreamEvent};
use crate::types::{
    Balance, MarketCatalogue, MarketInfo, Ohlcv, Order, OrderBook, OrderRequest, Position, Ticker,
};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const DEFAULT_FUTURES_URL: &str = "https://fapi.binance.com";
const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443";
const TESTNET_BASE_URL: &str = "https://testnet.binance.vision";
const TESTNET_WS_URL: &str = "wss://testnet.binance.vision";

/// Public-data adapter for a Binance-shaped venue.
pub struct PublicRestExchange {
    id: String,
    base_url: String,
    futures_url: String,
    ws_url: String,
    client: reqwest::Client,
}

impl PublicRestExchange {
    pub fn from_config(config: &ExchangeConfig) -> EngineResult<Self> {
        let (default_base, default_ws) = if config.testnet {
            (TESTNET_BASE_URL, TESTNET_WS_URL)
        } else {
            (DEFAULT_BASE_URL, DEFAULT_WS_URL)
        };

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        let ws_url = config
            .ws_url
            .clone()
            .unwrap_or_else(|| default_ws.to_string());

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Configuration(format!("failed to build http client: {e}")))?;

        debug!(exchange = %config.name, base_url = %base_url, "public REST exchange initialised");

        Ok(Self {
            id: config.name.clone(),
            base_url,
            futures_url: DEFAULT_FUTURES_URL.to_string(),
            ws_url,
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// "BTC/USDT" -> "BTCUSDT".
    fn venue_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    async fn get_json(&self, url: &str) -> EngineResult<serde_json::Value> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("failed to parse response: {e}")))?;

        if !status.is_success() {
            return Err(EngineError::from_http_status(
                status.as_u16(),
                body.to_string(),
            ));
        }
        Ok(body)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> EngineResult<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| EngineError::Validation(format!("failed to parse '{s}' as f64")))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(EngineError::Validation(format!(
                "expected string or number, got: {val}"
            )))
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PublicRestExchange {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load_markets(&self) -> EngineResult<MarketCatalogue> {
        let info = self
            .get_json(&format!("{}/api/v3/exchangeInfo", self.base_url))
            .await?;

        // 24 h stats in one call so candidate ranking has volumes.
        let day_stats = self
            .get_json(&format!("{}/api/v3/ticker/24hr", self.base_url))
            .await
            .unwrap_or(serde_json::Value::Array(Vec::new()));

        let mut volumes = std::collections::HashMap::new();
        if let Some(arr) = day_stats.as_array() {
            for entry in arr {
                if let (Some(sym), Some(vol)) = (
                    entry["symbol"].as_str(),
                    entry["quoteVolume"].as_str().and_then(|v| v.parse::<f64>().ok()),
                ) {
                    volumes.insert(sym.to_string(), vol);
                }
            }
        }

        let symbols = info["symbols"]
            .as_array()
            .ok_or_else(|| EngineError::Validation("exchangeInfo missing 'symbols'".into()))?;

        let mut catalogue = MarketCatalogue::new();
        for entry in symbols {
            let venue = match entry["symbol"].as_str() {
                Some(s) => s,
                None => continue,
            };
            let base = entry["baseAsset"].as_str().unwrap_or_default();
            let quote = entry["quoteAsset"].as_str().unwrap_or_default();
            if base.is_empty() || quote.is_empty() {
                continue;
            }
            let symbol = format!("{base}/{quote}");
            catalogue.insert(
                symbol.clone(),
                MarketInfo {
                    symbol,
                    base: base.to_string(),
                    quote: quote.to_string(),
                    active: entry["status"].as_str() == Some("TRADING"),
                    min_notional: None,
                    quote_volume_24h: volumes.get(venue).copied().unwrap_or(0.0),
                },
            );
        }

        debug!(markets = catalogue.len(), "market catalogue loaded");
        Ok(catalogue)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> EngineResult<Vec<Ohlcv>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            Self::venue_symbol(symbol),
            timeframe,
            limit
        );
        let body = self.get_json(&url).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| EngineError::Validation("klines response is not an array".into()))?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            bars.push(Ohlcv {
                ts: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
            });
        }

        debug!(symbol, timeframe, count = bars.len(), "ohlcv fetched");
        Ok(bars)
    }

    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker> {
        let url = format!(
            "{}/api/v3/ticker/24hr?symbol={}",
            self.base_url,
            Self::venue_symbol(symbol)
        );
        let body = self.get_json(&url).await?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last: Self::parse_str_f64(&body["lastPrice"])?,
            bid: Self::parse_str_f64(&body["bidPrice"]).unwrap_or(0.0),
            ask: Self::parse_str_f64(&body["askPrice"]).unwrap_or(0.0),
            ts: body["closeTime"].as_i64().unwrap_or(0),
        })
    }

    async fn fetch_order_book(&self, symbol: &str, depth: u32) -> EngineResult<OrderBook> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url,
            Self::venue_symbol(symbol),
            depth
        );
        let body = self.get_json(&url).await?;

        let parse_levels = |side: &serde_json::Value| -> Vec<(f64, f64)> {
            side.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|lvl| {
                            let pair = lvl.as_array()?;
                            let price = Self::parse_str_f64(pair.first()?).ok()?;
                            let qty = Self::parse_str_f64(pair.get(1)?).ok()?;
                            Some((price, qty))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_levels(&body["bids"]),
            asks: parse_levels(&body["asks"]),
            ts: body["lastUpdateId"].as_i64().unwrap_or(0),
        })
    }

    async fn fetch_open_interest(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!(
            "{}/fapi/v1/openInterest?symbol={}",
            self.futures_url,
            Self::venue_symbol(symbol)
        );
        let body = self.get_json(&url).await?;
        Self::parse_str_f64(&body["openInterest"])
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!(
            "{}/fapi/v1/premiumIndex?symbol={}",
            self.futures_url,
            Self::venue_symbol(symbol)
        );
        let body = self.get_json(&url).await?;
        // The venue reports a fraction; the engine speaks percent.
        Ok(Self::parse_str_f64(&body["lastFundingRate"])? * 100.0)
    }

    async fn fetch_balance(&self) -> EngineResult<Balance> {
        Err(EngineError::Configuration(
            "public data adapter is read-only; balance requires a venue execution adapter".into(),
        ))
    }

    async fn fetch_positions(&self) -> EngineResult<Vec<Position>> {
        Err(EngineError::Configuration(
            "public data adapter is read-only; positions require a venue execution adapter".into(),
        ))
    }

    async fn create_order(&self, _request: &OrderRequest) -> EngineResult<Order> {
        Err(EngineError::Configuration(
            "public data adapter is read-only; orders require a venue execution adapter".into(),
        ))
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> EngineResult<()> {
        Err(EngineError::Configuration(
            "public data adapter is read-only; orders require a venue execution adapter".into(),
        ))
    }

    async fn watch(
        &self,
        symbol: &str,
        channel: StreamChannel,
        events: mpsc::Sender<StreamEvent>,
        stop: watch::Receiver<bool>,
    ) -> EngineResult<()> {
        let lower = Self::venue_symbol(symbol).to_lowercase();
        let stream = match channel {
            StreamChannel::Ticker => format!("{}/ws/{}@ticker", self.ws_url, lower),
            StreamChannel::Trades => format!("{}/ws/{}@aggTrade", self.ws_url, lower),
        };

        let engine_symbol = symbol.to_string();

        // Reconnect until told to stop; each failed dial backs off briefly.
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            let symbol_for_frames = engine_symbol.clone();
            let tx = events.clone();
            let result = ws_feed::run_json_feed(
                &stream,
                move |frame| {
                    if let Some(event) = parse_stream_frame(&symbol_for_frames, channel, frame) {
                        // A full buffer drops the frame: market snapshots
                        // are replaceable.
                        let _ = tx.try_send(event);
                    }
                },
                stop.clone(),
            )
            .await;

            if *stop.borrow() {
                return Ok(());
            }

            match result {
                Ok(()) => {
                    warn!(symbol = %engine_symbol, %channel, "stream ended — reconnecting in 5s");
                }
                Err(e) => {
                    error!(symbol = %engine_symbol, %channel, error = %e, "stream error — reconnecting in 5s");
                }
            }

            let mut stop_wait = stop.clone();
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                _ = stop_wait.changed() => {
                    if *stop_wait.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Parse one WebSocket frame into a stream event.
///
/// Ticker frames are Binance `24hrTicker` payloads; trade frames are
/// `aggTrade` payloads.
fn parse_stream_frame(symbol: &str, channel: StreamChannel, frame: &str) -> Option<StreamEvent> {
    let root: serde_json::Value = serde_json::from_str(frame).ok()?;

    match channel {
        StreamChannel::Ticker => Some(StreamEvent::Ticker(Ticker {
            symbol: symbol.to_string(),
            last: root["c"].as_str()?.parse().ok()?,
            bid: root["b"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            ask: root["a"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            ts: root["E"].as_i64().unwrap_or(0),
        })),
        StreamChannel::Trades => Some(StreamEvent::Trade(PublicTrade {
            symbol: symbol.to_string(),
            price: root["p"].as_str()?.parse().ok()?,
            amount: root["q"].as_str()?.parse().ok()?,
            is_buyer_maker: root["m"].as_bool()?,
            ts: root["E"].as_i64().unwrap_or(0),
        })),
    }
}

impl std::fmt::Debug for PublicRestExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicRestExchange")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_symbol_strips_separator() {
        assert_eq!(PublicRestExchange::venue_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(PublicRestExchange::venue_symbol("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn parse_ticker_frame() {
        let frame = r#"{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","c":"37000.5","b":"37000.1","a":"37000.9"}"#;
        let event = parse_stream_frame("BTC/USDT", StreamChannel::Ticker, frame).unwrap();
        match event {
            StreamEvent::Ticker(t) => {
                assert_eq!(t.symbol, "BTC/USDT");
                assert!((t.last - 37000.5).abs() < 1e-9);
                assert_eq!(t.ts, 1_700_000_000_000);
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn parse_trade_frame() {
        let frame = r#"{"e":"aggTrade","E":1700000000001,"s":"BTCUSDT","p":"37001.0","q":"0.25","m":true}"#;
        let event = parse_stream_frame("BTC/USDT", StreamChannel::Trades, frame).unwrap();
        match event {
            StreamEvent::Trade(t) => {
                assert!((t.price - 37001.0).abs() < 1e-9);
                assert!((t.amount - 0.25).abs() < 1e-9);
                assert!(t.is_buyer_maker);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_is_dropped() {
        assert!(parse_stream_frame("BTC/USDT", StreamChannel::Ticker, "not json").is_none());
        assert!(parse_stream_frame("BTC/USDT", StreamChannel::Trades, "{}").is_none());
    }
}
