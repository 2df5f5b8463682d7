//! Binance spot client: combined `@depth` diff stream over one socket,
//! primed from the `/api/v3/depth` REST snapshot.
//!
//! Binance exposes a monotonic update id (`U`/`u`); diffs whose final id is
//! at or below the book's current id are skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{OrderBook, PriceLevel, TradingPair};

use super::{
    book::{ApplyResult, LocalBook},
    reconnect_delay, BookEvent, VenueClient, VenueId, MAX_RECONNECT_ATTEMPTS, REST_TIMEOUT,
};

const VENUE: VenueId = VenueId::Binance;

#[derive(Debug, Deserialize)]
struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

/// Diff depth event, e.g.
/// `{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":157,"u":160,
///   "b":[["0.0024","10"]],"a":[["0.0026","0"]]}`
#[derive(Debug, Deserialize)]
struct DepthUpdate {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b", default)]
    bids: Vec<(String, String)>,
    #[serde(rename = "a", default)]
    asks: Vec<(String, String)>,
}

/// `/api/v3/exchangeInfo` payload, reduced to the pair-discovery fields.
#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    status: String,
}

pub struct BinanceClient {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    symbols: Vec<String>,
    books: RwLock<HashMap<String, LocalBook>>,
    events: mpsc::Sender<BookEvent>,
    shutdown: AtomicBool,
    /// Resolves the pending `connect()` on the first settled outcome.
    ready: Mutex<Option<oneshot::Sender<std::result::Result<(), String>>>>,
    http: reqwest::Client,
}

impl BinanceClient {
    pub fn new(symbols: Vec<String>, events: mpsc::Sender<BookEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                symbols,
                books: RwLock::new(HashMap::new()),
                events,
                shutdown: AtomicBool::new(false),
                ready: Mutex::new(None),
                http: reqwest::Client::new(),
            }),
            task: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn stream_url(&self) -> String {
        self.inner.stream_url()
    }
}

/// Pair discovery over `/api/v3/exchangeInfo`, feeding the symbol registry
/// before subscriptions are resolved. The manager runs this once per
/// startup and reconfiguration.
pub async fn discover_pairs(
    http: &reqwest::Client,
    registry: &crate::symbols::SymbolRegistry,
) -> Result<usize> {
    let url = format!("{}/api/v3/exchangeInfo", VENUE.descriptor().rest_url);
    let resp = http
        .get(&url)
        .timeout(REST_TIMEOUT)
        .send()
        .await
        .context("exchangeInfo request")?
        .error_for_status()
        .context("exchangeInfo status")?;
    let info: ExchangeInfo = resp.json().await.context("exchangeInfo body")?;
    let pairs = pairs_from_exchange_info(registry, &info);
    let count = pairs.len();
    registry.register_pairs(VENUE, pairs);
    Ok(count)
}

/// Listed, canonicalizable pairs out of an exchangeInfo payload. Symbols
/// the registry cannot parse are dropped, as are non-trading statuses.
fn pairs_from_exchange_info(
    registry: &crate::symbols::SymbolRegistry,
    info: &ExchangeInfo,
) -> Vec<TradingPair> {
    info.symbols
        .iter()
        .filter(|s| s.status == "TRADING")
        .filter_map(|s| {
            let canonical = registry.canonicalize(VENUE, &s.symbol)?;
            Some(TradingPair {
                native_symbol: s.symbol.clone(),
                base_asset: s.base_asset.clone(),
                quote_asset: s.quote_asset.clone(),
                canonical_symbol: canonical,
                active: true,
                min_order_size: None,
                tick_size: None,
            })
        })
        .collect()
}

impl Inner {
    /// Combined raw stream URL: symbols are lowercased in the URL only.
    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@depth", s.to_lowercase()))
            .collect();
        format!("{}/{}", VENUE.descriptor().ws_url, streams.join("/"))
    }

    async fn prime_books(&self) {
        for symbol in &self.symbols {
            match self.fetch_snapshot(symbol).await {
                Ok(snapshot) => {
                    let mut book = LocalBook::new(VENUE, symbol.clone());
                    let bids = tuples_to_levels(&snapshot.bids);
                    let asks = tuples_to_levels(&snapshot.asks);
                    if book.apply_snapshot(bids, asks, None, Some(snapshot.last_update_id))
                        == ApplyResult::Applied
                    {
                        let snap = book.snapshot();
                        self.books.write().insert(symbol.clone(), book);
                        let _ = self.events.send(BookEvent::Book(snap)).await;
                    }
                }
                Err(e) => {
                    warn!(venue = VENUE.as_str(), symbol = %symbol, error = %e,
                        "depth snapshot failed, symbol absent until next cycle");
                }
            }
        }
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<DepthSnapshot> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            VENUE.descriptor().rest_url,
            symbol,
            VENUE.book_depth()
        );
        let resp = self
            .http
            .get(&url)
            .timeout(REST_TIMEOUT)
            .send()
            .await
            .context("depth snapshot request")?
            .error_for_status()
            .context("depth snapshot status")?;
        resp.json::<DepthSnapshot>()
            .await
            .context("depth snapshot body")
    }

    /// Resolve a pending `connect()` with the first settled outcome.
    fn notify_ready(&self, outcome: std::result::Result<(), String>) {
        if let Some(tx) = self.ready.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        let mut primed = true; // connect() primed the first cycle
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if !primed {
                self.prime_books().await;
            }
            primed = false;

            match self.connect_and_stream(&mut attempts).await {
                Ok(()) => break, // shutdown requested
                Err(e) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    attempts += 1;
                    let detail = e.to_string();
                    let _ = self
                        .events
                        .send(BookEvent::VenueError {
                            venue: VENUE,
                            detail: detail.clone(),
                            terminal: attempts >= MAX_RECONNECT_ATTEMPTS,
                        })
                        .await;
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        warn!(venue = VENUE.as_str(), attempts, "reconnect budget exhausted");
                        self.notify_ready(Err(detail));
                        break;
                    }
                    sleep(reconnect_delay(attempts)).await;
                }
            }
        }
        self.notify_ready(Err("client stopped before first connection".to_string()));
        let _ = self.events.send(BookEvent::Disconnected(VENUE)).await;
    }

    async fn connect_and_stream(&self, attempts: &mut u32) -> Result<()> {
        let url = self.stream_url();
        info!(venue = VENUE.as_str(), url = %url, "connecting");
        let (ws, _) = connect_async(&url).await.context("ws connect")?;
        *attempts = 0;
        let _ = self.events.send(BookEvent::Connected(VENUE)).await;
        self.notify_ready(Ok(()));

        let (mut write, mut read) = ws.split();
        while let Some(frame) = read.next().await {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            match frame {
                Ok(Message::Text(text)) => self.handle_text(&text).await,
                Ok(Message::Ping(payload)) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(frame)) => {
                    debug!(venue = VENUE.as_str(), ?frame, "close frame");
                    anyhow::bail!("connection closed by venue");
                }
                Ok(_) => {}
                Err(e) => return Err(e).context("ws read"),
            }
        }
        anyhow::bail!("stream ended")
    }

    async fn handle_text(&self, text: &str) {
        let update: DepthUpdate = match serde_json::from_str(text) {
            Ok(u) => u,
            Err(e) => {
                debug!(venue = VENUE.as_str(), error = %e, "unparseable frame, skipping");
                return;
            }
        };
        if update.event_type != "depthUpdate" {
            return;
        }

        let emitted = {
            let mut books = self.books.write();
            let Some(book) = books.get_mut(&update.symbol) else {
                warn!(venue = VENUE.as_str(), symbol = %update.symbol, "update for unknown symbol");
                return;
            };
            let bids = tuples_to_levels(&update.bids);
            let asks = tuples_to_levels(&update.asks);
            match book.apply_deltas(
                &bids,
                &asks,
                Some(update.event_time),
                Some(update.final_update_id),
            ) {
                ApplyResult::Applied => Some(book.snapshot()),
                ApplyResult::Stale | ApplyResult::Rejected => None,
            }
        };
        if let Some(snap) = emitted {
            let _ = self.events.send(BookEvent::Book(snap)).await;
        }
    }
}

fn tuples_to_levels(rows: &[(String, String)]) -> Vec<PriceLevel> {
    rows.iter()
        .map(|(price, quantity)| PriceLevel::new(price.clone(), quantity.clone()))
        .collect()
}

#[async_trait]
impl VenueClient for BinanceClient {
    fn venue(&self) -> VenueId {
        VENUE
    }

    fn subscribed_symbols(&self) -> Vec<String> {
        self.inner.symbols.clone()
    }

    fn local_books(&self) -> Vec<OrderBook> {
        self.inner.books.read().values().map(LocalBook::snapshot).collect()
    }

    async fn connect(&self) -> Result<()> {
        self.inner.shutdown.store(false, Ordering::Relaxed);
        let (ready_tx, ready_rx) = oneshot::channel();
        *self.inner.ready.lock() = Some(ready_tx);
        self.inner.prime_books().await;
        let handle = tokio::spawn(self.inner.clone().run());
        *self.task.lock() = Some(handle);
        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(detail)) => anyhow::bail!("{detail}"),
            Err(_) => anyhow::bail!("client task exited before first connection"),
        }
    }

    async fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner
            .notify_ready(Err("disconnected".to_string()));
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.inner.books.write().clear();
        let _ = self.inner.events.send(BookEvent::Disconnected(VENUE)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_depth_update() {
        let raw = r#"{"e":"depthUpdate","E":1700000000123,"s":"BTCUSDT",
            "U":157,"u":160,
            "b":[["50000.00","1.5"],["49999.00","0"]],
            "a":[["50001.00","2.0"]]}"#;
        let update: DepthUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.event_type, "depthUpdate");
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.final_update_id, 160);
        assert_eq!(update.bids.len(), 2);
        assert_eq!(update.bids[1].1, "0");
        assert_eq!(update.event_time, 1700000000123);
    }

    #[test]
    fn test_parse_depth_snapshot() {
        let raw = r#"{"lastUpdateId":160,
            "bids":[["4.00000000","431.0"]],
            "asks":[["4.00000200","12.0"]]}"#;
        let snap: DepthSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snap.last_update_id, 160);
        assert_eq!(snap.bids[0].0, "4.00000000");
    }

    #[test]
    fn test_pairs_from_exchange_info() {
        let registry = crate::symbols::SymbolRegistry::default();
        let raw = r#"{"timezone":"UTC","symbols":[
            {"symbol":"BTCUSDT","baseAsset":"BTC","quoteAsset":"USDT","status":"TRADING"},
            {"symbol":"ETHBTC","baseAsset":"ETH","quoteAsset":"BTC","status":"TRADING"},
            {"symbol":"LUNAUSDT","baseAsset":"LUNA","quoteAsset":"USDT","status":"BREAK"}
        ]}"#;
        let info: ExchangeInfo = serde_json::from_str(raw).unwrap();
        let pairs = pairs_from_exchange_info(&registry, &info);

        // The halted pair is dropped; the rest canonicalize.
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].native_symbol, "BTCUSDT");
        assert_eq!(pairs[0].canonical_symbol, "BTCUSD");
        assert_eq!(pairs[1].canonical_symbol, "ETHBTC");

        registry.register_pairs(VenueId::Binance, pairs);
        assert_eq!(
            registry.to_native("BTCUSD", VenueId::Binance).unwrap(),
            "BTCUSDT"
        );
        // Registered discovery now gates unlisted symbols.
        assert_eq!(registry.to_native("DOGEUSD", VenueId::Binance), None);
    }

    #[test]
    fn test_stream_url_lowercases_symbols_only() {
        let (tx, _rx) = mpsc::channel(8);
        let client = BinanceClient::new(
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            tx,
        );
        assert_eq!(
            client.stream_url(),
            "wss://stream.binance.com:9443/ws/btcusdt@depth/ethusdt@depth"
        );
        assert_eq!(client.subscribed_symbols()[0], "BTCUSDT");
    }
}
