//! Coinbase Exchange client: public ticker channel over one socket, primed
//! from the level-2 REST book.
//!
//! The unauthenticated ticker stream only carries top-of-book, so each tick
//! replaces the best bid/ask while the primed depth below it ages until the
//! next reconnect cycle. Full `l2update` support needs an authenticated
//! feed and is out of scope here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{OrderBook, PriceLevel};

use super::{
    book::{ApplyResult, LocalBook},
    levels_from_rows, reconnect_delay, BookEvent, VenueClient, VenueId,
    MAX_RECONNECT_ATTEMPTS, REST_TIMEOUT,
};

const VENUE: VenueId = VenueId::Coinbase;

/// Level-2 REST book: rows are `[price, size, num_orders]`.
#[derive(Debug, Deserialize)]
struct RestBook {
    #[serde(default)]
    bids: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    asks: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum FeedMessage {
    #[serde(rename = "ticker")]
    Ticker(TickerMsg),
    #[serde(rename = "subscriptions")]
    Subscriptions {},
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TickerMsg {
    product_id: String,
    #[serde(default)]
    best_bid: Option<String>,
    #[serde(default)]
    best_bid_size: Option<String>,
    #[serde(default)]
    best_ask: Option<String>,
    #[serde(default)]
    best_ask_size: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

pub struct CoinbaseClient {
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

impl CoinbaseClient {
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
}

impl Inner {
    async fn prime_books(&self) {
        for symbol in &self.symbols {
            match self.fetch_snapshot(symbol).await {
                Ok(rest) => {
                    let mut book = LocalBook::new(VENUE, symbol.clone());
                    let bids = levels_from_rows(&rest.bids);
                    let asks = levels_from_rows(&rest.asks);
                    if book.apply_snapshot(bids, asks, None, None) == ApplyResult::Applied {
                        let snap = book.snapshot();
                        self.books.write().insert(symbol.clone(), book);
                        let _ = self.events.send(BookEvent::Book(snap)).await;
                    }
                }
                Err(e) => {
                    warn!(venue = VENUE.as_str(), symbol = %symbol, error = %e,
                        "level2 snapshot failed, symbol absent until next cycle");
                }
            }
        }
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<RestBook> {
        let url = format!(
            "{}/products/{}/book?level=2",
            VENUE.descriptor().rest_url,
            symbol
        );
        let resp = self
            .http
            .get(&url)
            .header("User-Agent", "spreadwatch")
            .timeout(REST_TIMEOUT)
            .send()
            .await
            .context("level2 book request")?
            .error_for_status()
            .context("level2 book status")?;
        resp.json::<RestBook>().await.context("level2 book body")
    }

    /// Resolve a pending `connect()` with the first settled outcome.
    fn notify_ready(&self, outcome: std::result::Result<(), String>) {
        if let Some(tx) = self.ready.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        let mut primed = true;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if !primed {
                self.prime_books().await;
            }
            primed = false;

            match self.connect_and_stream(&mut attempts).await {
                Ok(()) => break,
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
        let url = VENUE.descriptor().ws_url;
        info!(venue = VENUE.as_str(), url, "connecting");
        let (ws, _) = connect_async(url).await.context("ws connect")?;
        let (mut write, mut read) = ws.split();

        let subscribe = json!({
            "type": "subscribe",
            "product_ids": self.symbols,
            "channels": ["ticker"],
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("send subscribe")?;
        *attempts = 0;
        let _ = self.events.send(BookEvent::Connected(VENUE)).await;
        self.notify_ready(Ok(()));

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
        let msg: FeedMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(venue = VENUE.as_str(), error = %e, "unparseable frame, skipping");
                return;
            }
        };
        match msg {
            FeedMessage::Ticker(tick) => self.handle_ticker(tick).await,
            FeedMessage::Error { message } => {
                warn!(venue = VENUE.as_str(), message = %message, "feed error message");
            }
            FeedMessage::Subscriptions {} | FeedMessage::Other => {}
        }
    }

    async fn handle_ticker(&self, tick: TickerMsg) {
        let ts_ms = tick
            .time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp_millis());

        let emitted = {
            let mut books = self.books.write();
            let Some(book) = books.get_mut(&tick.product_id) else {
                warn!(venue = VENUE.as_str(), symbol = %tick.product_id, "ticker for unknown symbol");
                return;
            };
            let best_bid = zip_level(tick.best_bid, tick.best_bid_size);
            let best_ask = zip_level(tick.best_ask, tick.best_ask_size);
            match book.apply_top_of_book(best_bid, best_ask, ts_ms) {
                ApplyResult::Applied => Some(book.snapshot()),
                ApplyResult::Stale | ApplyResult::Rejected => None,
            }
        };
        if let Some(snap) = emitted {
            let _ = self.events.send(BookEvent::Book(snap)).await;
        }
    }
}

fn zip_level(price: Option<String>, size: Option<String>) -> Option<PriceLevel> {
    match (price, size) {
        (Some(price), Some(size)) => Some(PriceLevel::new(price, size)),
        _ => None,
    }
}

#[async_trait]
impl VenueClient for CoinbaseClient {
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
    fn test_parse_ticker() {
        let raw = r#"{"type":"ticker","sequence":12345,"product_id":"BTC-USD",
            "price":"50000.01","best_bid":"50000.00","best_bid_size":"0.5",
            "best_ask":"50000.02","best_ask_size":"0.8",
            "time":"2023-11-14T22:13:20.123456Z"}"#;
        let msg: FeedMessage = serde_json::from_str(raw).unwrap();
        let FeedMessage::Ticker(tick) = msg else {
            panic!("expected ticker");
        };
        assert_eq!(tick.product_id, "BTC-USD");
        assert_eq!(tick.best_bid.as_deref(), Some("50000.00"));
        assert_eq!(tick.best_ask_size.as_deref(), Some("0.8"));
    }

    #[test]
    fn test_parse_rest_book_with_order_counts() {
        let raw = r#"{"sequence":3,
            "bids":[["50000.00","0.5",4],["49999.00","1.0",2]],
            "asks":[["50001.00","0.7",1]]}"#;
        let book: RestBook = serde_json::from_str(raw).unwrap();
        let bids = levels_from_rows(&book.bids);
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].price, "50000.00");
        assert_eq!(bids[0].quantity, "0.5");
    }

    #[test]
    fn test_non_ticker_messages_ignored() {
        let sub = r#"{"type":"subscriptions","channels":[]}"#;
        assert!(matches!(
            serde_json::from_str::<FeedMessage>(sub).unwrap(),
            FeedMessage::Subscriptions {}
        ));
        let hb = r#"{"type":"heartbeat","sequence":90}"#;
        assert!(matches!(
            serde_json::from_str::<FeedMessage>(hb).unwrap(),
            FeedMessage::Other
        ));
    }
}
