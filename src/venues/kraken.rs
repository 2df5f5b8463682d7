//! Kraken client: one socket for all symbols with a `book` subscription at
//! depth 100, primed from the public `Depth` REST endpoint.
//!
//! Kraken frames book data as JSON arrays
//! `[channel_id, {..}, "book-100", "XBT/USD"]`; snapshots use `as`/`bs`
//! keys, incremental updates `a`/`b`, and an update may split bids and asks
//! across two payload objects in one frame. Event objects (heartbeat,
//! subscriptionStatus) arrive as JSON dicts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
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

const VENUE: VenueId = VenueId::Kraken;

#[derive(Debug, Deserialize)]
struct RestDepth {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, RestDepthSide>,
}

#[derive(Debug, Deserialize)]
struct RestDepthSide {
    #[serde(default)]
    bids: Vec<Vec<Value>>,
    #[serde(default)]
    asks: Vec<Vec<Value>>,
}

/// Payload pulled out of one array frame.
#[derive(Debug, Default)]
struct BookPayload {
    snapshot_bids: Vec<PriceLevel>,
    snapshot_asks: Vec<PriceLevel>,
    delta_bids: Vec<PriceLevel>,
    delta_asks: Vec<PriceLevel>,
}

impl BookPayload {
    fn is_snapshot(&self) -> bool {
        !self.snapshot_bids.is_empty() || !self.snapshot_asks.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.snapshot_bids.is_empty()
            && self.snapshot_asks.is_empty()
            && self.delta_bids.is_empty()
            && self.delta_asks.is_empty()
    }
}

pub struct KrakenClient {
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

impl KrakenClient {
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
                Ok(side) => {
                    let mut book = LocalBook::new(VENUE, symbol.clone());
                    let bids = levels_from_rows(&side.bids);
                    let asks = levels_from_rows(&side.asks);
                    if book.apply_snapshot(bids, asks, None, None) == ApplyResult::Applied {
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

    async fn fetch_snapshot(&self, symbol: &str) -> Result<RestDepthSide> {
        // The REST pair parameter drops the slash; the book key keeps it.
        let pair = symbol.replace('/', "");
        let url = format!(
            "{}/0/public/Depth?pair={}&count={}",
            VENUE.descriptor().rest_url,
            pair,
            VENUE.book_depth()
        );
        let resp = self
            .http
            .get(&url)
            .timeout(REST_TIMEOUT)
            .send()
            .await
            .context("depth request")?
            .error_for_status()
            .context("depth status")?;
        let depth: RestDepth = resp.json().await.context("depth body")?;
        if let Some(err) = depth.error.first() {
            anyhow::bail!("kraken depth error: {err}");
        }
        // The result is keyed by Kraken's internal pair name; one pair was
        // requested so the first entry is it.
        depth
            .result
            .into_values()
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty depth result"))
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
            "event": "subscribe",
            "pair": self.symbols,
            "subscription": {"name": "book", "depth": VENUE.book_depth()},
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
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(venue = VENUE.as_str(), error = %e, "unparseable frame, skipping");
                return;
            }
        };
        match value {
            Value::Array(frame) => self.handle_book_frame(&frame).await,
            Value::Object(obj) => {
                // heartbeat / systemStatus / subscriptionStatus
                if let Some(event) = obj.get("event").and_then(Value::as_str) {
                    if event == "subscriptionStatus"
                        && obj.get("status").and_then(Value::as_str) == Some("error")
                    {
                        warn!(venue = VENUE.as_str(), ?obj, "subscription rejected");
                    }
                }
            }
            _ => {}
        }
    }

    async fn handle_book_frame(&self, frame: &[Value]) {
        let Some((pair, payload)) = parse_book_frame(frame) else {
            debug!(venue = VENUE.as_str(), "unrecognized array frame");
            return;
        };
        if payload.is_empty() {
            return;
        }

        let emitted = {
            let mut books = self.books.write();
            let Some(book) = books.get_mut(&pair) else {
                warn!(venue = VENUE.as_str(), symbol = %pair, "update for unknown symbol");
                return;
            };
            let result = if payload.is_snapshot() {
                book.apply_snapshot(payload.snapshot_bids, payload.snapshot_asks, None, None)
            } else {
                book.apply_deltas(&payload.delta_bids, &payload.delta_asks, None, None)
            };
            match result {
                ApplyResult::Applied => Some(book.snapshot()),
                ApplyResult::Stale | ApplyResult::Rejected => None,
            }
        };
        if let Some(snap) = emitted {
            let _ = self.events.send(BookEvent::Book(snap)).await;
        }
    }
}

/// `[channel_id, {payload}.., channel_name, pair]` with rows
/// `[price, volume, time]`. Returns the native pair and collected levels.
fn parse_book_frame(frame: &[Value]) -> Option<(String, BookPayload)> {
    if frame.len() < 4 {
        return None;
    }
    let pair = frame.last()?.as_str()?.to_string();
    let channel = frame.get(frame.len() - 2)?.as_str()?;
    if !channel.starts_with("book") {
        return None;
    }

    let mut payload = BookPayload::default();
    for part in &frame[1..frame.len() - 2] {
        let Some(obj) = part.as_object() else { continue };
        for (key, rows) in obj {
            let Some(rows) = rows.as_array() else { continue };
            let rows: Vec<Vec<Value>> = rows
                .iter()
                .filter_map(|r| r.as_array().cloned())
                .collect();
            let levels = levels_from_rows(&rows);
            match key.as_str() {
                "bs" => payload.snapshot_bids.extend(levels),
                "as" => payload.snapshot_asks.extend(levels),
                "b" => payload.delta_bids.extend(levels),
                "a" => payload.delta_asks.extend(levels),
                _ => {}
            }
        }
    }
    Some((pair, payload))
}

#[async_trait]
impl VenueClient for KrakenClient {
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
