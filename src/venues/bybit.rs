//! Bybit spot client: `orderbook.50.SYMBOL` topics on one v5 public socket,
//! primed from the v5 market orderbook REST endpoint.
//!
//! Bybit tags every message `snapshot` or `delta` and carries a monotonic
//! update id `u`, which gates stale deltas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
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
    reconnect_delay, BookEvent, VenueClient, VenueId, MAX_RECONNECT_ATTEMPTS, REST_TIMEOUT,
};

const VENUE: VenueId = VenueId::Bybit;

#[derive(Debug, Deserialize)]
struct RestEnvelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<BookData>,
}

/// Shared shape of the REST result and the WS `data` object:
/// `{"s":"BTCUSDT","b":[["price","size"]],"a":[...],"u":18521288}`
#[derive(Debug, Deserialize)]
struct BookData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b", default)]
    bids: Vec<(String, String)>,
    #[serde(rename = "a", default)]
    asks: Vec<(String, String)>,
    #[serde(rename = "u")]
    update_id: u64,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    topic: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    data: Option<BookData>,
    // Subscribe acks carry these instead of a topic.
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
}

pub struct BybitClient {
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

impl BybitClient {
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
                Ok(data) => {
                    let mut book = LocalBook::new(VENUE, symbol.clone());
                    let bids = tuples_to_levels(&data.bids);
                    let asks = tuples_to_levels(&data.asks);
                    if book.apply_snapshot(bids, asks, None, Some(data.update_id))
                        == ApplyResult::Applied
                    {
                        let snap = book.snapshot();
                        self.books.write().insert(symbol.clone(), book);
                        let _ = self.events.send(BookEvent::Book(snap)).await;
                    }
                }
                Err(e) => {
                    warn!(venue = VENUE.as_str(), symbol = %symbol, error = %e,
                        "orderbook snapshot failed, symbol absent until next cycle");
                }
            }
        }
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<BookData> {
        let url = format!(
            "{}/v5/market/orderbook?category=spot&symbol={}&limit={}",
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
            .context("orderbook request")?
            .error_for_status()
            .context("orderbook status")?;
        let envelope: RestEnvelope = resp.json().await.context("orderbook body")?;
        if envelope.ret_code != 0 {
            anyhow::bail!("bybit retCode {}: {}", envelope.ret_code, envelope.ret_msg);
        }
        envelope
            .result
            .ok_or_else(|| anyhow::anyhow!("empty orderbook result"))
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

        let topics: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("orderbook.{}.{}", VENUE.book_depth(), s))
            .collect();
        let subscribe = json!({"op": "subscribe", "args": topics});
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
        let msg: StreamMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(venue = VENUE.as_str(), error = %e, "unparseable frame, skipping");
                return;
            }
        };
        if let Some(false) = msg.success {
            warn!(venue = VENUE.as_str(), ret_msg = ?msg.ret_msg, "subscribe rejected");
            return;
        }
        let (Some(topic), Some(data)) = (msg.topic.as_deref(), msg.data) else {
            return; // ack or ping response
        };
        if !topic.starts_with("orderbook.") {
            return;
        }
        let is_snapshot = msg.kind.as_deref() == Some("snapshot");

        let emitted = {
            let mut books = self.books.write();
            let Some(book) = books.get_mut(&data.symbol) else {
                warn!(venue = VENUE.as_str(), symbol = %data.symbol, "update for unknown symbol");
                return;
            };
            let bids = tuples_to_levels(&data.bids);
            let asks = tuples_to_levels(&data.asks);
            let result = if is_snapshot {
                book.apply_snapshot(bids, asks, msg.ts, Some(data.update_id))
            } else {
                book.apply_deltas(&bids, &asks, msg.ts, Some(data.update_id))
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

fn tuples_to_levels(rows: &[(String, String)]) -> Vec<PriceLevel> {
    rows.iter()
        .map(|(price, quantity)| PriceLevel::new(price.clone(), quantity.clone()))
        .collect()
}

#[async_trait]
impl VenueClient for BybitClient {
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
