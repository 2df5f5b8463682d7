//! Gemini client: one socket per symbol on `/v1/marketdata/<sym>`, primed
//! from the v1 REST book.
//!
//! Gemini sends pre-formed events with no subscribe frame; the first update
//! after connect carries the full book as `change` events with reason
//! `initial`, later ones are incremental (`remaining` of `0` removes a
//! level). Each symbol owns its own reconnect loop.

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

use crate::models::{OrderBook, PriceLevel};

use super::{
    book::{ApplyResult, LocalBook},
    reconnect_delay, BookEvent, VenueClient, VenueId, MAX_RECONNECT_ATTEMPTS, REST_TIMEOUT,
};

const VENUE: VenueId = VenueId::Gemini;

/// REST book entry: `{"price":"...","amount":"...","timestamp":"..."}`
#[derive(Debug, Deserialize)]
struct RestEntry {
    price: String,
    amount: String,
}

#[derive(Debug, Deserialize)]
struct RestBook {
    #[serde(default)]
    bids: Vec<RestEntry>,
    #[serde(default)]
    asks: Vec<RestEntry>,
}

#[derive(Debug, Deserialize)]
struct MarketDataMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestampms: Option<i64>,
    #[serde(default)]
    events: Vec<MarketDataEvent>,
}

#[derive(Debug, Deserialize)]
struct MarketDataEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    remaining: Option<String>,
}

pub struct GeminiClient {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    symbols: Vec<String>,
    books: RwLock<HashMap<String, LocalBook>>,
    events: mpsc::Sender<BookEvent>,
    shutdown: AtomicBool,
    /// Connected is reported once, for the first socket that comes up.
    announced: AtomicBool,
    /// Resolves the pending `connect()` on the first settled outcome
    /// across the per-symbol sockets.
    ready: Mutex<Option<oneshot::Sender<std::result::Result<(), String>>>>,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(symbols: Vec<String>, events: mpsc::Sender<BookEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                symbols,
                books: RwLock::new(HashMap::new()),
                events,
                shutdown: AtomicBool::new(false),
                announced: AtomicBool::new(false),
                ready: Mutex::new(None),
                http: reqwest::Client::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Inner {
    async fn prime_book(&self, symbol: &str) {
        match self.fetch_snapshot(symbol).await {
            Ok(rest) => {
                let mut book = LocalBook::new(VENUE, symbol.to_string());
                let bids = entries_to_levels(&rest.bids);
                let asks = entries_to_levels(&rest.asks);
                if book.apply_snapshot(bids, asks, None, None) == ApplyResult::Applied {
                    let snap = book.snapshot();
                    self.books.write().insert(symbol.to_string(), book);
                    let _ = self.events.send(BookEvent::Book(snap)).await;
                }
            }
            Err(e) => {
                warn!(venue = VENUE.as_str(), symbol = %symbol, error = %e,
                    "book snapshot failed, symbol absent until next cycle");
            }
        }
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<RestBook> {
        let url = format!("{}/v1/book/{}", VENUE.descriptor().rest_url, symbol);
        let resp = self
            .http
            .get(&url)
            .timeout(REST_TIMEOUT)
            .send()
            .await
            .context("book request")?
            .error_for_status()
            .context("book status")?;
        resp.json::<RestBook>().await.context("book body")
    }

    /// Resolve a pending `connect()` with the first settled outcome.
    fn notify_ready(&self, outcome: std::result::Result<(), String>) {
        if let Some(tx) = self.ready.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    /// Per-symbol loop: Gemini streams each symbol on its own socket.
    async fn run_symbol(self: Arc<Self>, symbol: String) {
        let mut attempts: u32 = 0;
        let mut primed = true;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if !primed {
                self.prime_book(&symbol).await;
            }
            primed = false;

            match self.connect_and_stream(&symbol, &mut attempts).await {
                Ok(()) => break,
                Err(e) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    attempts += 1;
                    let detail = format!("{symbol}: {e}");
                    let _ = self
                        .events
                        .send(BookEvent::VenueError {
                            venue: VENUE,
                            detail: detail.clone(),
                            terminal: attempts >= MAX_RECONNECT_ATTEMPTS,
                        })
                        .await;
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        warn!(venue = VENUE.as_str(), symbol = %symbol, attempts,
                            "reconnect budget exhausted");
                        self.notify_ready(Err(detail));
                        break;
                    }
                    sleep(reconnect_delay(attempts)).await;
                }
            }
        }
    }

    async fn connect_and_stream(&self, symbol: &str, attempts: &mut u32) -> Result<()> {
        let url = format!("{}/v1/marketdata/{}", VENUE.descriptor().ws_url, symbol);
        info!(venue = VENUE.as_str(), symbol = %symbol, "connecting");
        let (ws, _) = connect_async(&url).await.context("ws connect")?;
        *attempts = 0;
        if !self.announced.swap(true, Ordering::Relaxed) {
            let _ = self.events.send(BookEvent::Connected(VENUE)).await;
        }
        self.notify_ready(Ok(()));

        let (mut write, mut read) = ws.split();
        while let Some(frame) = read.next().await {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            match frame {
                Ok(Message::Text(text)) => self.handle_text(symbol, &text).await,
                Ok(Message::Ping(payload)) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(frame)) => {
                    debug!(venue = VENUE.as_str(), symbol = %symbol, ?frame, "close frame");
                    anyhow::bail!("connection closed by venue");
                }
                Ok(_) => {}
                Err(e) => return Err(e).context("ws read"),
            }
        }
        anyhow::bail!("stream ended")
    }

    async fn handle_text(&self, symbol: &str, text: &str) {
        let msg: MarketDataMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(venue = VENUE.as_str(), error = %e, "unparseable frame, skipping");
                return;
            }
        };
        if msg.kind != "update" {
            return; // heartbeats carry no book data
        }

        let (bids, asks) = split_changes(&msg.events);
        if bids.is_empty() && asks.is_empty() {
            return;
        }

        let emitted = {
            let mut books = self.books.write();
            let Some(book) = books.get_mut(symbol) else {
                warn!(venue = VENUE.as_str(), symbol = %symbol, "update for unprimed symbol");
                return;
            };
            match book.apply_deltas(&bids, &asks, msg.timestampms, None) {
                ApplyResult::Applied => Some(book.snapshot()),
                ApplyResult::Stale | ApplyResult::Rejected => None,
            }
        };
        if let Some(snap) = emitted {
            let _ = self.events.send(BookEvent::Book(snap)).await;
        }
    }
}

fn entries_to_levels(entries: &[RestEntry]) -> Vec<PriceLevel> {
    entries
        .iter()
        .map(|e| PriceLevel::new(e.price.clone(), e.amount.clone()))
        .collect()
}

/// Collect `change` events into per-side `(price, remaining)` deltas.
fn split_changes(events: &[MarketDataEvent]) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
    let mut bids = Vec::new();
    let mut asks = Vec::new();
    for event in events {
        if event.kind != "change" {
            continue;
        }
        let (Some(price), Some(remaining)) = (&event.price, &event.remaining) else {
            continue;
        };
        let level = PriceLevel::new(price.clone(), remaining.clone());
        match event.side.as_deref() {
            Some("bid") => bids.push(level),
            Some("ask") => asks.push(level),
            _ => {}
        }
    }
    (bids, asks)
}

#[async_trait]
impl VenueClient for GeminiClient {
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
        self.inner.announced.store(false, Ordering::Relaxed);
        let (ready_tx, ready_rx) = oneshot::channel();
        *self.inner.ready.lock() = Some(ready_tx);
        for symbol in &self.inner.symbols {
            self.inner.prime_book(symbol).await;
        }
        {
            let mut tasks = self.tasks.lock();
            for symbol in &self.inner.symbols {
                let handle = tokio::spawn(self.inner.clone().run_symbol(symbol.clone()));
                tasks.push(handle);
            }
        }
        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(detail)) => anyhow::bail!("{detail}"),
            Err(_) => anyhow::bail!("client tasks exited before first connection"),
        }
    }

    async fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner
            .notify_ready(Err("disconnected".to_string()));
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.inner.books.write().clear();
        let _ = self.inner.events.send(BookEvent::Disconnected(VENUE)).await;
    }
}
