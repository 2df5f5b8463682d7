//! KuCoin spot client: token bootstrap via `POST /api/v1/bullet-public`,
//! then `/market/level2:SYMBOL` subscriptions on the handed-out endpoint,
//! primed from the level2_100 REST book.
//!
//! KuCoin requires an application-level `ping` frame every 20 s on top of
//! WebSocket keepalive; the connection is dropped without it. Change rows
//! are `[price, size, sequence]` and `sequenceEnd` gates stale updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{OrderBook, PriceLevel};

use super::{
    book::{ApplyResult, LocalBook},
    levels_from_rows, reconnect_delay, BookEvent, VenueClient, VenueId,
    MAX_RECONNECT_ATTEMPTS, REST_TIMEOUT,
};

const VENUE: VenueId = VenueId::Kucoin;

/// Application-level ping cadence required by the venue.
const PING_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct BulletResponse {
    code: String,
    #[serde(default)]
    data: Option<BulletData>,
}

#[derive(Debug, Deserialize)]
struct BulletData {
    token: String,
    #[serde(rename = "instanceServers", default)]
    instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
struct InstanceServer {
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct RestLevel2 {
    code: String,
    #[serde(default)]
    data: Option<RestLevel2Data>,
}

#[derive(Debug, Deserialize)]
struct RestLevel2Data {
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    sequence: Option<String>,
    #[serde(default)]
    bids: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    asks: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    data: Option<Level2Update>,
}

/// `{"changes":{"asks":[["price","size","seq"]],"bids":[...]},
///   "sequenceEnd":123,"symbol":"BTC-USDT","time":1700000000000}`
#[derive(Debug, Deserialize)]
struct Level2Update {
    changes: Level2Changes,
    #[serde(rename = "sequenceEnd", default)]
    sequence_end: Option<u64>,
    symbol: String,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Level2Changes {
    #[serde(default)]
    bids: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    asks: Vec<Vec<serde_json::Value>>,
}

pub struct KucoinClient {
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

impl KucoinClient {
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
                    let bids = levels_from_rows(&data.bids);
                    let asks = levels_from_rows(&data.asks);
                    let seq = data.sequence.as_deref().and_then(|s| s.parse::<u64>().ok());
                    if book.apply_snapshot(bids, asks, data.time, seq) == ApplyResult::Applied {
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

    async fn fetch_snapshot(&self, symbol: &str) -> Result<RestLevel2Data> {
        let url = format!(
            "{}/api/v1/market/orderbook/level2_100?symbol={}",
            VENUE.descriptor().rest_url,
            symbol
        );
        let resp = self
            .http
            .get(&url)
            .timeout(REST_TIMEOUT)
            .send()
            .await
            .context("level2 request")?
            .error_for_status()
            .context("level2 status")?;
        let body: RestLevel2 = resp.json().await.context("level2 body")?;
        if body.code != "200000" {
            anyhow::bail!("kucoin level2 code {}", body.code);
        }
        body.data
            .ok_or_else(|| anyhow::anyhow!("empty level2 data"))
    }

    /// Token bootstrap: the socket endpoint is handed out per connection.
    async fn fetch_ws_endpoint(&self) -> Result<String> {
        let url = format!("{}/api/v1/bullet-public", VENUE.descriptor().rest_url);
        let resp = self
            .http
            .post(&url)
            .timeout(REST_TIMEOUT)
            .send()
            .await
            .context("bullet-public request")?
            .error_for_status()
            .context("bullet-public status")?;
        let body: BulletResponse = resp.json().await.context("bullet-public body")?;
        if body.code != "200000" {
            anyhow::bail!("bullet-public code {}", body.code);
        }
        let data = body
            .data
            .ok_or_else(|| anyhow::anyhow!("empty bullet-public data"))?;
        let server = data
            .instance_servers
            .first()
            .ok_or_else(|| anyhow::anyhow!("no instance servers"))?;
        Ok(format!(
            "{}?token={}&connectId={}",
            server.endpoint,
            data.token,
            Uuid::new_v4().simple()
        ))
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
        let url = self.fetch_ws_endpoint().await?;
        info!(venue = VENUE.as_str(), "connecting");
        let (ws, _) = connect_async(&url).await.context("ws connect")?;
        let (mut write, mut read) = ws.split();

        for symbol in &self.symbols {
            let subscribe = json!({
                "id": Uuid::new_v4().simple().to_string(),
                "type": "subscribe",
                "topic": format!("/market/level2:{symbol}"),
                "privateChannel": false,
                "response": true,
            });
            write
                .send(Message::Text(subscribe.to_string()))
                .await
                .context("send subscribe")?;
        }
        *attempts = 0;
        let _ = self.events.send(BookEvent::Connected(VENUE)).await;
        self.notify_ready(Ok(()));

        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let frame = json!({
                        "id": Uuid::new_v4().simple().to_string(),
                        "type": "ping",
                    });
                    write
                        .send(Message::Text(frame.to_string()))
                        .await
                        .context("send ping")?;
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        anyhow::bail!("stream ended");
                    };
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
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let msg: StreamMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(venue = VENUE.as_str(), error = %e, "unparseable frame, skipping");
                return;
            }
        };
        // welcome / ack / pong frames carry no book data
        if msg.kind != "message" || msg.subject.as_deref() != Some("trade.l2update") {
            return;
        }
        let Some(update) = msg.data else { return };

        let emitted = {
            let mut books = self.books.write();
            let Some(book) = books.get_mut(&update.symbol) else {
                warn!(venue = VENUE.as_str(), symbol = %update.symbol, "update for unknown symbol");
                return;
            };
            let bids = levels_from_rows(&update.changes.bids);
            let asks = levels_from_rows(&update.changes.asks);
            match book.apply_deltas(&bids, &asks, update.time, update.sequence_end) {
                ApplyResult::Applied => Some(book.snapshot()),
                ApplyResult::Stale | ApplyResult::Rejected => None,
            }
        };
        if let Some(snap) = emitted {
            let _ = self.events.send(BookEvent::Book(snap)).await;
        }
    }
}

#[async_trait]
impl VenueClient for KucoinClient {
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
    fn test_parse_bullet_response() {
        let raw = r#"{"code":"200000","data":{
            "token":"abc123",
            "instanceServers":[{"endpoint":"wss://ws-api-spot.kucoin.com",
                "encrypt":true,"protocol":"websocket",
                "pingInterval":18000,"pingTimeout":10000}]}}"#;
        let bullet: BulletResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(bullet.code, "200000");
        let data = bullet.data.unwrap();
        assert_eq!(data.token, "abc123");
        assert_eq!(
            data.instance_servers[0].endpoint,
            "wss://ws-api-spot.kucoin.com"
        );
    }

    #[test]
    fn test_parse_l2_update() {
        let raw = r#"{"type":"message","topic":"/market/level2:BTC-USDT",
            "subject":"trade.l2update",
            "data":{"changes":{
                "asks":[["50001.0","0.3","18521289"]],
                "bids":[["50000.0","0","18521290"]]},
            "sequenceStart":18521289,"sequenceEnd":18521290,
            "symbol":"BTC-USDT","time":1700000000123}}"#;
        let msg: StreamMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "message");
        assert_eq!(msg.subject.as_deref(), Some("trade.l2update"));
        let data = msg.data.unwrap();
        assert_eq!(data.symbol, "BTC-USDT");
        assert_eq!(data.sequence_end, Some(18521290));
        assert_eq!(levels_from_rows(&data.changes.bids)[0].quantity, "0");
    }

    #[test]
    fn test_welcome_and_pong_frames_skipped() {
        let welcome = r#"{"id":"x","type":"welcome"}"#;
        let msg: StreamMessage = serde_json::from_str(welcome).unwrap();
        assert_eq!(msg.kind, "welcome");
        assert!(msg.data.is_none());

        let pong = r#"{"id":"y","type":"pong"}"#;
        let msg: StreamMessage = serde_json::from_str(pong).unwrap();
        assert_eq!(msg.kind, "pong");
    }

    #[test]
    fn test_parse_rest_level2() {
        let raw = r#"{"code":"200000","data":{
            "time":1700000000000,"sequence":"3262786978",
            "bids":[["50000.0","0.5"]],"asks":[["50001.0","0.7"]]}}"#;
        let body: RestLevel2 = serde_json::from_str(raw).unwrap();
        let data = body.data.unwrap();
        assert_eq!(data.sequence.as_deref(), Some("3262786978"));
        assert_eq!(levels_from_rows(&data.bids)[0].price, "50000.0");
    }
}
