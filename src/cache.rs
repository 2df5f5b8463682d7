//! Redis adapter: short-TTL order-book cache, config/status keys, and the
//! config pub/sub topic.
//!
//! Two connections are held: a `ConnectionManager` for reads/writes (it
//! reconnects on its own) and a dedicated pub/sub connection created per
//! subscription. The store is the source of truth for config; the manager
//! only applies config through messages on the topic.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::models::{BotConfig, BotStatus, OrderBook};
use crate::venues::VenueId;

/// Key holding the authoritative `BotConfig` JSON.
pub const CONFIG_KEY: &str = "bot:config";
/// Key holding the latest `BotStatus` JSON.
pub const STATUS_KEY: &str = "bot:status";
/// Topic broadcasting full `BotConfig` replacements.
pub const CONFIG_CHANNEL: &str = "bot:config:update";

/// Seconds an `orderbook:*` entry stays readable after its last write.
pub const BOOK_TTL_SECS: u64 = 10;

fn book_key(venue: VenueId, symbol: &str) -> String {
    format!("orderbook:{}:{}", venue.as_str(), symbol)
}

/// Shared handle to the key/value + pub/sub store.
#[derive(Clone)]
pub struct StoreClient {
    client: redis::Client,
    conn: ConnectionManager,
}

impl StoreClient {
    /// Connect to the store. Failure here is fatal to startup.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!(url = %redis_url, "connecting to config store");
        let client = redis::Client::open(redis_url).context("redis url")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("redis connection manager")?;
        Ok(Self { client, conn })
    }

    /// Open the dedicated subscriber connection for `bot:config:update`.
    pub async fn config_subscriber(&self) -> Result<redis::aio::PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("redis pubsub connection")?;
        pubsub
            .subscribe(CONFIG_CHANNEL)
            .await
            .context("subscribe config channel")?;
        Ok(pubsub)
    }

    /// Cache a book under `orderbook:<venue>:<native>` with the short TTL,
    /// so a silently dead client cannot serve stale data to direct readers.
    pub async fn put_book(&self, book: &OrderBook) -> Result<()> {
        let key = book_key(book.venue, &book.symbol);
        let payload = serde_json::to_string(book)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(&key, payload, BOOK_TTL_SECS)
            .await
            .with_context(|| format!("SETEX {key}"))?;
        Ok(())
    }

    /// Cached book, or `None` on miss/expiry ("unknown" to readers).
    pub async fn get_book(&self, venue: VenueId, symbol: &str) -> Result<Option<OrderBook>> {
        let key = book_key(venue, symbol);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await.with_context(|| format!("GET {key}"))?;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(book) => Ok(Some(book)),
                Err(e) => {
                    warn!(key = %key, error = %e, "malformed cached book, treating as miss");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Current config snapshot, or `None` when the key is absent.
    pub async fn read_config(&self) -> Result<Option<BotConfig>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(CONFIG_KEY).await.context("GET bot:config")?;
        match raw {
            Some(raw) => {
                let config = serde_json::from_str(&raw).context("parse bot:config")?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// Admin write path: persist the snapshot. The running manager picks it
    /// up only through [`publish_config`](Self::publish_config).
    pub async fn write_config(&self, config: &BotConfig) -> Result<()> {
        let payload = serde_json::to_string(config)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(CONFIG_KEY, payload)
            .await
            .context("SET bot:config")?;
        Ok(())
    }

    /// Broadcast a full config replacement on the update topic.
    pub async fn publish_config(&self, config: &BotConfig) -> Result<()> {
        let payload = serde_json::to_string(config)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(CONFIG_CHANNEL, payload)
            .await
            .context("PUBLISH bot:config:update")?;
        debug!(receivers, "config update published");
        Ok(())
    }

    pub async fn write_status(&self, status: &BotStatus) -> Result<()> {
        let payload = serde_json::to_string(status)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(STATUS_KEY, payload)
            .await
            .context("SET bot:status")?;
        Ok(())
    }
}
