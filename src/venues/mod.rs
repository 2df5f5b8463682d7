//! Venue clients: one streaming client per supported exchange.
//!
//! Every client implements the same state machine (prime a REST snapshot,
//! stream incremental updates, reconnect with capped backoff) and differs
//! only in wire framing. The shared pieces live here and in [`book`]: the
//! venue table, the client trait, the backoff schedule, and the tolerant
//! `[price, qty, ...]` row decoding used by the REST and WS payloads.

pub mod binance;
pub mod book;
pub mod bybit;
pub mod coinbase;
pub mod gemini;
pub mod kraken;
pub mod kucoin;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{OrderBook, PriceLevel, VenueDescriptor};

pub use book::{ApplyResult, LocalBook};

/// Consecutive connection failures before a client goes terminal.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Per-call timeout for REST priming fetches.
pub const REST_TIMEOUT: Duration = Duration::from_secs(5);

/// Supported venues. `Ord` by name keeps detector scan order stable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VenueId {
    Binance,
    Bybit,
    Coinbase,
    Gemini,
    Kraken,
    Kucoin,
}

impl VenueId {
    pub fn all() -> &'static [VenueId] {
        &[
            VenueId::Binance,
            VenueId::Bybit,
            VenueId::Coinbase,
            VenueId::Gemini,
            VenueId::Kraken,
            VenueId::Kucoin,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Binance => "binance",
            VenueId::Bybit => "bybit",
            VenueId::Coinbase => "coinbase",
            VenueId::Gemini => "gemini",
            VenueId::Kraken => "kraken",
            VenueId::Kucoin => "kucoin",
        }
    }

    pub fn parse(name: &str) -> Option<VenueId> {
        match name.trim().to_lowercase().as_str() {
            "binance" => Some(VenueId::Binance),
            "bybit" => Some(VenueId::Bybit),
            "coinbase" => Some(VenueId::Coinbase),
            "gemini" => Some(VenueId::Gemini),
            "kraken" => Some(VenueId::Kraken),
            "kucoin" => Some(VenueId::Kucoin),
            _ => None,
        }
    }

    /// Compiled endpoint and fee defaults. Real deployments override fees
    /// through configuration.
    pub fn descriptor(&self) -> VenueDescriptor {
        match self {
            VenueId::Binance => VenueDescriptor {
                id: *self,
                display_name: "Binance",
                ws_url: "wss://stream.binance.com:9443/ws",
                rest_url: "https://api.binance.com",
                taker_fee: 0.001,
                maker_fee: 0.001,
                rate_limit_per_min: 1200,
            },
            VenueId::Bybit => VenueDescriptor {
                id: *self,
                display_name: "Bybit",
                ws_url: "wss://stream.bybit.com/v5/public/spot",
                rest_url: "https://api.bybit.com",
                taker_fee: 0.001,
                maker_fee: 0.001,
                rate_limit_per_min: 600,
            },
            VenueId::Coinbase => VenueDescriptor {
                id: *self,
                display_name: "Coinbase",
                ws_url: "wss://ws-feed.exchange.coinbase.com",
                rest_url: "https://api.exchange.coinbase.com",
                taker_fee: 0.006,
                maker_fee: 0.004,
                rate_limit_per_min: 600,
            },
            VenueId::Gemini => VenueDescriptor {
                id: *self,
                display_name: "Gemini",
                ws_url: "wss://api.gemini.com",
                rest_url: "https://api.gemini.com",
                taker_fee: 0.0035,
                maker_fee: 0.0025,
                rate_limit_per_min: 600,
            },
            VenueId::Kraken => VenueDescriptor {
                id: *self,
                display_name: "Kraken",
                ws_url: "wss://ws.kraken.com",
                rest_url: "https://api.kraken.com",
                taker_fee: 0.0026,
                maker_fee: 0.0016,
                rate_limit_per_min: 60,
            },
            VenueId::Kucoin => VenueDescriptor {
                id: *self,
                display_name: "KuCoin",
                ws_url: "", // endpoint is handed out by the bullet bootstrap
                rest_url: "https://api.kucoin.com",
                taker_fee: 0.001,
                maker_fee: 0.001,
                rate_limit_per_min: 600,
            },
        }
    }

    /// Depth levels (K) maintained per side for this venue.
    pub fn book_depth(&self) -> usize {
        match self {
            VenueId::Binance => 100,
            VenueId::Bybit => 50,
            VenueId::Coinbase => 50,
            VenueId::Gemini => 50,
            VenueId::Kraken => 100,
            VenueId::Kucoin => 100,
        }
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by venue clients toward the manager's intake channel.
#[derive(Debug, Clone)]
pub enum BookEvent {
    Connected(VenueId),
    /// Emitted on every book mutation, with the full normalized book.
    Book(OrderBook),
    VenueError {
        venue: VenueId,
        detail: String,
        /// Reconnect budget exhausted; the client will not retry.
        terminal: bool,
    },
    Disconnected(VenueId),
}

/// Capability set every venue variant implements.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn venue(&self) -> VenueId;

    fn subscribed_symbols(&self) -> Vec<String>;

    /// Current local books, one per primed symbol.
    fn local_books(&self) -> Vec<OrderBook>;

    /// Prime REST snapshots, start the streaming task, and resolve once the
    /// first stream outcome settles: `Ok` after the socket is up, `Err`
    /// when the reconnect budget is exhausted without ever connecting.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Stop streaming, clear local books, emit `Disconnected`. Idempotent.
    async fn disconnect(&self);
}

/// Run the venue's pair discovery call, feeding the registry's
/// registered-pair overlay. Venues without a discovery endpoint resolve
/// purely by recipe and report zero pairs.
pub async fn discover_pairs(
    venue: VenueId,
    http: &reqwest::Client,
    registry: &crate::symbols::SymbolRegistry,
) -> anyhow::Result<usize> {
    match venue {
        VenueId::Binance => binance::discover_pairs(http, registry).await,
        _ => Ok(0),
    }
}

/// Construct the client variant for `venue` over `symbols` (native
/// spellings), emitting into `events`.
pub fn build_client(
    venue: VenueId,
    symbols: Vec<String>,
    events: mpsc::Sender<BookEvent>,
) -> Arc<dyn VenueClient> {
    match venue {
        VenueId::Binance => Arc::new(binance::BinanceClient::new(symbols, events)),
        VenueId::Bybit => Arc::new(bybit::BybitClient::new(symbols, events)),
        VenueId::Coinbase => Arc::new(coinbase::CoinbaseClient::new(symbols, events)),
        VenueId::Gemini => Arc::new(gemini::GeminiClient::new(symbols, events)),
        VenueId::Kraken => Arc::new(kraken::KrakenClient::new(symbols, events)),
        VenueId::Kucoin => Arc::new(kucoin::KucoinClient::new(symbols, events)),
    }
}

/// Backoff before reconnect attempt `attempt` (1-based):
/// `min(2^attempt * 1s, 30s)`.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempt.min(10))
        .unwrap_or(u64::MAX)
        .min(30);
    Duration::from_secs(secs)
}

/// Decode a `[price, qty, ...]` row where entries may be JSON strings or
/// numbers and trailing elements (order counts, timestamps) are ignored.
pub(crate) fn level_from_row(row: &[serde_json::Value]) -> Option<PriceLevel> {
    let price = decimal_string(row.first()?)?;
    let quantity = decimal_string(row.get(1)?)?;
    Some(PriceLevel { price, quantity })
}

pub(crate) fn levels_from_rows(rows: &[Vec<serde_json::Value>]) -> Vec<PriceLevel> {
    rows.iter()
        .filter_map(|row| level_from_row(row))
        .collect()
}

fn decimal_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
