//! Shared data model: price levels, normalized order books, runtime
//! configuration and status, and detected opportunities.
//!
//! Prices and quantities are carried as exact decimal strings end to end and
//! parsed to `f64` only at comparison/output time, so venue precision is
//! never rounded away inside the pipeline.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::venues::VenueId;

/// Current wall-clock time in UTC milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A single `(price, quantity)` entry on one side of a book.
///
/// Quantity `"0"` is the wire signal for "remove this level".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: String,
    pub quantity: String,
}

impl PriceLevel {
    pub fn new(price: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self {
            price: price.into(),
            quantity: quantity.into(),
        }
    }

    #[inline]
    pub fn price_f64(&self) -> Option<f64> {
        self.price.trim().parse::<f64>().ok().filter(|p| p.is_finite())
    }

    #[inline]
    pub fn quantity_f64(&self) -> Option<f64> {
        self.quantity.trim().parse::<f64>().ok().filter(|q| q.is_finite())
    }
}

/// A locally reconstructed order book for one `(venue, native symbol)`.
///
/// Invariants on every emitted book: bids strictly descending by price, asks
/// strictly ascending, prices unique per side, each side at most K levels
/// (K per venue), no zero-quantity entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub venue: VenueId,
    /// Native symbol spelling (the venue's own, e.g. `BTC-USD`).
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Last update time, UTC milliseconds.
    pub timestamp_ms: i64,
    /// Monotonic update id, for venues that expose one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Best bid at or above best ask within the same snapshot.
    pub fn is_crossed(&self) -> bool {
        match (
            self.bids.first().and_then(PriceLevel::price_f64),
            self.asks.first().and_then(PriceLevel::price_f64),
        ) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Age relative to `now`, in milliseconds. Future-dated books report 0.
    pub fn age_ms(&self, now: i64) -> i64 {
        (now - self.timestamp_ms).max(0)
    }

    pub fn mid_price(&self) -> Option<f64> {
        let bid = self.bids.first().and_then(PriceLevel::price_f64)?;
        let ask = self.asks.first().and_then(PriceLevel::price_f64)?;
        Some((bid + ask) * 0.5)
    }

    /// Top-of-book spread in basis points of mid.
    pub fn spread_bps(&self) -> Option<f64> {
        let bid = self.bids.first().and_then(PriceLevel::price_f64)?;
        let ask = self.asks.first().and_then(PriceLevel::price_f64)?;
        let mid = (bid + ask) * 0.5;
        if mid <= 0.0 {
            return None;
        }
        Some((ask - bid) / mid * 10_000.0)
    }
}

/// Static description of a venue's public endpoints and fee schedule.
#[derive(Debug, Clone, Serialize)]
pub struct VenueDescriptor {
    pub id: VenueId,
    pub display_name: &'static str,
    pub ws_url: &'static str,
    pub rest_url: &'static str,
    /// Fractional taker rate (0.001 = 10 bps).
    pub taker_fee: f64,
    pub maker_fee: f64,
    pub rate_limit_per_min: u32,
}

/// A venue-listed trading pair, as returned by a discovery call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPair {
    pub native_symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub canonical_symbol: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_order_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_size: Option<f64>,
}

/// Authoritative runtime configuration, stored at `bot:config` and broadcast
/// on `bot:config:update` as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    /// Enabled venue ids, by lowercase name.
    pub exchanges: Vec<String>,
    /// Canonical symbols to monitor, e.g. `BTCUSD`.
    pub symbols: Vec<String>,
    pub min_profit_percent: f64,
    #[serde(rename = "tradeAmount")]
    pub trade_amount_usd: f64,
    pub is_active: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            exchanges: vec![
                "binance".to_string(),
                "coinbase".to_string(),
                "kraken".to_string(),
            ],
            symbols: vec!["BTCUSD".to_string(), "ETHUSD".to_string()],
            min_profit_percent: 0.1,
            trade_amount_usd: 1000.0,
            is_active: true,
        }
    }
}

impl BotConfig {
    /// Order-insensitive comparison of the venue set.
    pub fn same_exchanges(&self, other: &Self) -> bool {
        let mut a = self.exchanges.clone();
        let mut b = other.exchanges.clone();
        a.sort();
        b.sort();
        a == b
    }

    /// Order-insensitive comparison of the symbol set.
    pub fn same_symbols(&self, other: &Self) -> bool {
        let mut a = self.symbols.clone();
        let mut b = other.symbols.clone();
        a.sort();
        b.sort();
        a == b
    }
}

/// Published at `bot:status`, refreshed every 10 s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotStatus {
    pub is_running: bool,
    pub connected_exchanges: Vec<String>,
    /// Unix ms the current run started.
    pub uptime: i64,
    pub config: BotConfig,
}

/// A qualifying two-leg opportunity: buy on `buy_venue`, sell on
/// `sell_venue`, same canonical symbol, evaluated within one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrageOpportunity {
    pub id: String,
    pub canonical_symbol: String,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub buy_price: f64,
    pub sell_price: f64,
    /// `sell_value - buy_value` in USD, before fees.
    pub gross_spread: f64,
    /// Net profit percent of buy value; the qualification metric.
    pub spread_percent: f64,
    pub estimated_net_profit: f64,
    pub buy_fee: f64,
    pub sell_fee: f64,
    pub total_fee: f64,
    /// Unix ms at detection.
    pub detected_at: i64,
}
