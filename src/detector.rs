//! Opportunity detector: turns book updates into qualifying two-leg
//! opportunities.
//!
//! The detector owns a latest-book-by-key map fed from the manager's intake
//! path (single writer, no locks), throttles full scans to one per tick
//! interval, and evaluates every venue pair in both directions per canonical
//! symbol. Scan order is symbols ascending, then venue pairs ascending, so
//! identical input snapshots emit in a stable order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::models::{now_ms, ArbitrageOpportunity, OrderBook};
use crate::sink::OpportunitySink;
use crate::symbols::SymbolRegistry;
use crate::venues::VenueId;

/// Taker rate assumed for venues missing from the fee schedule.
const DEFAULT_TAKER_FEE: f64 = 0.001;

/// Detector tunables; the profit threshold and trade size follow config
/// updates at runtime.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Minimum net profit percent to qualify.
    pub min_profit_percent: f64,
    /// Added on top of the minimum to absorb slippage, in percent.
    pub slippage_buffer: f64,
    /// Books older than this are excluded from evaluation.
    pub max_spread_age_ms: i64,
    /// Minimum interval between full scans. Zero disables the throttle.
    pub tick_interval_ms: u64,
    /// USD notional per evaluated trade.
    pub trade_amount_usd: f64,
    /// Rolling bound on sink rows.
    pub retention_count: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            min_profit_percent: 0.1,
            slippage_buffer: 0.1,
            max_spread_age_ms: 5_000,
            tick_interval_ms: 1_000,
            trade_amount_usd: 1_000.0,
            retention_count: 1_000,
        }
    }
}

pub struct OpportunityDetector {
    settings: DetectorSettings,
    /// Fractional taker rates per venue.
    fees: HashMap<VenueId, f64>,
    /// Latest book per `(venue, native symbol)`, intake-path only.
    books: HashMap<(VenueId, String), OrderBook>,
    registry: Arc<SymbolRegistry>,
    sink: Arc<OpportunitySink>,
    last_tick: Option<Instant>,
}

impl OpportunityDetector {
    pub fn new(
        registry: Arc<SymbolRegistry>,
        sink: Arc<OpportunitySink>,
        settings: DetectorSettings,
    ) -> Self {
        let fees = VenueId::all()
            .iter()
            .map(|&v| (v, v.descriptor().taker_fee))
            .collect();
        Self {
            settings,
            fees,
            books: HashMap::new(),
            registry,
            sink,
            last_tick: None,
        }
    }

    /// Override the taker rate for one venue.
    pub fn set_taker_fee(&mut self, venue: VenueId, rate: f64) {
        self.fees.insert(venue, rate);
    }

    /// Applied on every config update without a restart.
    pub fn set_tunables(&mut self, min_profit_percent: f64, trade_amount_usd: f64) {
        self.settings.min_profit_percent = min_profit_percent;
        self.settings.trade_amount_usd = trade_amount_usd;
        info!(
            min_profit_percent,
            trade_amount_usd, "detector tunables updated"
        );
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Forget all books (venue set changed).
    pub fn clear_books(&mut self) {
        self.books.clear();
    }

    /// Book intake: update the slot, then run a scan unless the throttle
    /// says the last one was too recent. Returns opportunities found.
    pub fn on_book(&mut self, book: OrderBook) -> Vec<ArbitrageOpportunity> {
        self.books
            .insert((book.venue, book.symbol.clone()), book);

        if self.settings.tick_interval_ms > 0 {
            if let Some(last) = self.last_tick {
                if (last.elapsed().as_millis() as u64) < self.settings.tick_interval_ms {
                    return Vec::new();
                }
            }
        }
        self.last_tick = Some(Instant::now());
        self.scan()
    }

    /// Evaluate all canonical symbols with at least two fresh books.
    pub fn scan(&mut self) -> Vec<ArbitrageOpportunity> {
        let now = now_ms();

        // Group fresh books by canonical symbol; BTreeMap + venue sort give
        // the deterministic emission order.
        let mut by_canonical: BTreeMap<String, Vec<&OrderBook>> = BTreeMap::new();
        for ((venue, symbol), book) in &self.books {
            // age_ms clamps future-dated books to zero: clock skew ahead of
            // us never excludes a book.
            if book.age_ms(now) > self.settings.max_spread_age_ms {
                continue;
            }
            let Some(canonical) = self.registry.canonicalize(*venue, symbol) else {
                debug!(venue = venue.as_str(), symbol = %symbol, "unmapped symbol skipped");
                continue;
            };
            by_canonical.entry(canonical).or_default().push(book);
        }

        let mut found = Vec::new();
        for (canonical, mut books) in by_canonical {
            if books.len() < 2 {
                continue;
            }
            books.sort_by_key(|b| b.venue);
            for i in 0..books.len() {
                for j in (i + 1)..books.len() {
                    // Both directions of the unordered pair, independently.
                    if let Some(opp) = self.evaluate(books[i], books[j], &canonical) {
                        found.push(opp);
                    }
                    if let Some(opp) = self.evaluate(books[j], books[i], &canonical) {
                        found.push(opp);
                    }
                }
            }
        }

        for opp in &found {
            self.persist(opp);
        }
        found
    }

    /// One direction: buy at `buy_side`'s best ask, sell at `sell_side`'s
    /// best bid, USD-denominated quantity model.
    fn evaluate(
        &self,
        buy_side: &OrderBook,
        sell_side: &OrderBook,
        canonical: &str,
    ) -> Option<ArbitrageOpportunity> {
        let ask = buy_side.best_ask()?;
        let bid = sell_side.best_bid()?;
        let buy_price = ask.price_f64()?;
        let sell_price = bid.price_f64()?;
        if buy_price <= 0.0 {
            return None;
        }

        let trade_amount = self.settings.trade_amount_usd;
        let qty = trade_amount / buy_price;
        let buy_value = trade_amount;
        let sell_value = sell_price * qty;

        let buy_fee = buy_value * self.taker(buy_side.venue);
        let sell_fee = sell_value * self.taker(sell_side.venue);
        let total_fee = buy_fee + sell_fee;

        let gross = sell_value - buy_value;
        let net = gross - total_fee;
        let profit_percent = (net / buy_value) * 100.0;

        let threshold = self.settings.min_profit_percent + self.settings.slippage_buffer;
        if profit_percent < threshold {
            return None;
        }

        Some(ArbitrageOpportunity {
            id: fresh_id(),
            canonical_symbol: canonical.to_string(),
            buy_venue: buy_side.venue,
            sell_venue: sell_side.venue,
            buy_price,
            sell_price,
            gross_spread: gross,
            spread_percent: profit_percent,
            estimated_net_profit: net,
            buy_fee,
            sell_fee,
            total_fee,
            detected_at: now_ms(),
        })
    }

    #[inline]
    fn taker(&self, venue: VenueId) -> f64 {
        self.fees.get(&venue).copied().unwrap_or(DEFAULT_TAKER_FEE)
    }

    /// Sink write plus retention; failures are logged, the opportunity is
    /// still emitted in-process by the caller.
    fn persist(&self, opp: &ArbitrageOpportunity) {
        if let Err(e) = self.sink.append(opp) {
            warn!(id = %opp.id, error = %e, "opportunity append failed");
            return;
        }
        if let Err(e) = self.sink.prune_to(self.settings.retention_count) {
            warn!(error = %e, "retention prune failed");
        }
    }
}

fn fresh_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("opp_{}_{}", now_ms(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceLevel;

    fn test_detector(slippage: f64) -> OpportunityDetector {
        let settings = DetectorSettings {
            slippage_buffer: slippage,
            tick_interval_ms: 0, // no throttle in unit tests
            ..DetectorSettings::default()
        };
        OpportunityDetector::new(
            SymbolRegistry::shared(),
            Arc::new(OpportunitySink::new(":memory:").unwrap()),
            settings,
        )
    }

    fn book(
        venue: VenueId,
        symbol: &str,
        bid: Option<(&str, &str)>,
        ask: Option<(&str, &str)>,
        timestamp_ms: i64,
    ) -> OrderBook {
        OrderBook {
            venue,
            symbol: symbol.to_string(),
            bids: bid.map(|(p, q)| vec![PriceLevel::new(p, q)]).unwrap_or_default(),
            asks: ask.map(|(p, q)| vec![PriceLevel::new(p, q)]).unwrap_or_default(),
            timestamp_ms,
            last_seq: None,
        }
    }

    #[test]
    fn test_qualifying_spread_both_numbers_and_direction() {
        // binance BTCUSDT ask 10000, coinbase BTC-USD bid 10200, $1000
        // trade, fees 0.1% / 0.6%: net 12.88, profit 1.288%.
        let mut detector = test_detector(0.0);
        let now = now_ms();
        detector.on_book(book(
            VenueId::Binance,
            "BTCUSDT",
            Some(("9999", "1")),
            Some(("10000", "1")),
            now,
        ));
        let opps = detector.on_book(book(
            VenueId::Coinbase,
            "BTC-USD",
            Some(("10200", "1")),
            Some(("10201", "1")),
            now,
        ));

        assert_eq!(opps.len(), 1, "reverse direction must not qualify");
        let opp = &opps[0];
        assert_eq!(opp.canonical_symbol, "BTCUSD");
        assert_eq!(opp.buy_venue, VenueId::Binance);
        assert_eq!(opp.sell_venue, VenueId::Coinbase);
        assert_eq!(opp.buy_price, 10000.0);
        assert_eq!(opp.sell_price, 10200.0);
        assert!((opp.gross_spread - 20.0).abs() < 1e-9);
        assert!((opp.buy_fee - 1.0).abs() < 1e-9);
        assert!((opp.sell_fee - 6.12).abs() < 1e-9);
        assert!((opp.total_fee - 7.12).abs() < 1e-9);
        assert!((opp.estimated_net_profit - 12.88).abs() < 1e-9);
        assert!((opp.spread_percent - 1.288).abs() < 1e-9);
        assert!(opp.id.starts_with("opp_"));

        // Persisted too.
        assert_eq!(detector.sink.count().unwrap(), 1);
    }

    #[test]
    fn test_stale_book_excluded() {
        let mut detector = test_detector(0.0);
        let now = now_ms();
        detector.on_book(book(
            VenueId::Binance,
            "BTCUSDT",
            Some(("9999", "1")),
            Some(("10000", "1")),
            now - 6_000, // beyond the 5 s freshness window
        ));
        let opps = detector.on_book(book(
            VenueId::Coinbase,
            "BTC-USD",
            Some(("10200", "1")),
            Some(("10201", "1")),
            now,
        ));
        assert!(opps.is_empty());
    }

    #[test]
    fn test_future_dated_book_is_fresh() {
        let mut detector = test_detector(0.0);
        let now = now_ms();
        detector.on_book(book(
            VenueId::Binance,
            "BTCUSDT",
            Some(("9999", "1")),
            Some(("10000", "1")),
            now + 2_000, // clock skew ahead of us
        ));
        let opps = detector.on_book(book(
            VenueId::Coinbase,
            "BTC-USD",
            Some(("10200", "1")),
            Some(("10201", "1")),
            now,
        ));
        assert_eq!(opps.len(), 1);
    }

    #[test]
    fn test_exact_threshold_qualifies() {
        // Zero-fee venues, threshold 0.1% + 0 slippage. Ask 10000 and bid
        // 10010 give exactly 0.1% net.
        let mut detector = test_detector(0.0);
        detector.set_taker_fee(VenueId::Binance, 0.0);
        detector.set_taker_fee(VenueId::Coinbase, 0.0);
        let now = now_ms();
        detector.on_book(book(
            VenueId::Binance,
            "BTCUSDT",
            None,
            Some(("10000", "1")),
            now,
        ));
        let opps = detector.on_book(book(
            VenueId::Coinbase,
            "BTC-USD",
            Some(("10010", "1")),
            None,
            now,
        ));
        assert_eq!(opps.len(), 1);
        assert!((opps[0].spread_percent - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_empty_side_no_emission() {
        let mut detector = test_detector(0.0);
        let now = now_ms();
        // Binance has no asks: buying there is impossible, and coinbase has
        // no bids either, so neither direction evaluates.
        detector.on_book(book(VenueId::Binance, "BTCUSDT", Some(("9999", "1")), None, now));
        let opps = detector.on_book(book(
            VenueId::Coinbase,
            "BTC-USD",
            None,
            Some(("10201", "1")),
            now,
        ));
        assert!(opps.is_empty());
    }

    #[test]
    fn test_single_venue_never_emits() {
        let mut detector = test_detector(0.0);
        let now = now_ms();
        let opps = detector.on_book(book(
            VenueId::Binance,
            "BTCUSDT",
            Some(("9000", "1")),
            Some(("10000", "1")),
            now,
        ));
        assert!(opps.is_empty());
    }

    #[test]
    fn test_slippage_buffer_raises_threshold() {
        // 1.288% profit fails a 1.3% combined threshold.
        let mut detector = test_detector(1.2); // + 0.1 min = 1.3
        let now = now_ms();
        detector.on_book(book(
            VenueId::Binance,
            "BTCUSDT",
            None,
            Some(("10000", "1")),
            now,
        ));
        let opps = detector.on_book(book(
            VenueId::Coinbase,
            "BTC-USD",
            Some(("10200", "1")),
            None,
            now,
        ));
        assert!(opps.is_empty());
    }

    #[test]
    fn test_tick_throttle_defers_scan() {
        let settings = DetectorSettings {
            slippage_buffer: 0.0,
            tick_interval_ms: 60_000,
            ..DetectorSettings::default()
        };
        let mut detector = OpportunityDetector::new(
            SymbolRegistry::shared(),
            Arc::new(OpportunitySink::new(":memory:").unwrap()),
            settings,
        );
        let now = now_ms();
        // First intake scans (one book only, nothing found) and arms the
        // throttle; the second intake inside the window must not scan.
        detector.on_book(book(
            VenueId::Binance,
            "BTCUSDT",
            None,
            Some(("10000", "1")),
            now,
        ));
        let opps = detector.on_book(book(
            VenueId::Coinbase,
            "BTC-USD",
            Some(("10200", "1")),
            None,
            now,
        ));
        assert!(opps.is_empty());

        // A direct scan sees the qualifying pair.
        assert_eq!(detector.scan().len(), 1);
    }

    #[test]
    fn test_deterministic_scan_order() {
        let mut detector = test_detector(0.0);
        detector.set_taker_fee(VenueId::Binance, 0.0);
        detector.set_taker_fee(VenueId::Coinbase, 0.0);
        detector.set_taker_fee(VenueId::Kraken, 0.0);
        let now = now_ms();

        // Kraken trades richest, Binance cheapest, so every cheap-to-rich
        // direction qualifies with zero fees.
        for (venue, eth, btc, shift) in [
            (VenueId::Kraken, "ETH/USD", "XBT/USD", 200.0),
            (VenueId::Coinbase, "ETH-USD", "BTC-USD", 100.0),
            (VenueId::Binance, "ETHUSDT", "BTCUSDT", 0.0),
        ] {
            let (bid, ask) = (10_000.0 + shift, 10_005.0 + shift);
            detector.on_book(book(
                venue,
                btc,
                Some((&bid.to_string(), "1")),
                Some((&ask.to_string(), "1")),
                now,
            ));
            let (bid, ask) = (2_000.0 + shift, 2_001.0 + shift);
            detector.on_book(book(
                venue,
                eth,
                Some((&bid.to_string(), "1")),
                Some((&ask.to_string(), "1")),
                now,
            ));
        }

        let opps = detector.scan();
        assert!(opps.len() >= 4);
        // Symbols ascending: all BTCUSD emissions precede ETHUSD ones.
        let first_eth = opps
            .iter()
            .position(|o| o.canonical_symbol == "ETHUSD")
            .unwrap();
        assert!(opps[..first_eth]
            .iter()
            .all(|o| o.canonical_symbol == "BTCUSD"));
        // Within a symbol, venue pairs ascend by id: (binance, coinbase),
        // (binance, kraken), (coinbase, kraken), profitable leg buying the
        // cheaper venue each time.
        let btc: Vec<_> = opps
            .iter()
            .filter(|o| o.canonical_symbol == "BTCUSD")
            .collect();
        assert_eq!(btc.len(), 3);
        assert_eq!(
            (btc[0].buy_venue, btc[0].sell_venue),
            (VenueId::Binance, VenueId::Coinbase)
        );
        assert_eq!(
            (btc[1].buy_venue, btc[1].sell_venue),
            (VenueId::Binance, VenueId::Kraken)
        );
        assert_eq!(
            (btc[2].buy_venue, btc[2].sell_venue),
            (VenueId::Coinbase, VenueId::Kraken)
        );
    }
}
