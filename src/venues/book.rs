//! Local order-book reconstruction shared by all venue clients.
//!
//! The side-update rule: for every incoming `(price, quantity)` the existing
//! entry at that price is removed, the new entry inserted when quantity
//! parses above zero, the side re-sorted (bids descending, asks ascending)
//! and truncated to the venue's depth. Snapshot messages replace a side
//! wholesale. Venues with a monotonic update id get stale updates skipped.

use tracing::warn;

use crate::models::{now_ms, OrderBook, PriceLevel};

use super::VenueId;

/// Outcome of applying a message to a [`LocalBook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Applied,
    /// Monotonic id at or below the book's current id; book unchanged.
    Stale,
    /// The update left the book crossed even after a recompute; reverted.
    Rejected,
}

/// Reconstructed depth for one `(venue, native symbol)`.
#[derive(Debug, Clone)]
pub struct LocalBook {
    venue: VenueId,
    symbol: String,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    max_depth: usize,
    last_seq: Option<u64>,
    timestamp_ms: i64,
}

impl LocalBook {
    pub fn new(venue: VenueId, symbol: impl Into<String>) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            max_depth: venue.book_depth(),
            last_seq: None,
            timestamp_ms: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Replace both sides wholesale from a snapshot.
    pub fn apply_snapshot(
        &mut self,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp_ms: Option<i64>,
        seq: Option<u64>,
    ) -> ApplyResult {
        self.bids = bids;
        self.asks = asks;
        normalize_side(&mut self.bids, true, self.max_depth);
        normalize_side(&mut self.asks, false, self.max_depth);
        self.timestamp_ms = timestamp_ms.unwrap_or_else(now_ms);
        if seq.is_some() {
            self.last_seq = seq;
        }
        if self.crossed() {
            warn!(
                venue = self.venue.as_str(),
                symbol = %self.symbol,
                "snapshot is crossed after normalization, clearing book"
            );
            self.bids.clear();
            self.asks.clear();
            return ApplyResult::Rejected;
        }
        ApplyResult::Applied
    }

    /// Apply incremental `(price, quantity)` changes to both sides.
    ///
    /// `final_seq` is the update's final monotonic id for venues that expose
    /// one; updates whose id is at or below the book's current id are
    /// skipped. `timestamp_ms` falls back to wall clock when the message
    /// carries no event time.
    pub fn apply_deltas(
        &mut self,
        bid_changes: &[PriceLevel],
        ask_changes: &[PriceLevel],
        timestamp_ms: Option<i64>,
        final_seq: Option<u64>,
    ) -> ApplyResult {
        if let (Some(incoming), Some(current)) = (final_seq, self.last_seq) {
            if incoming <= current {
                return ApplyResult::Stale;
            }
        }

        let prev_bids = self.bids.clone();
        let prev_asks = self.asks.clone();

        for level in bid_changes {
            update_side(&mut self.bids, level);
        }
        for level in ask_changes {
            update_side(&mut self.asks, level);
        }
        normalize_side(&mut self.bids, true, self.max_depth);
        normalize_side(&mut self.asks, false, self.max_depth);

        if self.crossed() {
            // Recompute from the stored entries before giving up.
            normalize_side(&mut self.bids, true, self.max_depth);
            normalize_side(&mut self.asks, false, self.max_depth);
            if self.crossed() {
                warn!(
                    venue = self.venue.as_str(),
                    symbol = %self.symbol,
                    "update left book crossed, discarding"
                );
                self.bids = prev_bids;
                self.asks = prev_asks;
                return ApplyResult::Rejected;
            }
        }

        if let Some(seq) = final_seq {
            self.last_seq = Some(seq);
        }
        self.timestamp_ms = timestamp_ms.unwrap_or_else(now_ms);
        ApplyResult::Applied
    }

    /// Replace only the top of book, keeping the primed depth below it.
    /// Used by venues whose public stream is ticker-only (Coinbase).
    pub fn apply_top_of_book(
        &mut self,
        best_bid: Option<PriceLevel>,
        best_ask: Option<PriceLevel>,
        timestamp_ms: Option<i64>,
    ) -> ApplyResult {
        let prev_bids = self.bids.clone();
        let prev_asks = self.asks.clone();

        if let Some(bid) = best_bid {
            if let Some(price) = bid.price_f64() {
                // Drop stale levels at or above the new best bid.
                self.bids
                    .retain(|l| l.price_f64().map_or(false, |p| p < price));
                update_side(&mut self.bids, &bid);
            }
        }
        if let Some(ask) = best_ask {
            if let Some(price) = ask.price_f64() {
                self.asks
                    .retain(|l| l.price_f64().map_or(false, |p| p > price));
                update_side(&mut self.asks, &ask);
            }
        }
        normalize_side(&mut self.bids, true, self.max_depth);
        normalize_side(&mut self.asks, false, self.max_depth);

        if self.crossed() {
            warn!(
                venue = self.venue.as_str(),
                symbol = %self.symbol,
                "ticker left book crossed, discarding"
            );
            self.bids = prev_bids;
            self.asks = prev_asks;
            return ApplyResult::Rejected;
        }
        self.timestamp_ms = timestamp_ms.unwrap_or_else(now_ms);
        ApplyResult::Applied
    }

    fn crossed(&self) -> bool {
        match (
            self.bids.first().and_then(PriceLevel::price_f64),
            self.asks.first().and_then(PriceLevel::price_f64),
        ) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Normalized wire snapshot of the current state.
    pub fn snapshot(&self) -> OrderBook {
        OrderBook {
            venue: self.venue,
            symbol: self.symbol.clone(),
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            timestamp_ms: self.timestamp_ms,
            last_seq: self.last_seq,
        }
    }
}

/// Remove any existing entry at the level's price, then insert when the
/// quantity parses above zero.
fn update_side(side: &mut Vec<PriceLevel>, level: &PriceLevel) {
    let Some(price) = level.price_f64() else {
        return;
    };
    side.retain(|l| l.price_f64() != Some(price));
    match level.quantity_f64() {
        Some(qty) if qty > 0.0 => side.push(level.clone()),
        _ => {}
    }
}

/// Sort (bids descending, asks ascending), drop unparseable and
/// zero-quantity entries, dedup by price, truncate to `depth`.
fn normalize_side(side: &mut Vec<PriceLevel>, descending: bool, depth: usize) {
    side.retain(|l| {
        l.price_f64().is_some() && l.quantity_f64().map_or(false, |q| q > 0.0)
    });
    side.sort_by(|a, b| {
        let pa = a.price_f64().unwrap_or(0.0);
        let pb = b.price_f64().unwrap_or(0.0);
        if descending {
            pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
        } else {
            pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
        }
    });
    side.dedup_by(|a, b| a.price_f64() == b.price_f64());
    side.truncate(depth);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(p: &str, q: &str) -> PriceLevel {
        PriceLevel::new(p, q)
    }

    fn primed_book() -> LocalBook {
        let mut book = LocalBook::new(VenueId::Binance, "BTCUSDT");
        book.apply_snapshot(
            vec![level("100", "1"), level("99", "2"), level("98", "3")],
            vec![level("101", "1"), level("102", "2"), level("103", "3")],
            Some(1_000),
            Some(10),
        );
        book
    }

    fn side_prices(levels: &[PriceLevel]) -> Vec<f64> {
        levels.iter().filter_map(PriceLevel::price_f64).collect()
    }

    #[test]
    fn test_snapshot_sorts_and_dedups() {
        let mut book = LocalBook::new(VenueId::Binance, "BTCUSDT");
        book.apply_snapshot(
            vec![level("99", "2"), level("100", "1"), level("99", "9"), level("97", "0")],
            vec![level("103", "1"), level("101", "2")],
            Some(1_000),
            None,
        );
        let snap = book.snapshot();
        assert_eq!(side_prices(&snap.bids), vec![100.0, 99.0]);
        assert_eq!(side_prices(&snap.asks), vec![101.0, 103.0]);
        assert_eq!(snap.timestamp_ms, 1_000);
    }

    #[test]
    fn test_side_update_insert_replace_remove() {
        let mut book = primed_book();

        // Insert a new bid level between existing prices.
        book.apply_deltas(&[level("99.5", "4")], &[], Some(2_000), Some(11));
        assert_eq!(
            side_prices(&book.snapshot().bids),
            vec![100.0, 99.5, 99.0, 98.0]
        );

        // Replace quantity at an existing price: no duplicate entry.
        book.apply_deltas(&[level("99.5", "7")], &[], Some(3_000), Some(12));
        let snap = book.snapshot();
        assert_eq!(side_prices(&snap.bids), vec![100.0, 99.5, 99.0, 98.0]);
        assert_eq!(snap.bids[1].quantity, "7");

        // Zero quantity removes the level.
        book.apply_deltas(&[level("99.5", "0")], &[], Some(4_000), Some(13));
        assert_eq!(side_prices(&book.snapshot().bids), vec![100.0, 99.0, 98.0]);
    }

    #[test]
    fn test_delta_idempotence() {
        // Applying the same (un-sequenced) change twice equals applying once.
        let mut once = primed_book();
        let mut twice = primed_book();
        let changes = [level("99", "5"), level("97", "1")];
        once.apply_deltas(&changes, &[], Some(2_000), None);
        twice.apply_deltas(&changes, &[], Some(2_000), None);
        twice.apply_deltas(&changes, &[], Some(2_000), None);
        assert_eq!(once.snapshot().bids, twice.snapshot().bids);
        assert_eq!(once.snapshot().asks, twice.snapshot().asks);
    }

    #[test]
    fn test_stale_sequence_skipped() {
        let mut book = primed_book();
        let before = book.snapshot();

        // Equal and lower ids leave the book untouched.
        assert_eq!(
            book.apply_deltas(&[level("100", "9")], &[], Some(2_000), Some(10)),
            ApplyResult::Stale
        );
        assert_eq!(
            book.apply_deltas(&[level("100", "9")], &[], Some(2_000), Some(3)),
            ApplyResult::Stale
        );
        assert_eq!(book.snapshot().bids, before.bids);
        assert_eq!(book.last_seq(), Some(10));

        assert_eq!(
            book.apply_deltas(&[level("100", "9")], &[], Some(2_000), Some(11)),
            ApplyResult::Applied
        );
        assert_eq!(book.last_seq(), Some(11));
    }

    #[test]
    fn test_snapshot_overwrites_any_state() {
        let mut book = primed_book();
        book.apply_snapshot(
            vec![level("50", "1")],
            vec![level("51", "1")],
            Some(9_000),
            Some(99),
        );
        let snap = book.snapshot();
        assert_eq!(side_prices(&snap.bids), vec![50.0]);
        assert_eq!(side_prices(&snap.asks), vec![51.0]);
        assert_eq!(snap.last_seq, Some(99));
    }

    #[test]
    fn test_depth_truncation() {
        let mut book = LocalBook::new(VenueId::Bybit, "BTCUSDT"); // depth 50
        let bids: Vec<PriceLevel> = (0..80)
            .map(|i| level(&format!("{}", 1000 - i), "1"))
            .collect();
        book.apply_snapshot(bids, vec![level("2000", "1")], Some(1_000), None);
        assert_eq!(book.snapshot().bids.len(), 50);
        // Deepest kept bid is the 50th best.
        assert_eq!(book.snapshot().bids.last().unwrap().price, "951");
    }

    #[test]
    fn test_crossed_update_is_rejected() {
        let mut book = primed_book();
        let before = book.snapshot();

        // An ask below the best bid crosses the book; resorting cannot fix
        // it, so the update is discarded wholesale.
        let result = book.apply_deltas(&[], &[level("99.5", "1")], Some(2_000), Some(11));
        assert_eq!(result, ApplyResult::Rejected);
        let after = book.snapshot();
        assert_eq!(after.bids, before.bids);
        assert_eq!(after.asks, before.asks);
        assert_eq!(book.last_seq(), Some(10));
    }

    #[test]
    fn test_crossed_snapshot_is_cleared() {
        // bids [100, 99], asks [98, 101]: crossed on arrival.
        let mut book = LocalBook::new(VenueId::Kraken, "XBT/USD");
        let result = book.apply_snapshot(
            vec![level("100", "1"), level("99", "1")],
            vec![level("98", "1"), level("101", "1")],
            Some(1_000),
            None,
        );
        assert_eq!(result, ApplyResult::Rejected);
        assert!(book.is_empty());
    }

    #[test]
    fn test_top_of_book_update_keeps_depth() {
        let mut book = primed_book();
        book.apply_top_of_book(
            Some(level("100.5", "2")),
            Some(level("100.9", "1")),
            Some(5_000),
        );
        let snap = book.snapshot();
        assert_eq!(side_prices(&snap.bids), vec![100.5, 100.0, 99.0, 98.0]);
        assert_eq!(side_prices(&snap.asks), vec![100.9, 101.0, 102.0, 103.0]);

        // A best bid jumping above old asks pushes the stale asks out.
        book.apply_top_of_book(Some(level("101.5", "1")), Some(level("101.9", "1")), None);
        let snap = book.snapshot();
        assert_eq!(snap.bids[0].price, "101.5");
        assert_eq!(snap.asks[0].price, "101.9");
        assert!(!snap.is_crossed());
    }
}
