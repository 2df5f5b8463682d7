//! Symbol registry: canonical ⇌ native symbol translation.
//!
//! The detector compares books across venues by canonical symbol (uppercase
//! base + quote, stablecoin quotes collapsed to USD), while each venue client
//! subscribes with the venue's own spelling. Both translations live here, as
//! a per-venue formatting recipe plus an optional registered-pair overlay
//! filled from venue discovery calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::models::TradingPair;
use crate::venues::VenueId;

/// Quotes tried from the right when parsing a concatenated symbol, longest
/// match first within this order.
const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "USD", "EUR", "BTC", "ETH", "BNB"];

/// Dollar-pegged quotes that collapse to USD for cross-venue comparison.
const USD_EQUIVALENTS: &[&str] = &["USDT", "USDC", "BUSD", "DAI"];

/// Per-venue native spelling recipe.
#[derive(Debug, Clone, Copy)]
struct NativeFormat {
    uppercase: bool,
    separator: Option<char>,
    /// What a canonical USD quote becomes on the wire.
    usd_quote: &'static str,
    /// Base-asset renames applied when formatting (canonical -> native).
    base_aliases: &'static [(&'static str, &'static str)],
}

fn format_for(venue: VenueId) -> NativeFormat {
    match venue {
        VenueId::Binance => NativeFormat {
            uppercase: true,
            separator: None,
            usd_quote: "USDT",
            base_aliases: &[],
        },
        VenueId::Bybit => NativeFormat {
            uppercase: true,
            separator: None,
            usd_quote: "USDT",
            base_aliases: &[],
        },
        VenueId::Coinbase => NativeFormat {
            uppercase: true,
            separator: Some('-'),
            usd_quote: "USD",
            base_aliases: &[],
        },
        VenueId::Gemini => NativeFormat {
            uppercase: false,
            separator: None,
            usd_quote: "USD",
            base_aliases: &[],
        },
        VenueId::Kraken => NativeFormat {
            uppercase: true,
            separator: Some('/'),
            usd_quote: "USD",
            base_aliases: &[("BTC", "XBT")],
        },
        VenueId::Kucoin => NativeFormat {
            uppercase: true,
            separator: Some('-'),
            usd_quote: "USDT",
            base_aliases: &[],
        },
    }
}

/// Canonical ⇌ native symbol translation for all venues.
pub struct SymbolRegistry {
    /// Registered pairs per venue, keyed by native symbol. When non-empty
    /// for a venue, `to_native` resolves against this set; otherwise the
    /// formatting recipe alone answers.
    pairs: RwLock<HashMap<VenueId, HashMap<String, TradingPair>>>,
    /// Collapse dollar-pegged quotes to USD when canonicalizing.
    quote_equivalence: bool,
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SymbolRegistry {
    pub fn new(quote_equivalence: bool) -> Self {
        Self {
            pairs: RwLock::new(HashMap::new()),
            quote_equivalence,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Extend the registry from a venue's pair discovery call.
    pub fn register_pairs(&self, venue: VenueId, pairs: Vec<TradingPair>) {
        let mut map = self.pairs.write();
        let entry = map.entry(venue).or_default();
        for pair in pairs {
            if !pair.active {
                continue;
            }
            entry.insert(pair.native_symbol.clone(), pair);
        }
        debug!(venue = venue.as_str(), pairs = entry.len(), "registered venue pairs");
    }

    /// Canonical identity for a venue-native symbol, or `None` when the
    /// spelling cannot be parsed.
    pub fn canonicalize(&self, venue: VenueId, native: &str) -> Option<String> {
        if let Some(pair) = self
            .pairs
            .read()
            .get(&venue)
            .and_then(|m| m.get(native))
        {
            return Some(pair.canonical_symbol.clone());
        }

        let fmt = format_for(venue);
        let upper = native.trim().to_uppercase();
        let (base, quote) = match fmt.separator {
            Some(sep) => {
                let mut parts = upper.splitn(2, sep);
                let base = parts.next()?.to_string();
                let quote = parts.next()?.to_string();
                if base.is_empty() || quote.is_empty() {
                    return None;
                }
                (base, quote)
            }
            None => split_concatenated(&upper)?,
        };

        let base = unalias_base(&base);
        let quote = if self.quote_equivalence && USD_EQUIVALENTS.contains(&quote.as_str()) {
            "USD".to_string()
        } else {
            quote
        };
        Some(format!("{base}{quote}"))
    }

    /// The venue's native spelling of a canonical symbol, or `None` when the
    /// canonical cannot be parsed or the venue does not list the pair.
    pub fn to_native(&self, canonical: &str, venue: VenueId) -> Option<String> {
        let canonical = canonical.trim().to_uppercase();
        let (base, quote) = split_concatenated(&canonical)?;

        let fmt = format_for(venue);
        let quote = if quote == "USD" { fmt.usd_quote.to_string() } else { quote };
        let base = alias_base(&base, fmt.base_aliases);

        let joined = match fmt.separator {
            Some(sep) => format!("{base}{sep}{quote}"),
            None => format!("{base}{quote}"),
        };
        let native = if fmt.uppercase {
            joined
        } else {
            joined.to_lowercase()
        };

        let pairs = self.pairs.read();
        match pairs.get(&venue) {
            Some(listed) if !listed.is_empty() => {
                if listed.contains_key(&native) {
                    Some(native)
                } else {
                    // The venue may list the pair under a different spelling.
                    listed
                        .values()
                        .find(|p| p.canonical_symbol == canonical)
                        .map(|p| p.native_symbol.clone())
                }
            }
            _ => Some(native),
        }
    }

    /// Canonical symbols resolvable on *every* venue in `venues`, restricted
    /// to USD-quoted pairs over `base_whitelist`. Maps canonical symbol to
    /// each venue's native spelling.
    pub fn common_symbols(
        &self,
        venues: &[VenueId],
        base_whitelist: &[&str],
    ) -> BTreeMap<String, HashMap<VenueId, String>> {
        let mut out = BTreeMap::new();
        if venues.is_empty() {
            return out;
        }
        for base in base_whitelist {
            let canonical = format!("{}USD", base.trim().to_uppercase());
            let mut per_venue = HashMap::with_capacity(venues.len());
            let mut complete = true;
            for &venue in venues {
                match self.to_native(&canonical, venue) {
                    Some(native) => {
                        per_venue.insert(venue, native);
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                out.insert(canonical, per_venue);
            }
        }
        out
    }
}

/// Split `BASEQUOTE` by trying known quotes from the right.
fn split_concatenated(symbol: &str) -> Option<(String, String)> {
    for quote in KNOWN_QUOTES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Some((base.to_string(), quote.to_string()));
            }
        }
    }
    None
}

fn alias_base(base: &str, aliases: &[(&str, &str)]) -> String {
    aliases
        .iter()
        .find(|(from, _)| *from == base)
        .map(|(_, to)| to.to_string())
        .unwrap_or_else(|| base.to_string())
}

/// Venue-specific base spellings back to canonical (`XBT` -> `BTC`).
fn unalias_base(base: &str) -> String {
    match base {
        "XBT" => "BTC".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(native: &str, base: &str, quote: &str, canonical: &str) -> TradingPair {
        TradingPair {
            native_symbol: native.to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            canonical_symbol: canonical.to_string(),
            active: true,
            min_order_size: None,
            tick_size: None,
        }
    }

    #[test]
    fn test_to_native_recipes() {
        let reg = SymbolRegistry::default();
        assert_eq!(reg.to_native("BTCUSD", VenueId::Binance).unwrap(), "BTCUSDT");
        assert_eq!(reg.to_native("BTCUSD", VenueId::Coinbase).unwrap(), "BTC-USD");
        assert_eq!(reg.to_native("BTCUSD", VenueId::Kraken).unwrap(), "XBT/USD");
        assert_eq!(reg.to_native("BTCUSD", VenueId::Bybit).unwrap(), "BTCUSDT");
        assert_eq!(reg.to_native("BTCUSD", VenueId::Kucoin).unwrap(), "BTC-USDT");
        assert_eq!(reg.to_native("BTCUSD", VenueId::Gemini).unwrap(), "btcusd");
        assert_eq!(reg.to_native("ETHBTC", VenueId::Coinbase).unwrap(), "ETH-BTC");
    }

    #[test]
    fn test_canonicalize_recipes() {
        let reg = SymbolRegistry::default();
        assert_eq!(reg.canonicalize(VenueId::Binance, "BTCUSDT").unwrap(), "BTCUSD");
        assert_eq!(reg.canonicalize(VenueId::Coinbase, "BTC-USD").unwrap(), "BTCUSD");
        assert_eq!(reg.canonicalize(VenueId::Kraken, "XBT/USD").unwrap(), "BTCUSD");
        assert_eq!(reg.canonicalize(VenueId::Kucoin, "BTC-USDT").unwrap(), "BTCUSD");
        assert_eq!(reg.canonicalize(VenueId::Gemini, "btcusd").unwrap(), "BTCUSD");
        assert_eq!(reg.canonicalize(VenueId::Binance, "SOLUSDC").unwrap(), "SOLUSD");
        assert_eq!(reg.canonicalize(VenueId::Binance, "ETHBTC").unwrap(), "ETHBTC");
        assert_eq!(reg.canonicalize(VenueId::Binance, "GARBAGE123"), None);
    }

    #[test]
    fn test_round_trip_all_venues() {
        let reg = SymbolRegistry::default();
        for &venue in VenueId::all() {
            for canonical in ["BTCUSD", "ETHUSD", "SOLUSD"] {
                let native = reg.to_native(canonical, venue).unwrap();
                assert_eq!(
                    reg.canonicalize(venue, &native).as_deref(),
                    Some(canonical),
                    "round trip failed for {canonical} on {venue:?} via {native}"
                );
            }
        }
    }

    #[test]
    fn test_longest_quote_wins() {
        // USDT must be tried before USD so BTCUSDT does not parse as BTCUS|DT.
        assert_eq!(
            split_concatenated("BTCUSDT"),
            Some(("BTC".to_string(), "USDT".to_string()))
        );
        assert_eq!(
            split_concatenated("BTCUSD"),
            Some(("BTC".to_string(), "USD".to_string()))
        );
        assert_eq!(split_concatenated("USDT"), None);
    }

    #[test]
    fn test_registered_pairs_take_priority() {
        let reg = SymbolRegistry::default();
        reg.register_pairs(
            VenueId::Kraken,
            vec![pair("XBT/USD", "XBT", "USD", "BTCUSD")],
        );
        // Listed pair resolves; unlisted symbol on the same venue does not.
        assert_eq!(reg.to_native("BTCUSD", VenueId::Kraken).unwrap(), "XBT/USD");
        assert_eq!(reg.to_native("DOGEUSD", VenueId::Kraken), None);
    }

    #[test]
    fn test_common_symbols_intersection() {
        let reg = SymbolRegistry::default();
        // Gemini discovery lists BTC and ETH but not DOGE.
        reg.register_pairs(
            VenueId::Gemini,
            vec![
                pair("btcusd", "BTC", "USD", "BTCUSD"),
                pair("ethusd", "ETH", "USD", "ETHUSD"),
            ],
        );

        let venues = [VenueId::Binance, VenueId::Coinbase, VenueId::Gemini];
        let common = reg.common_symbols(&venues, &["BTC", "ETH", "DOGE"]);

        assert_eq!(common.len(), 2);
        assert!(common.contains_key("BTCUSD"));
        assert!(common.contains_key("ETHUSD"));
        assert!(!common.contains_key("DOGEUSD"));
        assert_eq!(common["BTCUSD"][&VenueId::Binance], "BTCUSDT");
        assert_eq!(common["BTCUSD"][&VenueId::Coinbase], "BTC-USD");
        assert_eq!(common["BTCUSD"][&VenueId::Gemini], "btcusd");
    }

    #[test]
    fn test_inactive_pairs_are_dropped() {
        let reg = SymbolRegistry::default();
        let mut delisted = pair("DOGE-USD", "DOGE", "USD", "DOGEUSD");
        delisted.active = false;
        reg.register_pairs(VenueId::Coinbase, vec![delisted, pair("BTC-USD", "BTC", "USD", "BTCUSD")]);
        assert_eq!(reg.to_native("DOGEUSD", VenueId::Coinbase), None);
        assert_eq!(reg.to_native("BTCUSD", VenueId::Coinbase).unwrap(), "BTC-USD");
    }
}
