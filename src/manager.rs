//! Dynamic manager: owns the venue-client set, mediates configuration, and
//! publishes status.
//!
//! One task runs the whole control loop: venue events arrive on a bounded
//! intake channel (the single consumer that feeds the cache and the
//! detector), config replacements arrive on the store's pub/sub topic, and a
//! 10 s timer refreshes `bot:status`. Clients never mutate the client map;
//! only this loop does, on config changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::StoreClient;
use crate::detector::{DetectorSettings, OpportunityDetector};
use crate::models::{now_ms, ArbitrageOpportunity, BotConfig, BotStatus, OrderBook};
use crate::sink::OpportunitySink;
use crate::symbols::SymbolRegistry;
use crate::venues::{build_client, discover_pairs, BookEvent, VenueClient, VenueId};

/// Intake channel depth; a full channel blocks the producing client.
const INTAKE_CAPACITY: usize = 1024;

/// Status refresh cadence.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period for outstanding store writes during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Events re-emitted to local subscribers (API layer, tests).
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Started,
    Book(OrderBook),
    OpportunityDetected(ArbitrageOpportunity),
    VenueError { venue: VenueId, detail: String },
    Stopped,
}

/// Enabled venue ids from a config; unknown names are dropped with a
/// warning, duplicates collapse.
pub fn enabled_venues(config: &BotConfig) -> Vec<VenueId> {
    let mut venues = Vec::new();
    for name in &config.exchanges {
        match VenueId::parse(name) {
            Some(venue) => venues.push(venue),
            None => warn!(name = %name, "unknown venue in config, dropped"),
        }
    }
    venues.sort();
    venues.dedup();
    venues
}

/// Native spellings per venue for every canonical symbol. A canonical
/// unsupported by any of the venues is clamped out entirely.
pub fn resolve_symbols(
    registry: &SymbolRegistry,
    venues: &[VenueId],
    canonicals: &[String],
) -> HashMap<VenueId, Vec<String>> {
    let mut map: HashMap<VenueId, Vec<String>> = HashMap::new();
    for canonical in canonicals {
        let resolved: Vec<(VenueId, String)> = venues
            .iter()
            .filter_map(|&v| registry.to_native(canonical, v).map(|n| (v, n)))
            .collect();
        if resolved.len() < venues.len() {
            warn!(symbol = %canonical, "unsupported on some enabled venues, dropped");
            continue;
        }
        for (venue, native) in resolved {
            map.entry(venue).or_default().push(native);
        }
    }
    map
}

pub struct DynamicManager {
    registry: Arc<SymbolRegistry>,
    store: StoreClient,
    detector: OpportunityDetector,
    clients: HashMap<VenueId, Arc<dyn VenueClient>>,
    config: BotConfig,
    connected: HashSet<VenueId>,
    started_at: i64,
    events_tx: broadcast::Sender<ManagerEvent>,
    intake_tx: mpsc::Sender<BookEvent>,
    intake_rx: mpsc::Receiver<BookEvent>,
    http: reqwest::Client,
}

impl DynamicManager {
    pub fn new(
        registry: Arc<SymbolRegistry>,
        store: StoreClient,
        sink: Arc<OpportunitySink>,
        settings: DetectorSettings,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (events_tx, _) = broadcast::channel(256);
        let detector = OpportunityDetector::new(registry.clone(), sink, settings);
        Self {
            registry,
            store,
            detector,
            clients: HashMap::new(),
            config: BotConfig::default(),
            connected: HashSet::new(),
            started_at: now_ms(),
            events_tx,
            intake_tx,
            intake_rx,
            http: reqwest::Client::new(),
        }
    }

    /// Subscribe to locally re-emitted events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events_tx.subscribe()
    }

    /// Run until `shutdown` flips true. Failure to reach the store during
    /// startup is fatal and propagates.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut config_sub = self
            .store
            .config_subscriber()
            .await
            .context("open config subscriber")?;

        match self.store.read_config().await.context("read bot:config")? {
            Some(config) => {
                info!(?config, "adopting stored config");
                self.config = config;
            }
            None => {
                info!("no stored config, using defaults");
                self.config = BotConfig::default();
            }
        }

        self.started_at = now_ms();
        if self.config.is_active {
            self.start_clients().await;
        } else {
            info!("config is inactive, venue clients idle");
        }
        self.detector.set_tunables(
            self.config.min_profit_percent,
            self.config.trade_amount_usd,
        );
        self.publish_status().await;
        let _ = self.events_tx.send(ManagerEvent::Started);
        info!("🚀 manager running");

        let mut status_tick = interval(STATUS_INTERVAL);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut config_stream = config_sub.on_message();

        loop {
            tokio::select! {
                event = self.intake_rx.recv() => {
                    // intake_tx is held by self, so recv never yields None
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                msg = config_stream.next() => {
                    match msg {
                        Some(msg) => self.handle_config_message(msg).await,
                        None => {
                            error!("config subscription closed");
                            break;
                        }
                    }
                }
                _ = status_tick.tick() => {
                    self.publish_status().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(config_stream);
        self.shutdown().await;
        Ok(())
    }

    /// Discover pairs, resolve native symbols, and bring up one client per
    /// enabled venue, connecting concurrently and waiting for all to settle
    /// (first socket up, or terminal failure) so the status written right
    /// after reflects real outcomes.
    async fn start_clients(&mut self) {
        let venues = enabled_venues(&self.config);
        if venues.is_empty() {
            warn!("no recognizable venues enabled, nothing to start");
            return;
        }

        // Feed the registry from each venue's discovery call first; a
        // failed or absent discovery leaves that venue on recipe
        // resolution.
        for &venue in &venues {
            match discover_pairs(venue, &self.http, &self.registry).await {
                Ok(0) => {}
                Ok(count) => {
                    info!(venue = venue.as_str(), pairs = count, "venue pairs discovered");
                }
                Err(e) => {
                    warn!(venue = venue.as_str(), error = %e,
                        "pair discovery failed, resolving by recipe");
                }
            }
        }

        let native_map = resolve_symbols(&self.registry, &venues, &self.config.symbols);
        for &venue in &venues {
            let symbols = native_map.get(&venue).cloned().unwrap_or_default();
            if symbols.is_empty() {
                warn!(venue = venue.as_str(), "no resolvable symbols, client skipped");
                continue;
            }
            let client = build_client(venue, symbols, self.intake_tx.clone());
            self.clients.insert(venue, client);
        }

        // Settle all connects concurrently while draining intake: a full
        // intake channel would otherwise block a slower client's priming
        // sends and stall the whole startup.
        let connects = self
            .clients
            .iter()
            .map(|(&venue, client)| {
                let client = client.clone();
                async move { (venue, client.connect().await) }
            })
            .collect::<Vec<_>>();
        let settle = futures_util::future::join_all(connects);
        tokio::pin!(settle);
        let results = loop {
            tokio::select! {
                results = &mut settle => break results,
                Some(event) = self.intake_rx.recv() => self.handle_event(event).await,
            }
        };

        for (venue, result) in results {
            match result {
                Ok(()) => {
                    self.connected.insert(venue);
                }
                Err(e) => {
                    warn!(venue = venue.as_str(), error = %e, "client failed to connect");
                }
            }
        }
        info!(
            clients = self.clients.len(),
            connected = self.connected.len(),
            "venue clients settled"
        );
    }

    async fn handle_event(&mut self, event: BookEvent) {
        match event {
            BookEvent::Book(book) => {
                if let Err(e) = self.store.put_book(&book).await {
                    warn!(error = %e, "book cache write failed");
                }
                let opportunities = self.detector.on_book(book.clone());
                for opp in opportunities {
                    info!(
                        id = %opp.id,
                        symbol = %opp.canonical_symbol,
                        buy = opp.buy_venue.as_str(),
                        sell = opp.sell_venue.as_str(),
                        profit_percent = opp.spread_percent,
                        "💰 opportunity detected"
                    );
                    let _ = self.events_tx.send(ManagerEvent::OpportunityDetected(opp));
                }
                let _ = self.events_tx.send(ManagerEvent::Book(book));
            }
            BookEvent::Connected(venue) => {
                info!(venue = venue.as_str(), "✅ venue connected");
                self.connected.insert(venue);
            }
            BookEvent::Disconnected(venue) => {
                debug!(venue = venue.as_str(), "venue disconnected");
                self.connected.remove(&venue);
            }
            BookEvent::VenueError { venue, detail, terminal } => {
                if terminal {
                    error!(venue = venue.as_str(), detail = %detail, "venue failed terminally");
                    self.connected.remove(&venue);
                } else {
                    warn!(venue = venue.as_str(), detail = %detail, "venue error");
                }
                let _ = self
                    .events_tx
                    .send(ManagerEvent::VenueError { venue, detail });
            }
        }
    }

    async fn handle_config_message(&mut self, msg: redis::Msg) {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "unreadable config message, keeping prior config");
                return;
            }
        };
        let incoming: BotConfig = match serde_json::from_str(&payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "malformed config message, keeping prior config");
                return;
            }
        };
        self.apply_config(incoming).await;
    }

    /// Apply a replacement config: tunables always flow to the detector; a
    /// changed venue or symbol set tears the client set down and restarts
    /// it. An update that would leave no venues is rejected.
    async fn apply_config(&mut self, incoming: BotConfig) {
        if incoming.exchanges.is_empty()
            || !incoming.exchanges.iter().any(|n| VenueId::parse(n).is_some())
        {
            warn!("config update would leave venue set empty, rejected");
            return;
        }

        let membership_changed = !self.config.same_exchanges(&incoming)
            || !self.config.same_symbols(&incoming);
        let activity_changed = self.config.is_active != incoming.is_active;

        self.detector
            .set_tunables(incoming.min_profit_percent, incoming.trade_amount_usd);
        self.config = incoming;

        if !self.config.is_active {
            if activity_changed {
                info!("config deactivated, stopping venue clients");
                self.stop_clients().await;
            }
        } else if membership_changed || activity_changed {
            info!(
                exchanges = ?self.config.exchanges,
                symbols = ?self.config.symbols,
                "reconfiguring venue clients"
            );
            self.stop_clients().await;
            self.start_clients().await;
        }
        self.publish_status().await;
    }

    async fn stop_clients(&mut self) {
        let clients: Vec<_> = self.clients.drain().map(|(_, c)| c).collect();
        for client in clients {
            client.disconnect().await;
        }
        self.connected.clear();
        self.detector.clear_books();
    }

    fn status(&self) -> BotStatus {
        let mut connected: Vec<String> = self
            .connected
            .iter()
            .map(|v| v.as_str().to_string())
            .collect();
        connected.sort();
        BotStatus {
            is_running: self.config.is_active && !self.clients.is_empty(),
            connected_exchanges: connected,
            uptime: self.started_at,
            config: self.config.clone(),
        }
    }

    async fn publish_status(&self) {
        if let Err(e) = self.store.write_status(&self.status()).await {
            warn!(error = %e, "status write failed");
        }
    }

    /// Disconnect everything, flush a final stopped status, emit `Stopped`.
    async fn shutdown(&mut self) {
        info!("shutting down");
        self.stop_clients().await;

        // Let in-flight intake drain briefly so the last books are cached.
        let drain = async {
            while let Ok(event) = self.intake_rx.try_recv() {
                self.handle_event(event).await;
            }
        };
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, drain).await;

        let mut status = self.status();
        status.is_running = false;
        status.connected_exchanges.clear();
        let final_write = self.store.write_status(&status);
        if tokio::time::timeout(SHUTDOWN_GRACE, final_write)
            .await
            .is_err()
        {
            warn!("final status write timed out");
        }
        let _ = self.events_tx.send(ManagerEvent::Stopped);
        info!("stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradingPair;

    fn config(exchanges: &[&str], symbols: &[&str]) -> BotConfig {
        BotConfig {
            exchanges: exchanges.iter().map(|s| s.to_string()).collect(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..BotConfig::default()
        }
    }

    #[test]
    fn test_membership_change_detection() {
        let current = config(&["binance", "coinbase"], &["BTCUSD"]);

        let same = config(&["coinbase", "binance"], &["BTCUSD"]);
        assert!(current.same_exchanges(&same) && current.same_symbols(&same));

        let grown = config(&["binance", "coinbase", "kraken"], &["BTCUSD"]);
        assert!(!current.same_exchanges(&grown));

        let reshaped = config(&["binance", "coinbase"], &["BTCUSD", "ETHUSD"]);
        assert!(!current.same_symbols(&reshaped));
    }

    #[test]
    fn test_enabled_venues_drops_unknown_names() {
        let cfg = config(&["binance", "mtgox", "BINANCE"], &["BTCUSD"]);
        // Unknown names are dropped, case-insensitive duplicates collapse.
        assert_eq!(enabled_venues(&cfg), vec![VenueId::Binance]);
    }

    #[test]
    fn test_symbol_clamp_drops_unsupported() {
        let registry = SymbolRegistry::default();
        // Kraken discovery lists only BTC; DOGEUSD cannot resolve there.
        registry.register_pairs(
            VenueId::Kraken,
            vec![TradingPair {
                native_symbol: "XBT/USD".to_string(),
                base_asset: "XBT".to_string(),
                quote_asset: "USD".to_string(),
                canonical_symbol: "BTCUSD".to_string(),
                active: true,
                min_order_size: None,
                tick_size: None,
            }],
        );

        let venues = [VenueId::Binance, VenueId::Kraken];
        let canonicals = vec!["BTCUSD".to_string(), "DOGEUSD".to_string()];
        let resolved = resolve_symbols(&registry, &venues, &canonicals);

        assert_eq!(resolved[&VenueId::Binance], vec!["BTCUSDT".to_string()]);
        assert_eq!(resolved[&VenueId::Kraken], vec!["XBT/USD".to_string()]);
        // DOGEUSD was clamped out everywhere, not just on kraken.
        assert!(!resolved[&VenueId::Binance].contains(&"DOGEUSDT".to_string()));
    }
}
