//! Spreadwatch: real-time cross-exchange arbitrage monitor.
//!
//! Live order books are reconstructed from six venues' public feeds, fanned
//! through a Redis-backed cache into the opportunity detector, and
//! qualifying two-leg spreads are persisted with rolling retention. Runtime
//! configuration arrives over a Redis pub/sub channel with no restart.

pub mod cache;
pub mod detector;
pub mod manager;
pub mod models;
pub mod sink;
pub mod symbols;
pub mod venues;

pub use cache::StoreClient;
pub use detector::{DetectorSettings, OpportunityDetector};
pub use manager::{DynamicManager, ManagerEvent};
pub use models::{ArbitrageOpportunity, BotConfig, BotStatus, OrderBook, PriceLevel};
pub use sink::OpportunitySink;
pub use symbols::SymbolRegistry;
pub use venues::{BookEvent, VenueClient, VenueId};
