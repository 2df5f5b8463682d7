//! Opportunity sink: durable retention of detected opportunities with a
//! rolling bound, on SQLite.
//!
//! WAL mode, foreign keys on, connection behind a mutex. The venue table is
//! keyed by name and upserted on demand so an opportunity referencing a
//! venue the table has never seen retries once after the upsert instead of
//! failing.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use tracing::{info, warn};

use crate::models::ArbitrageOpportunity;
use crate::venues::VenueId;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS venues (
    name TEXT PRIMARY KEY,
    ws_url TEXT NOT NULL,
    rest_url TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS opportunities (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    buy_exchange TEXT NOT NULL REFERENCES venues(name),
    sell_exchange TEXT NOT NULL REFERENCES venues(name),
    buy_price REAL NOT NULL,
    sell_price REAL NOT NULL,
    spread REAL NOT NULL,
    spread_percent REAL NOT NULL,
    estimated_profit REAL NOT NULL,
    buy_fee REAL NOT NULL,
    sell_fee REAL NOT NULL,
    total_fee REAL NOT NULL,
    timestamp INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_opportunities_ts
    ON opportunities(timestamp DESC);
"#;

/// Rolling-retention opportunity store.
pub struct OpportunitySink {
    conn: Mutex<Connection>,
}

impl OpportunitySink {
    /// Open (or create) the database at `path`. `:memory:` works for tests.
    pub fn new(path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("open opportunity db at {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("initialize opportunity schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM opportunities", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path, existing = count, "opportunity sink ready");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert one opportunity. A missing venue row triggers a one-shot
    /// venue upsert and a single retry; the caller still emits the
    /// opportunity in-process if the retry fails too.
    pub fn append(&self, opp: &ArbitrageOpportunity) -> Result<()> {
        let conn = self.conn.lock();
        match insert_opportunity(&conn, opp) {
            Ok(()) => Ok(()),
            Err(e) if is_foreign_key_violation(&e) => {
                ensure_venues(&conn, &[opp.buy_venue, opp.sell_venue])?;
                insert_opportunity(&conn, opp).context("opportunity insert retry")
            }
            Err(e) => Err(e).context("opportunity insert"),
        }
    }

    /// Drop everything older than the `keep`-th most recent by detection
    /// time. Call after each append.
    pub fn prune_to(&self, keep: usize) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM opportunities WHERE id NOT IN (
                    SELECT id FROM opportunities
                    ORDER BY timestamp DESC, id DESC LIMIT ?1
                )",
                params![keep as i64],
            )
            .context("prune opportunities")?;
        Ok(deleted)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM opportunities", [], |row| row.get(0))
            .context("count opportunities")?;
        Ok(count as usize)
    }

    /// Newest `n` opportunities by detection time.
    pub fn latest(&self, n: usize) -> Result<Vec<ArbitrageOpportunity>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, symbol, buy_exchange, sell_exchange, buy_price,
                        sell_price, spread, spread_percent, estimated_profit,
                        buy_fee, sell_fee, total_fee, timestamp
                 FROM opportunities
                 ORDER BY timestamp DESC, id DESC LIMIT ?1",
            )
            .context("prepare latest query")?;
        let rows = stmt
            .query_map(params![n as i64], |row| {
                let buy: String = row.get(2)?;
                let sell: String = row.get(3)?;
                Ok((buy, sell, row_to_partial(row)?))
            })
            .context("latest query")?;

        let mut out = Vec::with_capacity(n);
        for row in rows {
            let (buy, sell, partial) = row.context("latest row")?;
            let (Some(buy_venue), Some(sell_venue)) =
                (VenueId::parse(&buy), VenueId::parse(&sell))
            else {
                warn!(buy = %buy, sell = %sell, "row references unknown venue, skipping");
                continue;
            };
            out.push(ArbitrageOpportunity {
                buy_venue,
                sell_venue,
                ..partial
            });
        }
        Ok(out)
    }
}

/// Row fields other than the venue columns.
fn row_to_partial(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArbitrageOpportunity> {
    Ok(ArbitrageOpportunity {
        id: row.get(0)?,
        canonical_symbol: row.get(1)?,
        buy_venue: VenueId::Binance, // replaced by the caller
        sell_venue: VenueId::Binance,
        buy_price: row.get(4)?,
        sell_price: row.get(5)?,
        gross_spread: row.get(6)?,
        spread_percent: row.get(7)?,
        estimated_net_profit: row.get(8)?,
        buy_fee: row.get(9)?,
        sell_fee: row.get(10)?,
        total_fee: row.get(11)?,
        detected_at: row.get(12)?,
    })
}

fn insert_opportunity(conn: &Connection, opp: &ArbitrageOpportunity) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO opportunities
         (id, symbol, buy_exchange, sell_exchange, buy_price, sell_price,
          spread, spread_percent, estimated_profit, buy_fee, sell_fee,
          total_fee, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            opp.id,
            opp.canonical_symbol,
            opp.buy_venue.as_str(),
            opp.sell_venue.as_str(),
            opp.buy_price,
            opp.sell_price,
            opp.gross_spread,
            opp.spread_percent,
            opp.estimated_net_profit,
            opp.buy_fee,
            opp.sell_fee,
            opp.total_fee,
            opp.detected_at,
        ],
    )?;
    Ok(())
}

/// Upsert venue rows with their compiled endpoint defaults.
fn ensure_venues(conn: &Connection, venues: &[VenueId]) -> Result<()> {
    for venue in venues {
        let descriptor = venue.descriptor();
        conn.execute(
            "INSERT INTO venues (name, ws_url, rest_url) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
                 ws_url = excluded.ws_url,
                 rest_url = excluded.rest_url",
            params![venue.as_str(), descriptor.ws_url, descriptor.rest_url],
        )
        .with_context(|| format!("upsert venue {venue}"))?;
    }
    Ok(())
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
    )
}
