//! StatsStore — redb-backed historical dump statistics.
//!
//! One record per (host, device): per-level sizes and durations of the
//! last successful dump, running rate/compression averages, and pending
//! operator commands. The planner reads each record once at estimate
//! time; the driver writes it back once per completed dump.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use spool_core::HistoricalStats;

use crate::error::{StateError, StateResult};
use crate::tables::STATS;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe stats store backed by redb.
#[derive(Clone)]
pub struct StatsStore {
    db: Arc<Database>,
}

impl StatsStore {
    /// Open (or create) a persistent stats store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "stats store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory stats store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory stats store opened");
        Ok(store)
    }

    /// Create the stats table if it doesn't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(STATS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn key(host: &str, device: &str) -> String {
        format!("{host}:{device}")
    }

    /// Fetch the stats record for one filesystem.
    pub fn get(&self, host: &str, device: &str) -> StateResult<Option<HistoricalStats>> {
        let key = Self::key(host, device);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let stats: HistoricalStats =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(stats))
            }
            None => Ok(None),
        }
    }

    /// Insert or update the stats record for one filesystem.
    pub fn put(&self, host: &str, device: &str, stats: &HistoricalStats) -> StateResult<()> {
        let key = Self::key(host, device);
        let value = serde_json::to_vec(stats).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STATS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "stats record stored");
        Ok(())
    }

    /// List all (host:device, stats) pairs. Used by reporting.
    pub fn list(&self) -> StateResult<Vec<(String, HistoricalStats)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATS).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for item in table.iter().map_err(map_err!(Read))? {
            let (key, value) = item.map_err(map_err!(Read))?;
            let stats: HistoricalStats =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            out.push((key.value().to_string(), stats));
        }
        Ok(out)
    }
}
