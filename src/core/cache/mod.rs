//! Content cache for split code units
//!
//! Maps an archive entry identity (name + CRC-32) to the code units that
//! were extracted from it. Storage backends implement [`CacheStore`]; the
//! [`ContentCache`] wrapper owns the two policies every backend shares:
//!
//! - a record is only a hit when its stored CRC equals the queried CRC
//! - a storage failure is logged and treated as a miss, never surfaced

pub mod disk;
pub mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use crate::core::archive::EntryId;
use crate::core::error::CacheError;
use crate::core::units::CodeUnit;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Persisted mapping from an entry identity to its full unit set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub entry: EntryId,
    pub units: Vec<CodeUnit>,
    /// Unix seconds at insertion
    pub stored_at: i64,
}

impl CacheRecord {
    pub fn new(entry: EntryId, units: Vec<CodeUnit>) -> Self {
        CacheRecord {
            entry,
            units,
            stored_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Key-value backend for cache records.
///
/// Backends hold at most one record per entry name: a `put` for a name
/// supersedes whatever was stored for it, whatever its CRC. Each `put` must
/// be atomic (readers see the old record or the new one, never a mix) and
/// concurrent readers must be supported.
pub trait CacheStore: Send + Sync {
    /// Fetch the record currently stored under `key.name`
    fn get(&self, key: &EntryId) -> Result<Option<CacheRecord>, CacheError>;

    /// Insert or supersede the record for `record.entry.name`
    fn put(&self, record: &CacheRecord) -> Result<(), CacheError>;
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Records rejected because the stored CRC differed
    pub stale: u64,
    /// Backend failures downgraded to misses or dropped writes
    pub errors: u64,
}

/// Cache front used by the splitter
#[derive(Clone)]
pub struct ContentCache {
    store: Arc<dyn CacheStore>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    errors: AtomicU64,
}

impl ContentCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        ContentCache {
            store,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Cache backed by a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Units previously stored for exactly `key`, or `None` on miss.
    pub fn lookup(&self, key: &EntryId) -> Option<Vec<CodeUnit>> {
        let record = match self.store.get(key) {
            Ok(record) => record,
            Err(e) => {
                warn!("Cache read for {} failed, treating as miss: {}", key, e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match record {
            Some(record) if record.entry == *key => {
                debug!("Cache hit for {} ({} units)", key, record.units.len());
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(record.units)
            }
            Some(record) => {
                debug!("Cache record for {} is stale ({})", key, record.entry);
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store the unit set for `key`, superseding any older record for the same name.
    pub fn store(&self, key: &EntryId, units: &[CodeUnit]) {
        let record = CacheRecord::new(key.clone(), units.to_vec());
        if let Err(e) = self.store.put(&record) {
            warn!("Cache write for {} failed, dropping: {}", key, e);
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("stats", &self.stats())
            .finish()
    }
}
