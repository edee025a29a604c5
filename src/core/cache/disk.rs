//! On-disk cache store
//!
//! One bincode-encoded file per entry name, named after the SHA-256 of the
//! name. Writes go to a unique temporary file in the same directory and are
//! renamed into place, so each record is replaced atomically and concurrent
//! writers to one key resolve last-writer-wins. A small LRU keeps recently
//! used records decoded in memory.

use super::{CacheRecord, CacheStore};
use crate::core::archive::EntryId;
use crate::core::error::CacheError;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const RECORD_EXTENSION: &str = "rec";

/// Durable cache store rooted at a directory
pub struct DiskStore {
    root: PathBuf,
    memory: Mutex<LruCache<String, Arc<CacheRecord>>>,
    tmp_counter: AtomicU64,
}

impl DiskStore {
    /// Open (creating if needed) a store in `root`, keeping up to
    /// `memory_entries` decoded records in memory.
    pub fn open<P: AsRef<Path>>(root: P, memory_entries: usize) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let capacity = NonZeroUsize::new(memory_entries).unwrap_or(NonZeroUsize::MIN);
        debug!("Opened disk cache at {:?}", root);

        Ok(DiskStore {
            root,
            memory: Mutex::new(LruCache::new(capacity)),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, name: &str) -> PathBuf {
        let hash = Sha256::digest(name.as_bytes());
        let file: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
        self.root.join(format!("{}.{}", file, RECORD_EXTENSION))
    }

    fn read_record(&self, name: &str) -> Result<Option<CacheRecord>, CacheError> {
        let bytes = match fs::read(self.record_path(name)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: CacheRecord = bincode::deserialize(&bytes)?;
        // Same hash, different name: treat as absent rather than trusting it
        if record.entry.name != name {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

impl CacheStore for DiskStore {
    fn get(&self, key: &EntryId) -> Result<Option<CacheRecord>, CacheError> {
        if let Some(record) = self.memory.lock().get(&key.name) {
            if record.entry == *key {
                return Ok(Some(record.as_ref().clone()));
            }
        }

        // Memory copy absent or not for this CRC; another process may have written a newer one.
        let record = self.read_record(&key.name)?;
        if let Some(record) = &record {
            self.memory
                .lock()
                .put(key.name.clone(), Arc::new(record.clone()));
        }
        Ok(record)
    }

    fn put(&self, record: &CacheRecord) -> Result<(), CacheError> {
        let bytes = bincode::serialize(record)?;
        let target = self.record_path(&record.entry.name);
        let tmp = target.with_extension(format!(
            "{}.tmp-{}-{}",
            RECORD_EXTENSION,
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)
        })();
        if let Err(e) = written {
            fs::remove_file(&tmp).ok();
            return Err(e.into());
        }

        self.memory
            .lock()
            .put(record.entry.name.clone(), Arc::new(record.clone()));
        debug!("Stored {} units for {}", record.units.len(), record.entry);
        Ok(())
    }
}
