//! In-memory cache store

use super::{CacheRecord, CacheStore};
use crate::core::archive::EntryId;
use crate::core::error::CacheError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-local store, one record slot per entry name
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Arc<CacheRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &EntryId) -> Result<Option<CacheRecord>, CacheError> {
        Ok(self
            .records
            .read()
            .get(&key.name)
            .map(|record| record.as_ref().clone()))
    }

    fn put(&self, record: &CacheRecord) -> Result<(), CacheError> {
        self.records
            .write()
            .insert(record.entry.name.clone(), Arc::new(record.clone()));
        Ok(())
    }
}
