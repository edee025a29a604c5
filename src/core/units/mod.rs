//! Code units: the finest independently swappable pieces of code

pub mod splitter;

pub use splitter::{BundleSplitter, CachedSplitter, UnitFilter, UnitSplitter, BUNDLE_MAGIC};

use crate::core::archive::EntryId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One independently addressable block of code extracted from a container entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    /// Fully-qualified name, unique within its container
    pub name: String,
    /// Container entry the unit was extracted from
    pub entry: EntryId,
    pub payload: Vec<u8>,
    /// CRC-32 of `payload`
    pub checksum: u32,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>, entry: EntryId, payload: Vec<u8>) -> Self {
        let checksum = crc32fast::hash(&payload);
        CodeUnit {
            name: name.into(),
            entry,
            payload,
            checksum,
        }
    }
}

/// Every unit of one deployment snapshot, keyed by qualified name
pub type UnitSet = BTreeMap<String, CodeUnit>;
