//! Splitting code containers into units
//!
//! A code container is an archive entry bundling many code units. The
//! build emits them in a simple length-prefixed format:
//!
//! ```text
//! "UNIT" | u32 count | count x ( u16 name_len | name | u32 len | payload )
//! ```
//!
//! Splitting means decompressing the entry and walking that structure,
//! which is the expensive part of diffing. [`CachedSplitter`] consults the
//! content cache first and only splits for real on a miss.

use super::CodeUnit;
use crate::core::archive::{ArchiveEntry, ByteCursor, PackageArchive};
use crate::core::cache::ContentCache;
use crate::core::error::{DeployError, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub const BUNDLE_MAGIC: &[u8; 4] = b"UNIT";

/// Predicate selecting units that must be freshly computed
pub type UnitFilter = Arc<dyn Fn(&CodeUnit) -> bool + Send + Sync>;

/// Produces the code units of a container entry
pub trait UnitSplitter: Send + Sync {
    /// Whether `entry` is a code container this splitter understands
    fn accepts(&self, entry: &ArchiveEntry) -> bool;

    /// Extract units from `entry`. With a filter, only matching units are returned.
    fn split(
        &self,
        archive: &PackageArchive,
        entry: &ArchiveEntry,
        filter: Option<&UnitFilter>,
    ) -> Result<Vec<CodeUnit>>;
}

/// Splitter for `UNIT` bundles
#[derive(Debug, Clone)]
pub struct BundleSplitter {
    suffix: String,
}

impl BundleSplitter {
    pub fn new(suffix: impl Into<String>) -> Self {
        BundleSplitter {
            suffix: suffix.into(),
        }
    }

    /// Decode a bundle already read from `entry`
    pub fn decode(entry: &ArchiveEntry, bytes: &[u8]) -> Result<Vec<CodeUnit>> {
        let fail = |reason: String| DeployError::Split {
            entry: entry.name.clone(),
            reason,
        };

        let mut cursor = ByteCursor::new(bytes);
        let magic = cursor.take(4).map_err(|e| fail(e.to_string()))?;
        if magic != BUNDLE_MAGIC {
            return Err(fail("missing UNIT magic".to_string()));
        }

        let count = cursor.read_u32().map_err(|e| fail(e.to_string()))?;
        let id = entry.id();
        let mut names = HashSet::new();
        let mut units = Vec::new();

        for _ in 0..count {
            let name_len = cursor.read_u16().map_err(|e| fail(e.to_string()))? as usize;
            let name = cursor.take(name_len).map_err(|e| fail(e.to_string()))?;
            let name = std::str::from_utf8(name)
                .map_err(|_| fail("unit name is not UTF-8".to_string()))?
                .to_string();
            let len = cursor.read_u32().map_err(|e| fail(e.to_string()))? as usize;
            let payload = cursor.take(len).map_err(|e| fail(e.to_string()))?;

            if !names.insert(name.clone()) {
                return Err(fail(format!("duplicate unit '{}'", name)));
            }
            units.push(CodeUnit::new(name, id.clone(), payload.to_vec()));
        }

        if cursor.remaining() != 0 {
            return Err(fail(format!("{} trailing bytes", cursor.remaining())));
        }

        Ok(units)
    }

    /// Encode units into the bundle format
    pub fn encode<'a, I>(units: I) -> Vec<u8>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let units: Vec<_> = units.into_iter().collect();
        let mut out = Vec::new();
        out.extend_from_slice(BUNDLE_MAGIC);
        out.extend_from_slice(&(units.len() as u32).to_le_bytes());
        for (name, payload) in units {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }
}

impl UnitSplitter for BundleSplitter {
    fn accepts(&self, entry: &ArchiveEntry) -> bool {
        entry.name.ends_with(&self.suffix)
    }

    fn split(
        &self,
        archive: &PackageArchive,
        entry: &ArchiveEntry,
        filter: Option<&UnitFilter>,
    ) -> Result<Vec<CodeUnit>> {
        let bytes = archive.read_entry(entry)?;
        let mut units = Self::decode(entry, &bytes)?;
        if let Some(filter) = filter {
            units.retain(|unit| filter(unit));
        }
        Ok(units)
    }
}

/// Cache-first splitter
///
/// A cached unit set is returned verbatim when the entry's CRC matches.
/// When a filter is supplied the cache is bypassed entirely and the entry
/// is re-split, even for units the filter would keep. Every real split
/// writes the full unit set back; the filter only narrows what is returned.
pub struct CachedSplitter {
    cache: ContentCache,
    inner: Arc<dyn UnitSplitter>,
    extractions: AtomicU64,
}

impl CachedSplitter {
    pub fn new(cache: ContentCache, inner: Arc<dyn UnitSplitter>) -> Self {
        CachedSplitter {
            cache,
            inner,
            extractions: AtomicU64::new(0),
        }
    }

    pub fn accepts(&self, entry: &ArchiveEntry) -> bool {
        self.inner.accepts(entry)
    }

    pub fn split(
        &self,
        archive: &PackageArchive,
        entry: &ArchiveEntry,
        force_filter: Option<&UnitFilter>,
    ) -> Result<Vec<CodeUnit>> {
        let key = entry.id();

        if force_filter.is_none() {
            if let Some(units) = self.cache.lookup(&key) {
                if !units.is_empty() {
                    return Ok(units);
                }
            }
        }

        // Always split in full so the record written back is complete.
        self.extractions.fetch_add(1, Ordering::Relaxed);
        let mut units = self.inner.split(archive, entry, None)?;
        debug!("Split {} into {} units", key, units.len());
        self.cache.store(&key, &units);

        if let Some(filter) = force_filter {
            units.retain(|unit| filter(unit));
        }
        Ok(units)
    }

    /// Number of real (uncached) splits performed
    pub fn extractions(&self) -> u64 {
        self.extractions.load(Ordering::Relaxed)
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> ArchiveEntry {
        ArchiveEntry {
            name: name.to_string(),
            crc32: 5,
            compressed_size: 0,
            uncompressed_size: 0,
            method: 0,
            local_header_offset: 0,
        }
    }

    #[test]
    fn test_decode_bundle() {
        let bytes = BundleSplitter::encode([("a.A", &b"one"[..]), ("a.B", &b"two"[..])]);
        let units = BundleSplitter::decode(&entry("classes.units"), &bytes).unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].name, "a.A");
        assert_eq!(units[1].payload, b"two");
        assert_eq!(units[1].checksum, crc32fast::hash(b"two"));
        assert_eq!(units[0].entry.crc32, 5);
    }

    #[test]
    fn test_duplicate_unit_rejected() {
        let bytes = BundleSplitter::encode([("a.A", &b"one"[..]), ("a.A", &b"two"[..])]);
        let err = BundleSplitter::decode(&entry("classes.units"), &bytes).unwrap_err();
        assert!(matches!(err, DeployError::Split { reason, .. } if reason.contains("duplicate")));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let err = BundleSplitter::decode(&entry("x.units"), b"NOPE\0\0\0\0").unwrap_err();
        assert!(matches!(err, DeployError::Split { .. }));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut bytes = BundleSplitter::encode([("a.A", &b"payload"[..])]);
        bytes.truncate(bytes.len() - 2);
        assert!(BundleSplitter::decode(&entry("x.units"), &bytes).is_err());
    }

    #[test]
    fn test_accepts_by_suffix() {
        let splitter = BundleSplitter::new(".units");
        assert!(splitter.accepts(&entry("classes2.units")));
        assert!(!splitter.accepts(&entry("res/layout.xml")));
    }
}
