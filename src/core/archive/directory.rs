//! Central directory records and local entry extraction

use super::cursor::ByteCursor;
use crate::core::error::ArchiveError;
use flate2::read::DeflateDecoder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;

pub const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;

const CENTRAL_HEADER_SIZE: usize = 46;
const LOCAL_HEADER_SIZE: usize = 30;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

/// One named record inside a package archive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub method: u16,
    pub local_header_offset: u64,
}

impl ArchiveEntry {
    /// Identity used as the content cache key
    pub fn id(&self) -> EntryId {
        EntryId {
            name: self.name.clone(),
            crc32: self.crc32,
        }
    }
}

/// (name, CRC-32) identity of an archive entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId {
    pub name: String,
    pub crc32: u32,
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:08x}", self.name, self.crc32)
    }
}

/// Walk every file header in the central directory.
pub fn read_entries(directory: &[u8]) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut cursor = ByteCursor::new(directory);
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    while cursor.remaining() >= CENTRAL_HEADER_SIZE {
        let start = cursor.position();
        if cursor.read_u32()? != CENTRAL_DIRECTORY_SIGNATURE {
            // Anything after the last file header (e.g. a digital signature record) is ignored.
            cursor.seek(start)?;
            break;
        }

        cursor.skip(6)?; // version made by, version needed, flags
        let method = cursor.read_u16()?;
        cursor.skip(4)?; // mod time, mod date
        let crc32 = cursor.read_u32()?;
        let compressed_size = cursor.read_u32()? as u64;
        let uncompressed_size = cursor.read_u32()? as u64;
        let name_len = cursor.read_u16()? as usize;
        let extra_len = cursor.read_u16()? as usize;
        let comment_len = cursor.read_u16()? as usize;
        cursor.skip(8)?; // disk start, internal attrs, external attrs
        let local_header_offset = cursor.read_u32()? as u64;

        let name = String::from_utf8_lossy(cursor.take(name_len)?).into_owned();
        cursor.skip(extra_len + comment_len)?;

        if !seen.insert(name.clone()) {
            return Err(ArchiveError::DuplicateEntry(name));
        }

        entries.push(ArchiveEntry {
            name,
            crc32,
            compressed_size,
            uncompressed_size,
            method,
            local_header_offset,
        });
    }

    Ok(entries)
}

/// Extract and verify the bytes of `entry` from the whole-archive slice.
pub fn extract(archive: &[u8], entry: &ArchiveEntry) -> Result<Vec<u8>, ArchiveError> {
    let mut cursor = ByteCursor::at(archive, entry.local_header_offset as usize)?;
    if cursor.read_u32()? != LOCAL_HEADER_SIGNATURE {
        return Err(ArchiveError::InvalidLocalHeader(entry.name.clone()));
    }
    cursor.skip(LOCAL_HEADER_SIZE - 4 - 4)?;
    let name_len = cursor.read_u16()? as usize;
    let extra_len = cursor.read_u16()? as usize;
    cursor.skip(name_len + extra_len)?;

    // Sizes come from the central directory: local headers may defer them to a data descriptor.
    let raw = cursor.take(entry.compressed_size as usize)?;

    let data = match entry.method {
        METHOD_STORED => raw.to_vec(),
        METHOD_DEFLATED => {
            let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
            DeflateDecoder::new(raw).read_to_end(&mut out)?;
            out
        }
        method => {
            return Err(ArchiveError::UnsupportedCompression {
                entry: entry.name.clone(),
                method,
            })
        }
    };

    let actual = crc32fast::hash(&data);
    if actual != entry.crc32 {
        return Err(ArchiveError::CrcMismatch {
            entry: entry.name.clone(),
            expected: entry.crc32,
            actual,
        });
    }

    Ok(data)
}
