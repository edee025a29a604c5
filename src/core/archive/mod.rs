//! Package archive indexing
//!
//! Locates the central directory of a zip-format package archive by
//! scanning backward for the end-of-central-directory record, then probes
//! for an optional signature block that sits immediately before the
//! central directory. Nothing is decompressed while indexing.
//!
//! ```text
//! [local entries ...][signature block?][central directory][EOCD][comment]
//! ```
//!
//! Signature block layout (all little-endian):
//!
//! ```text
//! u64 size | payload ... | u64 size | "APK Sig Block 42"
//! ```
//!
//! `size` counts everything after the first size field, so the block spans
//! `size + 8` bytes ending at the central directory. Both size fields must
//! agree before the block is trusted.

pub mod cursor;
pub mod directory;

pub use cursor::ByteCursor;
pub use directory::{ArchiveEntry, EntryId};

use crate::core::error::ArchiveError;
use directory::CENTRAL_DIRECTORY_SIGNATURE;
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const END_OF_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;
/// Size of the end-of-central-directory record without comment
pub const END_OF_DIRECTORY_SIZE: usize = 22;
/// The comment length is a u16
pub const MAX_COMMENT_LENGTH: usize = u16::MAX as usize;
pub const SIGNATURE_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";

/// Location of a verified signature block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureBlock {
    pub offset: u64,
    pub size: u64,
}

/// Structural offsets of an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub central_directory_offset: u64,
    pub central_directory_size: u64,
    pub end_of_directory_offset: u64,
    pub signature_block: Option<SignatureBlock>,
}

impl ArchiveLayout {
    /// Locate the central directory and signature block in `bytes`.
    pub fn locate(bytes: &[u8]) -> Result<Self, ArchiveError> {
        if bytes.len() < END_OF_DIRECTORY_SIZE {
            return Err(ArchiveError::TooShort {
                len: bytes.len() as u64,
            });
        }

        let cursor = ByteCursor::new(bytes);
        let (eocd, cd_offset, cd_size) = find_end_of_directory(&cursor)?;

        let signature_block = probe_signature_block(&cursor, cd_offset as usize);

        Ok(ArchiveLayout {
            central_directory_offset: cd_offset,
            central_directory_size: cd_size,
            end_of_directory_offset: eocd as u64,
            signature_block,
        })
    }
}

/// Backward scan for the EOCD record.
///
/// Only candidates whose central directory ends exactly at the candidate
/// are considered. Among those, one whose comment length reaches exactly
/// to the end of the file wins; otherwise (trailing bytes after a
/// well-formed record) the last valid candidate in the file is used.
fn find_end_of_directory(cursor: &ByteCursor<'_>) -> Result<(usize, u64, u64), ArchiveError> {
    let start = cursor.len() - END_OF_DIRECTORY_SIZE;
    let floor = start.saturating_sub(MAX_COMMENT_LENGTH);
    let mut fallback = None;
    let mut rejected = None;
    let mut from = start;

    while let Some(candidate) = cursor.rfind_u32(from, from - floor, END_OF_DIRECTORY_SIGNATURE) {
        match directory_at(cursor, candidate) {
            Ok((cd_offset, cd_size)) => {
                let comment_len = cursor.u16_at(candidate + 20)? as usize;
                if candidate + END_OF_DIRECTORY_SIZE + comment_len == cursor.len() {
                    return Ok((candidate, cd_offset, cd_size));
                }
                fallback.get_or_insert((candidate, cd_offset, cd_size));
            }
            Err(e) => {
                debug!("Rejecting end-of-directory candidate at {}: {}", candidate, e);
                rejected.get_or_insert(e);
            }
        }
        if candidate == floor {
            break;
        }
        from = candidate - 1;
    }

    match (fallback, rejected) {
        (Some(found), _) => Ok(found),
        (None, Some(e)) => Err(e),
        (None, None) => Err(ArchiveError::EndOfDirectoryNotFound {
            scanned: start - floor + 1,
        }),
    }
}

/// Central directory (offset, size) declared by the EOCD at `eocd`
fn directory_at(cursor: &ByteCursor<'_>, eocd: usize) -> Result<(u64, u64), ArchiveError> {
    let entries = cursor.u16_at(eocd + 10)?;
    let cd_size = cursor.u32_at(eocd + 12)? as u64;
    let cd_offset = cursor.u32_at(eocd + 16)? as u64;

    if cd_offset + cd_size != eocd as u64 {
        return Err(ArchiveError::InvalidCentralDirectory { offset: cd_offset });
    }
    if cd_size == 0 {
        if entries != 0 {
            return Err(ArchiveError::InvalidCentralDirectory { offset: cd_offset });
        }
    } else if cursor.u32_at(cd_offset as usize)? != CENTRAL_DIRECTORY_SIGNATURE {
        return Err(ArchiveError::InvalidCentralDirectory { offset: cd_offset });
    }
    Ok((cd_offset, cd_size))
}

fn probe_signature_block(cursor: &ByteCursor<'_>, cd_offset: usize) -> Option<SignatureBlock> {
    let magic_offset = cd_offset.checked_sub(SIGNATURE_BLOCK_MAGIC.len())?;
    if cursor.peek(magic_offset, SIGNATURE_BLOCK_MAGIC.len()).ok()? != SIGNATURE_BLOCK_MAGIC {
        return None;
    }

    // Size field closest to the central directory
    let lower_size = cursor.u64_at(magic_offset.checked_sub(8)?).ok()?;
    let block_len = usize::try_from(lower_size).ok()?.checked_add(8)?;
    if block_len < 8 + 8 + SIGNATURE_BLOCK_MAGIC.len() {
        return None;
    }
    let block_offset = cd_offset.checked_sub(block_len)?;
    let upper_size = cursor.u64_at(block_offset).ok()?;

    if upper_size != lower_size {
        debug!(
            "Signature block size mismatch (lower {}, upper {}), ignoring",
            lower_size, upper_size
        );
        return None;
    }

    Some(SignatureBlock {
        offset: block_offset as u64,
        size: block_len as u64,
    })
}

/// Indexes package archives
pub struct ArchiveIndex;

impl ArchiveIndex {
    /// Map `path` read-only and index it.
    pub fn index<P: AsRef<Path>>(path: P) -> Result<PackageArchive, ArchiveError> {
        let path = std::path::absolute(path.as_ref())?;
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < END_OF_DIRECTORY_SIZE as u64 {
            return Err(ArchiveError::TooShort { len });
        }

        // SAFETY: the mapping is read-only and private to this handle. Package
        // archives are build outputs that are not rewritten while a deployment runs.
        let mmap = unsafe { Mmap::map(&file)? };
        PackageArchive::from_mapping(path, mmap)
    }
}

/// Immutable, memory-mapped view of one package archive
pub struct PackageArchive {
    path: PathBuf,
    mmap: Mmap,
    layout: ArchiveLayout,
    digest: String,
    entries: Vec<ArchiveEntry>,
    by_name: HashMap<String, usize>,
}

impl PackageArchive {
    fn from_mapping(path: PathBuf, mmap: Mmap) -> Result<Self, ArchiveError> {
        let layout = ArchiveLayout::locate(&mmap)?;
        let cursor = ByteCursor::new(&mmap);

        let directory = cursor.peek(
            layout.central_directory_offset as usize,
            layout.central_directory_size as usize,
        )?;
        let entries = directory::read_entries(directory)?;

        let digested = match layout.signature_block {
            Some(block) => cursor.peek(block.offset as usize, block.size as usize)?,
            None => directory,
        };
        let digest = hex_digest(digested);

        let by_name = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();

        debug!(
            "Indexed {:?}: {} entries, cd at {} ({} bytes), signed={}",
            path,
            entries.len(),
            layout.central_directory_offset,
            layout.central_directory_size,
            layout.signature_block.is_some()
        );

        Ok(PackageArchive {
            path,
            mmap,
            layout,
            digest,
            entries,
            by_name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component, used as the remote file name when pushing
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "package.apk".to_string())
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    pub fn central_directory_offset(&self) -> u64 {
        self.layout.central_directory_offset
    }

    pub fn central_directory_size(&self) -> u64 {
        self.layout.central_directory_size
    }

    pub fn signature_block(&self) -> Option<SignatureBlock> {
        self.layout.signature_block
    }

    /// SHA-256 (hex) over the signature block, or the central directory when unsigned
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Decompress and CRC-verify one entry
    pub fn read_entry(&self, entry: &ArchiveEntry) -> Result<Vec<u8>, ArchiveError> {
        directory::extract(&self.mmap, entry)
    }

    /// The whole archive as mapped
    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}

impl std::fmt::Debug for PackageArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageArchive")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("digest", &self.digest)
            .field("entries", &self.entries.len())
            .finish()
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eocd(cd_offset: u32, cd_size: u32, comment: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&END_OF_DIRECTORY_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        out.extend_from_slice(comment);
        out
    }

    #[test]
    fn test_empty_archive() {
        let bytes = eocd(0, 0, b"");
        let layout = ArchiveLayout::locate(&bytes).unwrap();
        assert_eq!(layout.central_directory_offset, 0);
        assert_eq!(layout.central_directory_size, 0);
        assert!(layout.signature_block.is_none());
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            ArchiveLayout::locate(&[0u8; 10]),
            Err(ArchiveError::TooShort { len: 10 })
        ));
    }

    #[test]
    fn test_no_end_of_directory() {
        assert!(matches!(
            ArchiveLayout::locate(&[0u8; 100]),
            Err(ArchiveError::EndOfDirectoryNotFound { .. })
        ));
    }

    #[test]
    fn test_comment_containing_signature() {
        // Comment embeds a fake EOCD signature; the comment-length check rejects it
        let mut comment = vec![0u8; 40];
        comment[4..8].copy_from_slice(&END_OF_DIRECTORY_SIGNATURE.to_le_bytes());
        let bytes = eocd(0, 0, &comment);
        let layout = ArchiveLayout::locate(&bytes).unwrap();
        assert_eq!(layout.end_of_directory_offset, 0);
    }

    #[test]
    fn test_trailing_lookalike_record_is_skipped() {
        let mut bytes = eocd(0, 0, b"");
        bytes.extend(eocd(0, 0, b""));
        bytes.extend_from_slice(b"junk");
        let layout = ArchiveLayout::locate(&bytes).unwrap();
        assert_eq!(layout.end_of_directory_offset, 0);
    }

    #[test]
    fn test_declared_entries_need_a_directory() {
        let mut bytes = eocd(0, 0, b"");
        bytes[10] = 3;
        assert!(matches!(
            ArchiveLayout::locate(&bytes),
            Err(ArchiveError::InvalidCentralDirectory { offset: 0 })
        ));
    }

    #[test]
    fn test_directory_past_eocd_rejected() {
        let bytes = eocd(4, 100, b"");
        assert!(matches!(
            ArchiveLayout::locate(&bytes),
            Err(ArchiveError::InvalidCentralDirectory { offset: 4 })
        ));
    }

    #[test]
    fn test_signature_block_sizes_must_agree() {
        let payload = [7u8; 12];
        let size = (payload.len() + 8 + SIGNATURE_BLOCK_MAGIC.len()) as u64;

        let mut good = Vec::new();
        good.extend_from_slice(&size.to_le_bytes());
        good.extend_from_slice(&payload);
        good.extend_from_slice(&size.to_le_bytes());
        good.extend_from_slice(SIGNATURE_BLOCK_MAGIC);
        let cd = good.len() as u32;
        good.extend(eocd(cd, 0, b""));

        let layout = ArchiveLayout::locate(&good).unwrap();
        assert_eq!(
            layout.signature_block,
            Some(SignatureBlock {
                offset: 0,
                size: size + 8
            })
        );

        let mut bad = good.clone();
        bad[0] ^= 0xFF;
        let layout = ArchiveLayout::locate(&bad).unwrap();
        assert!(layout.signature_block.is_none());
    }
}
