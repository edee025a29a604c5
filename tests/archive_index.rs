//! Archive indexing against real zip bytes

mod common;

use common::ZipBuilder;
use deltadeploy::core::archive::ArchiveLayout;
use deltadeploy::{ArchiveError, ArchiveIndex};
use proptest::prelude::*;
use tempfile::TempDir;

fn sample() -> ZipBuilder {
    ZipBuilder::new()
        .stored("AndroidManifest.xml", b"<manifest/>")
        .deflated("classes.units", &b"compressible ".repeat(64))
        .stored("res/layout/main.xml", b"<layout/>")
}

#[test]
fn test_index_lists_entries() {
    let dir = TempDir::new().unwrap();
    let path = sample().write_to(dir.path(), "base.apk");

    let archive = ArchiveIndex::index(&path).unwrap();
    let names: Vec<_> = archive.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["AndroidManifest.xml", "classes.units", "res/layout/main.xml"]
    );
    assert!(archive.path().is_absolute());
    assert_eq!(archive.file_name(), "base.apk");
    assert!(archive.signature_block().is_none());
    assert_eq!(archive.digest().len(), 64);
}

#[test]
fn test_read_stored_and_deflated() {
    let dir = TempDir::new().unwrap();
    let path = sample().write_to(dir.path(), "base.apk");
    let archive = ArchiveIndex::index(&path).unwrap();

    let manifest = archive.entry("AndroidManifest.xml").unwrap();
    assert_eq!(archive.read_entry(manifest).unwrap(), b"<manifest/>");

    let code = archive.entry("classes.units").unwrap();
    assert_eq!(code.method, 8);
    assert!(code.compressed_size < code.uncompressed_size);
    assert_eq!(archive.read_entry(code).unwrap(), b"compressible ".repeat(64));
}

#[test]
fn test_located_offsets_match_builder() {
    let (bytes, layout) = sample().signed(b"certificate chain").build_with_layout();
    let located = ArchiveLayout::locate(&bytes).unwrap();

    assert_eq!(located.central_directory_offset, layout.central_directory_offset);
    assert_eq!(located.central_directory_size, layout.central_directory_size);
    let block = located.signature_block.unwrap();
    assert_eq!(Some((block.offset, block.size)), layout.signature_block);
}

#[test]
fn test_digest_follows_signature_block() {
    let dir = TempDir::new().unwrap();
    let signed = sample().signed(b"cert-a");
    let a = ArchiveIndex::index(signed.write_to(dir.path(), "a.apk")).unwrap();
    let b = ArchiveIndex::index(signed.write_to(dir.path(), "b.apk")).unwrap();
    assert_eq!(a.digest(), b.digest());

    // Same entries, different signature: different digest
    let resigned = sample().signed(b"cert-b");
    let c = ArchiveIndex::index(resigned.write_to(dir.path(), "c.apk")).unwrap();
    assert_ne!(a.digest(), c.digest());

    // Unsigned: digest over the central directory, so content changes show up
    let plain = ArchiveIndex::index(sample().write_to(dir.path(), "d.apk")).unwrap();
    let changed = ArchiveIndex::index(
        sample()
            .stored("extra.txt", b"x")
            .write_to(dir.path(), "e.apk"),
    )
    .unwrap();
    assert_ne!(plain.digest(), changed.digest());
}

#[test]
fn test_corrupt_entry_fails_crc() {
    let dir = TempDir::new().unwrap();
    let mut bytes = ZipBuilder::new().stored("data.bin", b"0123456789").build();
    // Local header (30) + name (8) puts the payload at 38
    bytes[40] ^= 0xFF;
    let path = dir.path().join("bad.apk");
    std::fs::write(&path, bytes).unwrap();

    let archive = ArchiveIndex::index(&path).unwrap();
    let entry = archive.entry("data.bin").unwrap();
    assert!(matches!(
        archive.read_entry(entry),
        Err(ArchiveError::CrcMismatch { .. })
    ));
}

#[test]
fn test_malformed_files() {
    let dir = TempDir::new().unwrap();

    let tiny = dir.path().join("tiny.apk");
    std::fs::write(&tiny, b"PK").unwrap();
    assert!(matches!(
        ArchiveIndex::index(&tiny),
        Err(ArchiveError::TooShort { len: 2 })
    ));

    let noise = dir.path().join("noise.apk");
    std::fs::write(&noise, vec![0xAAu8; 4096]).unwrap();
    assert!(matches!(
        ArchiveIndex::index(&noise),
        Err(ArchiveError::EndOfDirectoryNotFound { .. })
    ));

    assert!(matches!(
        ArchiveIndex::index(dir.path().join("missing.apk")),
        Err(ArchiveError::Io(_))
    ));
}

#[test]
fn test_truncated_signature_block_is_ignored() {
    let (mut bytes, layout) = sample().signed(b"certificate").build_with_layout();
    let (offset, _) = layout.signature_block.unwrap();
    // Corrupt the upper size field only
    bytes[offset as usize] ^= 0x01;

    let located = ArchiveLayout::locate(&bytes).unwrap();
    assert!(located.signature_block.is_none());
    assert_eq!(located.central_directory_offset, layout.central_directory_offset);
}

#[test]
fn test_trailing_lookalike_record_does_not_move_directory() {
    let dir = TempDir::new().unwrap();
    let (mut bytes, layout) = sample().build_with_layout();
    // Trailing garbage holding a zeroed end-of-directory lookalike
    bytes.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 18]);
    bytes.extend_from_slice(b"junk");

    let located = ArchiveLayout::locate(&bytes).unwrap();
    assert_eq!(located.central_directory_offset, layout.central_directory_offset);
    assert_eq!(located.central_directory_size, layout.central_directory_size);

    let path = dir.path().join("trailing.apk");
    std::fs::write(&path, &bytes).unwrap();
    let archive = ArchiveIndex::index(&path).unwrap();
    assert_eq!(archive.entries().len(), 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_comment_length_does_not_move_directory(
        comment_len in prop_oneof![0usize..512, 65_000usize..=65_535],
        fill in any::<u8>(),
        signed in any::<bool>(),
    ) {
        let mut builder = sample().comment(&vec![fill; comment_len]);
        if signed {
            builder = builder.signed(b"sig");
        }
        let (bytes, layout) = builder.build_with_layout();
        let located = ArchiveLayout::locate(&bytes).unwrap();

        prop_assert_eq!(located.central_directory_offset, layout.central_directory_offset);
        prop_assert_eq!(located.central_directory_size, layout.central_directory_size);
        prop_assert_eq!(located.signature_block.is_some(), signed);
    }

    #[test]
    fn prop_locate_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = ArchiveLayout::locate(&bytes);
    }
}
