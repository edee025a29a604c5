#![no_main]
use deltadeploy::{ArchiveEntry, BundleSplitter};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let entry = ArchiveEntry {
        name: "classes.units".to_string(),
        crc32: crc32fast::hash(data),
        compressed_size: data.len() as u64,
        uncompressed_size: data.len() as u64,
        method: 0,
        local_header_offset: 0,
    };
    let _ = BundleSplitter::decode(&entry, data);
});

