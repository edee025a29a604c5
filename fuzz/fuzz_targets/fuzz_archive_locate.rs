#![no_main]
use deltadeploy::core::archive::ArchiveLayout;
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must never panic the layout scan or the directory walk
fuzz_target!(|data: &[u8]| {
    let Ok(layout) = ArchiveLayout::locate(data) else {
        return;
    };
    assert!(layout.central_directory_offset <= data.len() as u64);

    let path = std::env::temp_dir().join(format!("fuzz-locate-{}.apk", std::process::id()));
    if std::fs::write(&path, data).is_ok() {
        if let Ok(archive) = deltadeploy::ArchiveIndex::index(&path) {
            for entry in archive.entries() {
                let _ = archive.read_entry(entry);
            }
        }
        std::fs::remove_file(&path).ok();
    }
});
