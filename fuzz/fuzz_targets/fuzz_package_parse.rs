#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Write;
use tempfile::Builder;
use update_pkg::{MemoryStream, PackageManager};

// The first byte picks the container format
const SUFFIXES: [&str; 4] = [".bin", ".zip", ".gz", ".lz4"];

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let suffix = SUFFIXES[data[0] as usize % SUFFIXES.len()];

    let mut temp_file = match Builder::new().suffix(suffix).tempfile() {
        Ok(f) => f,
        Err(_) => return,
    };
    if temp_file.write_all(&data[1..]).is_err() || temp_file.flush().is_err() {
        return;
    }

    // Parsing must never panic, whatever the bytes
    let mut manager = PackageManager::default();
    let ids = match manager.load_package_without_unpack(temp_file.path()) {
        Ok(ids) => ids,
        Err(_) => return,
    };

    for id in &ids {
        let _ = manager.file_info(id);
        let mut output = MemoryStream::growable(id.clone());
        let _ = manager.extract_file(id, &mut output);
    }
    let _ = manager.package_info(temp_file.path());
    let _ = manager.clear_packages();
});
