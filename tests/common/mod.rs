//! Shared fixtures for the archiver integration tests.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use h5ar::storage::MemoryStorage;
use h5ar::Archiver;

/// CRC32 of `data`, as stored in archive indices.
pub fn crc32_of(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// A fresh writable archive over in-memory storage.
pub fn memory_archive() -> (Arc<MemoryStorage>, Archiver) {
    let storage = Arc::new(MemoryStorage::new());
    let archiver = Archiver::open(storage.clone());
    (storage, archiver)
}

/// Creates the standard fixture tree:
///
/// ```text
/// <root>/a.txt      5 bytes "hello"
/// <root>/sub/b.bin  4096 zero bytes
/// ```
pub fn fixture_tree() -> TempDir {
    let dir = tempfile::tempdir().expect("cannot create tempdir");
    write_file(&dir.path().join("a.txt"), b"hello");
    fs::create_dir(dir.path().join("sub")).expect("cannot create subdir");
    write_file(&dir.path().join("sub/b.bin"), &[0u8; 4096]);
    dir
}

pub fn write_file(path: &Path, contents: &[u8]) {
    fs::write(path, contents).expect("cannot write fixture file");
}
