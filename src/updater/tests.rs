#![cfg(test)]

use std::io::{Cursor, Write};
use std::sync::Arc;

use crate::errors::RethrowStrategy;
use crate::index::provider::{lock, IndexProvider};
use crate::link::{LinkRecord, NewEntry};
use crate::storage::{DatasetLayout, MemoryStorage, ObjectType, Storage};
use crate::strategy::ArchivingStrategy;

use super::{Updater, SMALL_DATASET_LIMIT};

fn updater_with(strategy: ArchivingStrategy) -> (Arc<MemoryStorage>, Arc<IndexProvider>, Updater) {
    let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
    let provider = Arc::new(IndexProvider::new(
        storage.clone(),
        Arc::new(RethrowStrategy),
    ));
    let updater = Updater::new(storage.clone(), provider.clone(), strategy);
    (storage, provider, updater)
}

fn updater() -> (Arc<MemoryStorage>, Arc<IndexProvider>, Updater) {
    updater_with(ArchivingStrategy::default())
}

fn layout_of(storage: &MemoryStorage, path: &str) -> DatasetLayout {
    storage.dataset_info(path).expect("dataset missing").layout
}

#[test]
fn test_small_file_becomes_contiguous() {
    let (storage, _provider, updater) = updater();
    let mut input = Cursor::new(b"hello".to_vec());
    updater
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("a.txt")), Some(&mut input))
        .unwrap();

    assert_eq!(layout_of(&storage, "/a.txt"), DatasetLayout::Contiguous);
    assert_eq!(storage.read_dataset("/a.txt").unwrap(), b"hello");
}

#[test]
fn test_small_file_crc_and_size_recorded() {
    let (_storage, provider, updater) = updater();
    let mut input = Cursor::new(b"hello".to_vec());
    updater
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("a.txt")), Some(&mut input))
        .unwrap();

    let index = provider.get("/", false).unwrap();
    let guard = lock(&index);
    let record = guard.try_get_link("a.txt").expect("a.txt missing");
    assert_eq!(record.size(), 5);
    assert_eq!(record.crc32(), 0x3610A686);
}

#[test]
fn test_small_dataset_limit_is_inclusive() {
    let (storage, _provider, updater) = updater();
    let zeros = vec![0u8; SMALL_DATASET_LIMIT as usize];
    let mut input = Cursor::new(zeros);
    updater
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("b.bin")), Some(&mut input))
        .unwrap();
    assert_eq!(layout_of(&storage, "/b.bin"), DatasetLayout::Contiguous);
}

#[test]
fn test_medium_compressed_file_stays_chunked() {
    let (storage, _provider, updater) = updater();
    let data = vec![7u8; SMALL_DATASET_LIMIT as usize + 1];
    let mut input = Cursor::new(data);
    updater
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("c.bin")), Some(&mut input))
        .unwrap();
    assert!(matches!(layout_of(&storage, "/c.bin"), DatasetLayout::Chunked { .. }));
}

#[test]
fn test_medium_uncompressed_file_becomes_contiguous() {
    let strategy = ArchivingStrategy { compress: false, ..Default::default() };
    let (storage, _provider, updater) = updater_with(strategy);
    let data = vec![7u8; SMALL_DATASET_LIMIT as usize + 1];
    let mut input = Cursor::new(data);
    updater
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("c.bin")), Some(&mut input))
        .unwrap();
    assert_eq!(layout_of(&storage, "/c.bin"), DatasetLayout::Contiguous);
}

#[test]
fn test_multi_chunk_streaming() {
    let strategy = ArchivingStrategy { chunk_size: 8, ..Default::default() };
    let (storage, provider, updater) = updater_with(strategy);
    let data: Vec<u8> = (0..20u8).collect();
    let mut input = Cursor::new(data.clone());
    updater
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("big")), Some(&mut input))
        .unwrap();

    assert_eq!(layout_of(&storage, "/big"), DatasetLayout::Chunked { chunk_size: 8 });
    assert_eq!(storage.read_dataset("/big").unwrap(), data);

    let mut expected = crc32fast::Hasher::new();
    expected.update(&data);
    let index = provider.get("/", false).unwrap();
    let guard = lock(&index);
    let record = guard.try_get_link("big").expect("big missing");
    assert_eq!(record.size(), 20);
    assert_eq!(record.crc32(), expected.finalize());
}

#[test]
fn test_file_entry_requires_input() {
    let (_storage, _provider, updater) = updater();
    let result =
        updater.archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("f")), None);
    assert!(matches!(result, Err(crate::errors::ArchiveError::IllegalState(_))));
}

#[test]
fn test_directory_entry_creates_group() {
    let (storage, provider, updater) = updater();
    updater
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::directory("d")), None)
        .unwrap();
    assert_eq!(storage.object_type("/d").unwrap(), Some(ObjectType::Group));
    let index = provider.get("/", false).unwrap();
    assert!(lock(&index).is_directory("d"));
}

#[test]
fn test_symlink_entry_creates_soft_link() {
    let (storage, provider, updater) = updater();
    updater
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::symlink("l", "a.txt")), None)
        .unwrap();
    assert_eq!(storage.read_soft_link("/l").unwrap(), Some("a.txt".to_owned()));
    let index = provider.get("/", false).unwrap();
    assert!(lock(&index).try_get_file_link("l").is_some());
}

#[test]
fn test_entry_in_nested_directory_propagates_ancestors() {
    let (storage, provider, updater) = updater();
    let mut input = Cursor::new(b"abcd".to_vec());
    updater
        .archive_entry("/a/b", LinkRecord::from_new_entry(NewEntry::file("c")), Some(&mut input))
        .unwrap();

    assert_eq!(storage.object_type("/a").unwrap(), Some(ObjectType::Group));
    assert_eq!(storage.object_type("/a/b").unwrap(), Some(ObjectType::Group));

    let parent = provider.get("/a/b", false).unwrap();
    assert_eq!(lock(&parent).try_get_link("c").expect("c missing").size(), 4);
    let root = provider.get("/", false).unwrap();
    assert!(lock(&root).is_directory("a"));
}

#[test]
fn test_streaming_writer_records_size_and_crc_on_close() {
    let (_storage, provider, updater) = updater();
    let mut writer = updater
        .archive_file("/", LinkRecord::from_new_entry(NewEntry::file("log")))
        .unwrap();
    writer.write_all(b"abcdef").unwrap();
    writer.write_all(b"ghij").unwrap();
    writer.close().unwrap();

    let mut expected = crc32fast::Hasher::new();
    expected.update(b"abcdefghij");
    let index = provider.get("/", false).unwrap();
    let guard = lock(&index);
    let record = guard.try_get_link("log").expect("log missing");
    assert_eq!(record.size(), 10);
    assert_eq!(record.crc32(), expected.finalize());
}

#[test]
fn test_index_flush_drives_open_writers_first() {
    let (storage, provider, updater) = updater();
    let mut writer = updater
        .archive_file("/", LinkRecord::from_new_entry(NewEntry::file("stream")))
        .unwrap();
    writer.write_all(b"partial").unwrap();

    // Flush the root index while the writer is still open: the persisted
    // compound must already carry the running size and checksum.
    let index = provider.get("/", false).unwrap();
    lock(&index).update_index(LinkRecord::directory("unrelated"));
    provider.flush_index(&index).unwrap();

    let reloaded =
        crate::index::DirectoryIndex::load(storage.as_ref(), "/", false).unwrap();
    let record = reloaded.try_get_link("stream").expect("stream missing from flushed index");
    assert_eq!(record.size(), 7);
    let mut expected = crc32fast::Hasher::new();
    expected.update(b"partial");
    assert_eq!(record.crc32(), expected.finalize());

    writer.close().unwrap();
}

#[test]
fn test_closed_writer_deregisters() {
    let (_storage, provider, updater) = updater();
    let writer = updater
        .archive_file("/", LinkRecord::from_new_entry(NewEntry::file("w")))
        .unwrap();
    let index = provider.get("/", false).unwrap();
    assert_eq!(lock(&index).live_flushables().len(), 1);
    writer.close().unwrap();
    assert_eq!(lock(&index).live_flushables().len(), 0);
}
