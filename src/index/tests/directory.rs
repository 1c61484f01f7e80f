use std::sync::Arc;

use crate::archive_path::concat;
use crate::index::{DirectoryIndex, INDEX_DATASET_NAME, INDEX_NAMES_DATASET_NAME};
use crate::link::{LinkRecord, NewEntry};
use crate::storage::{MemoryStorage, ObjectType, Storage};

fn file_record(name: &str, size: i64, crc32: u32) -> LinkRecord {
    LinkRecord::from_discovery(name, ObjectType::Dataset, None).with_size_and_crc32(size, crc32)
}

#[test]
fn test_missing_datasets_synthesize_empty_index() {
    let storage = MemoryStorage::new();
    storage.create_group("/fresh", None).unwrap();
    let index = DirectoryIndex::load(&storage, "/fresh", false).unwrap();
    assert!(index.is_empty());
    assert!(!index.is_dirty());
}

#[test]
fn test_update_flush_reload_roundtrip() {
    let storage = MemoryStorage::new();
    let mut index = DirectoryIndex::load(&storage, "/", false).unwrap();
    index.update_index(file_record("b.txt", 5, 0x11111111));
    index.update_index(LinkRecord::directory("sub"));
    index.update_index(file_record("a.txt", 9, 0x22222222));
    assert!(index.is_dirty());
    index.flush(&storage).unwrap();
    assert!(!index.is_dirty());

    let reloaded = DirectoryIndex::load(&storage, "/", false).unwrap();
    assert_eq!(reloaded.len(), 3);
    let names: Vec<&str> = reloaded.records().iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["sub", "a.txt", "b.txt"]);
    let a = reloaded.try_get_link("a.txt").expect("a.txt missing");
    assert_eq!(a.size(), 9);
    assert_eq!(a.crc32(), 0x22222222);
    assert!(reloaded.is_directory("sub"));
}

#[test]
fn test_names_blob_binds_by_running_offset() {
    let storage = MemoryStorage::new();
    let mut index = DirectoryIndex::load(&storage, "/", false).unwrap();
    index.update_index(file_record("aa", 1, 1));
    index.update_index(file_record("bbbb", 2, 2));
    index.update_index(file_record("c", 3, 3));
    index.flush(&storage).unwrap();

    // Canonical order is lexicographic here (no directories): aa, bbbb, c.
    let names = storage.read_dataset(&concat("/", INDEX_NAMES_DATASET_NAME)).unwrap();
    assert_eq!(names, b"aabbbbc");
    let compound = storage.read_dataset(&concat("/", INDEX_DATASET_NAME)).unwrap();
    assert_eq!(compound.len(), 3 * crate::index::compound::RECORD_SIZE);
}

#[test]
fn test_flush_is_idempotent_and_lazy() {
    let storage = MemoryStorage::new();
    let mut index = DirectoryIndex::load(&storage, "/", false).unwrap();

    // Clean index never touched disk: no datasets appear.
    index.flush(&storage).unwrap();
    assert_eq!(storage.object_type(&concat("/", INDEX_DATASET_NAME)).unwrap(), None);

    index.update_index(file_record("x", 1, 1));
    index.flush(&storage).unwrap();
    let first = storage.read_dataset(&concat("/", INDEX_DATASET_NAME)).unwrap();

    // Second flush with no mutation in between is a no-op.
    index.flush(&storage).unwrap();
    let second = storage.read_dataset(&concat("/", INDEX_DATASET_NAME)).unwrap();
    assert_eq!(first, second);
    assert!(!index.is_dirty());
}

#[test]
fn test_bulk_replace_drops_missing_and_keeps_last_duplicate() {
    let storage = MemoryStorage::new();
    let mut index = DirectoryIndex::load(&storage, "/", false).unwrap();
    index.update_index(file_record("old", 1, 1));

    index.update_index_bulk(vec![
        file_record("kept", 2, 2),
        file_record("dup", 3, 3),
        file_record("dup", 4, 4),
    ]);
    assert!(!index.exists("old"));
    assert_eq!(index.len(), 2);
    assert_eq!(index.try_get_link("dup").expect("dup missing").size(), 4);
}

#[test]
fn test_remove() {
    let storage = MemoryStorage::new();
    let mut index = DirectoryIndex::load(&storage, "/", false).unwrap();
    index.update_index(file_record("x", 1, 1));
    index.flush(&storage).unwrap();

    assert!(!index.remove("absent"));
    assert!(!index.is_dirty());
    assert!(index.remove("x"));
    assert!(index.is_dirty());
}

#[test]
fn test_try_get_file_link_excludes_directories() {
    let storage = MemoryStorage::new();
    let mut index = DirectoryIndex::load(&storage, "/", false).unwrap();
    index.update_index(LinkRecord::directory("d"));
    index.update_index(file_record("f", 1, 1));
    index.update_index(LinkRecord::from_new_entry(NewEntry::symlink("l", "f")));

    assert!(index.try_get_file_link("d").is_none());
    assert!(index.try_get_file_link("f").is_some());
    assert!(index.try_get_file_link("l").is_some());
}

#[test]
fn test_symlink_target_resolution_on_load() {
    let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
    storage.create_soft_link("/link", "some/target").unwrap();
    let mut index = DirectoryIndex::load(storage.as_ref(), "/", false).unwrap();
    index.update_index(LinkRecord::from_new_entry(NewEntry::symlink("link", "some/target")));
    index.flush(storage.as_ref()).unwrap();

    let plain = DirectoryIndex::load(storage.as_ref(), "/", false).unwrap();
    assert_eq!(plain.try_get_link("link").unwrap().link_target(), None);

    let resolved = DirectoryIndex::load(storage.as_ref(), "/", true).unwrap();
    assert_eq!(resolved.try_get_link("link").unwrap().link_target(), Some("some/target"));
}
