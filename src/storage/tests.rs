#![cfg(test)]

use tempfile::tempdir;

use super::{DatasetLayout, Error, GroupAttributes, MemoryStorage, ObjectType, Storage};

#[test]
fn test_root_group_exists() {
    let storage = MemoryStorage::new();
    assert_eq!(storage.object_type("/").unwrap(), Some(ObjectType::Group));
    assert_eq!(storage.object_type("/nope").unwrap(), None);
}

#[test]
fn test_group_creation_requires_parent() {
    let storage = MemoryStorage::new();
    assert!(matches!(storage.create_group("/a/b", None), Err(Error::NodeNotFound(_))));
    storage.create_group("/a", None).unwrap();
    storage.create_group("/a/b", Some(64)).unwrap();
    assert_eq!(storage.list_children("/a").unwrap(), vec!["b".to_owned()]);
}

#[test]
fn test_chunked_dataset_extends_on_write() {
    let storage = MemoryStorage::new();
    storage
        .create_opaque_dataset("/d", "FILE", DatasetLayout::Chunked { chunk_size: 4 }, 0, false)
        .unwrap();
    storage.write_block("/d", b"abcdef", 0).unwrap();
    storage.write_block("/d", b"xy", 10).unwrap();
    let info = storage.dataset_info("/d").unwrap();
    assert_eq!(info.size, 12);
    let bytes = storage.read_dataset("/d").unwrap();
    assert_eq!(&bytes[..6], b"abcdef");
    assert_eq!(&bytes[6..10], &[0, 0, 0, 0]);
    assert_eq!(&bytes[10..], b"xy");
}

#[test]
fn test_contiguous_dataset_is_fixed() {
    let storage = MemoryStorage::new();
    storage
        .create_opaque_dataset("/d", "FILE", DatasetLayout::Contiguous, 4, false)
        .unwrap();
    storage.write_block("/d", b"abcd", 0).unwrap();
    assert!(matches!(storage.write_block("/d", b"e", 4), Err(Error::NotExtendable(_))));
    assert!(matches!(storage.set_dataset_size("/d", 8), Err(Error::NotExtendable(_))));
}

#[test]
fn test_read_block_past_end() {
    let storage = MemoryStorage::new();
    storage
        .create_opaque_dataset("/d", "FILE", DatasetLayout::Chunked { chunk_size: 4 }, 0, false)
        .unwrap();
    storage.write_block("/d", b"abc", 0).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(storage.read_block("/d", &mut buf, 0).unwrap(), 3);
    assert_eq!(storage.read_block("/d", &mut buf, 3).unwrap(), 0);
}

#[test]
fn test_delete_removes_subtree() {
    let storage = MemoryStorage::new();
    storage.create_group("/a", None).unwrap();
    storage.create_group("/a/b", None).unwrap();
    storage.write_dataset("/a/b/data", b"x").unwrap();
    storage.delete("/a").unwrap();
    assert_eq!(storage.object_type("/a").unwrap(), None);
    assert_eq!(storage.object_type("/a/b/data").unwrap(), None);
    assert_eq!(storage.node_count(), 1);
}

#[test]
fn test_soft_links() {
    let storage = MemoryStorage::new();
    storage.create_soft_link("/l", "target").unwrap();
    assert_eq!(storage.read_soft_link("/l").unwrap(), Some("target".to_owned()));
    storage.write_dataset("/d", b"x").unwrap();
    assert_eq!(storage.read_soft_link("/d").unwrap(), None);
    assert!(matches!(storage.read_soft_link("/nope"), Err(Error::NodeNotFound(_))));
}

#[test]
fn test_persistence_roundtrip() {
    let dir = tempdir().expect("cannot create tempdir");
    let file = dir.path().join("container.h5ar");

    let storage = MemoryStorage::open_path(&file).unwrap();
    storage.create_group("/sub", Some(120)).unwrap();
    storage
        .create_opaque_dataset("/sub/data", "FILE", DatasetLayout::Chunked { chunk_size: 8 }, 0, true)
        .unwrap();
    storage.write_block("/sub/data", b"compressible compressible", 0).unwrap();
    storage.create_soft_link("/link", "sub/data").unwrap();
    storage
        .set_group_attributes(
            "/",
            GroupAttributes { last_modified: 1000, uid: 42, gid: 7, permissions: 0o755 },
        )
        .unwrap();
    storage.flush().unwrap();

    let reloaded = MemoryStorage::load_from(&file).unwrap();
    assert_eq!(reloaded.read_dataset("/sub/data").unwrap(), b"compressible compressible");
    assert_eq!(reloaded.read_soft_link("/link").unwrap(), Some("sub/data".to_owned()));
    let attrs = reloaded.group_attributes("/").unwrap().expect("root attrs missing");
    assert_eq!(attrs.uid, 42);
    assert_eq!(attrs.permissions, 0o755);
    let info = reloaded.dataset_info("/sub/data").unwrap();
    assert!(info.compressed);
    assert_eq!(info.layout, DatasetLayout::Chunked { chunk_size: 8 });
}
