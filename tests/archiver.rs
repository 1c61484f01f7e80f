//! End-to-end archiver scenarios over the bundled memory storage.

mod common;

use std::fs;
use std::io::Write;
use std::sync::Arc;

use common::{crc32_of, fixture_tree, memory_archive, write_file};

use h5ar::storage::{DatasetLayout, MemoryStorage, ObjectType, Storage};
use h5ar::{
    ArchiveInfo, ArchiveReader, ArchiveWriter, ArchiveError, Archiver, ArchivingStrategy,
    FileLinkType, NewEntry, LinkRecord, RethrowStrategy,
};

#[test]
fn test_archive_then_list() {
    let (storage, archiver) = memory_archive();
    let tree = fixture_tree();
    archiver.archive_below("/", tree.path(), None).unwrap();

    let entries = archiver.list("/", false).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["sub", "a.txt"]);

    let a = entries.iter().find(|e| e.name == "a.txt").expect("a.txt missing");
    assert_eq!(a.link_type, FileLinkType::RegularFile);
    assert_eq!(a.size, 5);
    assert_eq!(a.crc32, 0x3610A686);
    let sub = entries.iter().find(|e| e.name == "sub").expect("sub missing");
    assert_eq!(sub.link_type, FileLinkType::Directory);

    let inside = archiver.list("/sub", false).unwrap();
    assert_eq!(inside.len(), 1);
    assert_eq!(inside[0].name, "b.bin");
    assert_eq!(inside[0].size, 4096);
    assert_eq!(inside[0].crc32, crc32_of(&[0u8; 4096]));

    // Exactly at the small-dataset limit: stored CONTIGUOUS.
    assert_eq!(
        storage.dataset_info("/sub/b.bin").unwrap().layout,
        DatasetLayout::Contiguous
    );
}

#[test]
fn test_roundtrip_extract_restores_bytes() {
    let (_storage, archiver) = memory_archive();
    let tree = fixture_tree();
    write_file(&tree.path().join("sub/c.bin"), &(0..=255u8).cycle().take(9000).collect::<Vec<u8>>());
    archiver.archive_below("/", tree.path(), None).unwrap();

    let dest = tempfile::tempdir().expect("cannot create tempdir");
    let entries = archiver.extract("/", dest.path(), true).unwrap();
    assert!(entries.iter().all(|e| e.is_ok()), "extraction reported failures");

    assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"hello");
    assert_eq!(fs::read(dest.path().join("sub/b.bin")).unwrap(), vec![0u8; 4096]);
    let original = fs::read(tree.path().join("sub/c.bin")).unwrap();
    assert_eq!(fs::read(dest.path().join("sub/c.bin")).unwrap(), original);
}

#[test]
fn test_stream_then_flush() {
    let (_storage, archiver) = memory_archive();
    let mut writer = archiver
        .archive_file("/", LinkRecord::from_new_entry(NewEntry::file("log")))
        .unwrap();
    writer.write_all(b"abcdef").unwrap();
    writer.write_all(b"ghij").unwrap();
    writer.close().unwrap();

    let entry = archiver.try_get_entry("/log", false).unwrap().expect("log missing");
    assert_eq!(entry.size, 10);
    assert_eq!(entry.crc32, crc32_of(b"abcdefghij"));
}

#[test]
fn test_ancestor_consistency_after_nested_write() {
    let (_storage, archiver) = memory_archive();
    let mut input = std::io::Cursor::new(b"payload".to_vec());
    archiver
        .archive_entry("/a/b", LinkRecord::from_new_entry(NewEntry::file("c")), Some(&mut input))
        .unwrap();

    let c = archiver.try_get_entry("/a/b/c", false).unwrap().expect("c missing");
    assert_eq!(c.crc32, crc32_of(b"payload"));
    let a = archiver.try_get_entry("/a", false).unwrap().expect("a missing");
    assert_eq!(a.link_type, FileLinkType::Directory);
}

#[test]
fn test_delete_subtree() {
    let (storage, archiver) = memory_archive();
    let tree = tempfile::tempdir().expect("cannot create tempdir");
    fs::create_dir_all(tree.path().join("d/e")).unwrap();
    write_file(&tree.path().join("d/e/f.txt"), b"doomed");
    write_file(&tree.path().join("keep.txt"), b"kept");
    archiver.archive_below("/", tree.path(), None).unwrap();
    archiver.flush().unwrap();

    // f.txt + keep.txt + index pairs for /, /d and /d/e.
    let before = storage.dataset_count();
    assert_eq!(before, 8);

    archiver.delete(&["/d".to_owned()], None).unwrap();
    archiver.flush().unwrap();

    assert!(!archiver.exists("/d").unwrap());
    assert!(!archiver.exists("/d/e/f.txt").unwrap());
    assert!(archiver.exists("/keep.txt").unwrap());
    assert_eq!(storage.object_type("/d").unwrap(), None);
    assert_eq!(storage.object_type("/d/e/f.txt").unwrap(), None);

    // Gone: f.txt plus the index pairs of /d and /d/e.
    assert_eq!(storage.dataset_count(), before - 5);
}

#[test]
fn test_unknown_delete_path_warns_but_continues() {
    let (_storage, archiver) = memory_archive();
    let tree = fixture_tree();
    archiver.archive_below("/", tree.path(), None).unwrap();

    let mut seen = Vec::new();
    let mut visit = |path: &str| seen.push(path.to_owned());
    archiver
        .delete(&["/nope".to_owned(), "/a.txt".to_owned()], Some(&mut visit))
        .unwrap();
    assert_eq!(seen, vec!["/a.txt".to_owned()]);
    assert!(!archiver.exists("/a.txt").unwrap());
}

#[test]
fn test_corruption_detected_by_test() {
    let (_storage, archiver) = memory_archive();
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let mut input = std::io::Cursor::new(payload);
    archiver
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("a.txt")), Some(&mut input))
        .unwrap();

    // Flip one byte through the random-access adapter without touching the
    // stored checksum.
    {
        let mut file = archiver.open_random_access("/a.txt", Some(256)).unwrap();
        use std::io::{Read, Seek, SeekFrom};
        file.seek(SeekFrom::Start(500)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(500)).unwrap();
        std::io::Write::write_all(&mut file, &[byte[0] ^ 0xFF]).unwrap();
    }

    let entries = archiver.test(true).unwrap();
    let a = entries.iter().find(|e| e.path == "/a.txt").expect("a.txt missing");
    assert!(!a.is_ok());
    assert_ne!(a.verified_crc32, Some(a.crc32));
}

#[test]
fn test_non_recursive_walks_stop_at_top_level() {
    let (_storage, archiver) = memory_archive();
    let tree = fixture_tree();
    archiver.archive_below("/", tree.path(), None).unwrap();

    // Corrupt the nested file only.
    {
        let mut file = archiver.open_random_access("/sub/b.bin", Some(256)).unwrap();
        use std::io::{Seek, SeekFrom};
        file.seek(SeekFrom::Start(100)).unwrap();
        std::io::Write::write_all(&mut file, &[0xFF]).unwrap();
    }

    let shallow = archiver.test(false).unwrap();
    assert!(shallow.iter().all(|e| e.path != "/sub/b.bin"));
    assert!(shallow.iter().all(|e| e.is_ok()));

    let deep = archiver.test(true).unwrap();
    let b = deep.iter().find(|e| e.path == "/sub/b.bin").expect("b.bin missing");
    assert!(!b.is_ok());

    let dest = tempfile::tempdir().expect("cannot create tempdir");
    archiver.extract("/", dest.path(), false).unwrap();
    assert!(dest.path().join("a.txt").exists());
    assert!(dest.path().join("sub").exists());
    assert!(!dest.path().join("sub/b.bin").exists());
}

#[test]
fn test_verify_against_filesystem() {
    let (_storage, archiver) = memory_archive();
    let tree = fixture_tree();
    archiver.archive_below("/", tree.path(), None).unwrap();

    let clean = archiver.verify("/", tree.path(), true).unwrap();
    assert!(clean.iter().all(|e| e.is_ok()));

    // Change the file on disk: verification must flag the mismatch.
    write_file(&tree.path().join("a.txt"), b"HELLO");
    let tainted = archiver.verify("/", tree.path(), true).unwrap();
    let a = tainted.iter().find(|e| e.path == "/a.txt").expect("a.txt missing");
    assert!(!a.is_ok());
}

#[cfg(unix)]
#[test]
fn test_symlink_archiving_and_extraction() {
    let (storage, archiver) = memory_archive();
    let tree = tempfile::tempdir().expect("cannot create tempdir");
    write_file(&tree.path().join("target"), b"pointed at");
    std::os::unix::fs::symlink("target", tree.path().join("link")).unwrap();
    archiver.archive_below("/", tree.path(), None).unwrap();

    assert_eq!(storage.object_type("/link").unwrap(), Some(ObjectType::SoftLink));
    let entry = archiver.try_get_entry("/link", true).unwrap().expect("link missing");
    assert_eq!(entry.link_type, FileLinkType::Symlink);
    assert_eq!(entry.link_target.as_deref(), Some("target"));

    let dest = tempfile::tempdir().expect("cannot create tempdir");
    archiver.extract("/", dest.path(), true).unwrap();
    let extracted = dest.path().join("link");
    assert!(fs::symlink_metadata(&extracted).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&extracted).unwrap().to_str(), Some("target"));
    assert_eq!(fs::read(&extracted).unwrap(), b"pointed at");
}

#[test]
fn test_read_only_archive_rejects_writes() {
    let storage = Arc::new(MemoryStorage::new());
    {
        let writable = Archiver::open(storage.clone());
        let mut input = std::io::Cursor::new(b"x".to_vec());
        writable
            .archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("f")), Some(&mut input))
            .unwrap();
    }

    let reader = Archiver::open_read_only(storage);
    assert!(reader.exists("/f").unwrap());
    let result = reader.delete(&["/f".to_owned()], None);
    assert!(matches!(result, Err(ArchiveError::IllegalState(_))));
    let result = reader.archive_file("/", LinkRecord::from_new_entry(NewEntry::file("g")));
    assert!(matches!(result, Err(ArchiveError::IllegalState(_))));
}

#[test]
fn test_container_file_persistence() {
    let dir = tempfile::tempdir().expect("cannot create tempdir");
    let container = dir.path().join("archive.h5ar");
    let tree = fixture_tree();

    {
        let storage = Arc::new(MemoryStorage::open_path(&container).unwrap());
        let archiver = Archiver::open(storage);
        archiver.archive_below("/", tree.path(), None).unwrap();
        archiver.close().unwrap();
    }

    let storage = Arc::new(MemoryStorage::open_path(&container).unwrap());
    let archiver = Archiver::open_read_only(storage);
    let entries = archiver.list("/", true).unwrap();
    let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    assert!(paths.contains(&"/a.txt"));
    assert!(paths.contains(&"/sub/b.bin"));
    assert_eq!(archiver.read_file("/a.txt").unwrap(), b"hello");
}

#[test]
fn test_no_compress_strategy_spills_to_contiguous() {
    let storage = Arc::new(MemoryStorage::new());
    let strategy = ArchivingStrategy { compress: false, ..Default::default() };
    let archiver =
        Archiver::with_options(storage.clone(), strategy, Arc::new(RethrowStrategy), false);

    let payload = vec![3u8; 10_000];
    let mut input = std::io::Cursor::new(payload);
    archiver
        .archive_entry("/", LinkRecord::from_new_entry(NewEntry::file("plain")), Some(&mut input))
        .unwrap();
    assert_eq!(storage.dataset_info("/plain").unwrap().layout, DatasetLayout::Contiguous);
}

#[test]
fn test_excluded_entries_are_skipped() {
    let storage = Arc::new(MemoryStorage::new());
    let strategy = ArchivingStrategy {
        exclude_names: vec!["skipme".to_owned()],
        ..Default::default()
    };
    let archiver = Archiver::with_options(storage, strategy, Arc::new(RethrowStrategy), false);

    let tree = tempfile::tempdir().expect("cannot create tempdir");
    write_file(&tree.path().join("skipme"), b"nope");
    write_file(&tree.path().join("takeme"), b"yes");
    archiver.archive_below("/", tree.path(), None).unwrap();

    assert!(!archiver.exists("/skipme").unwrap());
    assert!(archiver.exists("/takeme").unwrap());
}

#[test]
fn test_archive_keeps_basename_at_root() {
    let (_storage, archiver) = memory_archive();
    let tree = fixture_tree();
    archiver.archive(tree.path(), true, None).unwrap();

    let name = tree.path().file_name().unwrap().to_str().unwrap().to_owned();
    assert!(archiver.exists(&format!("/{name}")).unwrap());
    assert!(archiver.exists(&format!("/{name}/a.txt")).unwrap());
    assert!(archiver.exists(&format!("/{name}/sub/b.bin")).unwrap());
}

#[test]
fn test_archive_under_subdirectory() {
    let (_storage, archiver) = memory_archive();
    let tree = fixture_tree();
    archiver.archive_under("/backup", &tree.path().join("a.txt"), None).unwrap();

    assert!(archiver.exists("/backup/a.txt").unwrap());
    let backup = archiver.try_get_entry("/backup", false).unwrap().expect("backup missing");
    assert_eq!(backup.link_type, FileLinkType::Directory);
    assert_eq!(archiver.read_file("/backup/a.txt").unwrap(), b"hello");
}

#[test]
fn test_archive_relative_strips_prefix() {
    let (_storage, archiver) = memory_archive();
    let tree = fixture_tree();
    archiver
        .archive_relative(tree.path(), &tree.path().join("sub/b.bin"), None)
        .unwrap();

    assert!(archiver.exists("/sub/b.bin").unwrap());
    assert!(!archiver.exists("/a.txt").unwrap());

    let outside = archiver.archive_relative(&tree.path().join("sub"), &tree.path().join("a.txt"), None);
    assert!(matches!(outside, Err(ArchiveError::InvalidPath(_))));
}

#[test]
fn test_visitor_reports_archived_paths() {
    let (_storage, archiver) = memory_archive();
    let tree = fixture_tree();
    let mut seen = Vec::new();
    let mut visit = |path: &str| seen.push(path.to_owned());
    archiver.archive_below("/", tree.path(), Some(&mut visit)).unwrap();

    assert!(seen.contains(&"/a.txt".to_owned()));
    assert!(seen.contains(&"/sub".to_owned()));
    assert!(seen.contains(&"/sub/b.bin".to_owned()));
}
