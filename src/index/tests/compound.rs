use std::io::Cursor;

use crate::index::compound::{read_record, write_record, RECORD_SIZE};
use crate::link::{FileLinkType, LinkRecord, NewEntry};
use crate::storage::ObjectType;

#[test]
fn test_record_roundtrip() {
    let record = LinkRecord::from_discovery("data.bin", ObjectType::Dataset, Some(512))
        .with_size_and_crc32(512, 0xCAFEBABE);
    let mut bytes = Vec::new();
    write_record(&mut bytes, &record, 8).expect("cannot serialize record");
    assert_eq!(bytes.len(), RECORD_SIZE);

    let raw = read_record(&mut Cursor::new(&bytes)).expect("cannot parse record");
    assert_eq!(raw.link_name_length, 8);
    assert_eq!(raw.link_type, FileLinkType::RegularFile);
    assert_eq!(raw.size, 512);
    assert_eq!(raw.crc32, 0xCAFEBABE);
}

#[test]
fn test_record_layout_is_packed_little_endian() {
    let record = LinkRecord::from_new_entry(
        NewEntry::file("a").last_modified(0x0102030405060708).owner(5, 6).permissions(0o644),
    )
    .with_size_and_crc32(0x11, 0xAABBCCDD);
    let mut bytes = Vec::new();
    write_record(&mut bytes, &record, 1).expect("cannot serialize record");

    assert_eq!(&bytes[0..4], &[1, 0, 0, 0]); // name length
    assert_eq!(bytes[4], 0); // REGULAR_FILE
    assert_eq!(&bytes[5..13], &[0x11, 0, 0, 0, 0, 0, 0, 0]); // size
    assert_eq!(&bytes[13..21], &[8, 7, 6, 5, 4, 3, 2, 1]); // mtime
    assert_eq!(&bytes[21..25], &[5, 0, 0, 0]); // uid
    assert_eq!(&bytes[25..29], &[6, 0, 0, 0]); // gid
    assert_eq!(&bytes[29..31], &[0xA4, 1]); // permissions 0o644
    assert_eq!(&bytes[31..35], &[0xDD, 0xCC, 0xBB, 0xAA]); // crc32
}

#[test]
fn test_truncated_record_fails() {
    let data = [0x01, 0x00, 0x00];
    assert!(read_record(&mut Cursor::new(&data)).is_err());
}

#[test]
fn test_unknown_link_type_fails() {
    let mut bytes = Vec::new();
    let record = LinkRecord::directory("d");
    write_record(&mut bytes, &record, 1).expect("cannot serialize record");
    bytes[4] = 9; // bogus type tag
    assert!(read_record(&mut Cursor::new(&bytes)).is_err());
}
