//! Byte-level codec for the on-disk directory index.
//!
//! Each archive group carries two sibling datasets: [`INDEX_DATASET_NAME`]
//! holds a packed array of fixed-width records, [`INDEX_NAMES_DATASET_NAME`]
//! the concatenation of all link names with no separators. All multibyte
//! fields are little-endian; one record is exactly [`RECORD_SIZE`] bytes.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::link::{FileLinkType, LinkRecord};

/// Reserved dataset name for the packed compound records of a directory.
pub const INDEX_DATASET_NAME: &str = "__INDEX__";

/// Reserved dataset name for the concatenated link names of a directory.
pub const INDEX_NAMES_DATASET_NAME: &str = "__INDEXNAMES__";

/// Packed size of one compound record:
/// i32 + i8 + i64 + i64 + i32 + i32 + i16 + i32.
pub const RECORD_SIZE: usize = 35;

/// Compound fields of one record, before the name is bound.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawRecord {
    pub link_name_length: i32,
    pub link_type: FileLinkType,
    pub size: i64,
    pub last_modified: i64,
    pub uid: i32,
    pub gid: i32,
    pub permissions: i16,
    pub crc32: u32,
}

/// Parses one compound record from the `Read` source.
pub(crate) fn read_record(src: &mut impl Read) -> io::Result<RawRecord> {
    let link_name_length = src.read_i32::<LittleEndian>()?;
    let type_tag = src.read_i8()?;
    let link_type = FileLinkType::from_i8(type_tag).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("unknown link type tag {type_tag}"))
    })?;
    if link_name_length < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("negative link name length {link_name_length}"),
        ));
    }
    Ok(RawRecord {
        link_name_length,
        link_type,
        size: src.read_i64::<LittleEndian>()?,
        last_modified: src.read_i64::<LittleEndian>()?,
        uid: src.read_i32::<LittleEndian>()?,
        gid: src.read_i32::<LittleEndian>()?,
        permissions: src.read_i16::<LittleEndian>()?,
        crc32: src.read_u32::<LittleEndian>()?,
    })
}

/// Serializes one record with the name length captured by
/// [`LinkRecord::prepare_for_writing`].
pub(crate) fn write_record(
    dest: &mut impl Write,
    record: &LinkRecord,
    name_length: i32,
) -> io::Result<()> {
    dest.write_i32::<LittleEndian>(name_length)?;
    let type_tag = record.link_type().to_i8().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "link type has no i8 representation")
    })?;
    dest.write_i8(type_tag)?;
    dest.write_i64::<LittleEndian>(record.size())?;
    dest.write_i64::<LittleEndian>(record.last_modified())?;
    dest.write_i32::<LittleEndian>(record.uid())?;
    dest.write_i32::<LittleEndian>(record.gid())?;
    dest.write_i16::<LittleEndian>(record.permissions())?;
    dest.write_u32::<LittleEndian>(record.crc32())?;
    Ok(())
}
