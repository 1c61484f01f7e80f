//! One archive entry --- [`LinkRecord`] --- and its field conventions.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::Path;

use num_derive::{FromPrimitive, ToPrimitive};

use crate::errors::Result;
use crate::metadata;
use crate::storage::{ObjectType, Storage};

/// Sentinel for sizes that are not meaningful for the entry type.
pub const UNKNOWN_SIZE: i64 = -1;
/// Sentinel for timestamps that were not captured.
pub const UNKNOWN_MTIME: i64 = -1;
/// Sentinel for uid/gid values that were not captured.
pub const UNKNOWN_ID: i32 = -1;
/// Sentinel for permission bits that were not captured.
pub const UNKNOWN_PERMISSIONS: i16 = -1;

/// Kind of an archive entry, stored on disk as an `i8` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i8)]
pub enum FileLinkType {
    RegularFile = 0,
    Directory = 1,
    Symlink = 2,
    Other = 3,
}

impl FileLinkType {
    fn from_object_type(object_type: ObjectType) -> Self {
        match object_type {
            ObjectType::Group => FileLinkType::Directory,
            ObjectType::Dataset => FileLinkType::RegularFile,
            ObjectType::SoftLink => FileLinkType::Symlink,
        }
    }
}

/// Client-supplied descriptor for a new entry, used when archiving content
/// that does not come from the filesystem.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub name: String,
    pub link_type: FileLinkType,
    pub last_modified: i64,
    pub uid: i32,
    pub gid: i32,
    pub permissions: i16,
    /// Required for symlinks, ignored otherwise.
    pub target: Option<String>,
}

impl NewEntry {
    /// Descriptor for a regular file entry with everything else UNKNOWN.
    pub fn file(name: impl Into<String>) -> Self {
        Self::with_type(name, FileLinkType::RegularFile)
    }

    /// Descriptor for a directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        Self::with_type(name, FileLinkType::Directory)
    }

    /// Descriptor for a symlink entry pointing at `target`.
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut entry = Self::with_type(name, FileLinkType::Symlink);
        entry.target = Some(target.into());
        entry
    }

    fn with_type(name: impl Into<String>, link_type: FileLinkType) -> Self {
        Self {
            name: name.into(),
            link_type,
            last_modified: UNKNOWN_MTIME,
            uid: UNKNOWN_ID,
            gid: UNKNOWN_ID,
            permissions: UNKNOWN_PERMISSIONS,
            target: None,
        }
    }

    pub fn last_modified(mut self, seconds: i64) -> Self {
        self.last_modified = seconds;
        self
    }

    pub fn owner(mut self, uid: i32, gid: i32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn permissions(mut self, permissions: i16) -> Self {
        self.permissions = permissions;
        self
    }
}

/// One archive entry as stored in a directory index.
///
/// Records are immutable; size and CRC32 finalization after streaming
/// produces a replacement via [`LinkRecord::with_size_and_crc32`] that the
/// index swaps in by name.
#[derive(Debug, Clone)]
pub struct LinkRecord {
    link_name: String,
    link_target: Option<String>,
    link_type: FileLinkType,
    size: i64,
    last_modified: i64,
    uid: i32,
    gid: i32,
    permissions: i16,
    crc32: u32,
}

impl LinkRecord {
    /// Scans a filesystem path into a record named `link_name`.
    ///
    /// Captures type, size and mtime; uid/gid/permissions only when
    /// `include_owner` is set. For symlinks the target is read as well.
    pub fn from_filesystem(link_name: &str, fs_path: &Path, include_owner: bool) -> io::Result<Self> {
        let meta = metadata::probe(fs_path, include_owner)?;
        Ok(Self {
            link_name: link_name.to_owned(),
            link_target: meta.symlink_target,
            link_type: meta.link_type,
            size: meta.size,
            last_modified: meta.last_modified,
            uid: meta.uid,
            gid: meta.gid,
            permissions: meta.permissions,
            crc32: 0,
        })
    }

    /// Builds a record for an object discovered in the container itself,
    /// from its node type and an optional size probe.
    pub fn from_discovery(link_name: &str, object_type: ObjectType, size_probe: Option<u64>) -> Self {
        let link_type = FileLinkType::from_object_type(object_type);
        let size = match (link_type, size_probe) {
            (FileLinkType::RegularFile, Some(size)) => i64::try_from(size).unwrap_or(UNKNOWN_SIZE),
            _ => UNKNOWN_SIZE,
        };
        Self {
            link_name: link_name.to_owned(),
            link_target: None,
            link_type,
            size,
            last_modified: UNKNOWN_MTIME,
            uid: UNKNOWN_ID,
            gid: UNKNOWN_ID,
            permissions: UNKNOWN_PERMISSIONS,
            crc32: 0,
        }
    }

    /// The synthetic entry for the archive root directory.
    pub fn root() -> Self {
        Self::directory("")
    }

    /// A plain directory record with UNKNOWN metadata and zero checksum.
    pub fn directory(link_name: &str) -> Self {
        Self {
            link_name: link_name.to_owned(),
            link_target: None,
            link_type: FileLinkType::Directory,
            size: UNKNOWN_SIZE,
            last_modified: UNKNOWN_MTIME,
            uid: UNKNOWN_ID,
            gid: UNKNOWN_ID,
            permissions: UNKNOWN_PERMISSIONS,
            crc32: 0,
        }
    }

    /// Builds a record from a client-supplied [`NewEntry`] descriptor.
    pub fn from_new_entry(entry: NewEntry) -> Self {
        Self {
            link_name: entry.name,
            link_target: entry.target,
            link_type: entry.link_type,
            size: UNKNOWN_SIZE,
            last_modified: entry.last_modified,
            uid: entry.uid,
            gid: entry.gid,
            permissions: entry.permissions,
            crc32: 0,
        }
    }

    /// Rebuilds a record from its deserialized compound fields, slicing its
    /// name out of the shared names blob.
    ///
    /// `start` is the byte offset of this record's name; the returned offset
    /// is where the next record's name begins. When `read_link_target` is set
    /// and the record is a symlink, the target is resolved from the storage
    /// layer's soft-link information of the child node.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn init_after_reading(
        raw: crate::index::compound::RawRecord,
        names: &[u8],
        start: usize,
        storage: &dyn Storage,
        group_path: &str,
        read_link_target: bool,
    ) -> Result<(Self, usize)> {
        let len = raw.link_name_length as usize;
        let end = start + len;
        let name_bytes = names.get(start..end).ok_or_else(|| {
            crate::errors::ArchiveError::from(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "names blob shorter than the index records claim",
            ))
        })?;
        let link_name = std::str::from_utf8(name_bytes)
            .map_err(|_| {
                crate::errors::ArchiveError::from(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "link name is not valid UTF-8",
                ))
            })?
            .to_owned();

        let link_target = if read_link_target && raw.link_type == FileLinkType::Symlink {
            storage.read_soft_link(&crate::archive_path::concat(group_path, &link_name))?
        } else {
            None
        };

        let record = Self {
            link_name,
            link_target,
            link_type: raw.link_type,
            size: raw.size,
            last_modified: raw.last_modified,
            uid: raw.uid,
            gid: raw.gid,
            permissions: raw.permissions,
            crc32: raw.crc32,
        };
        Ok((record, end))
    }

    /// Appends this record's name bytes to the shared names buffer and
    /// returns the byte length recorded in the compound.
    ///
    /// Lengths count UTF-8 bytes, never codepoints; this is what keeps the
    /// terminator-free names blob aligned on read.
    pub(crate) fn prepare_for_writing(&self, names: &mut Vec<u8>) -> i32 {
        names.extend_from_slice(self.link_name.as_bytes());
        self.link_name.len() as i32
    }

    /// Replacement record carrying the final size and checksum of a
    /// completed file write.
    pub fn with_size_and_crc32(&self, size: i64, crc32: u32) -> Self {
        let mut record = self.clone();
        record.size = size;
        record.crc32 = crc32;
        record
    }

    /// Replacement record with the symlink target filled in.
    pub(crate) fn with_link_target(&self, target: Option<String>) -> Self {
        let mut record = self.clone();
        record.link_target = target;
        record
    }

    pub fn name(&self) -> &str {
        &self.link_name
    }

    pub fn link_target(&self) -> Option<&str> {
        self.link_target.as_deref()
    }

    pub fn link_type(&self) -> FileLinkType {
        self.link_type
    }

    pub fn is_directory(&self) -> bool {
        self.link_type == FileLinkType::Directory
    }

    pub fn is_regular_file(&self) -> bool {
        self.link_type == FileLinkType::RegularFile
    }

    pub fn is_symlink(&self) -> bool {
        self.link_type == FileLinkType::Symlink
    }

    /// Size in bytes; [`UNKNOWN_SIZE`] for anything but regular files.
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn gid(&self) -> i32 {
        self.gid
    }

    pub fn permissions(&self) -> i16 {
        self.permissions
    }

    /// Stored checksum; `0` for non-files.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Whether a checksum was recorded for this entry.
    pub fn has_crc32(&self) -> bool {
        self.is_regular_file() && self.crc32 != 0
    }
}

/// Records are identified by name alone within one directory.
impl PartialEq for LinkRecord {
    fn eq(&self, other: &Self) -> bool {
        self.link_name == other.link_name
    }
}

impl Eq for LinkRecord {}

impl Hash for LinkRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.link_name.hash(state);
    }
}

/// Canonical index order: directories sort before everything else, then
/// lexicographically by name.
impl Ord for LinkRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_directory(), other.is_directory()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => self.link_name.cmp(&other.link_name),
        }
    }
}

impl PartialOrd for LinkRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_directories_first() {
        let mut records = vec![
            LinkRecord::from_discovery("zeta", ObjectType::Dataset, Some(1)),
            LinkRecord::directory("beta"),
            LinkRecord::from_discovery("alpha", ObjectType::Dataset, Some(1)),
            LinkRecord::directory("delta"),
        ];
        records.sort();
        let names: Vec<&str> = records.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["beta", "delta", "alpha", "zeta"]);
    }

    #[test]
    fn test_equality_is_by_name() {
        let file = LinkRecord::from_discovery("x", ObjectType::Dataset, Some(3));
        let dir = LinkRecord::directory("x");
        assert_eq!(file, dir);
    }

    #[test]
    fn test_name_length_counts_bytes() {
        let record = LinkRecord::directory("grüße");
        let mut names = Vec::new();
        let len = record.prepare_for_writing(&mut names);
        assert_eq!(len, 7);
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn test_finalization_replaces_size_and_crc() {
        let record = LinkRecord::from_discovery("f", ObjectType::Dataset, None);
        let done = record.with_size_and_crc32(10, 0xDEADBEEF);
        assert_eq!(done.size(), 10);
        assert_eq!(done.crc32(), 0xDEADBEEF);
        assert_eq!(record.size(), UNKNOWN_SIZE);
    }
}
