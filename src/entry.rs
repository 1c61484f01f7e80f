//! User-facing view of one archive entry --- [`ArchiveEntry`].

use std::fmt;

use crate::archive_path;
use crate::link::{FileLinkType, LinkRecord, UNKNOWN_PERMISSIONS, UNKNOWN_SIZE};

/// Snapshot of one entry as reported by listing, verification or extraction.
///
/// Carries the stored index fields plus the transient verification results
/// populated by `test`/`verify`; the stored [`LinkRecord`] itself stays
/// immutable.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub parent_path: String,
    pub name: String,
    pub link_type: FileLinkType,
    pub size: i64,
    pub last_modified: i64,
    pub uid: i32,
    pub gid: i32,
    pub permissions: i16,
    pub crc32: u32,
    pub link_target: Option<String>,
    pub verified_type: Option<FileLinkType>,
    pub verified_size: Option<i64>,
    pub verified_crc32: Option<u32>,
    failure: Option<String>,
}

impl ArchiveEntry {
    pub(crate) fn from_record(parent_path: &str, record: &LinkRecord) -> Self {
        let name = record.name().to_owned();
        let path = if name.is_empty() {
            "/".to_owned()
        } else {
            archive_path::concat(parent_path, &name)
        };
        Self {
            path,
            parent_path: parent_path.to_owned(),
            name,
            link_type: record.link_type(),
            size: record.size(),
            last_modified: record.last_modified(),
            uid: record.uid(),
            gid: record.gid(),
            permissions: record.permissions(),
            crc32: record.crc32(),
            link_target: record.link_target().map(str::to_owned),
            verified_type: None,
            verified_size: None,
            verified_crc32: None,
            failure: None,
        }
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

    /// Whether a checksum was stored for this entry.
    pub fn has_crc32(&self) -> bool {
        self.is_regular_file() && self.crc32 != 0
    }

    /// True when nothing failed and every populated verification field
    /// matches its stored counterpart.
    pub fn is_ok(&self) -> bool {
        if self.failure.is_some() {
            return false;
        }
        if self.verified_type.is_some_and(|t| t != self.link_type) {
            return false;
        }
        if self.size != UNKNOWN_SIZE && self.verified_size.is_some_and(|s| s != self.size) {
            return false;
        }
        if self.has_crc32() && self.verified_crc32.is_some_and(|c| c != self.crc32) {
            return false;
        }
        true
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub(crate) fn set_failure(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    /// One `ls -l`-flavoured line for CLI output.
    pub fn describe(&self) -> String {
        let target = match &self.link_target {
            Some(target) => format!(" -> {target}"),
            None => String::new(),
        };
        let size = if self.size == UNKNOWN_SIZE { String::new() } else { self.size.to_string() };
        let status = if self.is_ok() { "" } else { "!" };
        format!(
            "{}{:>12} {:>10} {:>8} {}{}{}",
            mode_string(self.link_type, self.permissions),
            size,
            self.crc32_string(),
            self.last_modified,
            self.path,
            target,
            status,
        )
    }

    fn crc32_string(&self) -> String {
        if self.has_crc32() {
            format!("{:08x}", self.crc32)
        } else {
            String::new()
        }
    }
}

impl fmt::Display for ArchiveEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

fn mode_string(link_type: FileLinkType, permissions: i16) -> String {
    let type_char = match link_type {
        FileLinkType::RegularFile => '-',
        FileLinkType::Directory => 'd',
        FileLinkType::Symlink => 'l',
        FileLinkType::Other => '?',
    };
    if permissions == UNKNOWN_PERMISSIONS {
        return format!("{type_char}?????????");
    }
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6u32, 3, 0] {
        let bits = (permissions as u16 >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}
