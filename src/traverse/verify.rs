//! Verification processor: archive entries against an on-disk filesystem
//! root.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::archive_path;
use crate::entry::ArchiveEntry;
use crate::errors::Result;
use crate::link::{UNKNOWN_ID, UNKNOWN_MTIME, UNKNOWN_PERMISSIONS};
use crate::metadata;

use super::ArchiveProcessor;

const READ_BLOCK_SIZE: usize = 64 * 1024;

/// Tolerance for modification time comparison, in seconds.
const MTIME_TOLERANCE: i64 = 1;

/// Compares archived entries against a filesystem root: type, size and CRC32
/// for files, optionally uid/gid/permissions/mtime for everything.
pub struct VerifyProcessor<'a> {
    fs_root: PathBuf,
    check_attributes: bool,
    numeric_ids: bool,
    visitor: &'a mut dyn FnMut(&ArchiveEntry),
    buffer: Vec<u8>,
}

impl<'a> VerifyProcessor<'a> {
    pub fn new(
        fs_root: &Path,
        check_attributes: bool,
        numeric_ids: bool,
        visitor: &'a mut dyn FnMut(&ArchiveEntry),
    ) -> Self {
        Self {
            fs_root: fs_root.to_owned(),
            check_attributes,
            numeric_ids,
            visitor,
            buffer: vec![0u8; READ_BLOCK_SIZE],
        }
    }

    fn fs_path(&self, entry: &ArchiveEntry) -> PathBuf {
        self.fs_root.join(entry.path.trim_start_matches('/'))
    }

    fn verify_entry(&mut self, entry: &mut ArchiveEntry) {
        let fs_path = self.fs_path(entry);
        let meta = match metadata::probe(&fs_path, self.check_attributes) {
            Ok(meta) => meta,
            Err(err) => {
                entry.set_failure(format!("missing on filesystem: {err}"));
                return;
            }
        };
        entry.verified_type = Some(meta.link_type);
        if meta.link_type != entry.link_type {
            entry.set_failure(format!(
                "type mismatch: archived {:?}, filesystem {:?}",
                entry.link_type, meta.link_type
            ));
            return;
        }

        if entry.is_symlink() {
            if let (Some(stored), Some(on_disk)) = (&entry.link_target, &meta.symlink_target) {
                if stored != on_disk {
                    entry.set_failure(format!(
                        "symlink target mismatch: archived '{stored}', filesystem '{on_disk}'"
                    ));
                    return;
                }
            }
        }

        if entry.is_regular_file() {
            entry.verified_size = Some(meta.size);
            if meta.size != entry.size {
                entry.set_failure(format!(
                    "size mismatch: archived {}, filesystem {}",
                    entry.size, meta.size
                ));
                return;
            }
            if entry.has_crc32() {
                match self.file_crc32(&fs_path) {
                    Ok(crc32) => {
                        entry.verified_crc32 = Some(crc32);
                        if crc32 != entry.crc32 {
                            entry.set_failure(format!(
                                "checksum mismatch: archived {:08x}, filesystem {crc32:08x}",
                                entry.crc32
                            ));
                            return;
                        }
                    }
                    Err(err) => {
                        entry.set_failure(format!("cannot checksum file: {err}"));
                        return;
                    }
                }
            }
        }

        if self.check_attributes {
            self.verify_attributes(entry, &meta);
        }
    }

    fn verify_attributes(&self, entry: &mut ArchiveEntry, meta: &metadata::FsMetadata) {
        if entry.last_modified != UNKNOWN_MTIME
            && (entry.last_modified - meta.last_modified).abs() > MTIME_TOLERANCE
        {
            entry.set_failure(format!(
                "mtime mismatch: archived {}, filesystem {}",
                entry.last_modified, meta.last_modified
            ));
            return;
        }
        if entry.permissions != UNKNOWN_PERMISSIONS && entry.permissions != meta.permissions {
            entry.set_failure(format!(
                "permissions mismatch: archived {:o}, filesystem {:o}",
                entry.permissions, meta.permissions
            ));
            return;
        }
        if entry.uid != UNKNOWN_ID && !self.ids_match(entry.uid, meta.uid, metadata::user_name) {
            entry.set_failure(format!(
                "owner mismatch: archived uid {}, filesystem uid {}",
                entry.uid, meta.uid
            ));
            return;
        }
        if entry.gid != UNKNOWN_ID && !self.ids_match(entry.gid, meta.gid, metadata::group_name) {
            entry.set_failure(format!(
                "group mismatch: archived gid {}, filesystem gid {}",
                entry.gid, meta.gid
            ));
        }
    }

    /// Numeric comparison, or name-based when symbolic ownership is
    /// requested and both ids resolve.
    fn ids_match(&self, archived: i32, on_disk: i32, resolve: fn(u32) -> Option<String>) -> bool {
        if archived == on_disk {
            return true;
        }
        if self.numeric_ids || archived < 0 || on_disk < 0 {
            return false;
        }
        match (resolve(archived as u32), resolve(on_disk as u32)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn file_crc32(&mut self, fs_path: &Path) -> std::io::Result<u32> {
        let mut file = File::open(fs_path)?;
        let mut hasher = crc32fast::Hasher::new();
        loop {
            let n = file.read(&mut self.buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&self.buffer[..n]);
        }
        Ok(hasher.finalize())
    }
}

impl ArchiveProcessor for VerifyProcessor<'_> {
    fn visit_pre(&mut self, entry: &ArchiveEntry) -> Result<bool> {
        if !archive_path::is_root(&entry.path) {
            let mut entry = entry.clone();
            self.verify_entry(&mut entry);
            (self.visitor)(&entry);
        }
        Ok(true)
    }

    fn visit_file(&mut self, entry: &ArchiveEntry) -> Result<()> {
        let mut entry = entry.clone();
        self.verify_entry(&mut entry);
        (self.visitor)(&entry);
        Ok(())
    }
}
