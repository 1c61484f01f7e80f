//! Extraction processor: archive entries back onto the filesystem.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;

use crate::archive_path;
use crate::entry::ArchiveEntry;
use crate::errors::Result;
use crate::link::{UNKNOWN_ID, UNKNOWN_MTIME, UNKNOWN_PERMISSIONS};
use crate::storage::Storage;

use super::ArchiveProcessor;

const READ_BLOCK_SIZE: usize = 64 * 1024;

/// Materializes archive entries under a destination root.
///
/// File contents are verified against the stored CRC32 while they stream
/// out; mismatches mark the entry not-ok but do not abort the walk.
/// Attribute and ownership restoration follow the strategy flags; both are
/// best-effort.
pub struct ExtractProcessor<'a> {
    storage: Arc<dyn Storage>,
    dest_root: PathBuf,
    restore_attributes: bool,
    restore_ownership: bool,
    visitor: &'a mut dyn FnMut(&ArchiveEntry),
    buffer: Vec<u8>,
}

impl<'a> ExtractProcessor<'a> {
    pub fn new(
        storage: Arc<dyn Storage>,
        dest_root: &Path,
        restore_attributes: bool,
        restore_ownership: bool,
        visitor: &'a mut dyn FnMut(&ArchiveEntry),
    ) -> Self {
        Self {
            storage,
            dest_root: dest_root.to_owned(),
            restore_attributes,
            restore_ownership,
            visitor,
            buffer: vec![0u8; READ_BLOCK_SIZE],
        }
    }

    fn dest_path(&self, entry: &ArchiveEntry) -> PathBuf {
        self.dest_root.join(entry.path.trim_start_matches('/'))
    }

    fn extract_file(&mut self, entry: &mut ArchiveEntry, dest: &Path) {
        if let Some(parent) = dest.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                entry.set_failure(format!("cannot create directory: {err}"));
                return;
            }
        }
        let mut file = match fs::File::create(dest) {
            Ok(file) => file,
            Err(err) => {
                entry.set_failure(format!("cannot create file: {err}"));
                return;
            }
        };
        let mut hasher = crc32fast::Hasher::new();
        let mut offset = 0u64;
        loop {
            let n = match self.storage.read_block(&entry.path, &mut self.buffer, offset) {
                Ok(n) => n,
                Err(err) => {
                    entry.set_failure(format!("cannot read dataset: {err}"));
                    return;
                }
            };
            if n == 0 {
                break;
            }
            if let Err(err) = file.write_all(&self.buffer[..n]) {
                entry.set_failure(format!("cannot write file: {err}"));
                return;
            }
            hasher.update(&self.buffer[..n]);
            offset += n as u64;
        }
        entry.verified_size = Some(offset as i64);
        let crc32 = hasher.finalize();
        entry.verified_crc32 = Some(crc32);
        if entry.has_crc32() && crc32 != entry.crc32 {
            let err = crate::errors::ArchiveError::Integrity {
                path: entry.path.clone(),
                stored: entry.crc32,
                computed: crc32,
            };
            entry.set_failure(err.to_string());
            return;
        }
        drop(file);
        self.restore(entry, dest, false);
    }

    fn extract_symlink(&mut self, entry: &mut ArchiveEntry, dest: &Path) {
        let Some(target) = entry.link_target.clone() else {
            entry.set_failure("symlink target not recorded");
            return;
        };
        if let Some(parent) = dest.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if dest.symlink_metadata().is_ok() {
            let _ = fs::remove_file(dest);
        }
        match make_symlink(&target, dest) {
            Ok(()) => self.restore(entry, dest, true),
            Err(err) => {
                // No symlink support: degrade to a copy of the linked entry.
                if self.copy_link_target(entry, &target, dest) {
                    return;
                }
                entry.set_failure(format!("cannot create symlink: {err}"));
            }
        }
    }

    /// Fallback used where symlinks cannot be created: extract the target's
    /// bytes as a regular file. Only works for targets that resolve inside
    /// the archive.
    fn copy_link_target(&mut self, entry: &mut ArchiveEntry, target: &str, dest: &Path) -> bool {
        let resolved = if target.starts_with('/') {
            target.to_owned()
        } else {
            archive_path::concat(&entry.parent_path, target)
        };
        let Ok(resolved) = archive_path::normalize(&resolved) else {
            return false;
        };
        let mut copy = entry.clone();
        copy.path = resolved;
        self.extract_file(&mut copy, dest);
        copy.failure().is_none()
    }

    fn restore(&self, entry: &ArchiveEntry, dest: &Path, is_symlink: bool) {
        if self.restore_attributes && !is_symlink {
            if entry.permissions != UNKNOWN_PERMISSIONS {
                set_permissions(dest, entry.permissions as u32);
            }
            if entry.last_modified != UNKNOWN_MTIME {
                let mtime = FileTime::from_unix_time(entry.last_modified, 0);
                let _ = filetime::set_file_mtime(dest, mtime);
            }
        }
        if self.restore_ownership && entry.uid != UNKNOWN_ID && entry.gid != UNKNOWN_ID {
            set_ownership(dest, entry.uid as u32, entry.gid as u32, is_symlink);
        }
    }
}

impl ArchiveProcessor for ExtractProcessor<'_> {
    fn visit_pre(&mut self, entry: &ArchiveEntry) -> Result<bool> {
        let dest = self.dest_path(entry);
        if let Err(err) = fs::create_dir_all(&dest) {
            let mut entry = entry.clone();
            entry.set_failure(format!("cannot create directory: {err}"));
            (self.visitor)(&entry);
            return Ok(false);
        }
        Ok(true)
    }

    fn visit_file(&mut self, entry: &ArchiveEntry) -> Result<()> {
        let dest = self.dest_path(entry);
        let mut entry = entry.clone();
        if entry.is_symlink() {
            self.extract_symlink(&mut entry, &dest);
        } else {
            self.extract_file(&mut entry, &dest);
        }
        (self.visitor)(&entry);
        Ok(())
    }

    /// Directory attributes are restored after the children so the writes
    /// inside do not bump the directory mtime again.
    fn visit_post(&mut self, entry: &ArchiveEntry) -> Result<()> {
        if archive_path::is_root(&entry.path) {
            return Ok(());
        }
        self.restore(entry, &self.dest_path(entry), false);
        (self.visitor)(entry);
        Ok(())
    }
}

#[cfg(unix)]
fn make_symlink(target: &str, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn make_symlink(_target: &str, _dest: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symbolic links are not supported on this platform",
    ))
}

#[cfg(unix)]
fn set_permissions(dest: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(dest, fs::Permissions::from_mode(mode & 0o7777));
}

#[cfg(not(unix))]
fn set_permissions(_dest: &Path, _mode: u32) {}

#[cfg(unix)]
fn set_ownership(dest: &Path, uid: u32, gid: u32, is_symlink: bool) {
    let result = if is_symlink {
        std::os::unix::fs::lchown(dest, Some(uid), Some(gid))
    } else {
        std::os::unix::fs::chown(dest, Some(uid), Some(gid))
    };
    if let Err(err) = result {
        tracing::warn!(path = %dest.display(), error = %err, "cannot restore ownership");
    }
}

#[cfg(not(unix))]
fn set_ownership(_dest: &Path, _uid: u32, _gid: u32, _is_symlink: bool) {}
