//! Native filesystem metadata provider.
//!
//! Thin wrapper over `lstat`/`readlink` that yields the fields the archiver
//! records per entry. Ownership and permissions are only available on Unix;
//! elsewhere the corresponding fields stay at their UNKNOWN sentinels.

use std::fs;
use std::io;
use std::path::Path;

use crate::link::{FileLinkType, UNKNOWN_ID, UNKNOWN_PERMISSIONS, UNKNOWN_SIZE};

/// Metadata snapshot of one filesystem node, taken without following links.
#[derive(Debug, Clone)]
pub struct FsMetadata {
    pub link_type: FileLinkType,
    pub size: i64,
    pub last_modified: i64,
    pub uid: i32,
    pub gid: i32,
    pub permissions: i16,
    /// Target string, populated for symbolic links only.
    pub symlink_target: Option<String>,
}

/// Probes `path` with `lstat` semantics.
///
/// `include_owner` controls whether uid/gid/permissions are captured; when
/// false (or unavailable on the platform) they stay UNKNOWN.
pub fn probe(path: &Path, include_owner: bool) -> io::Result<FsMetadata> {
    let meta = fs::symlink_metadata(path)?;
    let file_type = meta.file_type();

    let link_type = if file_type.is_symlink() {
        FileLinkType::Symlink
    } else if file_type.is_dir() {
        FileLinkType::Directory
    } else if file_type.is_file() {
        FileLinkType::RegularFile
    } else {
        FileLinkType::Other
    };

    let size = if link_type == FileLinkType::RegularFile {
        i64::try_from(meta.len()).unwrap_or(UNKNOWN_SIZE)
    } else {
        UNKNOWN_SIZE
    };

    let last_modified = modified_seconds(&meta);
    let (uid, gid, permissions) = if include_owner {
        owner_fields(&meta)
    } else {
        (UNKNOWN_ID, UNKNOWN_ID, UNKNOWN_PERMISSIONS)
    };

    let symlink_target = if link_type == FileLinkType::Symlink {
        Some(fs::read_link(path)?.to_string_lossy().into_owned())
    } else {
        None
    };

    Ok(FsMetadata { link_type, size, last_modified, uid, gid, permissions, symlink_target })
}

#[cfg(unix)]
fn modified_seconds(meta: &fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
}

#[cfg(not(unix))]
fn modified_seconds(meta: &fs::Metadata) -> i64 {
    use std::time::UNIX_EPOCH;
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(-1, |d| d.as_secs() as i64)
}

#[cfg(unix)]
fn owner_fields(meta: &fs::Metadata) -> (i32, i32, i16) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid() as i32, meta.gid() as i32, (meta.mode() & 0o7777) as i16)
}

#[cfg(not(unix))]
fn owner_fields(_meta: &fs::Metadata) -> (i32, i32, i16) {
    (UNKNOWN_ID, UNKNOWN_ID, UNKNOWN_PERMISSIONS)
}

/// Resolves a numeric uid to an account name.
#[cfg(unix)]
pub fn user_name(uid: u32) -> Option<String> {
    use std::ffi::CStr;

    let mut buf = vec![0u8; 1024];
    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    loop {
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut passwd,
                buf.as_mut_ptr().cast::<libc::c_char>(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(passwd.pw_name) };
        return name.to_str().ok().map(str::to_owned);
    }
}

#[cfg(not(unix))]
pub fn user_name(_uid: u32) -> Option<String> {
    None
}

/// Resolves a numeric gid to a group name.
#[cfg(unix)]
pub fn group_name(gid: u32) -> Option<String> {
    use std::ffi::CStr;

    let mut buf = vec![0u8; 1024];
    let mut group: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    loop {
        let rc = unsafe {
            libc::getgrgid_r(
                gid,
                &mut group,
                buf.as_mut_ptr().cast::<libc::c_char>(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(group.gr_name) };
        return name.to_str().ok().map(str::to_owned);
    }
}

#[cfg(not(unix))]
pub fn group_name(_gid: u32) -> Option<String> {
    None
}
