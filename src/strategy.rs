//! Archiving policy knobs --- [`ArchivingStrategy`].

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{ArchiveError, Result};

/// Tunable policy for archive, extract and verify operations.
///
/// Loadable from a TOML file so CLI users can keep profiles around; every
/// field has a default, so partial files are fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivingStrategy {
    /// Apply the deflate filter to file datasets.
    pub compress: bool,
    /// Chunk size for file datasets in bytes; `0` picks the scratch buffer
    /// size.
    pub chunk_size: usize,
    /// Capture uid/gid/permissions when scanning the filesystem.
    pub store_owner_and_permissions: bool,
    /// Restore permissions and modification times on extraction.
    pub restore_attributes: bool,
    /// Restore file ownership on extraction (usually needs privileges).
    pub restore_ownership: bool,
    /// Compare uid/gid/permissions/mtime during verification.
    pub check_attributes: bool,
    /// Compare ownership numerically instead of by account/group name.
    pub numeric_ids: bool,
    /// Basenames of files to skip while archiving.
    pub exclude_names: Vec<String>,
    /// Basenames of directories to skip (the whole subtree is dropped).
    pub exclude_dir_names: Vec<String>,
}

impl Default for ArchivingStrategy {
    fn default() -> Self {
        Self {
            compress: true,
            chunk_size: 0,
            store_owner_and_permissions: false,
            restore_attributes: false,
            restore_ownership: false,
            check_attributes: false,
            numeric_ids: false,
            exclude_names: Vec::new(),
            exclude_dir_names: Vec::new(),
        }
    }
}

impl ArchivingStrategy {
    /// Whether the filesystem node at `fs_path` is excluded from archiving.
    pub fn do_exclude(&self, fs_path: &Path, is_directory: bool) -> bool {
        let name = fs_path.file_name().and_then(OsStr::to_str).unwrap_or("");
        let list = if is_directory { &self.exclude_dir_names } else { &self.exclude_names };
        list.iter().any(|excluded| excluded == name)
    }

    /// Loads a strategy profile from a TOML file.
    pub fn from_toml_file(file: &Path) -> Result<Self> {
        let text = fs::read_to_string(file)?;
        toml::from_str(&text).map_err(|err| {
            ArchiveError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
        })
    }
}
