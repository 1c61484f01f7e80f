//! Filesystem-to-archive ingestion --- the archive updater.

pub(crate) mod writer;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::archive_path::{self, concat};
use crate::errors::{ArchiveError, Result};
use crate::index::provider::{lock, IndexProvider};
use crate::link::{FileLinkType, LinkRecord};
use crate::metadata;
use crate::storage::{DatasetLayout, GroupAttributes, Storage, FILE_OPAQUE_TAG};
use crate::strategy::ArchivingStrategy;

pub use writer::ArchiveFileWriter;

/// Streams this size or less into a CONTIGUOUS dataset: the chunk header
/// overhead outweighs any deflate savings for small data.
pub const SMALL_DATASET_LIMIT: u64 = 4096;

/// Directories with more children than this get a group size hint.
pub const MIN_GROUP_MEMBER_COUNT_TO_COMPUTE_SIZEHINT: usize = 100;

/// Bytes of local-heap hint per byte of child name.
pub const SIZEHINT_FACTOR: usize = 5;

/// Size of the shared scratch buffer used for file streaming.
pub const SCRATCH_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Size and checksum of a completed file write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub size: u64,
    pub crc32: u32,
}

/// Ingests filesystem trees and individual entries into the archive, keeping
/// index records consistent up to the archive root.
pub(crate) struct Updater {
    storage: Arc<dyn Storage>,
    provider: Arc<IndexProvider>,
    strategy: ArchivingStrategy,
    /// Shared scratch buffer, borrowed exclusively for one file write at a
    /// time.
    buffer: RefCell<Vec<u8>>,
}

impl Updater {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<IndexProvider>,
        strategy: ArchivingStrategy,
    ) -> Self {
        Self { storage, provider, strategy, buffer: RefCell::new(vec![0u8; SCRATCH_BUFFER_SIZE]) }
    }

    pub fn strategy(&self) -> &ArchivingStrategy {
        &self.strategy
    }

    /// Archives `fs_path` at the archive root.
    ///
    /// With `keep_name_from_path` the entry lands as `/<basename>`; without
    /// it `fs_path` itself is the strip prefix and its contents land directly
    /// at the root.
    pub fn archive(
        &self,
        fs_path: &Path,
        keep_name_from_path: bool,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()> {
        if keep_name_from_path {
            self.archive_under("/", fs_path, visitor)
        } else {
            self.archive_below("/", fs_path, visitor)
        }
    }

    /// Archives `fs_path` as a child of the archive directory
    /// `root_in_archive`.
    pub fn archive_under(
        &self,
        root_in_archive: &str,
        fs_path: &Path,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()> {
        let mut noop = |_: &str| {};
        let visitor = visitor.unwrap_or(&mut noop);
        self.archive_at(root_in_archive, fs_path, visitor)
    }

    /// Archives the *contents* of `fs_dir`, not `fs_dir` itself, into the
    /// archive directory `root_in_archive`.
    pub fn archive_below(
        &self,
        root_in_archive: &str,
        fs_dir: &Path,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()> {
        let mut noop = |_: &str| {};
        let visitor = visitor.unwrap_or(&mut noop);
        let root = archive_path::normalize(root_in_archive)?;
        let parent_existed = self.ensure_groups(&root)?;

        let records = self.archive_children(fs_dir, &root, visitor)?;
        let index = self.provider.get(&root, false)?;
        lock(&index).update_index_bulk(records);

        if archive_path::is_root(&root) {
            self.store_root_attributes(fs_dir);
        } else {
            let record = directory_record(&root, fs_dir, &self.strategy);
            self.provider.update_indices_on_path(&root, record, parent_existed, "/")?;
        }
        visitor(&root);
        Ok(())
    }

    /// Archives `fs_path` at the archive path obtained by stripping
    /// `parent_to_strip` from it.
    pub fn archive_relative(
        &self,
        parent_to_strip: &Path,
        fs_path: &Path,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()> {
        let relative = fs_path.strip_prefix(parent_to_strip).map_err(|_| {
            ArchiveError::InvalidPath(format!(
                "'{}' is not below the strip prefix '{}'",
                fs_path.display(),
                parent_to_strip.display()
            ))
        })?;
        let mut archive_parent = "/".to_owned();
        if let Some(dir) = relative.parent() {
            for component in dir.components() {
                if let std::path::Component::Normal(name) = component {
                    let name = name.to_str().ok_or_else(|| {
                        ArchiveError::InvalidPath(fs_path.display().to_string())
                    })?;
                    archive_parent = concat(&archive_parent, name);
                }
            }
        }
        let mut noop = |_: &str| {};
        let visitor = visitor.unwrap_or(&mut noop);
        self.archive_at(&archive_parent, fs_path, visitor)
    }

    /// Archives an explicit link record. `input` is required exactly when the
    /// record describes a regular file.
    pub fn archive_entry(
        &self,
        dir_in_archive: &str,
        link: LinkRecord,
        input: Option<&mut dyn Read>,
    ) -> Result<()> {
        let dir = archive_path::normalize(dir_in_archive)?;
        let parent_existed = self.ensure_groups(&dir)?;
        let path = concat(&dir, link.name());

        let record = match link.link_type() {
            FileLinkType::RegularFile => {
                let input = input.ok_or(ArchiveError::IllegalState(
                    "an input stream is required to archive a regular file entry",
                ))?;
                self.replace_node(&path)?;
                let result = self
                    .stream_file(input, &path)
                    .map_err(|err| err.archiving(&path))?;
                link.with_size_and_crc32(result.size as i64, result.crc32)
            }
            FileLinkType::Directory => {
                if self.storage.object_type(&path)?.is_none() {
                    self.storage.create_group(&path, None)?;
                }
                link
            }
            FileLinkType::Symlink => {
                let target = link.link_target().ok_or(ArchiveError::IllegalState(
                    "a symlink entry needs a target",
                ))?;
                self.replace_node(&path)?;
                self.storage.create_soft_link(&path, target)?;
                link
            }
            FileLinkType::Other => {
                return Err(ArchiveError::IllegalState(
                    "only files, directories and symlinks can be archived",
                ))
            }
        };
        self.provider.update_indices_on_path(&path, record, parent_existed, "/")
    }

    /// Opens a streaming writer for a new regular file entry. The entry's
    /// size and checksum are recorded when the writer flushes or closes.
    pub fn archive_file(&self, dir_in_archive: &str, link: LinkRecord) -> Result<ArchiveFileWriter> {
        if !link.is_regular_file() {
            return Err(ArchiveError::IllegalState(
                "streaming writers are only available for regular file entries",
            ));
        }
        let dir = archive_path::normalize(dir_in_archive)?;
        let parent_existed = self.ensure_groups(&dir)?;
        let path = concat(&dir, link.name());
        self.replace_node(&path)?;
        self.storage
            .create_opaque_dataset(
                &path,
                FILE_OPAQUE_TAG,
                DatasetLayout::Chunked { chunk_size: self.effective_chunk() },
                0,
                self.strategy.compress,
            )
            .map_err(|err| ArchiveError::from(err).archiving(&path))?;
        let index = self.provider.get(&dir, false)?;
        ArchiveFileWriter::create(
            self.storage.clone(),
            self.provider.clone(),
            index,
            path,
            link,
            parent_existed,
        )
    }

    /// Archives one filesystem node (file, directory tree or symlink) as a
    /// child of `archive_parent`.
    fn archive_at(
        &self,
        archive_parent: &str,
        fs_path: &Path,
        visitor: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let parent = archive_path::normalize(archive_parent)?;
        let parent_existed = self.ensure_groups(&parent)?;
        let Some(record) = self.archive_node(fs_path, &parent, visitor)? else {
            return Ok(());
        };
        let path = concat(&parent, record.name());
        self.provider.update_indices_on_path(&path, record, parent_existed, "/")
    }

    /// Converts one filesystem node into an archived entry plus its record.
    ///
    /// Failures are routed through the error strategy; `Ok(None)` means the
    /// node was excluded or dropped after a tolerated failure.
    fn archive_node(
        &self,
        fs_path: &Path,
        archive_parent: &str,
        visitor: &mut dyn FnMut(&str),
    ) -> Result<Option<LinkRecord>> {
        let name = match fs_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_owned(),
            None => {
                return Err(ArchiveError::InvalidPath(fs_path.display().to_string()));
            }
        };
        let record = match LinkRecord::from_filesystem(
            &name,
            fs_path,
            self.strategy.store_owner_and_permissions,
        ) {
            Ok(record) => record,
            Err(err) => {
                let err = ArchiveError::from(err).archiving(&concat(archive_parent, &name));
                self.provider.strategy().deal_with_error(err)?;
                return Ok(None);
            }
        };
        if self.strategy.do_exclude(fs_path, record.is_directory()) {
            tracing::debug!(path = %fs_path.display(), "excluded by strategy");
            return Ok(None);
        }

        let path = concat(archive_parent, &name);
        let outcome = match record.link_type() {
            FileLinkType::Directory => self
                .archive_directory(fs_path, &path, visitor)
                .map(|()| record),
            FileLinkType::RegularFile => {
                self.replace_node(&path).and_then(|()| {
                    let mut file = fs::File::open(fs_path).map_err(ArchiveError::from)?;
                    let result = self.stream_file(&mut file, &path)?;
                    Ok(record.with_size_and_crc32(result.size as i64, result.crc32))
                })
            }
            FileLinkType::Symlink => match record.link_target() {
                Some(target) => {
                    let target = target.to_owned();
                    self.replace_node(&path)
                        .and_then(|()| Ok(self.storage.create_soft_link(&path, &target)?))
                        .map(|()| record)
                }
                None => Err(ArchiveError::IllegalState("symlink target could not be read")),
            },
            FileLinkType::Other => Err(ArchiveError::IllegalState(
                "node is neither a file nor a directory nor a symlink",
            )),
        };

        match outcome {
            Ok(record) => {
                visitor(&path);
                Ok(Some(record))
            }
            Err(err) => {
                let err = match err {
                    err @ ArchiveError::Archiving { .. } => err,
                    other => other.archiving(&path),
                };
                self.provider.strategy().deal_with_error(err)?;
                Ok(None)
            }
        }
    }

    /// Creates the group for a directory and archives all of its children,
    /// then installs the collected records as the directory's index.
    fn archive_directory(
        &self,
        fs_dir: &Path,
        group_path: &str,
        visitor: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let children = read_dir_sorted(fs_dir)?;
        let size_hint = if children.len() > MIN_GROUP_MEMBER_COUNT_TO_COMPUTE_SIZEHINT {
            let total: usize = children.iter().map(|(name, _)| name.len()).sum();
            Some(SIZEHINT_FACTOR * total)
        } else {
            None
        };
        if self.storage.object_type(group_path)?.is_none() {
            self.storage.create_group(group_path, size_hint)?;
        }

        let mut records = Vec::with_capacity(children.len());
        for (_, child_path) in children {
            if let Some(record) = self.archive_node(&child_path, group_path, visitor)? {
                records.push(record);
            }
        }
        let index = self.provider.get(group_path, false)?;
        lock(&index).update_index_bulk(records);
        Ok(())
    }

    /// Archives the children of `fs_dir` into `group_path` without touching
    /// the group's own record; returns the surviving records.
    fn archive_children(
        &self,
        fs_dir: &Path,
        group_path: &str,
        visitor: &mut dyn FnMut(&str),
    ) -> Result<Vec<LinkRecord>> {
        let children = read_dir_sorted(fs_dir)?;
        let mut records = Vec::with_capacity(children.len());
        for (_, child_path) in children {
            if let Some(record) = self.archive_node(&child_path, group_path, visitor)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Streams a reader into a chunked opaque dataset, falling back to a
    /// CONTIGUOUS layout when the whole input fits the small-dataset limit
    /// (or compression is off and the input ends within the first chunk).
    fn stream_file(&self, input: &mut dyn Read, dataset_path: &str) -> Result<WriteResult> {
        let mut buffer = self.buffer.borrow_mut();
        let effective_chunk = self.effective_chunk();
        let compress = self.strategy.compress;

        self.storage.create_opaque_dataset(
            dataset_path,
            FILE_OPAQUE_TAG,
            DatasetLayout::Chunked { chunk_size: effective_chunk },
            0,
            compress,
        )?;

        let mut hasher = crc32fast::Hasher::new();
        let mut n = read_fully(input, &mut buffer[..effective_chunk])?;

        if n < effective_chunk && (n as u64 <= SMALL_DATASET_LIMIT || !compress) {
            self.storage.delete(dataset_path)?;
            self.storage.create_opaque_dataset(
                dataset_path,
                FILE_OPAQUE_TAG,
                DatasetLayout::Contiguous,
                n as u64,
                false,
            )?;
            if n > 0 {
                self.storage.write_block(dataset_path, &buffer[..n], 0)?;
            }
            hasher.update(&buffer[..n]);
            return Ok(WriteResult { size: n as u64, crc32: hasher.finalize() });
        }

        let mut offset = 0u64;
        loop {
            if n == 0 {
                break;
            }
            self.storage.write_block(dataset_path, &buffer[..n], offset)?;
            hasher.update(&buffer[..n]);
            offset += n as u64;
            if n < effective_chunk {
                break;
            }
            n = read_fully(input, &mut buffer[..effective_chunk])?;
        }
        Ok(WriteResult { size: offset, crc32: hasher.finalize() })
    }

    fn effective_chunk(&self) -> usize {
        let buffer_len = SCRATCH_BUFFER_SIZE;
        if self.strategy.chunk_size > 0 {
            self.strategy.chunk_size.min(buffer_len)
        } else {
            buffer_len
        }
    }

    /// Creates any missing groups on the way to `dir`; reports whether the
    /// directory itself already existed.
    fn ensure_groups(&self, dir: &str) -> Result<bool> {
        if archive_path::is_root(dir) {
            return Ok(true);
        }
        if self.storage.object_type(dir)?.is_some() {
            return Ok(true);
        }
        let parent = archive_path::parent(dir);
        let parent = if parent.is_empty() { "/" } else { parent };
        self.ensure_groups(parent)?;
        self.storage.create_group(dir, None)?;
        Ok(false)
    }

    /// Clears the way for a replacement entry at `path`.
    fn replace_node(&self, path: &str) -> Result<()> {
        if self.storage.object_type(path)?.is_some() {
            self.storage.delete(path)?;
        }
        Ok(())
    }

    /// Captures the source directory's metadata onto the root group.
    fn store_root_attributes(&self, fs_dir: &Path) {
        let Ok(meta) = metadata::probe(fs_dir, self.strategy.store_owner_and_permissions) else {
            return;
        };
        let attrs = GroupAttributes {
            last_modified: meta.last_modified,
            uid: meta.uid,
            gid: meta.gid,
            permissions: meta.permissions,
        };
        if let Err(err) = self.storage.set_group_attributes("/", attrs) {
            self.provider.strategy().warning(&format!("cannot store root metadata: {err}"));
        }
    }
}

/// Directory record for an archived directory, carrying the source
/// directory's metadata when it can be read.
fn directory_record(group_path: &str, fs_dir: &Path, strategy: &ArchivingStrategy) -> LinkRecord {
    let name = archive_path::basename(group_path);
    match LinkRecord::from_filesystem(name, fs_dir, strategy.store_owner_and_permissions) {
        Ok(record) => record,
        Err(_) => LinkRecord::directory(name),
    }
}

/// Lists a directory's children sorted by name for deterministic archives.
fn read_dir_sorted(fs_dir: &Path) -> Result<Vec<(String, std::path::PathBuf)>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(fs_dir).map_err(ArchiveError::from)? {
        let entry = entry.map_err(ArchiveError::from)?;
        match entry.file_name().into_string() {
            Ok(name) => children.push((name, entry.path())),
            Err(name) => {
                return Err(ArchiveError::InvalidPath(name.to_string_lossy().into_owned()))
            }
        }
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(children)
}

/// Reads until `buf` is full or the input is exhausted.
fn read_fully(input: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).map_err(ArchiveError::from)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
