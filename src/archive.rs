//! Top-level archive handle --- [`Archiver`] --- and the read/write split.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::archive_path::{self, basename, parent};
use crate::deleter::Deleter;
use crate::entry::ArchiveEntry;
use crate::errors::{ArchiveError, ErrorStrategy, Result, RethrowStrategy};
use crate::index::provider::{lock, IndexProvider};
use crate::link::LinkRecord;
use crate::random_access::RandomAccessDataset;
use crate::storage::{self, Storage};
use crate::strategy::ArchivingStrategy;
use crate::traverse::{ExtractProcessor, ListProcessor, Traverser, VerifyProcessor};
use crate::updater::{ArchiveFileWriter, Updater};

/// Read-only queries every archive handle supports.
pub trait ArchiveInfo {
    /// Whether an entry exists at `path`.
    fn exists(&self, path: &str) -> Result<bool>;

    /// The entry at `path`, or `None`. With `read_link_target` symlink
    /// targets are resolved.
    fn try_get_entry(&self, path: &str, read_link_target: bool) -> Result<Option<ArchiveEntry>>;

    /// Entries below `path` in canonical order.
    fn list(&self, path: &str, recursive: bool) -> Result<Vec<ArchiveEntry>>;
}

/// Content access on top of [`ArchiveInfo`].
///
/// The `recursive` switch on each walk mirrors [`ArchiveInfo::list`]:
/// without it only the immediate children of the start directory are
/// processed.
pub trait ArchiveReader: ArchiveInfo {
    /// Re-reads file datasets and reports each entry with recomputed size
    /// and CRC32; mismatches come back with `is_ok() == false`.
    fn test(&self, recursive: bool) -> Result<Vec<ArchiveEntry>>;

    /// Extracts the subtree at `path` under `dest_root`.
    fn extract(&self, path: &str, dest_root: &Path, recursive: bool)
        -> Result<Vec<ArchiveEntry>>;

    /// Compares the subtree at `path` against the filesystem below
    /// `fs_root`.
    fn verify(&self, path: &str, fs_root: &Path, recursive: bool)
        -> Result<Vec<ArchiveEntry>>;

    /// Whole contents of the file entry at `path`.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Opens a file entry for random access. Writes go through when the
    /// archive itself is writable.
    fn open_random_access(
        &self,
        path: &str,
        block_size: Option<usize>,
    ) -> Result<RandomAccessDataset>;
}

/// Mutation on top of [`ArchiveReader`].
pub trait ArchiveWriter: ArchiveReader {
    /// Archives `fs_path` at the root, keeping its basename or, without
    /// `keep_name_from_path`, spilling a directory's contents into the root.
    fn archive(
        &self,
        fs_path: &Path,
        keep_name_from_path: bool,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()>;

    /// Archives `fs_path` as a child of the archive directory
    /// `root_in_archive`.
    fn archive_under(
        &self,
        root_in_archive: &str,
        fs_path: &Path,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()>;

    /// Archives the contents of `fs_dir` into `root_in_archive`.
    fn archive_below(
        &self,
        root_in_archive: &str,
        fs_dir: &Path,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()>;

    /// Archives `fs_path` at the archive path left after stripping
    /// `parent_to_strip`.
    fn archive_relative(
        &self,
        parent_to_strip: &Path,
        fs_path: &Path,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()>;

    /// Archives an explicit entry; `input` is required exactly for regular
    /// files.
    fn archive_entry(
        &self,
        dir_in_archive: &str,
        link: LinkRecord,
        input: Option<&mut dyn Read>,
    ) -> Result<()>;

    /// Opens a streaming writer for a new file entry.
    fn archive_file(&self, dir_in_archive: &str, link: LinkRecord) -> Result<ArchiveFileWriter>;

    /// Deletes the given entries and their backing storage.
    fn delete(&self, paths: &[String], visitor: Option<&mut dyn FnMut(&str)>) -> Result<()>;

    /// Flushes all dirty indices and syncs the container.
    fn flush(&self) -> Result<()>;
}

/// An open archive container.
///
/// Owns the index provider (and with it all cached directory state) plus the
/// shared storage handle. Dropping the archiver flushes best-effort; call
/// [`Archiver::close`] to observe flush failures.
pub struct Archiver {
    storage: Arc<dyn Storage>,
    provider: Arc<IndexProvider>,
    updater: Updater,
    traverser: Traverser,
    deleter: Deleter,
    errors: Arc<dyn ErrorStrategy>,
    read_only: bool,
    closed: bool,
}

impl Archiver {
    /// Opens a writable archive with default strategy and fail-fast errors.
    pub fn open(storage: Arc<dyn Storage>) -> Self {
        Self::with_options(storage, ArchivingStrategy::default(), Arc::new(RethrowStrategy), false)
    }

    /// Opens a read-only view; every mutating operation fails with
    /// [`ArchiveError::IllegalState`].
    pub fn open_read_only(storage: Arc<dyn Storage>) -> Self {
        Self::with_options(storage, ArchivingStrategy::default(), Arc::new(RethrowStrategy), true)
    }

    pub fn with_options(
        storage: Arc<dyn Storage>,
        strategy: ArchivingStrategy,
        errors: Arc<dyn ErrorStrategy>,
        read_only: bool,
    ) -> Self {
        let provider = Arc::new(IndexProvider::new(storage.clone(), errors.clone()));
        let updater = Updater::new(storage.clone(), provider.clone(), strategy);
        let traverser = Traverser::new(storage.clone(), provider.clone());
        let deleter = Deleter::new(storage.clone(), provider.clone());
        Self { storage, provider, updater, traverser, deleter, errors, read_only, closed: false }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn error_strategy(&self) -> &Arc<dyn ErrorStrategy> {
        &self.errors
    }

    pub fn strategy(&self) -> &ArchivingStrategy {
        self.updater.strategy()
    }

    /// Flushes all dirty state and releases the handle.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.provider.close()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(ArchiveError::IllegalState("archive opened read-only"));
        }
        Ok(())
    }
}

impl Drop for Archiver {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.provider.close() {
            tracing::warn!(error = %err, "failed to flush archive on drop");
        }
    }
}

impl ArchiveInfo for Archiver {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.try_get_entry(path, false)?.is_some())
    }

    fn try_get_entry(&self, path: &str, read_link_target: bool) -> Result<Option<ArchiveEntry>> {
        let path = archive_path::normalize(path)?;
        if archive_path::is_root(&path) {
            return Ok(Some(ArchiveEntry::from_record("/", &LinkRecord::root())));
        }
        let parent_index = self.provider.get(parent(&path), read_link_target)?;
        let guard = lock(&parent_index);
        Ok(guard
            .try_get_link(basename(&path))
            .map(|record| ArchiveEntry::from_record(parent(&path), record)))
    }

    fn list(&self, path: &str, recursive: bool) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        let mut visitor = |entry: &ArchiveEntry| entries.push(entry.clone());
        let mut processor = ListProcessor::new(self.storage.clone(), &mut visitor, false);
        self.traverser.process(path, recursive, true, &mut processor)?;
        drop(processor);
        Ok(entries)
    }
}

impl ArchiveReader for Archiver {
    fn test(&self, recursive: bool) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        let mut visitor = |entry: &ArchiveEntry| entries.push(entry.clone());
        let mut processor = ListProcessor::new(self.storage.clone(), &mut visitor, true);
        self.traverser.process("/", recursive, true, &mut processor)?;
        drop(processor);
        Ok(entries)
    }

    fn extract(
        &self,
        path: &str,
        dest_root: &Path,
        recursive: bool,
    ) -> Result<Vec<ArchiveEntry>> {
        let strategy = self.updater.strategy();
        let mut entries = Vec::new();
        let mut visitor = |entry: &ArchiveEntry| entries.push(entry.clone());
        let mut processor = ExtractProcessor::new(
            self.storage.clone(),
            dest_root,
            strategy.restore_attributes,
            strategy.restore_ownership,
            &mut visitor,
        );
        self.traverser.process(path, recursive, true, &mut processor)?;
        drop(processor);
        Ok(entries)
    }

    fn verify(
        &self,
        path: &str,
        fs_root: &Path,
        recursive: bool,
    ) -> Result<Vec<ArchiveEntry>> {
        let strategy = self.updater.strategy();
        let mut entries = Vec::new();
        let mut visitor = |entry: &ArchiveEntry| entries.push(entry.clone());
        let mut processor = VerifyProcessor::new(
            fs_root,
            strategy.check_attributes,
            strategy.numeric_ids,
            &mut visitor,
        );
        self.traverser.process(path, recursive, true, &mut processor)?;
        drop(processor);
        Ok(entries)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = archive_path::normalize(path)?;
        match self.storage.read_dataset(&path) {
            Ok(bytes) => Ok(bytes),
            Err(storage::Error::NodeNotFound(_)) => Err(ArchiveError::NotFound(path)),
            Err(err) => Err(ArchiveError::from(err).unarchiving(&path)),
        }
    }

    fn open_random_access(
        &self,
        path: &str,
        block_size: Option<usize>,
    ) -> Result<RandomAccessDataset> {
        let path = archive_path::normalize(path)?;
        RandomAccessDataset::open(self.storage.clone(), &path, block_size, self.read_only)
    }
}

impl ArchiveWriter for Archiver {
    fn archive(
        &self,
        fs_path: &Path,
        keep_name_from_path: bool,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.updater.archive(fs_path, keep_name_from_path, visitor)
    }

    fn archive_under(
        &self,
        root_in_archive: &str,
        fs_path: &Path,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.updater.archive_under(root_in_archive, fs_path, visitor)
    }

    fn archive_below(
        &self,
        root_in_archive: &str,
        fs_dir: &Path,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.updater.archive_below(root_in_archive, fs_dir, visitor)
    }

    fn archive_relative(
        &self,
        parent_to_strip: &Path,
        fs_path: &Path,
        visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.updater.archive_relative(parent_to_strip, fs_path, visitor)
    }

    fn archive_entry(
        &self,
        dir_in_archive: &str,
        link: LinkRecord,
        input: Option<&mut dyn Read>,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.updater.archive_entry(dir_in_archive, link, input)
    }

    fn archive_file(&self, dir_in_archive: &str, link: LinkRecord) -> Result<ArchiveFileWriter> {
        self.ensure_writable()?;
        self.updater.archive_file(dir_in_archive, link)
    }

    fn delete(&self, paths: &[String], visitor: Option<&mut dyn FnMut(&str)>) -> Result<()> {
        self.ensure_writable()?;
        self.deleter.delete(paths, visitor)
    }

    fn flush(&self) -> Result<()> {
        self.ensure_writable()?;
        self.provider.flush_all()?;
        Ok(self.storage.flush()?)
    }
}
