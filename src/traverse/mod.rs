//! Recursive walks over archive subtrees --- [`Traverser`] and the
//! [`ArchiveProcessor`] contract.

mod extract;
mod list;
mod verify;

pub use extract::ExtractProcessor;
pub use list::ListProcessor;
pub use verify::VerifyProcessor;

use std::sync::Arc;

use crate::archive_path::{self, basename, concat, parent};
use crate::entry::ArchiveEntry;
use crate::errors::{ArchiveError, Result};
use crate::index::provider::{lock, IndexProvider};
use crate::link::LinkRecord;
use crate::storage::Storage;

/// Visitor driven by [`Traverser::process`].
pub trait ArchiveProcessor {
    /// Called for a directory before its children; returning `false` skips
    /// the directory.
    fn visit_pre(&mut self, _entry: &ArchiveEntry) -> Result<bool> {
        Ok(true)
    }

    /// Called for every regular file and symlink.
    fn visit_file(&mut self, entry: &ArchiveEntry) -> Result<()>;

    /// Called for a directory after its children.
    fn visit_post(&mut self, _entry: &ArchiveEntry) -> Result<()> {
        Ok(())
    }
}

/// Drives recursive operations over archive subtrees.
pub(crate) struct Traverser {
    storage: Arc<dyn Storage>,
    provider: Arc<IndexProvider>,
}

impl Traverser {
    pub fn new(storage: Arc<dyn Storage>, provider: Arc<IndexProvider>) -> Self {
        Self { storage, provider }
    }

    /// Walks the subtree at `start_path`, dispatching each entry to the
    /// processor. Without `recursive` only the immediate children of a
    /// directory start path are visited.
    pub fn process(
        &self,
        start_path: &str,
        recursive: bool,
        read_link_targets: bool,
        processor: &mut dyn ArchiveProcessor,
    ) -> Result<()> {
        let path = archive_path::normalize(start_path)?;
        if archive_path::is_root(&path) {
            let entry = self.root_entry()?;
            return self.process_directory(&path, &entry, recursive, read_link_targets, processor);
        }

        let parent_path = parent(&path);
        let parent_index = self.provider.get(parent_path, read_link_targets)?;
        let record = lock(&parent_index)
            .try_get_link(basename(&path))
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(path.clone()))?;
        let entry = ArchiveEntry::from_record(parent_path, &record);

        if record.is_directory() {
            self.process_directory(&path, &entry, recursive, read_link_targets, processor)
        } else {
            processor.visit_file(&entry)
        }
    }

    fn process_directory(
        &self,
        group_path: &str,
        entry: &ArchiveEntry,
        recursive: bool,
        read_link_targets: bool,
        processor: &mut dyn ArchiveProcessor,
    ) -> Result<()> {
        if !processor.visit_pre(entry)? {
            return Ok(());
        }
        let index = self.provider.get(group_path, read_link_targets)?;
        let records: Vec<LinkRecord> =
            lock(&index).records().into_iter().cloned().collect();
        for record in records {
            let child_entry = ArchiveEntry::from_record(group_path, &record);
            if record.is_directory() {
                let child_path = concat(group_path, record.name());
                if recursive {
                    self.process_directory(
                        &child_path,
                        &child_entry,
                        recursive,
                        read_link_targets,
                        processor,
                    )?;
                } else if processor.visit_pre(&child_entry)? {
                    processor.visit_post(&child_entry)?;
                }
            } else {
                processor.visit_file(&child_entry)?;
            }
        }
        processor.visit_post(entry)
    }

    /// The synthetic root entry, enriched with the metadata attributes
    /// attached to the root group.
    fn root_entry(&self) -> Result<ArchiveEntry> {
        let mut entry = ArchiveEntry::from_record("/", &LinkRecord::root());
        if let Some(attrs) = self.storage.group_attributes("/")? {
            entry.last_modified = attrs.last_modified;
            entry.uid = attrs.uid;
            entry.gid = attrs.gid;
            entry.permissions = attrs.permissions;
        }
        Ok(entry)
    }
}
