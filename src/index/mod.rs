//! Per-directory entry index --- [`DirectoryIndex`] --- and its on-disk form.

pub(crate) mod compound;
pub mod provider;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Weak;

use crate::archive_path;
use crate::errors::{ArchiveError, Result};
use crate::link::LinkRecord;
use crate::storage::{self, Storage};

pub use compound::{INDEX_DATASET_NAME, INDEX_NAMES_DATASET_NAME};

/// An in-flight streaming writer whose pending size/checksum must be
/// persisted into index records before the index itself is written out.
/// Registrations carry an id for deregistration and are held weakly, so a
/// dropped writer unhooks itself.
pub(crate) trait IndexFlushable: Send + Sync {
    /// Pushes the writer's running size and CRC32 into the owning indices.
    fn flush_pending(&self) -> Result<()>;
}

/// The contents of one archive directory.
///
/// Loaded lazily from the two sibling index datasets of the group, kept
/// either *clean* (matching disk) or *dirty* (with unflushed updates).
/// Instances are unique per directory path; [`provider::IndexProvider`]
/// enforces that.
pub struct DirectoryIndex {
    group_path: String,
    entries: HashMap<String, LinkRecord>,
    link_targets_resolved: bool,
    dirty: bool,
    flushables: Vec<(u64, Weak<dyn IndexFlushable>)>,
}

impl DirectoryIndex {
    /// Loads the index of `group_path` from storage.
    ///
    /// A directory whose index datasets do not exist yet (a newly created
    /// group, or the untouched root) is synthesized as empty.
    pub(crate) fn load(
        storage: &dyn Storage,
        group_path: &str,
        read_link_targets: bool,
    ) -> Result<Self> {
        let compound_bytes = read_optional_dataset(
            storage,
            &archive_path::concat(group_path, INDEX_DATASET_NAME),
        )?;
        let names = read_optional_dataset(
            storage,
            &archive_path::concat(group_path, INDEX_NAMES_DATASET_NAME),
        )?;

        let mut index = Self {
            group_path: group_path.to_owned(),
            entries: HashMap::new(),
            link_targets_resolved: read_link_targets,
            dirty: false,
            flushables: Vec::new(),
        };

        let Some(compound_bytes) = compound_bytes else {
            tracing::debug!(group = group_path, "no index datasets, synthesizing empty index");
            return Ok(index);
        };
        let names = names.unwrap_or_default();

        if compound_bytes.len() % compound::RECORD_SIZE != 0 {
            return Err(corrupt(group_path, "index dataset size is not a whole record count"));
        }
        let count = compound_bytes.len() / compound::RECORD_SIZE;
        let mut src = Cursor::new(compound_bytes);
        let mut offset = 0usize;
        for _ in 0..count {
            let raw = compound::read_record(&mut src)
                .map_err(|err| ArchiveError::from(err).unarchiving(group_path))?;
            let (record, next_offset) = LinkRecord::init_after_reading(
                raw,
                &names,
                offset,
                storage,
                group_path,
                read_link_targets,
            )
            .map_err(|err| match err {
                err @ ArchiveError::Unarchiving { .. } => err,
                other => other.unarchiving(group_path),
            })?;
            offset = next_offset;
            index.entries.insert(record.name().to_owned(), record);
        }
        tracing::debug!(group = group_path, entries = count, "loaded directory index");
        Ok(index)
    }

    /// Archive path of the directory this index describes.
    pub fn group_path(&self) -> &str {
        &self.group_path
    }

    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn try_get_link(&self, name: &str) -> Option<&LinkRecord> {
        self.entries.get(name)
    }

    /// Returns the entry only when it is a regular file or a symlink.
    pub fn try_get_file_link(&self, name: &str) -> Option<&LinkRecord> {
        self.entries
            .get(name)
            .filter(|record| record.is_regular_file() || record.is_symlink())
    }

    pub fn is_directory(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(LinkRecord::is_directory)
    }

    /// Entries in canonical order: directories first, then by name.
    pub fn records(&self) -> Vec<&LinkRecord> {
        let mut records: Vec<&LinkRecord> = self.entries.values().collect();
        records.sort();
        records
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Inserts or replaces the record with the same name. Marks the index
    /// dirty.
    pub fn update_index(&mut self, record: LinkRecord) {
        self.entries.insert(record.name().to_owned(), record);
        self.dirty = true;
    }

    /// Replaces the whole directory contents with `records`.
    ///
    /// Used after archiving an entire directory; entries not in `records`
    /// are dropped from the index but their backing storage is untouched.
    /// Duplicate names: last one wins.
    pub fn update_index_bulk(&mut self, records: Vec<LinkRecord>) {
        self.entries.clear();
        for record in records {
            self.entries.insert(record.name().to_owned(), record);
        }
        self.dirty = true;
    }

    /// Removes the named entry; returns whether it was present. Marks the
    /// index dirty when it was.
    pub fn remove(&mut self, name: &str) -> bool {
        let removed = self.entries.remove(name).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub(crate) fn add_flushable(&mut self, id: u64, flushable: Weak<dyn IndexFlushable>) {
        self.remove_flushable(id);
        self.flushables.push((id, flushable));
    }

    pub(crate) fn remove_flushable(&mut self, id: u64) {
        self.flushables.retain(|(fid, _)| *fid != id);
    }

    /// Snapshot of the still-alive registered flushables. Dead registrations
    /// are pruned as a side effect.
    pub(crate) fn live_flushables(&mut self) -> Vec<std::sync::Arc<dyn IndexFlushable>> {
        self.flushables.retain(|(_, weak)| weak.strong_count() > 0);
        self.flushables.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    pub(crate) fn link_targets_resolved(&self) -> bool {
        self.link_targets_resolved
    }

    /// One-shot upgrade: resolves symlink targets for every SYMLINK entry.
    pub(crate) fn resolve_link_targets(&mut self, storage: &dyn Storage) -> Result<()> {
        if self.link_targets_resolved {
            return Ok(());
        }
        let names: Vec<String> = self
            .entries
            .values()
            .filter(|r| r.is_symlink() && r.link_target().is_none())
            .map(|r| r.name().to_owned())
            .collect();
        for name in names {
            let target =
                storage.read_soft_link(&archive_path::concat(&self.group_path, &name))?;
            if let Some(record) = self.entries.get(&name) {
                // Replacing the record only changes the transient target;
                // the on-disk state is untouched, so the index stays clean.
                let updated = record.with_link_target(target);
                self.entries.insert(name, updated);
            }
        }
        self.link_targets_resolved = true;
        Ok(())
    }

    /// Serializes the compound records and the names blob and writes both
    /// datasets back, replacing prior content. No-op when clean.
    ///
    /// Registered flushables must already have run; the provider drives them
    /// before taking this index's lock (see
    /// [`provider::IndexProvider::flush_index`]).
    pub(crate) fn flush(&mut self, storage: &dyn Storage) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut names: Vec<u8> = Vec::new();
        let mut compound_bytes: Vec<u8> =
            Vec::with_capacity(self.entries.len() * compound::RECORD_SIZE);
        let count = {
            let records = self.records();
            for record in records.iter().copied() {
                let name_length = record.prepare_for_writing(&mut names);
                compound::write_record(&mut compound_bytes, record, name_length)
                    .map_err(|err| ArchiveError::from(err).archiving(&self.group_path))?;
            }
            records.len()
        };
        storage.write_dataset(
            &archive_path::concat(&self.group_path, INDEX_DATASET_NAME),
            &compound_bytes,
        )?;
        storage.write_dataset(
            &archive_path::concat(&self.group_path, INDEX_NAMES_DATASET_NAME),
            &names,
        )?;
        self.dirty = false;
        tracing::debug!(group = %self.group_path, entries = count, "flushed directory index");
        Ok(())
    }
}

fn read_optional_dataset(storage: &dyn Storage, path: &str) -> Result<Option<Vec<u8>>> {
    match storage.read_dataset(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(storage::Error::NodeNotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn corrupt(group_path: &str, detail: &str) -> ArchiveError {
    ArchiveError::from(std::io::Error::new(std::io::ErrorKind::InvalidData, detail.to_owned()))
        .unarchiving(group_path)
}

impl std::fmt::Debug for DirectoryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryIndex")
            .field("group_path", &self.group_path)
            .field("entries", &self.entries.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}
