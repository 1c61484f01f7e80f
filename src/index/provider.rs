//! Container-wide cache of directory indices --- [`IndexProvider`].
//!
//! One provider exists per open container; every component reaches directory
//! state through it, which is what makes the "one index instance per
//! directory" invariant hold.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;

use crate::archive_path;
use crate::errors::{ErrorStrategy, Result};
use crate::link::LinkRecord;
use crate::storage::Storage;

use super::DirectoryIndex;

/// Shared handle to one directory's index.
pub type SharedIndex = Arc<Mutex<DirectoryIndex>>;

/// Cache of [`DirectoryIndex`] instances keyed by archive path.
pub struct IndexProvider {
    storage: Arc<dyn Storage>,
    cache: DashMap<String, SharedIndex>,
    strategy: Arc<dyn ErrorStrategy>,
}

impl IndexProvider {
    pub fn new(storage: Arc<dyn Storage>, strategy: Arc<dyn ErrorStrategy>) -> Self {
        Self { storage, cache: DashMap::new(), strategy }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub(crate) fn strategy(&self) -> &Arc<dyn ErrorStrategy> {
        &self.strategy
    }

    /// Returns the index for `archive_path`, loading it on first access.
    ///
    /// Repeated calls for the same path yield the same instance. When an
    /// index loaded without link targets is requested with
    /// `read_link_targets`, the targets are resolved once in place.
    pub fn get(&self, archive_path: &str, read_link_targets: bool) -> Result<SharedIndex> {
        let key = canonical_key(archive_path);

        let index = match self.cache.get(key) {
            Some(existing) => existing.value().clone(),
            None => {
                let loaded =
                    DirectoryIndex::load(self.storage.as_ref(), key, read_link_targets)?;
                self.cache
                    .entry(key.to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(loaded)))
                    .clone()
            }
        };

        if read_link_targets {
            let mut guard = lock(&index);
            if !guard.link_targets_resolved() {
                guard.resolve_link_targets(self.storage.as_ref())?;
            }
        }
        Ok(index)
    }

    /// Flushes one index: first every live registered streaming writer, then
    /// the index's own datasets.
    ///
    /// The flushables run before the index lock is taken, because a writer's
    /// pending-metadata flush updates indices (possibly this very one)
    /// through the provider.
    pub fn flush_index(&self, index: &SharedIndex) -> Result<()> {
        let flushables = lock(index).live_flushables();
        for flushable in flushables {
            flushable.flush_pending()?;
        }
        lock(index).flush(self.storage.as_ref())
    }

    /// Flushes every cached index, routing individual failures through the
    /// error strategy.
    ///
    /// Runs in two phases: first every live streaming writer anywhere in the
    /// cache, then the indices themselves. A writer's propagation dirties
    /// ancestor indices, so serializing in one interleaved pass could write
    /// an ancestor before its final records arrive.
    pub fn flush_all(&self) -> Result<()> {
        let indices: Vec<SharedIndex> =
            self.cache.iter().map(|entry| entry.value().clone()).collect();
        for index in &indices {
            let flushables = lock(index).live_flushables();
            for flushable in flushables {
                if let Err(err) = flushable.flush_pending() {
                    self.strategy.deal_with_error(err)?;
                }
            }
        }
        // Propagation may have pulled new parents into the cache; re-collect.
        let indices: Vec<SharedIndex> =
            self.cache.iter().map(|entry| entry.value().clone()).collect();
        for index in indices {
            if let Err(err) = lock(&index).flush(self.storage.as_ref()) {
                self.strategy.deal_with_error(err)?;
            }
        }
        Ok(())
    }

    /// Flushes all dirty indices, syncs the storage layer and drops the
    /// cache. The provider is reusable afterwards but starts cold.
    pub fn close(&self) -> Result<()> {
        self.flush_all()?;
        self.storage.flush()?;
        self.cache.clear();
        Ok(())
    }

    /// Drops cached indices at and below `archive_path` without flushing.
    /// Used after deletions so stale dirty state cannot resurrect removed
    /// directories.
    pub(crate) fn evict_subtree(&self, archive_path: &str) {
        let key = canonical_key(archive_path).to_owned();
        let prefix = format!("{}/", key.trim_end_matches('/'));
        self.cache.retain(|path, _| path != &key && !path.starts_with(&prefix));
    }

    /// Propagates an updated entry into its ancestors' indices.
    ///
    /// The entry itself lands in its parent's index carrying its checksum;
    /// each further ancestor is recorded as a plain directory. The walk stops
    /// at `strip_root` (or the archive root). With `immediate_group_only`
    /// only the direct parent is touched, which is correct when that group
    /// already existed before the write.
    pub(crate) fn update_indices_on_path(
        &self,
        archive_path: &str,
        link: LinkRecord,
        immediate_group_only: bool,
        strip_root: &str,
    ) -> Result<()> {
        let strip_root = canonical_key(strip_root);
        let mut child_record = link;
        let mut child_path = archive_path.to_owned();
        loop {
            let parent = canonical_key(archive_path::parent(&child_path)).to_owned();
            let index = self.get(&parent, false)?;
            lock(&index).update_index(child_record);
            if immediate_group_only || parent == strip_root || archive_path::is_root(&parent) {
                return Ok(());
            }
            child_record = LinkRecord::directory(archive_path::basename(&parent));
            child_path = parent;
        }
    }
}

impl std::fmt::Debug for IndexProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexProvider").field("cached", &self.cache.len()).finish()
    }
}

/// The empty parent of a top-level child and the root spell the same group.
fn canonical_key(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

pub(crate) fn lock(index: &SharedIndex) -> MutexGuard<'_, DirectoryIndex> {
    index.lock().expect("directory index lock poisoned")
}
