//! Entry removal --- the archive deleter.

use std::sync::Arc;

use crate::archive_path::{self, basename, concat, parent};
use crate::errors::{ArchiveError, Result};
use crate::index::provider::{lock, IndexProvider};
use crate::link::LinkRecord;
use crate::storage::Storage;

/// Removes entries and their backing storage, updating parent indices.
pub(crate) struct Deleter {
    storage: Arc<dyn Storage>,
    provider: Arc<IndexProvider>,
}

impl Deleter {
    pub fn new(storage: Arc<dyn Storage>, provider: Arc<IndexProvider>) -> Self {
        Self { storage, provider }
    }

    /// Deletes each path in `paths`.
    ///
    /// Unknown paths produce a warning through the error strategy and are
    /// skipped; other failures are routed through the strategy, which decides
    /// whether the batch continues.
    pub fn delete(
        &self,
        paths: &[String],
        mut visitor: Option<&mut dyn FnMut(&str)>,
    ) -> Result<()> {
        for raw_path in paths {
            let path = archive_path::normalize(raw_path)?;
            if archive_path::is_root(&path) {
                self.provider
                    .strategy()
                    .warning("refusing to delete the archive root");
                continue;
            }
            match self.delete_one(&path) {
                Ok(true) => {
                    if let Some(visit) = visitor.as_deref_mut() {
                        visit(&path);
                    }
                }
                Ok(false) => {
                    self.provider
                        .strategy()
                        .warning(&format!("'{path}' does not exist in the archive"));
                }
                Err(err) => {
                    let err = match err {
                        err @ ArchiveError::Unarchiving { .. } => err,
                        other => other.unarchiving(&path),
                    };
                    self.provider.strategy().deal_with_error(err)?;
                }
            }
        }
        Ok(())
    }

    /// Deletes one entry; `Ok(false)` when it does not exist.
    fn delete_one(&self, path: &str) -> Result<bool> {
        let parent_path = parent(path);
        let name = basename(path);
        let parent_index = self.provider.get(parent_path, false)?;

        let record = match lock(&parent_index).try_get_link(name) {
            Some(record) => record.clone(),
            None => return Ok(false),
        };

        if record.is_directory() {
            self.delete_subtree_storage(path)?;
            self.provider.evict_subtree(path);
        }
        self.storage.delete(path)?;
        lock(&parent_index).remove(name);
        tracing::debug!(path, "deleted archive entry");
        Ok(true)
    }

    /// Removes the backing storage of a directory's descendants, children
    /// before parents.
    fn delete_subtree_storage(&self, group_path: &str) -> Result<()> {
        let index = self.provider.get(group_path, false)?;
        let records: Vec<LinkRecord> =
            lock(&index).records().into_iter().cloned().collect();
        for record in records {
            let child_path = concat(group_path, record.name());
            if record.is_directory() {
                self.delete_subtree_storage(&child_path)?;
            }
            self.storage.delete(&child_path)?;
        }
        Ok(())
    }
}
