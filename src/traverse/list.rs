//! Listing processor, with optional stored-checksum re-validation.

use std::sync::Arc;

use crate::archive_path;
use crate::entry::ArchiveEntry;
use crate::errors::Result;
use crate::link::FileLinkType;
use crate::storage::Storage;

use super::ArchiveProcessor;

const READ_BLOCK_SIZE: usize = 64 * 1024;

/// Converts each record into an [`ArchiveEntry`] view and forwards it to a
/// visitor. With `test_archive` every file dataset is re-read block by block
/// and entries whose recomputed CRC32 or size disagree with the stored index
/// are reported not-ok.
pub struct ListProcessor<'a> {
    storage: Arc<dyn Storage>,
    visitor: &'a mut dyn FnMut(&ArchiveEntry),
    test_archive: bool,
    buffer: Vec<u8>,
}

impl<'a> ListProcessor<'a> {
    pub fn new(
        storage: Arc<dyn Storage>,
        visitor: &'a mut dyn FnMut(&ArchiveEntry),
        test_archive: bool,
    ) -> Self {
        Self { storage, visitor, test_archive, buffer: vec![0u8; READ_BLOCK_SIZE] }
    }

    fn test_file(&mut self, entry: &mut ArchiveEntry) -> Result<()> {
        entry.verified_type = Some(FileLinkType::RegularFile);
        let info = match self.storage.dataset_info(&entry.path) {
            Ok(info) => info,
            Err(err) => {
                entry.set_failure(format!("cannot stat dataset: {err}"));
                return Ok(());
            }
        };
        entry.verified_size = Some(info.size as i64);

        let mut hasher = crc32fast::Hasher::new();
        let mut offset = 0u64;
        loop {
            let n = match self.storage.read_block(&entry.path, &mut self.buffer, offset) {
                Ok(n) => n,
                Err(err) => {
                    entry.set_failure(format!("cannot read dataset: {err}"));
                    return Ok(());
                }
            };
            if n == 0 {
                break;
            }
            hasher.update(&self.buffer[..n]);
            offset += n as u64;
        }
        let computed = hasher.finalize();
        entry.verified_crc32 = Some(computed);
        if entry.has_crc32() && computed != entry.crc32 {
            let err = crate::errors::ArchiveError::Integrity {
                path: entry.path.clone(),
                stored: entry.crc32,
                computed,
            };
            entry.set_failure(err.to_string());
        }
        Ok(())
    }
}

impl ArchiveProcessor for ListProcessor<'_> {
    fn visit_pre(&mut self, entry: &ArchiveEntry) -> Result<bool> {
        if !archive_path::is_root(&entry.path) {
            (self.visitor)(entry);
        }
        Ok(true)
    }

    fn visit_file(&mut self, entry: &ArchiveEntry) -> Result<()> {
        let mut entry = entry.clone();
        if self.test_archive && entry.is_regular_file() {
            self.test_file(&mut entry)?;
        }
        (self.visitor)(&entry);
        Ok(())
    }
}
