//! Incremental file entry writer --- [`ArchiveFileWriter`].
//!
//! Wraps the raw dataset output path with CRC32 and size accumulation plus a
//! deferred index update. The writer registers itself with the target
//! directory index so that an index flush always sees final metadata for
//! entries that are still streaming.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::Result;
use crate::index::provider::{lock, IndexProvider, SharedIndex};
use crate::index::IndexFlushable;
use crate::link::LinkRecord;
use crate::storage::Storage;

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

struct WriterState {
    link: LinkRecord,
    hasher: crc32fast::Hasher,
    count: u64,
}

pub(crate) struct WriterCore {
    storage: Arc<dyn Storage>,
    provider: Arc<IndexProvider>,
    dataset_path: String,
    immediate_group_only: bool,
    id: u64,
    state: Mutex<WriterState>,
}

impl WriterCore {
    fn finalized_record(&self) -> LinkRecord {
        let state = self.state.lock().expect("writer state lock poisoned");
        state.link.with_size_and_crc32(state.count as i64, state.hasher.clone().finalize())
    }
}

impl IndexFlushable for WriterCore {
    /// Pushes the running size and CRC32 into the index records so a flush of
    /// the owning index never persists stale metadata.
    fn flush_pending(&self) -> Result<()> {
        let record = self.finalized_record();
        self.provider.update_indices_on_path(
            &self.dataset_path,
            record,
            self.immediate_group_only,
            "/",
        )
    }
}

/// Streaming writer for one regular file entry.
///
/// Bytes are persisted in write order; `flush` records the size and checksum
/// of everything written so far and propagates it up the ancestor indices.
/// Dropping the writer closes it best-effort; [`ArchiveFileWriter::close`]
/// reports errors instead of swallowing them.
pub struct ArchiveFileWriter {
    core: Arc<WriterCore>,
    index: SharedIndex,
    closed: bool,
}

impl ArchiveFileWriter {
    pub(crate) fn create(
        storage: Arc<dyn Storage>,
        provider: Arc<IndexProvider>,
        index: SharedIndex,
        dataset_path: String,
        link: LinkRecord,
        immediate_group_only: bool,
    ) -> Result<Self> {
        let core = Arc::new(WriterCore {
            storage,
            provider,
            dataset_path,
            immediate_group_only,
            id: NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(WriterState {
                link,
                hasher: crc32fast::Hasher::new(),
                count: 0,
            }),
        });
        let as_flushable: Arc<dyn IndexFlushable> = core.clone();
        lock(&index).add_flushable(core.id, Arc::downgrade(&as_flushable));
        Ok(Self { core, index, closed: false })
    }

    /// Archive path of the entry being written.
    pub fn path(&self) -> &str {
        &self.core.dataset_path
    }

    /// Bytes written so far.
    pub fn count(&self) -> u64 {
        self.core.state.lock().expect("writer state lock poisoned").count
    }

    /// Flushes pending metadata, deregisters from the index and consumes the
    /// writer.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.core.flush_pending();
        lock(&self.index).remove_flushable(self.core.id);
        result
    }
}

impl Write for ArchiveFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer is closed"));
        }
        let mut state = self.core.state.lock().expect("writer state lock poisoned");
        self.core
            .storage
            .write_block(&self.core.dataset_path, buf, state.count)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        state.hasher.update(buf);
        state.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.core
            .flush_pending()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

impl Drop for ArchiveFileWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close_inner() {
            tracing::warn!(
                path = %self.core.dataset_path,
                error = %err,
                "failed to finalize streaming writer on drop"
            );
        }
    }
}

impl std::fmt::Debug for ArchiveFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFileWriter")
            .field("path", &self.core.dataset_path)
            .field("closed", &self.closed)
            .finish()
    }
}
