//! Error taxonomy and error-handling strategies for archive operations.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage;

/// Result of archive operations with error type [`ArchiveError`].
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors produced by the archiver.
#[derive(Debug)]
pub enum ArchiveError {
    /// A write-side failure, bound to the archive path that was being written.
    Archiving { path: String, source: Box<ArchiveError> },
    /// A read-side failure during listing, extraction or verification.
    Unarchiving { path: String, source: Box<ArchiveError> },
    /// Path normalization violation, e.g. `..` escaping above the root.
    InvalidPath(String),
    /// CRC32 mismatch detected by `test` or `verify`.
    Integrity { path: String, stored: u32, computed: u32 },
    /// The named entry does not exist in the archive.
    NotFound(String),
    /// Operation not permitted in the current state, e.g. a write on a
    /// read-only archive.
    IllegalState(&'static str),
    /// Failure of the underlying storage library.
    Storage(storage::Error),
    /// Plain I/O failure outside the storage layer.
    Io(io::Error),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::Archiving { path, source } => {
                write!(f, "error archiving '{path}': {source}")
            }
            ArchiveError::Unarchiving { path, source } => {
                write!(f, "error unarchiving '{path}': {source}")
            }
            ArchiveError::InvalidPath(path) => write!(f, "invalid archive path '{path}'"),
            ArchiveError::Integrity { path, stored, computed } => write!(
                f,
                "integrity check failed for '{path}': stored CRC32 {stored:08x}, computed {computed:08x}"
            ),
            ArchiveError::NotFound(path) => write!(f, "entry '{path}' not found"),
            ArchiveError::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            ArchiveError::Storage(err) => write!(f, "storage failure: {err}"),
            ArchiveError::Io(err) => write!(f, "I/O failure: {err}"),
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArchiveError::Archiving { source, .. } | ArchiveError::Unarchiving { source, .. } => {
                Some(source)
            }
            ArchiveError::Storage(err) => Some(err),
            ArchiveError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<storage::Error> for ArchiveError {
    fn from(err: storage::Error) -> Self {
        ArchiveError::Storage(err)
    }
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        ArchiveError::Io(err)
    }
}

impl ArchiveError {
    /// Wraps this error as a write-side failure at `path`.
    pub fn archiving(self, path: &str) -> ArchiveError {
        ArchiveError::Archiving { path: path.to_owned(), source: Box::new(self) }
    }

    /// Wraps this error as a read-side failure at `path`.
    pub fn unarchiving(self, path: &str) -> ArchiveError {
        ArchiveError::Unarchiving { path: path.to_owned(), source: Box::new(self) }
    }
}

/// Decides what happens when an individual archive operation fails.
///
/// The strategy receives every failure before it propagates. Returning `Ok(())`
/// from [`ErrorStrategy::deal_with_error`] continues the surrounding batch
/// operation with the offending record dropped; returning the error aborts it.
pub trait ErrorStrategy: Send + Sync {
    /// Handles a failure. Returns `Err` to propagate, `Ok(())` to continue.
    fn deal_with_error(&self, err: ArchiveError) -> Result<()>;

    /// Reports a non-fatal condition.
    fn warning(&self, message: &str);

    /// Number of failures seen so far. Zero for fail-fast strategies that
    /// never survive one.
    fn failure_count(&self) -> u64 {
        0
    }
}

/// Default fail-fast strategy: every error aborts the current operation.
#[derive(Debug, Default)]
pub struct RethrowStrategy;

impl ErrorStrategy for RethrowStrategy {
    fn deal_with_error(&self, err: ArchiveError) -> Result<()> {
        Err(err)
    }

    fn warning(&self, message: &str) {
        tracing::warn!(message);
    }
}

/// Best-effort batch strategy: logs every failure and continues, keeping a
/// count so callers can report partial success.
#[derive(Debug, Default)]
pub struct ContinueStrategy {
    failures: AtomicU64,
}

impl ErrorStrategy for ContinueStrategy {
    fn deal_with_error(&self, err: ArchiveError) -> Result<()> {
        self.failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %err, "continuing past failure");
        Ok(())
    }

    fn warning(&self, message: &str) {
        tracing::warn!(message);
    }

    fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
