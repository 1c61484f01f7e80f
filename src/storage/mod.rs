//! Defines the archive container storage interface --- [`Storage`].
//!
//! The archiver core is written against this trait only; the HDF5 library
//! proper sits behind an implementation of it. [`MemoryStorage`] is the
//! bundled reference backend used by the tests and the demo CLI.

mod memory;

#[cfg(test)]
mod tests;

pub use memory::MemoryStorage;

use std::fmt;
use std::io;

/// Result of [`Storage`] operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Opaque datatype tag applied to datasets that hold archived file contents.
pub const FILE_OPAQUE_TAG: &str = "FILE";

/// [`Storage`] errors.
#[derive(Debug)]
pub enum Error {
    /// No node exists at the given path.
    NodeNotFound(String),
    /// A node already exists at the given path.
    NodeExists(String),
    /// The node at the given path is not a group.
    NotAGroup(String),
    /// The node at the given path is not a dataset.
    NotADataset(String),
    /// A resize or out-of-bounds write was attempted on a dataset whose
    /// layout cannot grow (CONTIGUOUS or COMPACT).
    NotExtendable(String),
    /// The container's serialized form could not be understood.
    Corrupt(String),
    /// I/O failure in the backing container file.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NodeNotFound(path) => write!(f, "no node at '{path}'"),
            Error::NodeExists(path) => write!(f, "node already exists at '{path}'"),
            Error::NotAGroup(path) => write!(f, "'{path}' is not a group"),
            Error::NotADataset(path) => write!(f, "'{path}' is not a dataset"),
            Error::NotExtendable(path) => {
                write!(f, "dataset '{path}' has a fixed layout and cannot be extended")
            }
            Error::Corrupt(detail) => write!(f, "corrupt container: {detail}"),
            Error::Io(err) => write!(f, "container I/O failure: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Kind of node present at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Group,
    Dataset,
    SoftLink,
}

/// Physical layout of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetLayout {
    /// Fixed-size blocks; the dataset can grow.
    Chunked { chunk_size: usize },
    /// One fixed extent; the size is decided at creation time.
    Contiguous,
    /// Stored inline in the object header; fixed size, small.
    Compact,
}

impl DatasetLayout {
    /// Whether a dataset with this layout may grow after creation.
    pub fn is_extendable(self) -> bool {
        matches!(self, DatasetLayout::Chunked { .. })
    }
}

/// Shape and storage properties of a dataset.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    /// Current first-dimension size in bytes.
    pub size: u64,
    pub layout: DatasetLayout,
    /// Opaque datatype tag, when the element type is opaque bytes.
    pub opaque_tag: Option<String>,
    /// Whether the deflate filter is applied on write.
    pub compressed: bool,
}

/// Filesystem metadata attached to a group, used for the archive root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupAttributes {
    pub last_modified: i64,
    pub uid: i32,
    pub gid: i32,
    pub permissions: i16,
}

impl Default for GroupAttributes {
    fn default() -> Self {
        Self { last_modified: -1, uid: -1, gid: -1, permissions: -1 }
    }
}

/// Container storage interface.
///
/// Mirrors the operations the archiver requires of the HDF5 library: group
/// and dataset creation, opaque block I/O at byte offsets, soft links,
/// dataset resizing and attributes. All paths are absolute archive paths as
/// produced by [`crate::archive_path::normalize`]; the root group `/` always
/// exists.
pub trait Storage: Send + Sync {
    /// Creates a group. `size_hint` is a byte estimate of the local heap for
    /// the group's link names, when the caller can compute one.
    fn create_group(&self, path: &str, size_hint: Option<usize>) -> Result<()>;

    /// Returns the node type at `path`, or `None` when nothing is there.
    fn object_type(&self, path: &str) -> Result<Option<ObjectType>>;

    /// Lists basenames of the direct children of a group, sorted.
    fn list_children(&self, group_path: &str) -> Result<Vec<String>>;

    /// Creates a rank-1 opaque byte dataset.
    ///
    /// For `Contiguous` and `Compact` layouts `total_size` fixes the extent
    /// forever; for `Chunked` it is the initial extent. Replaces nothing: the
    /// path must be free.
    fn create_opaque_dataset(
        &self,
        path: &str,
        tag: &str,
        layout: DatasetLayout,
        total_size: u64,
        compress: bool,
    ) -> Result<()>;

    /// Writes `data` at byte `offset`, growing a chunked dataset as needed.
    /// Writing past the extent of a fixed-layout dataset fails with
    /// [`Error::NotExtendable`].
    fn write_block(&self, path: &str, data: &[u8], offset: u64) -> Result<()>;

    /// Reads up to `buf.len()` bytes at `offset`; returns the number read,
    /// `0` at or past the end.
    fn read_block(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Reads a whole dataset.
    fn read_dataset(&self, path: &str) -> Result<Vec<u8>>;

    /// Creates or replaces a plain byte dataset holding exactly `data`,
    /// uncompressed. Used for directory index datasets.
    fn write_dataset(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Sets the first-dimension size. Shrinking truncates, growing zero-fills.
    /// Fails with [`Error::NotExtendable`] on fixed layouts.
    fn set_dataset_size(&self, path: &str, size: u64) -> Result<()>;

    /// Shape and storage properties of the dataset at `path`.
    fn dataset_info(&self, path: &str) -> Result<DatasetInfo>;

    /// Creates a soft link at `path` whose target string is `target`.
    fn create_soft_link(&self, path: &str, target: &str) -> Result<()>;

    /// Returns the target of the soft link at `path`, `None` when the node
    /// exists but is not a soft link.
    fn read_soft_link(&self, path: &str) -> Result<Option<String>>;

    /// Removes the node at `path`; a group is removed with everything
    /// beneath it.
    fn delete(&self, path: &str) -> Result<()>;

    /// Attaches filesystem metadata attributes to a group.
    fn set_group_attributes(&self, path: &str, attrs: GroupAttributes) -> Result<()>;

    /// Reads back group metadata attributes, `None` when never set.
    fn group_attributes(&self, path: &str) -> Result<Option<GroupAttributes>>;

    /// Commits pending state to the backing container (blocking sync).
    fn flush(&self) -> Result<()>;
}
