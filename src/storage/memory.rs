//! In-memory reference implementation of [`Storage`].
//!
//! Keeps the whole node table in a [`BTreeMap`] keyed by absolute path, the
//! way a throwaway filesystem backend would. Dataset bytes are held
//! uncompressed in memory; the deflate filter is applied when the table is
//! persisted to a container file, so compressed datasets cost disk, not RAM.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use super::{DatasetInfo, DatasetLayout, Error, GroupAttributes, ObjectType, Result, Storage};
use crate::archive_path;

const CONTAINER_MAGIC: &[u8; 8] = b"h5armem1";

#[derive(Debug, Clone)]
enum Node {
    Group { attrs: Option<GroupAttributes>, size_hint: Option<usize> },
    Dataset(Dataset),
    SoftLink { target: String },
}

#[derive(Debug, Clone)]
struct Dataset {
    layout: DatasetLayout,
    tag: Option<String>,
    compressed: bool,
    bytes: Vec<u8>,
}

struct State {
    nodes: BTreeMap<String, Node>,
    backing: Option<PathBuf>,
}

/// In-memory [`Storage`] backend, optionally persisted to a container file.
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Creates an empty container holding only the root group.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::Group { attrs: None, size_hint: None });
        Self { state: Mutex::new(State { nodes, backing: None }) }
    }

    /// Opens a container file, creating an empty container when the file does
    /// not exist yet. [`Storage::flush`] writes the table back to this file.
    pub fn open_path(file: &Path) -> Result<Self> {
        let storage = if file.exists() {
            Self::load_from(file)?
        } else {
            Self::new()
        };
        storage.lock().backing = Some(file.to_owned());
        Ok(storage)
    }

    /// Reads a container file into a fresh instance without remembering the
    /// file for write-back.
    pub fn load_from(file: &Path) -> Result<Self> {
        let mut src = BufReader::new(File::open(file)?);
        let mut magic = [0u8; 8];
        src.read_exact(&mut magic)?;
        if &magic != CONTAINER_MAGIC {
            return Err(Error::Corrupt("bad container magic".to_owned()));
        }
        let count = src.read_u32::<BigEndian>()?;
        let mut nodes = BTreeMap::new();
        for _ in 0..count {
            let path = read_string(&mut src)?;
            let node = read_node(&mut src)?;
            nodes.insert(path, node);
        }
        if !nodes.contains_key("/") {
            return Err(Error::Corrupt("container has no root group".to_owned()));
        }
        Ok(Self { state: Mutex::new(State { nodes, backing: None }) })
    }

    /// Writes the node table to `file` in the container format.
    pub fn save_to(&self, file: &Path) -> Result<()> {
        let state = self.lock();
        let mut dest = BufWriter::new(File::create(file)?);
        dest.write_all(CONTAINER_MAGIC)?;
        let count = u32::try_from(state.nodes.len())
            .map_err(|_| Error::Corrupt("too many nodes for container format".to_owned()))?;
        dest.write_u32::<BigEndian>(count)?;
        for (path, node) in &state.nodes {
            write_string(&mut dest, path)?;
            write_node(&mut dest, node)?;
        }
        dest.flush()?;
        Ok(())
    }

    /// Total number of nodes (groups, datasets and soft links).
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Number of dataset nodes, index datasets included.
    pub fn dataset_count(&self) -> usize {
        self.lock().nodes.values().filter(|n| matches!(n, Node::Dataset(_))).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("storage state lock poisoned")
    }
}

impl State {
    fn require_parent_group(&self, path: &str) -> Result<()> {
        let parent = archive_path::parent(path);
        let parent = if parent.is_empty() { "/" } else { parent };
        match self.nodes.get(parent) {
            Some(Node::Group { .. }) => Ok(()),
            Some(_) => Err(Error::NotAGroup(parent.to_owned())),
            None => Err(Error::NodeNotFound(parent.to_owned())),
        }
    }

    fn require_free(&self, path: &str) -> Result<()> {
        if self.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_owned()));
        }
        Ok(())
    }

    fn dataset(&self, path: &str) -> Result<&Dataset> {
        match self.nodes.get(path) {
            Some(Node::Dataset(ds)) => Ok(ds),
            Some(_) => Err(Error::NotADataset(path.to_owned())),
            None => Err(Error::NodeNotFound(path.to_owned())),
        }
    }

    fn dataset_mut(&mut self, path: &str) -> Result<&mut Dataset> {
        match self.nodes.get_mut(path) {
            Some(Node::Dataset(ds)) => Ok(ds),
            Some(_) => Err(Error::NotADataset(path.to_owned())),
            None => Err(Error::NodeNotFound(path.to_owned())),
        }
    }
}

impl Storage for MemoryStorage {
    fn create_group(&self, path: &str, size_hint: Option<usize>) -> Result<()> {
        let mut state = self.lock();
        state.require_parent_group(path)?;
        state.require_free(path)?;
        state.nodes.insert(path.to_owned(), Node::Group { attrs: None, size_hint });
        Ok(())
    }

    fn object_type(&self, path: &str) -> Result<Option<ObjectType>> {
        let state = self.lock();
        Ok(state.nodes.get(path).map(|node| match node {
            Node::Group { .. } => ObjectType::Group,
            Node::Dataset(_) => ObjectType::Dataset,
            Node::SoftLink { .. } => ObjectType::SoftLink,
        }))
    }

    fn list_children(&self, group_path: &str) -> Result<Vec<String>> {
        let state = self.lock();
        match state.nodes.get(group_path) {
            Some(Node::Group { .. }) => {}
            Some(_) => return Err(Error::NotAGroup(group_path.to_owned())),
            None => return Err(Error::NodeNotFound(group_path.to_owned())),
        }
        let prefix =
            if group_path == "/" { "/".to_owned() } else { format!("{group_path}/") };
        let mut children = Vec::new();
        for path in state.nodes.range(prefix.clone()..).map(|(k, _)| k) {
            if !path.starts_with(&prefix) {
                break;
            }
            let rest = &path[prefix.len()..];
            if !rest.is_empty() && !rest.contains('/') {
                children.push(rest.to_owned());
            }
        }
        Ok(children)
    }

    fn create_opaque_dataset(
        &self,
        path: &str,
        tag: &str,
        layout: DatasetLayout,
        total_size: u64,
        compress: bool,
    ) -> Result<()> {
        let mut state = self.lock();
        state.require_parent_group(path)?;
        state.require_free(path)?;
        let size = usize::try_from(total_size)
            .map_err(|_| Error::Corrupt(format!("dataset size {total_size} out of range")))?;
        state.nodes.insert(
            path.to_owned(),
            Node::Dataset(Dataset {
                layout,
                tag: Some(tag.to_owned()),
                compressed: compress,
                bytes: vec![0u8; size],
            }),
        );
        Ok(())
    }

    fn write_block(&self, path: &str, data: &[u8], offset: u64) -> Result<()> {
        let mut state = self.lock();
        let ds = state.dataset_mut(path)?;
        let offset = offset as usize;
        let end = offset + data.len();
        if end > ds.bytes.len() {
            if !ds.layout.is_extendable() {
                return Err(Error::NotExtendable(path.to_owned()));
            }
            ds.bytes.resize(end, 0);
        }
        ds.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read_block(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let state = self.lock();
        let ds = state.dataset(path)?;
        let offset = offset as usize;
        if offset >= ds.bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(ds.bytes.len() - offset);
        buf[..n].copy_from_slice(&ds.bytes[offset..offset + n]);
        Ok(n)
    }

    fn read_dataset(&self, path: &str) -> Result<Vec<u8>> {
        let state = self.lock();
        Ok(state.dataset(path)?.bytes.clone())
    }

    fn write_dataset(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        match state.nodes.get(path) {
            Some(Node::Dataset(_)) | None => {}
            Some(_) => return Err(Error::NotADataset(path.to_owned())),
        }
        if !state.nodes.contains_key(path) {
            state.require_parent_group(path)?;
        }
        state.nodes.insert(
            path.to_owned(),
            Node::Dataset(Dataset {
                layout: DatasetLayout::Contiguous,
                tag: None,
                compressed: false,
                bytes: data.to_vec(),
            }),
        );
        Ok(())
    }

    fn set_dataset_size(&self, path: &str, size: u64) -> Result<()> {
        let mut state = self.lock();
        let ds = state.dataset_mut(path)?;
        if !ds.layout.is_extendable() {
            return Err(Error::NotExtendable(path.to_owned()));
        }
        let size = usize::try_from(size)
            .map_err(|_| Error::Corrupt(format!("dataset size {size} out of range")))?;
        ds.bytes.resize(size, 0);
        Ok(())
    }

    fn dataset_info(&self, path: &str) -> Result<DatasetInfo> {
        let state = self.lock();
        let ds = state.dataset(path)?;
        Ok(DatasetInfo {
            size: ds.bytes.len() as u64,
            layout: ds.layout,
            opaque_tag: ds.tag.clone(),
            compressed: ds.compressed,
        })
    }

    fn create_soft_link(&self, path: &str, target: &str) -> Result<()> {
        let mut state = self.lock();
        state.require_parent_group(path)?;
        state.require_free(path)?;
        state.nodes.insert(path.to_owned(), Node::SoftLink { target: target.to_owned() });
        Ok(())
    }

    fn read_soft_link(&self, path: &str) -> Result<Option<String>> {
        let state = self.lock();
        match state.nodes.get(path) {
            Some(Node::SoftLink { target }) => Ok(Some(target.clone())),
            Some(_) => Ok(None),
            None => Err(Error::NodeNotFound(path.to_owned())),
        }
    }

    fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.lock();
        if archive_path::is_root(path) {
            // The root group itself stays; deleting it clears the container.
            state.nodes.retain(|k, _| k == "/");
            return Ok(());
        }
        if !state.nodes.contains_key(path) {
            return Err(Error::NodeNotFound(path.to_owned()));
        }
        let prefix = format!("{path}/");
        state.nodes.retain(|k, _| k != path && !k.starts_with(&prefix));
        Ok(())
    }

    fn set_group_attributes(&self, path: &str, attrs: GroupAttributes) -> Result<()> {
        let mut state = self.lock();
        match state.nodes.get_mut(path) {
            Some(Node::Group { attrs: slot, .. }) => {
                *slot = Some(attrs);
                Ok(())
            }
            Some(_) => Err(Error::NotAGroup(path.to_owned())),
            None => Err(Error::NodeNotFound(path.to_owned())),
        }
    }

    fn group_attributes(&self, path: &str) -> Result<Option<GroupAttributes>> {
        let state = self.lock();
        match state.nodes.get(path) {
            Some(Node::Group { attrs, .. }) => Ok(*attrs),
            Some(_) => Err(Error::NotAGroup(path.to_owned())),
            None => Err(Error::NodeNotFound(path.to_owned())),
        }
    }

    fn flush(&self) -> Result<()> {
        let backing = self.lock().backing.clone();
        match backing {
            Some(file) => self.save_to(&file),
            None => Ok(()),
        }
    }
}

fn write_string(dest: &mut impl Write, s: &str) -> Result<()> {
    let len = u32::try_from(s.len())
        .map_err(|_| Error::Corrupt("string too long for container format".to_owned()))?;
    dest.write_u32::<BigEndian>(len)?;
    dest.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string(src: &mut impl Read) -> Result<String> {
    let len = src.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| Error::Corrupt("non-UTF-8 string".to_owned()))
}

fn write_node(dest: &mut impl Write, node: &Node) -> Result<()> {
    match node {
        Node::Group { attrs, size_hint } => {
            dest.write_u8(0)?;
            match attrs {
                Some(a) => {
                    dest.write_u8(1)?;
                    dest.write_i64::<BigEndian>(a.last_modified)?;
                    dest.write_i32::<BigEndian>(a.uid)?;
                    dest.write_i32::<BigEndian>(a.gid)?;
                    dest.write_i16::<BigEndian>(a.permissions)?;
                }
                None => dest.write_u8(0)?,
            }
            dest.write_u64::<BigEndian>(size_hint.map_or(0, |h| h as u64))?;
        }
        Node::SoftLink { target } => {
            dest.write_u8(2)?;
            write_string(dest, target)?;
        }
        Node::Dataset(ds) => {
            dest.write_u8(1)?;
            match ds.layout {
                DatasetLayout::Chunked { chunk_size } => {
                    dest.write_u8(0)?;
                    dest.write_u64::<BigEndian>(chunk_size as u64)?;
                }
                DatasetLayout::Contiguous => dest.write_u8(1)?,
                DatasetLayout::Compact => dest.write_u8(2)?,
            }
            dest.write_u8(ds.compressed as u8)?;
            match &ds.tag {
                Some(tag) => {
                    dest.write_u8(1)?;
                    write_string(dest, tag)?;
                }
                None => dest.write_u8(0)?,
            }
            dest.write_u64::<BigEndian>(ds.bytes.len() as u64)?;
            if ds.compressed {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&ds.bytes)?;
                let packed = encoder.finish()?;
                dest.write_u64::<BigEndian>(packed.len() as u64)?;
                dest.write_all(&packed)?;
            } else {
                dest.write_u64::<BigEndian>(ds.bytes.len() as u64)?;
                dest.write_all(&ds.bytes)?;
            }
        }
    }
    Ok(())
}

fn read_node(src: &mut impl Read) -> Result<Node> {
    match src.read_u8()? {
        0 => {
            let attrs = match src.read_u8()? {
                0 => None,
                _ => Some(GroupAttributes {
                    last_modified: src.read_i64::<BigEndian>()?,
                    uid: src.read_i32::<BigEndian>()?,
                    gid: src.read_i32::<BigEndian>()?,
                    permissions: src.read_i16::<BigEndian>()?,
                }),
            };
            let hint = src.read_u64::<BigEndian>()?;
            let size_hint = if hint == 0 { None } else { Some(hint as usize) };
            Ok(Node::Group { attrs, size_hint })
        }
        1 => {
            let layout = match src.read_u8()? {
                0 => DatasetLayout::Chunked { chunk_size: src.read_u64::<BigEndian>()? as usize },
                1 => DatasetLayout::Contiguous,
                2 => DatasetLayout::Compact,
                other => {
                    return Err(Error::Corrupt(format!("unknown dataset layout tag {other}")))
                }
            };
            let compressed = src.read_u8()? != 0;
            let tag = match src.read_u8()? {
                0 => None,
                _ => Some(read_string(src)?),
            };
            let logical_len = src.read_u64::<BigEndian>()? as usize;
            let stored_len = src.read_u64::<BigEndian>()? as usize;
            let mut stored = vec![0u8; stored_len];
            src.read_exact(&mut stored)?;
            let bytes = if compressed {
                let mut decoder = DeflateDecoder::new(stored.as_slice());
                let mut bytes = Vec::with_capacity(logical_len);
                decoder.read_to_end(&mut bytes)?;
                if bytes.len() != logical_len {
                    return Err(Error::Corrupt("dataset length mismatch after inflate".to_owned()));
                }
                bytes
            } else {
                stored
            };
            Ok(Node::Dataset(Dataset { layout, tag, compressed, bytes }))
        }
        2 => Ok(Node::SoftLink { target: read_string(src)? }),
        other => Err(Error::Corrupt(format!("unknown node tag {other}"))),
    }
}
