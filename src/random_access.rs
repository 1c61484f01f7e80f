//! Byte-addressable file interface over a rank-1 dataset ---
//! [`RandomAccessDataset`].
//!
//! One block of the dataset is resident at a time; reads and writes move
//! through it, writes mark it dirty and it is written back on block change,
//! explicit flush or drop. Writes past the current end extend a chunked
//! dataset; the extension of a seek-beyond-end is deferred until the first
//! write actually lands.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::errors::{ArchiveError, Result};
use crate::storage::{self, Storage};

/// Fallback block size when the dataset layout does not suggest one.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Byte order used by the typed accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Random-access byte file over a rank-1 dataset.
pub struct RandomAccessDataset {
    storage: Arc<dyn Storage>,
    path: String,
    read_only: bool,
    extendable: bool,
    length: u64,
    block: Vec<u8>,
    block_offset: u64,
    position_in_block: usize,
    real_block_size: usize,
    block_loaded: bool,
    block_dirty: bool,
    extension_pending: bool,
    marked_pointer: Option<u64>,
    endian: Endianness,
}

impl RandomAccessDataset {
    /// Opens the dataset at `path`.
    ///
    /// The block size defaults to the dataset's chunk size, or
    /// [`DEFAULT_BLOCK_SIZE`] for fixed layouts. Fixed-layout datasets larger
    /// than 2 GiB are rejected.
    pub fn open(
        storage: Arc<dyn Storage>,
        path: &str,
        block_size: Option<usize>,
        read_only: bool,
    ) -> Result<Self> {
        let info = storage.dataset_info(path)?;
        let extendable = info.layout.is_extendable();
        if !extendable && info.size > i32::MAX as u64 {
            return Err(ArchiveError::IllegalState(
                "fixed-layout dataset larger than 2 GiB cannot be opened for random access",
            ));
        }
        let block_size = block_size
            .or(match info.layout {
                storage::DatasetLayout::Chunked { chunk_size } => Some(chunk_size),
                _ => None,
            })
            .filter(|&size| size > 0)
            .unwrap_or(DEFAULT_BLOCK_SIZE);
        Ok(Self {
            storage,
            path: path.to_owned(),
            read_only,
            extendable,
            length: info.size,
            block: vec![0u8; block_size],
            block_offset: 0,
            position_in_block: 0,
            real_block_size: 0,
            block_loaded: false,
            block_dirty: false,
            extension_pending: false,
            marked_pointer: None,
            endian: Endianness::default(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current logical length in bytes, pending writes included.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Current absolute read/write position.
    pub fn file_pointer(&self) -> u64 {
        self.block_offset + self.position_in_block as u64
    }

    pub fn byte_order(&self) -> Endianness {
        self.endian
    }

    pub fn set_byte_order(&mut self, endian: Endianness) {
        self.endian = endian;
    }

    /// Grows or truncates the dataset. Fails on fixed layouts.
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(ArchiveError::IllegalState("dataset opened read-only"));
        }
        self.flush_block()?;
        self.storage.set_dataset_size(&self.path, len)?;
        self.length = len;
        if self.block_offset + self.real_block_size as u64 > len || self.file_pointer() > len {
            let block_size = self.block.len() as u64;
            let pointer = self.file_pointer().min(len);
            self.block_offset = (pointer / block_size) * block_size;
            self.position_in_block = (pointer - self.block_offset) as usize;
            self.block_loaded = false;
            self.real_block_size = 0;
            self.extension_pending = false;
        }
        Ok(())
    }

    /// Saves the current position for a later [`RandomAccessDataset::reset`].
    pub fn mark(&mut self) {
        self.marked_pointer = Some(self.file_pointer());
    }

    /// Returns to the marked position. When the mark lies in the resident
    /// block no dataset read happens.
    pub fn reset(&mut self) -> io::Result<()> {
        let pointer = self
            .marked_pointer
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no mark set"))?;
        if self.block_loaded
            && pointer >= self.block_offset
            && pointer - self.block_offset <= self.real_block_size as u64
        {
            self.position_in_block = (pointer - self.block_offset) as usize;
            return Ok(());
        }
        self.seek_to(pointer)
    }

    /// Writes the dirty resident block back to the dataset.
    pub fn flush_block(&mut self) -> io::Result<()> {
        if !self.block_dirty {
            return Ok(());
        }
        self.storage
            .write_block(&self.path, &self.block[..self.real_block_size], self.block_offset)
            .map_err(io_error)?;
        self.block_dirty = false;
        tracing::trace!(path = %self.path, offset = self.block_offset, "block written back");
        Ok(())
    }

    /// Flushes the resident block and asks the container to commit.
    pub fn synchronize(&mut self) -> io::Result<()> {
        self.flush_block()?;
        self.storage.flush().map_err(io_error)
    }

    fn load_block(&mut self, offset: u64) -> io::Result<()> {
        let n = self.storage.read_block(&self.path, &mut self.block, offset).map_err(io_error)?;
        self.block_offset = offset;
        self.position_in_block = 0;
        self.real_block_size = n;
        self.block_loaded = true;
        self.extension_pending = false;
        Ok(())
    }

    /// Parks on an unmaterialized block: nothing is read, the buffer holds
    /// zeros and extension happens on the next write.
    fn park(&mut self, offset: u64, position: usize) {
        self.block_offset = offset;
        self.position_in_block = position;
        self.block.fill(0);
        self.real_block_size = position;
        self.block_loaded = true;
        self.block_dirty = false;
        self.extension_pending = true;
    }

    fn ensure_block_for_writing(&mut self) -> io::Result<()> {
        if self.extension_pending {
            if !self.extendable {
                return Err(not_extendable(&self.path));
            }
            let target = self.block_offset + self.position_in_block as u64;
            if target > self.length {
                self.storage.set_dataset_size(&self.path, target).map_err(io_error)?;
                self.length = target;
            }
            self.real_block_size = self.real_block_size.max(self.position_in_block);
            self.extension_pending = false;
        } else if !self.block_loaded {
            self.load_block(self.block_offset)?;
        }
        Ok(())
    }

    fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        if self.read_only && pos >= self.length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek at or past the end of a read-only dataset",
            ));
        }
        let block_size = self.block.len() as u64;
        let new_block_offset = (pos / block_size) * block_size;
        if new_block_offset < self.length {
            if !self.block_loaded || self.block_offset != new_block_offset {
                self.flush_block()?;
                self.load_block(new_block_offset)?;
            }
            self.position_in_block = (pos - new_block_offset) as usize;
            if self.position_in_block > self.real_block_size {
                // Seek into the unmaterialized tail of the resident block.
                self.block[self.real_block_size..self.position_in_block].fill(0);
                self.real_block_size = self.position_in_block;
                self.extension_pending = true;
            }
        } else {
            self.flush_block()?;
            self.park(new_block_offset, (pos - new_block_offset) as usize);
        }
        Ok(())
    }

    fn advance_block(&mut self) -> io::Result<()> {
        self.flush_block()?;
        let next = self.block_offset + self.block.len() as u64;
        if next < self.length {
            self.load_block(next)
        } else {
            self.park(next, 0);
            Ok(())
        }
    }

    fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u8_value(&mut self) -> io::Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i16(&mut self) -> io::Result<i16> {
        let buf = self.read_array::<2>()?;
        Ok(match self.endian {
            Endianness::Big => BigEndian::read_i16(&buf),
            Endianness::Little => LittleEndian::read_i16(&buf),
        })
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        let buf = self.read_array::<2>()?;
        Ok(match self.endian {
            Endianness::Big => BigEndian::read_u16(&buf),
            Endianness::Little => LittleEndian::read_u16(&buf),
        })
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        let buf = self.read_array::<4>()?;
        Ok(match self.endian {
            Endianness::Big => BigEndian::read_i32(&buf),
            Endianness::Little => LittleEndian::read_i32(&buf),
        })
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        let buf = self.read_array::<8>()?;
        Ok(match self.endian {
            Endianness::Big => BigEndian::read_i64(&buf),
            Endianness::Little => LittleEndian::read_i64(&buf),
        })
    }

    pub fn read_f32(&mut self) -> io::Result<f32> {
        let buf = self.read_array::<4>()?;
        Ok(match self.endian {
            Endianness::Big => BigEndian::read_f32(&buf),
            Endianness::Little => LittleEndian::read_f32(&buf),
        })
    }

    pub fn read_f64(&mut self) -> io::Result<f64> {
        let buf = self.read_array::<8>()?;
        Ok(match self.endian {
            Endianness::Big => BigEndian::read_f64(&buf),
            Endianness::Little => LittleEndian::read_f64(&buf),
        })
    }

    pub fn write_u8_value(&mut self, value: u8) -> io::Result<()> {
        self.write_all(&[value])
    }

    pub fn write_i16(&mut self, value: i16) -> io::Result<()> {
        let mut buf = [0u8; 2];
        match self.endian {
            Endianness::Big => BigEndian::write_i16(&mut buf, value),
            Endianness::Little => LittleEndian::write_i16(&mut buf, value),
        }
        self.write_all(&buf)
    }

    pub fn write_i32(&mut self, value: i32) -> io::Result<()> {
        let mut buf = [0u8; 4];
        match self.endian {
            Endianness::Big => BigEndian::write_i32(&mut buf, value),
            Endianness::Little => LittleEndian::write_i32(&mut buf, value),
        }
        self.write_all(&buf)
    }

    pub fn write_i64(&mut self, value: i64) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match self.endian {
            Endianness::Big => BigEndian::write_i64(&mut buf, value),
            Endianness::Little => LittleEndian::write_i64(&mut buf, value),
        }
        self.write_all(&buf)
    }

    pub fn write_f64(&mut self, value: f64) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match self.endian {
            Endianness::Big => BigEndian::write_f64(&mut buf, value),
            Endianness::Little => LittleEndian::write_f64(&mut buf, value),
        }
        self.write_all(&buf)
    }

    /// Reads until `\n`, skipping `\r`. Returns `None` at end of file.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut out = Vec::new();
        let mut any = false;
        loop {
            let mut byte = [0u8; 1];
            if self.read(&mut byte)? == 0 {
                break;
            }
            any = true;
            match byte[0] {
                b'\n' => break,
                b'\r' => {}
                other => out.push(other),
            }
        }
        if !any {
            return Ok(None);
        }
        String::from_utf8(out)
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "line is not valid UTF-8"))
    }

    /// Reads a string with a u16 length prefix followed by UTF-8 bytes.
    pub fn read_utf(&mut self) -> io::Result<String> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not valid UTF-8"))
    }

    /// Writes a string as a u16 length prefix followed by UTF-8 bytes.
    pub fn write_utf(&mut self, value: &str) -> io::Result<()> {
        let len = u16::try_from(value.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "string exceeds the u16 length prefix")
        })?;
        let mut prefix = [0u8; 2];
        match self.endian {
            Endianness::Big => BigEndian::write_u16(&mut prefix, len),
            Endianness::Little => LittleEndian::write_u16(&mut prefix, len),
        }
        self.write_all(&prefix)?;
        self.write_all(value.as_bytes())
    }
}

impl Read for RandomAccessDataset {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            if self.file_pointer() >= self.length {
                break;
            }
            if !self.block_loaded {
                self.load_block(self.block_offset)?;
            }
            if self.position_in_block >= self.real_block_size {
                self.advance_block()?;
                continue;
            }
            let available = self.real_block_size - self.position_in_block;
            let n = available.min(buf.len() - total);
            buf[total..total + n]
                .copy_from_slice(&self.block[self.position_in_block..self.position_in_block + n]);
            self.position_in_block += n;
            total += n;
        }
        Ok(total)
    }
}

impl Write for RandomAccessDataset {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "dataset opened read-only",
            ));
        }
        let block_size = self.block.len();
        let mut written = 0;
        while written < buf.len() {
            self.ensure_block_for_writing()?;
            if self.position_in_block == block_size {
                self.advance_block()?;
                continue;
            }
            let mut n = (block_size - self.position_in_block).min(buf.len() - written);
            if !self.extendable {
                let room = self.length.saturating_sub(self.file_pointer());
                if room == 0 {
                    return Err(not_extendable(&self.path));
                }
                n = n.min(room as usize);
            }
            self.block[self.position_in_block..self.position_in_block + n]
                .copy_from_slice(&buf[written..written + n]);
            self.position_in_block += n;
            self.real_block_size = self.real_block_size.max(self.position_in_block);
            self.block_dirty = true;
            written += n;
            self.length = self.length.max(self.file_pointer());
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()
    }
}

impl Seek for RandomAccessDataset {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.file_pointer()) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.length) + i128::from(delta),
        };
        let target = u64::try_from(target).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        self.seek_to(target)?;
        Ok(target)
    }
}

impl Drop for RandomAccessDataset {
    fn drop(&mut self) {
        if let Err(err) = self.flush_block() {
            tracing::warn!(path = %self.path, error = %err, "failed to flush block on drop");
        }
    }
}

fn io_error(err: storage::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

fn not_extendable(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        storage::Error::NotExtendable(path.to_owned()),
    )
}
