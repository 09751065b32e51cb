use super::{ByteStream, StreamKind};
use crate::error::{PkgError, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

enum Region<'a> {
    /// Read-only map of an existing file
    ReadOnly(Mmap),
    /// Read/write map of a file created at a fixed size
    Shared(MmapMut),
    /// Anonymous map of a fixed capacity
    Anonymous(MmapMut),
    /// Heap buffer that grows on write
    Owned(Vec<u8>),
    /// Caller-owned bytes, read only
    Borrowed(&'a [u8]),
}

/// Stream over memory: a mapping, an owned buffer, or a borrowed slice
///
/// Fixed-capacity regions reject writes past their end. `flush(size)` sets
/// the logical length, which must fit the capacity.
pub struct MemoryStream<'a> {
    name: String,
    region: Region<'a>,
    length: usize,
}

impl std::fmt::Debug for MemoryStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("name", &self.name)
            .field("length", &self.length)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl MemoryStream<'static> {
    /// Map an existing file read-only
    pub fn map_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            PkgError::InvalidFile(format!("cannot open {}: {}", path.display(), e))
        })?;
        // SAFETY: the mapping is private to this stream and only read through it.
        let mmap = unsafe { Mmap::map(&file)? };
        let length = mmap.len();
        debug!("Mapped {} read only ({} bytes)", path.display(), length);

        Ok(Self {
            name: path.display().to_string(),
            region: Region::ReadOnly(mmap),
            length,
        })
    }

    /// Create `path` at `size` bytes and map it read/write
    pub fn create_file<P: AsRef<Path>>(path: P, size: usize) -> Result<Self> {
        let path = path.as_ref();
        if size == 0 {
            return Err(PkgError::InvalidParam(format!(
                "cannot map {} with zero size",
                path.display()
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                PkgError::InvalidFile(format!("cannot create {}: {}", path.display(), e))
            })?;
        file.set_len(size as u64)?;
        // SAFETY: the file was just created by this stream and is not shared.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        debug!("Mapped {} read/write ({} bytes)", path.display(), size);

        Ok(Self {
            name: path.display().to_string(),
            region: Region::Shared(mmap),
            length: 0,
        })
    }

    /// Anonymous mapping with a fixed capacity
    pub fn anonymous(name: impl Into<String>, size: usize) -> Result<Self> {
        let region = if size == 0 {
            Region::Owned(Vec::new())
        } else {
            Region::Anonymous(MmapOptions::new().len(size).map_anon()?)
        };
        Ok(Self {
            name: name.into(),
            region,
            length: 0,
        })
    }

    /// Owned buffer holding `bytes`
    pub fn from_vec(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let length = bytes.len();
        Self {
            name: name.into(),
            region: Region::Owned(bytes),
            length,
        }
    }

    /// Empty owned buffer that grows as it is written
    pub fn growable(name: impl Into<String>) -> Self {
        Self::from_vec(name, Vec::new())
    }
}

impl<'a> MemoryStream<'a> {
    /// Zero-copy read view over caller bytes
    pub fn borrowed(name: impl Into<String>, bytes: &'a [u8]) -> Self {
        Self {
            name: name.into(),
            region: Region::Borrowed(bytes),
            length: bytes.len(),
        }
    }

    /// Bytes up to the logical length
    pub fn as_slice(&self) -> &[u8] {
        &self.storage()[..self.length]
    }

    /// Consume the stream, returning its logical contents
    pub fn into_bytes(self) -> Vec<u8> {
        match self.region {
            Region::Owned(mut bytes) => {
                bytes.truncate(self.length);
                bytes
            }
            _ => self.as_slice().to_vec(),
        }
    }

    fn capacity(&self) -> usize {
        match &self.region {
            Region::Owned(_) => usize::MAX,
            _ => self.storage().len(),
        }
    }

    fn storage(&self) -> &[u8] {
        match &self.region {
            Region::ReadOnly(mmap) => mmap,
            Region::Shared(mmap) | Region::Anonymous(mmap) => mmap,
            Region::Owned(bytes) => bytes,
            Region::Borrowed(bytes) => bytes,
        }
    }
}

impl ByteStream for MemoryStream<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StreamKind {
        match self.region {
            Region::ReadOnly(_) | Region::Shared(_) | Region::Anonymous(_) => {
                StreamKind::MemoryMap
            }
            Region::Owned(_) | Region::Borrowed(_) => StreamKind::Buffer,
        }
    }

    fn read(&mut self, buf: &mut [u8], start: usize) -> Result<usize> {
        if start > self.length {
            return Err(PkgError::InvalidStream(format!(
                "read at {} past end of {} ({} bytes)",
                start, self.name, self.length
            )));
        }
        let count = buf.len().min(self.length - start);
        buf[..count].copy_from_slice(&self.storage()[start..start + count]);
        Ok(count)
    }

    fn write(&mut self, data: &[u8], start: usize) -> Result<()> {
        let end = start + data.len();
        if start > self.length {
            return Err(PkgError::InvalidStream(format!(
                "write at {} past end of {} ({} bytes)",
                start, self.name, self.length
            )));
        }
        match &mut self.region {
            Region::ReadOnly(_) | Region::Borrowed(_) => {
                return Err(PkgError::InvalidStream(format!(
                    "{} is read only",
                    self.name
                )));
            }
            Region::Shared(mmap) | Region::Anonymous(mmap) => {
                if end > mmap.len() {
                    return Err(PkgError::InvalidStream(format!(
                        "write of {} bytes at {} exceeds {} capacity {}",
                        data.len(),
                        start,
                        self.name,
                        mmap.len()
                    )));
                }
                mmap[start..end].copy_from_slice(data);
            }
            Region::Owned(bytes) => {
                if end > bytes.len() {
                    bytes.resize(end, 0);
                }
                bytes[start..end].copy_from_slice(data);
            }
        }
        self.length = self.length.max(end);
        Ok(())
    }

    fn len(&self) -> usize {
        self.length
    }

    fn flush(&mut self, size: usize) -> Result<()> {
        if size > self.capacity() {
            return Err(PkgError::InvalidStream(format!(
                "flush size {} exceeds {} capacity {}",
                size,
                self.name,
                self.capacity()
            )));
        }
        if let Region::Shared(mmap) = &self.region {
            mmap.flush()?;
        }
        if size > 0 {
            if let Region::Owned(bytes) = &mut self.region {
                bytes.resize(size, 0);
            }
            self.length = size;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Region::Shared(mmap) = &self.region {
            mmap.flush()?;
        }
        debug!("Closed memory stream {}", self.name);
        Ok(())
    }
}
