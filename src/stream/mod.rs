//! Byte streams used as the source and sink of every package operation
//!
//! A [`ByteStream`] is a positional byte store: every read and write names its
//! absolute start offset, and the stream tracks its own logical length. Three
//! backings exist:
//! - [`FileStream`]: a plain file opened for reading or truncating write
//! - [`MemoryStream`]: a memory map (anonymous, shared or read-only), an owned
//!   buffer, or a borrowed slice
//! - [`ProcessorStream`]: a push sink that hands every write to a callback
//!
//! Streams that are opened by name are shared through the [`StreamCache`].

mod cache;
mod file;
mod memory;
mod processor;

pub use cache::StreamCache;
pub use file::FileStream;
pub use memory::MemoryStream;
pub use processor::{ProcessorCallback, ProcessorStream};

use crate::error::{PkgError, Result};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

/// Shared handle to a cached stream
pub type SharedStream = Rc<RefCell<dyn ByteStream>>;

/// Backing of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    File,
    MemoryMap,
    Buffer,
    Processor,
}

/// How a file-backed stream is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read only
    Read,
    /// File is created or truncated, then opened read/write
    Write,
}

/// Positional byte store with explicit length tracking
pub trait ByteStream {
    /// Name the stream was opened under (usually a path)
    fn name(&self) -> &str;

    fn kind(&self) -> StreamKind;

    /// Read up to `buf.len()` bytes starting at `start`, returning the count read
    fn read(&mut self, buf: &mut [u8], start: usize) -> Result<usize>;

    /// Write all of `data` at `start`
    fn write(&mut self, data: &[u8], start: usize) -> Result<()>;

    /// Current logical length
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commit pending data; `size` is the expected final length
    fn flush(&mut self, size: usize) -> Result<()>;

    /// Final teardown, invoked when the last reference is released
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Borrow a shared stream mutably, reporting re-entrant use as an error
pub fn borrow_stream(stream: &SharedStream) -> Result<std::cell::RefMut<'_, dyn ByteStream + 'static>> {
    stream
        .try_borrow_mut()
        .map_err(|_| PkgError::InvalidStream("stream is already in use".to_string()))
}

/// Read `min(remaining, buf.len())` bytes at `offset`, failing on a short read
///
/// `remaining` is decremented by the amount read.
pub fn read_data(
    stream: &mut dyn ByteStream,
    offset: usize,
    buf: &mut [u8],
    remaining: &mut usize,
) -> Result<usize> {
    let want = (*remaining).min(buf.len());
    let read = stream.read(&mut buf[..want], offset)?;
    if read != want {
        return Err(PkgError::InvalidStream(format!(
            "short read from {} at {}: wanted {}, got {}",
            stream.name(),
            offset,
            want,
            read
        )));
    }
    *remaining -= read;
    Ok(read)
}

/// Read exactly `buf.len()` bytes at `offset`
pub fn read_exact_at(stream: &mut dyn ByteStream, offset: usize, buf: &mut [u8]) -> Result<()> {
    let mut remaining = buf.len();
    read_data(stream, offset, buf, &mut remaining)?;
    Ok(())
}

/// `io::Read` view over a stream region, starting at `offset` and stopping at `end`
pub struct StreamReader<'s> {
    stream: &'s mut dyn ByteStream,
    position: usize,
    end: usize,
}

impl<'s> StreamReader<'s> {
    pub fn new(stream: &'s mut dyn ByteStream, offset: usize, end: usize) -> Self {
        Self {
            stream,
            position: offset,
            end,
        }
    }

    /// Absolute offset of the next byte to be read
    pub fn position(&self) -> usize {
        self.position
    }
}

impl io::Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.end.saturating_sub(self.position).min(buf.len());
        if available == 0 {
            return Ok(0);
        }
        let read = self
            .stream
            .read(&mut buf[..available], self.position)
            .map_err(io::Error::other)?;
        self.position += read;
        Ok(read)
    }
}

/// `io::Write` view over a stream, appending from `offset`
pub struct StreamWriter<'s> {
    stream: &'s mut dyn ByteStream,
    position: usize,
}

impl<'s> StreamWriter<'s> {
    pub fn new(stream: &'s mut dyn ByteStream, offset: usize) -> Self {
        Self {
            stream,
            position: offset,
        }
    }

    /// Absolute offset of the next byte to be written
    pub fn position(&self) -> usize {
        self.position
    }
}

impl io::Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream
            .write(buf, self.position)
            .map_err(io::Error::other)?;
        self.position += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_read_data_short_read() {
        let data = b"0123456789";
        let mut stream = MemoryStream::borrowed("digits", data);
        let mut buf = [0u8; 4];

        let mut remaining = 6;
        assert_eq!(read_data(&mut stream, 0, &mut buf, &mut remaining).unwrap(), 4);
        assert_eq!(remaining, 2);
        assert_eq!(&buf, b"0123");

        let mut remaining = 4;
        let err = read_data(&mut stream, 8, &mut buf, &mut remaining).unwrap_err();
        assert!(matches!(err, PkgError::InvalidStream(_)));
    }

    #[test]
    fn test_reader_respects_end() {
        let data = b"abcdefgh";
        let mut stream = MemoryStream::borrowed("letters", data);
        let mut reader = StreamReader::new(&mut stream, 2, 5);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"cde");
        assert_eq!(reader.position(), 5);
    }

    #[test]
    fn test_writer_advances() {
        let mut stream = MemoryStream::growable("out");
        {
            let mut writer = StreamWriter::new(&mut stream, 0);
            writer.write_all(b"head").unwrap();
            writer.write_all(b"tail").unwrap();
            assert_eq!(writer.position(), 8);
        }
        assert_eq!(stream.as_slice(), b"headtail");
    }
}
