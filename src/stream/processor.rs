use super::{ByteStream, StreamKind};
use crate::error::{PkgError, Result};

/// Callback receiving `(data, start, finished)` for every write
///
/// The terminal call carries an empty slice, the final size and `true`.
pub type ProcessorCallback = Box<dyn FnMut(&[u8], usize, bool) -> Result<()>>;

/// Write-only sink that forwards data to a callback
pub struct ProcessorStream {
    name: String,
    callback: ProcessorCallback,
    length: usize,
}

impl ProcessorStream {
    pub fn new(name: impl Into<String>, callback: ProcessorCallback) -> Self {
        Self {
            name: name.into(),
            callback,
            length: 0,
        }
    }
}

impl std::fmt::Debug for ProcessorStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorStream")
            .field("name", &self.name)
            .field("length", &self.length)
            .finish()
    }
}

impl ByteStream for ProcessorStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Processor
    }

    fn read(&mut self, _buf: &mut [u8], _start: usize) -> Result<usize> {
        Err(PkgError::InvalidStream(format!(
            "{} is a processor stream and cannot be read",
            self.name
        )))
    }

    fn write(&mut self, data: &[u8], start: usize) -> Result<()> {
        (self.callback)(data, start, false)?;
        self.length = self.length.max(start + data.len());
        Ok(())
    }

    fn len(&self) -> usize {
        self.length
    }

    fn flush(&mut self, size: usize) -> Result<()> {
        (self.callback)(&[], size, true)
    }
}
