use super::{ByteStream, OpenMode, StreamKind};
use crate::error::{PkgError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Stream backed by a plain file
///
/// Read mode opens an existing file. Write mode truncates (or creates) the
/// file and keeps it readable, so a freshly written package can be digested
/// in place.
#[derive(Debug)]
pub struct FileStream {
    name: String,
    file: File,
    mode: OpenMode,
    length: usize,
}

impl FileStream {
    /// Open a file stream
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let file = match mode {
            OpenMode::Read => File::open(path).map_err(|e| {
                PkgError::InvalidFile(format!("cannot open {}: {}", path.display(), e))
            })?,
            OpenMode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| {
                    PkgError::InvalidFile(format!("cannot create {}: {}", path.display(), e))
                })?,
        };
        let length = file.metadata()?.len() as usize;
        debug!("Opened file stream {} ({:?}, {} bytes)", path.display(), mode, length);

        Ok(Self {
            name: path.display().to_string(),
            file,
            mode,
            length,
        })
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

impl ByteStream for FileStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StreamKind {
        StreamKind::File
    }

    fn read(&mut self, buf: &mut [u8], start: usize) -> Result<usize> {
        if start > self.length {
            return Err(PkgError::InvalidStream(format!(
                "read at {} past end of {} ({} bytes)",
                start, self.name, self.length
            )));
        }
        let want = buf.len().min(self.length - start);
        self.file.seek(SeekFrom::Start(start as u64))?;

        let mut total = 0;
        while total < want {
            let n = self.file.read(&mut buf[total..want])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write(&mut self, data: &[u8], start: usize) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Err(PkgError::InvalidStream(format!(
                "{} is opened read only",
                self.name
            )));
        }
        if start > self.length {
            return Err(PkgError::InvalidStream(format!(
                "write at {} past end of {} ({} bytes)",
                start, self.name, self.length
            )));
        }
        self.file.seek(SeekFrom::Start(start as u64))?;
        self.file.write_all(data)?;
        self.length = self.length.max(start + data.len());
        Ok(())
    }

    fn len(&self) -> usize {
        self.length
    }

    fn flush(&mut self, size: usize) -> Result<()> {
        if self.mode == OpenMode::Write {
            self.file.flush()?;
            self.file.sync_data()?;
        }
        let on_disk = self.file.metadata()?.len() as usize;
        self.length = self.length.max(on_disk);
        if size > self.length {
            return Err(PkgError::InvalidStream(format!(
                "flush of {} expected {} bytes, have {}",
                self.name, size, self.length
            )));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.mode == OpenMode::Write {
            self.file.flush()?;
        }
        debug!("Closed file stream {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.bin");

        let mut stream = FileStream::open(&path, OpenMode::Write).unwrap();
        stream.write(b"hello", 0).unwrap();
        stream.write(b" world", 5).unwrap();
        stream.flush(11).unwrap();
        assert_eq!(stream.len(), 11);

        let mut buf = [0u8; 32];
        let n = stream.read(&mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn test_read_mode_rejects_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ro.bin");
        std::fs::write(&path, b"data").unwrap();

        let mut stream = FileStream::open(&path, OpenMode::Read).unwrap();
        assert_eq!(stream.len(), 4);
        let result = stream.write(b"x", 0);
        assert!(matches!(result, Err(PkgError::InvalidStream(_))));
    }

    #[test]
    fn test_read_past_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();

        let mut stream = FileStream::open(&path, OpenMode::Read).unwrap();
        let mut buf = [0u8; 4];
        assert!(stream.read(&mut buf, 10).is_err());
        assert_eq!(stream.read(&mut buf, 3).unwrap(), 0);
    }

    #[test]
    fn test_missing_file() {
        let result = FileStream::open("/nonexistent/update.bin", OpenMode::Read);
        assert!(matches!(result, Err(PkgError::InvalidFile(_))));
    }
}
