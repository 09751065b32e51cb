use super::{borrow_stream, ByteStream, FileStream, MemoryStream, OpenMode, SharedStream};
use crate::error::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

struct CachedStream {
    stream: SharedStream,
    refs: usize,
}

/// Reference-counted streams keyed by name
///
/// The first open of a name performs the real I/O setup; later opens return
/// the same handle and bump its reference count. Closing the last reference
/// tears the stream down and forgets it.
#[derive(Default)]
pub struct StreamCache {
    streams: HashMap<String, CachedStream>,
}

impl StreamCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or re-open) a file stream
    pub fn open_file<P: AsRef<Path>>(&mut self, path: P, mode: OpenMode) -> Result<SharedStream> {
        let path = path.as_ref();
        self.open_with(path.display().to_string(), || {
            Ok(Rc::new(RefCell::new(FileStream::open(path, mode)?)))
        })
    }

    /// Open a file-backed memory map
    ///
    /// A `size` of zero maps an existing file read-only; otherwise the file
    /// is created at `size` bytes and mapped read/write.
    pub fn open_memory_map<P: AsRef<Path>>(&mut self, path: P, size: usize) -> Result<SharedStream> {
        let path = path.as_ref();
        self.open_with(path.display().to_string(), || {
            let stream = if size == 0 {
                MemoryStream::map_file(path)?
            } else {
                MemoryStream::create_file(path, size)?
            };
            Ok(Rc::new(RefCell::new(stream)))
        })
    }

    /// Open an anonymous memory stream of a fixed capacity
    pub fn open_anonymous(&mut self, name: &str, size: usize) -> Result<SharedStream> {
        self.open_with(name.to_string(), || {
            Ok(Rc::new(RefCell::new(MemoryStream::anonymous(name, size)?)))
        })
    }

    fn open_with<F>(&mut self, name: String, open: F) -> Result<SharedStream>
    where
        F: FnOnce() -> Result<SharedStream>,
    {
        if let Some(cached) = self.streams.get_mut(&name) {
            cached.refs += 1;
            debug!("Reusing cached stream {} (refs {})", name, cached.refs);
            return Ok(cached.stream.clone());
        }

        let stream = open()?;
        self.streams.insert(
            name,
            CachedStream {
                stream: stream.clone(),
                refs: 1,
            },
        );
        Ok(stream)
    }

    /// Release one reference; the last release closes and removes the stream
    ///
    /// Unknown names are ignored.
    pub fn close(&mut self, name: &str) -> Result<()> {
        let Some(cached) = self.streams.get_mut(name) else {
            return Ok(());
        };
        cached.refs = cached.refs.saturating_sub(1);
        if cached.refs > 0 {
            return Ok(());
        }

        if let Some(cached) = self.streams.remove(name) {
            borrow_stream(&cached.stream)?.close()?;
            debug!("Released stream {}", name);
        }
        Ok(())
    }

    /// Close every stream regardless of its reference count
    pub fn clear(&mut self) -> Result<()> {
        for (_, cached) in self.streams.drain() {
            borrow_stream(&cached.stream)?.close()?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedStream> {
        self.streams.get(name).map(|cached| cached.stream.clone())
    }

    /// Current reference count, zero for unknown names
    pub fn ref_count(&self, name: &str) -> usize {
        self.streams.get(name).map_or(0, |cached| cached.refs)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl std::fmt::Debug for StreamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.streams.keys().collect();
        names.sort();
        f.debug_struct("StreamCache").field("streams", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_refcount_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cached.bin");
        std::fs::write(&path, b"cached").unwrap();
        let name = path.display().to_string();

        let mut cache = StreamCache::new();
        let first = cache.open_file(&path, OpenMode::Read).unwrap();
        let second = cache.open_file(&path, OpenMode::Read).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(cache.ref_count(&name), 2);

        cache.close(&name).unwrap();
        assert_eq!(cache.ref_count(&name), 1);
        assert_eq!(cache.len(), 1);

        cache.close(&name).unwrap();
        assert_eq!(cache.ref_count(&name), 0);
        assert!(cache.is_empty());

        // Releasing again is a no-op
        cache.close(&name).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_anonymous_streams_are_shared() {
        let mut cache = StreamCache::new();
        let stream = cache.open_anonymous("scratch", 64).unwrap();
        borrow_stream(&stream).unwrap().write(b"shared", 0).unwrap();

        let again = cache.open_anonymous("scratch", 64).unwrap();
        let mut buf = [0u8; 6];
        borrow_stream(&again).unwrap().read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"shared");
    }

    #[test]
    fn test_reentrant_borrow_is_an_error() {
        let mut cache = StreamCache::new();
        let stream = cache.open_anonymous("busy", 8).unwrap();
        let _held = borrow_stream(&stream).unwrap();
        assert!(borrow_stream(&stream).is_err());
    }

    #[test]
    fn test_failed_open_is_not_cached() {
        let mut cache = StreamCache::new();
        assert!(cache.open_file("/nonexistent/pkg.zip", OpenMode::Read).is_err());
        assert!(cache.is_empty());
    }
}
