//! Re-openable byte sources.
//!
//! Archives are opened through a [`StreamFactory`] rather than a single
//! stream so that every entry can get its own independent reader. Nothing
//! ever shares a seek position between two entries.

use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{ExtractError, Result};

/// Anything we can read and seek from another thread.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Source of fresh streams over the same bytes.
pub trait StreamFactory: Send + Sync {
    /// Open a new stream positioned at 0.
    fn open(&self) -> io::Result<Box<dyn ReadSeek>>;

    /// Logical name, used for extension checks and error messages.
    fn name(&self) -> &str;

    /// Backing file, when the bytes already live on disk.
    fn path(&self) -> Option<&Path> {
        None
    }

    fn last_modified(&self) -> SystemTime;
}

/// Factory over a file on disk.
#[derive(Debug, Clone)]
pub struct NativeFileStreamFactory {
    path: PathBuf,
    name: String,
}

impl NativeFileStreamFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, name }
    }
}

impl StreamFactory for NativeFileStreamFactory {
    fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::with_capacity(64 * 1024, file)))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn last_modified(&self) -> SystemTime {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

/// Factory over an in-memory buffer. Clones share the bytes.
#[derive(Debug, Clone)]
pub struct MemoryStreamFactory {
    data: Arc<[u8]>,
    name: String,
    modified: SystemTime,
}

impl MemoryStreamFactory {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            name: name.into(),
            modified: SystemTime::now(),
        }
    }

    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = modified;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StreamFactory for MemoryStreamFactory {
    fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(Cursor::new(SharedBytes(self.data.clone()))))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn last_modified(&self) -> SystemTime {
        self.modified
    }
}

/// `AsRef<[u8]>` wrapper so a `Cursor` can read an `Arc<[u8]>`.
#[derive(Debug, Clone)]
struct SharedBytes(Arc<[u8]>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Read-only window `[start, start + len)` over another stream.
pub struct SliceReader<R> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> SliceReader<R> {
    pub fn new(mut inner: R, start: u64, len: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self {
            inner,
            start,
            len,
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<R: Read + Seek> Read for SliceReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(remaining as usize);
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for SliceReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.len as i128 + d as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of slice",
            ));
        }
        let target = target as u64;
        self.inner.seek(SeekFrom::Start(self.start + target))?;
        self.pos = target;
        Ok(target)
    }
}

/// Copy exactly `len` bytes. A source that runs dry first is a
/// [`ExtractError::Truncated`].
pub fn copy_exact<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    archive: &str,
    entry: Option<&str>,
) -> Result<u64> {
    let copied = io::copy(&mut reader.take(len), writer).map_err(ExtractError::io(archive))?;
    if copied != len {
        return Err(ExtractError::Truncated {
            archive: archive.to_string(),
            entry: entry.map(str::to_string),
            expected: len,
            actual: copied,
        });
    }
    Ok(copied)
}

/// Upper bound for buffers sized from header fields before any data arrives
pub const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Initial capacity for a buffer expected to hold `len` bytes.
pub fn prealloc_capacity(len: u64) -> usize {
    usize::try_from(len.min(MAX_PREALLOC)).unwrap_or(0)
}

/// Read exactly `len` bytes into a new buffer, or fail with `Truncated`.
pub fn read_block<R: Read + ?Sized>(
    reader: &mut R,
    len: u64,
    archive: &str,
    entry: Option<&str>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(prealloc_capacity(len));
    copy_exact(reader, &mut buf, len, archive, entry)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_reader_window() -> anyhow::Result<()> {
        let data = b"0123456789".to_vec();
        let mut slice = SliceReader::new(Cursor::new(data), 3, 4)?;
        let mut out = String::new();
        slice.read_to_string(&mut out)?;
        assert_eq!(out, "3456");

        slice.seek(SeekFrom::Start(2))?;
        let mut out = String::new();
        slice.read_to_string(&mut out)?;
        assert_eq!(out, "56");

        assert_eq!(slice.seek(SeekFrom::End(0))?, 4);
        assert!(slice.seek(SeekFrom::Current(-5)).is_err());
        Ok(())
    }

    #[test]
    fn test_memory_factory_streams_are_independent() -> anyhow::Result<()> {
        let factory = MemoryStreamFactory::new("mem.bin", b"abcdef".to_vec());
        let mut a = factory.open()?;
        let mut b = factory.open()?;
        a.seek(SeekFrom::Start(4))?;
        let mut first = [0u8; 1];
        b.read_exact(&mut first)?;
        assert_eq!(&first, b"a");
        a.read_exact(&mut first)?;
        assert_eq!(&first, b"e");
        Ok(())
    }

    #[test]
    fn test_copy_exact_reports_short_source() {
        let mut src = Cursor::new(vec![1u8, 2, 3]);
        let mut out = Vec::new();
        let err = copy_exact(&mut src, &mut out, 5, "x.bsa", Some("a.txt")).unwrap_err();
        match err {
            ExtractError::Truncated { expected, actual, .. } => {
                assert_eq!(expected, 5);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
