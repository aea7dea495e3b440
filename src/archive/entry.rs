//! Uniform view of one extracted entry
//!
//! Whatever strategy produced it, a projection sees an [`ExtractedEntry`]:
//! a path, a timestamp and a way to get the bytes. Streams are opened on
//! demand and every `open()` returns an independent reader.

use once_cell::sync::OnceCell;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::bsa::ArchiveFile;
use crate::error::{ExtractError, Result};
use crate::paths::ensure_parent_dirs;
use crate::streams::{copy_exact, prealloc_capacity, ReadSeek, SliceReader, StreamFactory};

/// One entry handed to a projection
pub trait ExtractedEntry: Send + Sync {
    /// Archive-relative path, `\` separated
    fn path(&self) -> &str;

    fn last_modified(&self) -> SystemTime;

    /// Fresh stream over the entry's bytes
    fn open(&self) -> Result<Box<dyn ReadSeek>>;

    /// True when [`move_to`](Self::move_to) can skip [`open`](Self::open).
    fn can_move(&self) -> bool {
        false
    }

    /// Put the entry's bytes at `dest`, creating parent directories.
    fn move_to(&self, dest: &Path) -> Result<()> {
        let archive = self.path().to_string();
        ensure_parent_dirs(dest).map_err(ExtractError::io(&archive))?;
        let mut input = self.open()?;
        let file = File::create(dest).map_err(ExtractError::io(&archive))?;
        let mut output = BufWriter::new(file);
        io::copy(&mut input, &mut output).map_err(ExtractError::io(&archive))?;
        output.flush().map_err(ExtractError::io(&archive))?;
        Ok(())
    }
}

/// File already on disk (7-Zip output, reconstructed OMOD files)
pub struct NativeFileEntry {
    path: String,
    file: PathBuf,
}

impl NativeFileEntry {
    pub fn new(path: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: file.into(),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }
}

impl ExtractedEntry for NativeFileEntry {
    fn path(&self) -> &str {
        &self.path
    }

    fn last_modified(&self) -> SystemTime {
        fs::metadata(&self.file)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    fn open(&self) -> Result<Box<dyn ReadSeek>> {
        let file = File::open(&self.file).map_err(ExtractError::io(&self.path))?;
        Ok(Box::new(BufReader::with_capacity(64 * 1024, file)))
    }

    fn can_move(&self) -> bool {
        true
    }

    fn move_to(&self, dest: &Path) -> Result<()> {
        ensure_parent_dirs(dest).map_err(ExtractError::io(&self.path))?;
        if fs::rename(&self.file, dest).is_ok() {
            return Ok(());
        }
        // Cross-device: copy then remove
        fs::copy(&self.file, dest).map_err(ExtractError::io(&self.path))?;
        fs::remove_file(&self.file).map_err(ExtractError::io(&self.path))?;
        Ok(())
    }
}

/// Entry inside a BSA/BA2. Decompressed on first open, then served from
/// memory for the lifetime of the entry.
pub struct BsaEntry {
    file: ArchiveFile,
    modified: SystemTime,
    data: OnceCell<Arc<[u8]>>,
}

impl BsaEntry {
    pub fn new(file: ArchiveFile, modified: SystemTime) -> Self {
        Self {
            file,
            modified,
            data: OnceCell::new(),
        }
    }

    fn data(&self) -> Result<Arc<[u8]>> {
        self.data
            .get_or_try_init(|| {
                let mut buf = Vec::with_capacity(prealloc_capacity(self.file.size()?));
                self.file.copy_data_to(&mut buf)?;
                Ok(Arc::from(buf))
            })
            .cloned()
    }
}

impl ExtractedEntry for BsaEntry {
    fn path(&self) -> &str {
        self.file.path()
    }

    fn last_modified(&self) -> SystemTime {
        self.modified
    }

    fn open(&self) -> Result<Box<dyn ReadSeek>> {
        Ok(Box::new(Cursor::new(SharedData(self.data()?))))
    }
}

struct SharedData(Arc<[u8]>);

impl AsRef<[u8]> for SharedData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Record inside a BTAR: a byte range of the source stream
pub struct BtarEntry {
    source: Arc<dyn StreamFactory>,
    path: String,
    offset: u64,
    len: u64,
}

impl BtarEntry {
    pub fn new(source: Arc<dyn StreamFactory>, path: impl Into<String>, offset: u64, len: u64) -> Self {
        Self {
            source,
            path: path.into(),
            offset,
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ExtractedEntry for BtarEntry {
    fn path(&self) -> &str {
        &self.path
    }

    fn last_modified(&self) -> SystemTime {
        self.source.last_modified()
    }

    fn open(&self) -> Result<Box<dyn ReadSeek>> {
        let stream = self.source.open().map_err(ExtractError::io(self.source.name()))?;
        let slice = SliceReader::new(stream, self.offset, self.len)
            .map_err(ExtractError::io(self.source.name()))?;
        Ok(Box::new(slice))
    }

    fn can_move(&self) -> bool {
        true
    }

    fn move_to(&self, dest: &Path) -> Result<()> {
        let archive = self.source.name();
        ensure_parent_dirs(dest).map_err(ExtractError::io(archive))?;
        let mut input = self.source.open().map_err(ExtractError::io(archive))?;
        input
            .seek(io::SeekFrom::Start(self.offset))
            .map_err(ExtractError::io(archive))?;
        let file = File::create(dest).map_err(ExtractError::io(archive))?;
        let mut output = BufWriter::new(file);
        copy_exact(&mut input, &mut output, self.len, archive, Some(&self.path))?;
        output.flush().map_err(ExtractError::io(archive))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::MemoryStreamFactory;
    use std::io::Read;

    #[test]
    fn test_native_entry_moves_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("a.txt");
        fs::write(&src, b"hello")?;

        let entry = NativeFileEntry::new("a.txt", &src);
        assert!(entry.can_move());
        let mut text = String::new();
        entry.open()?.read_to_string(&mut text)?;
        assert_eq!(text, "hello");

        let dest = dir.path().join("out").join("nested").join("b.txt");
        entry.move_to(&dest)?;
        assert!(!src.exists());
        assert_eq!(fs::read(&dest)?, b"hello");
        Ok(())
    }

    #[test]
    fn test_btar_entry_slices_source() -> anyhow::Result<()> {
        let source = Arc::new(MemoryStreamFactory::new("x.btar", b"....payload....".to_vec()));
        let entry = BtarEntry::new(source, "p.bin", 4, 7);

        // Two opens are independent
        let mut first = entry.open()?;
        let mut second = entry.open()?;
        let mut a = [0u8; 3];
        first.read_exact(&mut a)?;
        let mut all = Vec::new();
        second.read_to_end(&mut all)?;
        assert_eq!(&a, b"pay");
        assert_eq!(all, b"payload");

        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("p.bin");
        entry.move_to(&dest)?;
        assert_eq!(fs::read(dest)?, b"payload");
        Ok(())
    }

    #[test]
    fn test_bsa_entry_with_inflated_size_fails_cleanly() -> anyhow::Result<()> {
        // One zlib record claiming ~4 GiB unpacked from 8 packed bytes
        let payload = [0x78, 0x9c, 0x03, 0x00, 0x00, 0x00, 0x00, 0x01];
        let mut bytes = b"BTDX".to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(b"GNRL");
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0x1234u32.to_le_bytes());
        bytes.extend_from_slice(b"nif\0");
        bytes.extend_from_slice(&0x5678u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&60u64.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        bytes.extend_from_slice(&crate::bsa::ba2_reader::RECORD_SENTINEL.to_le_bytes());
        bytes.extend_from_slice(&payload);

        let archive = crate::bsa::BsaArchive::open_detect(Arc::new(MemoryStreamFactory::new("big.ba2", bytes)))?;
        let file = archive.files()?.remove(0);
        assert_eq!(file.size()?, 0xFFFF_FFF0);

        let entry = BsaEntry::new(file, SystemTime::UNIX_EPOCH);
        assert!(entry.open().is_err());
        Ok(())
    }
}
