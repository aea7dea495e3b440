//! BTAR: a flat, length-prefixed record stream
//!
//! ```text
//! "BTAR"  u16 major (1)  u16 minor (2..=4)
//! repeat: u16 name_len, name (UTF-8), u64 data_len, data
//! ```
//!
//! All integers are little-endian. Records are never buffered: the reader
//! hands out (offset, length) windows and seeks past the payload.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{ExtractError, Result};
use crate::paths::to_archive_path;
use crate::streams::{read_block, ReadSeek, StreamFactory};

pub const BTAR_MAGIC: &[u8; 4] = b"BTAR";
pub const MAJOR_VERSION: u16 = 1;
pub const MIN_MINOR_VERSION: u16 = 2;
pub const MAX_MINOR_VERSION: u16 = 4;

/// Location of one record's payload in the source stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtarRecord {
    pub name: String,
    pub offset: u64,
    pub len: u64,
}

/// Sequential reader over a BTAR stream
pub struct BtarReader {
    archive: String,
    stream: Box<dyn ReadSeek>,
    stream_len: u64,
    minor_version: u16,
}

impl BtarReader {
    /// Open a fresh stream from `source` and validate the header.
    pub fn open(source: &Arc<dyn StreamFactory>) -> Result<Self> {
        let archive = source.name().to_string();
        let mut stream = source.open().map_err(ExtractError::io(&archive))?;
        let stream_len = stream
            .seek(SeekFrom::End(0))
            .and_then(|len| stream.seek(SeekFrom::Start(0)).map(|_| len))
            .map_err(ExtractError::io(&archive))?;

        let header = read_block(&mut stream, 8, &archive, None)
            .map_err(|_| ExtractError::invalid(&*archive, "Not a valid BTAR file"))?;
        if &header[..4] != BTAR_MAGIC {
            return Err(ExtractError::invalid(archive, "Not a valid BTAR file"));
        }
        let major = u16::from_le_bytes([header[4], header[5]]);
        if major != MAJOR_VERSION {
            return Err(ExtractError::invalid(
                archive,
                "Invalid BTAR major version, should be 1",
            ));
        }
        let minor_version = u16::from_le_bytes([header[6], header[7]]);
        if !(MIN_MINOR_VERSION..=MAX_MINOR_VERSION).contains(&minor_version) {
            return Err(ExtractError::invalid(archive, "Invalid BTAR minor version"));
        }

        debug!("Opened BTAR {} (1.{})", archive, minor_version);
        Ok(Self {
            archive,
            stream,
            stream_len,
            minor_version,
        })
    }

    pub fn minor_version(&self) -> u16 {
        self.minor_version
    }

    /// Read the next record header and skip its payload.
    pub fn next_record(&mut self) -> Result<Option<BtarRecord>> {
        let position = self
            .stream
            .stream_position()
            .map_err(ExtractError::io(&self.archive))?;
        if position >= self.stream_len {
            return Ok(None);
        }

        let archive = self.archive.as_str();
        let len_bytes = read_block(&mut self.stream, 2, archive, None)?;
        let name_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]);
        let name_bytes = read_block(&mut self.stream, name_len as u64, archive, None)?;
        let name = String::from_utf8(name_bytes).map_err(|_| {
            ExtractError::invalid(archive, format!("record name at {} is not UTF-8", position))
        })?;
        let size_bytes = read_block(&mut self.stream, 8, archive, Some(&name))?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&size_bytes);
        let len = u64::from_le_bytes(raw);

        let offset = position + 2 + name_len as u64 + 8;
        let end = offset.checked_add(len).filter(|&end| end <= self.stream_len);
        let Some(end) = end else {
            return Err(ExtractError::Truncated {
                archive: self.archive.clone(),
                entry: Some(name),
                expected: len,
                actual: self.stream_len.saturating_sub(offset),
            });
        };
        self.stream
            .seek(SeekFrom::Start(end))
            .map_err(ExtractError::io(&self.archive))?;

        Ok(Some(BtarRecord {
            name: to_archive_path(&name),
            offset,
            len,
        }))
    }
}

/// Writes BTAR 1.4 streams
pub struct BtarWriter<W: Write> {
    out: W,
    records: usize,
}

impl<W: Write> BtarWriter<W> {
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(BTAR_MAGIC)?;
        out.write_all(&MAJOR_VERSION.to_le_bytes())?;
        out.write_all(&MAX_MINOR_VERSION.to_le_bytes())?;
        Ok(Self { out, records: 0 })
    }

    /// Append a record of exactly `len` bytes from `data`.
    pub fn add(&mut self, name: &str, len: u64, data: &mut dyn Read) -> io::Result<()> {
        let name = to_archive_path(name);
        let name_len = u16::try_from(name.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("name too long: {}", name))
        })?;
        self.out.write_all(&name_len.to_le_bytes())?;
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&len.to_le_bytes())?;

        let copied = io::copy(&mut data.take(len), &mut self.out)?;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{}: expected {} bytes, got {}", name, len, copied),
            ));
        }
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Pack every file under `dir` into a BTAR at `output`. Returns the record count.
pub fn pack_directory(dir: &Path, output: &Path) -> anyhow::Result<usize> {
    use anyhow::Context;

    let file = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut writer = BtarWriter::new(BufWriter::new(file))?;

    let mut entries: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in entries {
        let relative = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{} is outside {}", entry.path().display(), dir.display()))?;
        let name = relative.to_string_lossy();
        let mut input = File::open(entry.path())
            .with_context(|| format!("Failed to open {}", entry.path().display()))?;
        let len = input.metadata()?.len();
        writer
            .add(&name, len, &mut input)
            .with_context(|| format!("Failed to pack {}", name))?;
    }

    let count = writer.records();
    writer.finish()?;
    info!("Packed {} files into {}", count, output.display());
    Ok(count)
}
