//! Splits one decompressed byte stream into a list of declared files.
//!
//! OMOD payloads are a single stream holding every file back to back, with
//! the names, CRCs and lengths stored separately. [`SparseFileWriter`] is
//! a `Write` sink that fills those files in order.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ExtractError, Result};
use crate::paths::{ensure_parent_dirs, is_safe_file_name, join_windows_path, to_archive_path};

/// Declared file in a sparse stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseEntry {
    pub name: String,
    pub crc: u32,
    pub length: u64,
}

/// Output of a finished sparse write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseFile {
    /// Archive-relative name, `\` separated
    pub name: String,
    pub path: PathBuf,
}

struct OpenFile {
    out: BufWriter<File>,
    hasher: crc32fast::Hasher,
    remaining: u64,
}

pub struct SparseFileWriter {
    archive: String,
    dest: PathBuf,
    entries: Vec<SparseEntry>,
    next: usize,
    current: Option<OpenFile>,
    files: Vec<SparseFile>,
}

impl SparseFileWriter {
    pub fn new(archive: impl Into<String>, dest: impl Into<PathBuf>, entries: Vec<SparseEntry>) -> Self {
        Self {
            archive: archive.into(),
            dest: dest.into(),
            entries,
            next: 0,
            current: None,
            files: Vec::new(),
        }
    }

    /// Total bytes the stream is expected to contain.
    pub fn declared_len(&self) -> u64 {
        self.entries.iter().map(|e| e.length).sum()
    }

    /// Where an entry goes. Unsafe names are redirected to a unique
    /// quarantine file that is never reported.
    fn target_for(&self, index: usize, entry: &SparseEntry) -> (PathBuf, bool) {
        if is_safe_file_name(&entry.name) {
            (join_windows_path(&self.dest, &entry.name), true)
        } else {
            warn!(
                "{}: refusing unsafe file name {:?}, writing it to quarantine",
                self.archive, entry.name
            );
            (self.dest.join(format!("IllegalFile_{}", index)), false)
        }
    }

    /// Open the next declared file, creating zero-length ones on the way.
    fn open_next(&mut self) -> io::Result<bool> {
        while self.next < self.entries.len() {
            let index = self.next;
            self.next += 1;
            let entry = self.entries[index].clone();
            let (path, safe) = self.target_for(index, &entry);
            ensure_parent_dirs(&path)?;
            let file = File::create(&path)?;
            if safe {
                self.files.push(SparseFile {
                    name: to_archive_path(&entry.name),
                    path,
                });
            }

            if entry.length == 0 {
                continue;
            }
            self.current = Some(OpenFile {
                out: BufWriter::new(file),
                hasher: crc32fast::Hasher::new(),
                remaining: entry.length,
            });
            return Ok(true);
        }
        Ok(false)
    }

    fn close_current(&mut self) -> io::Result<()> {
        if let Some(mut open) = self.current.take() {
            open.out.flush()?;
            let entry = &self.entries[self.next - 1];
            let crc = open.hasher.finalize();
            if crc != entry.crc {
                debug!(
                    "{}: CRC mismatch for {} (expected {:08x}, got {:08x})",
                    self.archive, entry.name, entry.crc, crc
                );
            }
        }
        Ok(())
    }

    /// Close the last file and check that every declared byte arrived.
    pub fn finish(mut self) -> Result<Vec<SparseFile>> {
        let underrun = |entry: &SparseEntry, archive: &str| ExtractError::OmodUnderrun {
            archive: archive.to_string(),
            entry: entry.name.clone(),
        };

        if let Some(open) = &self.current {
            if open.remaining > 0 {
                return Err(underrun(&self.entries[self.next - 1], &self.archive));
            }
        }
        self.close_current().map_err(ExtractError::io(&self.archive))?;

        // Anything left must be empty
        while self.next < self.entries.len() {
            let entry = &self.entries[self.next];
            if entry.length > 0 {
                return Err(underrun(entry, &self.archive));
            }
            self.open_next().map_err(ExtractError::io(&self.archive))?;
        }
        Ok(self.files)
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }
}

impl Write for SparseFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() && !self.open_next()? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: data runs past the declared files", self.archive),
            ));
        }

        let written = {
            let Some(open) = self.current.as_mut() else {
                return Ok(0);
            };
            let take = buf.len().min(usize::try_from(open.remaining).unwrap_or(usize::MAX));
            open.out.write_all(&buf[..take])?;
            open.hasher.update(&buf[..take]);
            open.remaining -= take as u64;
            take
        };

        if self.current.as_ref().is_some_and(|f| f.remaining == 0) {
            self.close_current()?;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(open) => open.out.flush(),
            None => Ok(()),
        }
    }
}
