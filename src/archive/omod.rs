//! OMOD (Oblivion Mod Manager) packages
//!
//! An OMOD is a zip holding a `config` entry, a `data.crc` file list plus a
//! `data` payload, and optionally `plugins.crc`/`plugins`. Each payload is
//! every listed file concatenated into one stream, compressed either as raw
//! LZMA (5 property bytes then the stream) or as a single-entry zip. The
//! file list drives a [`SparseFileWriter`] that cuts the stream back apart.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek};
use std::path::Path;
use tracing::{debug, info};
use zip::result::ZipError;
use zip::ZipArchive;

use super::sparse::{SparseEntry, SparseFile, SparseFileWriter};
use crate::error::{ExtractError, Result};

/// Payload compression declared by the config's last byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OmodCompression {
    /// Raw LZMA stream
    SevenZip,
    /// Single-entry zip
    Zip,
}

/// Package metadata from the `config` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmodConfig {
    pub file_version: u8,
    pub name: String,
    pub major_version: i32,
    pub minor_version: i32,
    pub author: String,
    pub email: String,
    pub website: String,
    pub description: String,
    /// Binary timestamp (file version 2 and later)
    pub creation_time: Option<i64>,
    /// Free-form date string (file version 1)
    pub creation_date: Option<String>,
    pub compression: OmodCompression,
}

impl OmodConfig {
    pub fn parse<R: Read>(reader: &mut R) -> io::Result<Self> {
        let file_version = read_u8(reader)?;
        let name = read_string(reader)?;
        let major_version = read_i32(reader)?;
        let minor_version = read_i32(reader)?;
        let author = read_string(reader)?;
        let email = read_string(reader)?;
        let website = read_string(reader)?;
        let description = read_string(reader)?;
        let (creation_time, creation_date) = if file_version >= 2 {
            (Some(read_i64(reader)?), None)
        } else {
            (None, Some(read_string(reader)?))
        };
        let compression = match read_u8(reader)? {
            0 => OmodCompression::SevenZip,
            1 => OmodCompression::Zip,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown compression type {}", other),
                ))
            }
        };

        Ok(Self {
            file_version,
            name,
            major_version,
            minor_version,
            author,
            email,
            website,
            description,
            creation_time,
            creation_date,
            compression,
        })
    }
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// .NET `BinaryReader.ReadString`: 7-bit varint length, then UTF-8.
fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut len: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = read_u8(reader)?;
        len |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "string length overflows"));
        }
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Parse a `*.crc` file list: (string name, u32 crc, i64 length) repeated.
pub fn parse_file_list(bytes: &[u8]) -> io::Result<Vec<SparseEntry>> {
    let mut cursor = Cursor::new(bytes);
    let mut entries = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        let name = read_string(&mut cursor)?;
        let crc = read_i32(&mut cursor)? as u32;
        let length = read_i64(&mut cursor)?;
        let length = u64::try_from(length).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, format!("negative length for {}", name))
        })?;
        entries.push(SparseEntry { name, crc, length });
    }
    Ok(entries)
}

fn zip_error(archive: &str) -> impl FnOnce(ZipError) -> ExtractError + '_ {
    move |err| match err {
        ZipError::Io(source) => ExtractError::Io {
            archive: archive.to_string(),
            source,
        },
        other => ExtractError::invalid(archive, other.to_string()),
    }
}

/// Open OMOD package
pub struct OmodArchive {
    archive: String,
    zip: ZipArchive<File>,
    config: OmodConfig,
}

impl OmodArchive {
    pub fn open(archive: impl Into<String>, path: &Path) -> Result<Self> {
        let archive = archive.into();
        let file = File::open(path).map_err(ExtractError::io(&archive))?;
        let mut zip = ZipArchive::new(file).map_err(zip_error(&archive))?;

        let config = {
            let mut entry = match zip.by_name("config") {
                Ok(entry) => entry,
                Err(ZipError::FileNotFound) => {
                    return Err(ExtractError::invalid(
                        &*archive,
                        "Could not find the configuration data",
                    ))
                }
                Err(e) => return Err(zip_error(&archive)(e)),
            };
            OmodConfig::parse(&mut entry).map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData if e.to_string().starts_with("unknown compression") => {
                    ExtractError::UnsupportedCompression {
                        archive: archive.clone(),
                        kind: e.to_string(),
                    }
                }
                _ => ExtractError::invalid(&*archive, format!("bad config: {}", e)),
            })?
        };

        debug!(
            "OMOD {}: {} {}.{} by {} ({:?})",
            archive,
            config.name,
            config.major_version,
            config.minor_version,
            config.author,
            config.compression
        );
        Ok(Self {
            archive,
            zip,
            config,
        })
    }

    pub fn config(&self) -> &OmodConfig {
        &self.config
    }

    pub fn has_plugins(&self) -> bool {
        self.zip.index_for_name("plugins.crc").is_some()
    }

    /// Reconstruct the data files under `dest`.
    pub fn extract_data(&mut self, dest: &Path) -> Result<Vec<SparseFile>> {
        self.extract_stream("data.crc", "data", dest)
    }

    /// Reconstruct the plugin files under `dest`; empty when the package
    /// has none.
    pub fn extract_plugins(&mut self, dest: &Path) -> Result<Vec<SparseFile>> {
        if !self.has_plugins() {
            return Ok(Vec::new());
        }
        self.extract_stream("plugins.crc", "plugins", dest)
    }

    fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut entry = self.zip.by_name(name).map_err(zip_error(&self.archive))?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(ExtractError::io(&self.archive))?;
        Ok(data)
    }

    fn extract_stream(&mut self, list_name: &str, data_name: &str, dest: &Path) -> Result<Vec<SparseFile>> {
        let archive = self.archive.clone();
        let list = self.read_entry(list_name)?;
        let entries = parse_file_list(&list)
            .map_err(|e| ExtractError::invalid(&*archive, format!("{}: {}", list_name, e)))?;
        info!("Extracting {} files from {}:{}", entries.len(), archive, data_name);

        let mut sink = SparseFileWriter::new(archive.clone(), dest, entries);
        let declared = sink.declared_len();
        let compression = self.config.compression;
        let mut entry = self.zip.by_name(data_name).map_err(zip_error(&archive))?;

        let copied = match compression {
            OmodCompression::SevenZip => {
                let mut props = [0u8; 5];
                entry
                    .read_exact(&mut props)
                    .map_err(|_| ExtractError::invalid(&*archive, "LZMA properties missing"))?;
                let dict_size = u32::from_le_bytes([props[1], props[2], props[3], props[4]]);
                let mut reader =
                    lzma_rust2::LzmaReader::new_with_props(&mut entry, declared, props[0], dict_size, None)
                        .map_err(|e| ExtractError::invalid(&*archive, e.to_string()))?;
                io::copy(&mut reader, &mut sink)
            }
            OmodCompression::Zip => {
                // Inner zip needs Seek; spool it
                let mut spool = tempfile::tempfile().map_err(ExtractError::io(&archive))?;
                io::copy(&mut entry, &mut spool).map_err(ExtractError::io(&archive))?;
                spool.rewind().map_err(ExtractError::io(&archive))?;
                let mut inner = ZipArchive::new(spool).map_err(zip_error(&archive))?;
                let mut payload = inner.by_index(0).map_err(zip_error(&archive))?;
                io::copy(&mut payload, &mut sink)
            }
        };

        match copied {
            Ok(_) => {}
            // A short stream is reported by finish() as an underrun
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(ExtractError::io(&archive)(e)),
        }
        sink.finish()
    }
}
