//! BA2 (Fallout 4/Starfield) archive reading
//!
//! Only general (GNRL) archives are handled. Texture archives (DX10, GNMF)
//! store chunked mip data and are rejected at open.

use binrw::prelude::*;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::debug;

use super::compression::{self, Codec};
use super::strings;
use super::{Ba2FileState, Ba2State};
use crate::error::{ExtractError, Result};
use crate::streams::{copy_exact, read_block, StreamFactory};

pub const BA2_MAGIC: &str = "BTDX";
pub const GNRL: [u8; 4] = *b"GNRL";

/// Sentinel stored in every GNRL record's alignment slot
pub const RECORD_SENTINEL: u32 = 0xBAAD_F00D;

pub(crate) const RECORD_LEN: u64 = 36;

/// Starfield v3 compression format value for LZ4 blocks
pub const COMPRESSION_LZ4: u32 = 3;

/// Fixed part of the header; v2/v3 extras are read after it.
#[binrw]
#[brw(little, magic = b"BTDX")]
#[derive(Debug, Clone)]
pub(crate) struct Ba2Header {
    pub version: u32,
    pub kind: [u8; 4],
    pub file_count: u32,
    pub name_table_offset: u64,
}

/// On-disk GNRL record
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub(crate) struct GnrlRecord {
    pub name_hash: u32,
    pub extension: [u8; 4],
    pub dir_hash: u32,
    pub flags: u32,
    pub offset: u64,
    pub packed_size: u32,
    pub unpacked_size: u32,
    pub align: u32,
}

pub fn is_supported_version(version: u32) -> bool {
    matches!(version, 1 | 2 | 3 | 7 | 8)
}

/// Header length for a given version
pub fn header_len(version: u32) -> u64 {
    match version {
        2 => 32,
        3 => 36,
        _ => 24,
    }
}

/// Codec for packed entries in this archive
pub fn codec_for(state: &Ba2State) -> Codec {
    if state.version == 3 && state.compression == COMPRESSION_LZ4 {
        Codec::Lz4Block
    } else {
        Codec::Zlib
    }
}

/// Entry in a general BA2
#[derive(Clone)]
pub struct Ba2File {
    source: Arc<dyn StreamFactory>,
    archive: Arc<str>,
    codec: Codec,
    offset: u64,
    packed_size: u32,
    unpacked_size: u32,
    state: Ba2FileState,
}

impl std::fmt::Debug for Ba2File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ba2File")
            .field("state", &self.state)
            .field("offset", &self.offset)
            .field("packed_size", &self.packed_size)
            .finish()
    }
}

impl Ba2File {
    pub fn path(&self) -> &str {
        &self.state.path
    }

    pub fn size(&self) -> u64 {
        self.unpacked_size as u64
    }

    pub fn compressed(&self) -> bool {
        self.packed_size != 0
    }

    pub fn state(&self) -> Ba2FileState {
        self.state.clone()
    }

    pub fn copy_data_to(&self, output: &mut dyn Write) -> Result<u64> {
        let mut stream = self.source.open().map_err(ExtractError::io(&self.archive))?;
        stream
            .seek(SeekFrom::Start(self.offset))
            .map_err(ExtractError::io(&self.archive))?;

        let codec = if self.compressed() { self.codec } else { Codec::Stored };
        let mut decoder = compression::decoder(
            codec,
            stream,
            self.packed_size as u64,
            self.unpacked_size as u64,
        )
        .map_err(ExtractError::io(&self.archive))?;
        copy_exact(
            &mut decoder,
            output,
            self.size(),
            &self.archive,
            Some(&self.state.path),
        )
    }
}

/// Open general BA2
pub struct Ba2Archive {
    name: Arc<str>,
    state: Ba2State,
    files: Vec<Ba2File>,
}

impl Ba2Archive {
    pub fn open(source: Arc<dyn StreamFactory>) -> Result<Self> {
        let name: Arc<str> = Arc::from(source.name());
        let mut stream = source.open().map_err(ExtractError::io(&name))?;
        let stream_len = stream
            .seek(SeekFrom::End(0))
            .and_then(|len| stream.seek(SeekFrom::Start(0)).map(|_| len))
            .map_err(ExtractError::io(&name))?;

        let header = Ba2Header::read(&mut stream)
            .map_err(ExtractError::binrw(&name, "Archive is not a BA2"))?;
        if !is_supported_version(header.version) {
            return Err(ExtractError::invalid(
                &*name,
                format!("Unknown BA2 version {}", header.version),
            ));
        }
        match &header.kind {
            b"GNRL" => {}
            b"DX10" | b"GNMF" => {
                return Err(ExtractError::invalid(
                    &*name,
                    format!(
                        "{} texture archives are not supported",
                        String::from_utf8_lossy(&header.kind)
                    ),
                ))
            }
            other => {
                return Err(ExtractError::invalid(
                    &*name,
                    format!("Can't parse entry types of {}", String::from_utf8_lossy(other)),
                ))
            }
        }

        let (unk1, unk2) = if header.version == 2 || header.version == 3 {
            <(u32, u32)>::read_le(&mut stream)
                .map_err(ExtractError::binrw(&name, "truncated header"))?
        } else {
            (0, 0)
        };
        let compression = if header.version == 3 {
            u32::read_le(&mut stream).map_err(ExtractError::binrw(&name, "truncated header"))?
        } else {
            0
        };

        let state = Ba2State {
            version: header.version,
            header_magic: BA2_MAGIC.to_string(),
            kind: String::from_utf8_lossy(&header.kind).into_owned(),
            has_name_table: header.name_table_offset > 0,
            unk1,
            unk2,
            compression,
        };
        let codec = codec_for(&state);

        let record_bytes = read_block(&mut stream, RECORD_LEN * header.file_count as u64, &name, None)?;
        let mut cursor = std::io::Cursor::new(record_bytes);
        let mut records = Vec::with_capacity(header.file_count as usize);
        for _ in 0..header.file_count {
            let record = GnrlRecord::read(&mut cursor)
                .map_err(ExtractError::binrw(&name, "truncated file record"))?;
            records.push(record);
        }

        let names = if state.has_name_table {
            if header.name_table_offset > stream_len {
                return Err(ExtractError::invalid(&*name, "name table points past the end of the archive"));
            }
            stream
                .seek(SeekFrom::Start(header.name_table_offset))
                .map_err(ExtractError::io(&name))?;
            let encoding = strings::encoding_for(None);
            let mut names = Vec::with_capacity(records.len());
            for _ in 0..records.len() {
                let len = u16::read_le(&mut stream)
                    .map_err(ExtractError::binrw(&name, "truncated name table"))?;
                let raw = read_block(&mut stream, len as u64, &name, None)?;
                names.push(strings::decode(&raw, encoding));
            }
            Some(names)
        } else {
            None
        };

        let mut files = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let extension = String::from_utf8_lossy(&record.extension)
                .trim_end_matches('\0')
                .to_string();
            let path = match &names {
                Some(names) => names[index].clone(),
                None => format!("{:08x}.{}", record.name_hash, extension),
            };
            let on_disk = if record.packed_size != 0 {
                record.packed_size
            } else {
                record.unpacked_size
            };
            let end = record.offset.checked_add(on_disk as u64);
            if end.map_or(true, |end| end > stream_len) {
                return Err(ExtractError::invalid(
                    &*name,
                    format!("{} points past the end of the archive", path),
                ));
            }

            files.push(Ba2File {
                source: source.clone(),
                archive: name.clone(),
                codec,
                offset: record.offset,
                packed_size: record.packed_size,
                unpacked_size: record.unpacked_size,
                state: Ba2FileState {
                    path,
                    index,
                    name_hash: record.name_hash,
                    extension,
                    dir_hash: record.dir_hash,
                    flags: record.flags,
                    align: record.align,
                    compressed: record.packed_size != 0,
                },
            });
        }

        debug!(
            "Opened BA2 {} (v{}, {} files, name table: {})",
            name,
            state.version,
            files.len(),
            state.has_name_table
        );
        Ok(Self { name, state, files })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Ba2State {
        self.state.clone()
    }

    pub fn files(&self) -> &[Ba2File] {
        &self.files
    }
}
