//! TES3 (Morrowind) BSA reading and building
//!
//! Morrowind archives have no folders and no compression: a flat table of
//! (size, offset) pairs, a name-offset table, a name block, a hash table
//! and then raw data. The whole directory is small, so it is parsed on open.

use binrw::prelude::*;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, info};

use super::strings;
use super::{Tes3FileState, Tes3State};
use crate::error::{ExtractError, Result};
use crate::streams::{copy_exact, read_block, StreamFactory};

pub const TES3_VERSION: u32 = 0x100;

#[binrw]
#[brw(little)]
#[derive(Debug)]
struct Tes3Header {
    version: u32,
    hash_offset: u32,
    file_count: u32,
    #[br(count = file_count)]
    records: Vec<(u32, u32)>,
    #[br(count = file_count)]
    name_offsets: Vec<u32>,
}

/// Entry in a Morrowind archive
#[derive(Clone)]
pub struct Tes3File {
    source: Arc<dyn StreamFactory>,
    archive: Arc<str>,
    data_offset: u64,
    state: Tes3FileState,
}

impl std::fmt::Debug for Tes3File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tes3File").field("state", &self.state).finish()
    }
}

impl Tes3File {
    pub fn path(&self) -> &str {
        &self.state.path
    }

    pub fn size(&self) -> u64 {
        self.state.size as u64
    }

    pub fn state(&self) -> Tes3FileState {
        self.state.clone()
    }

    pub fn copy_data_to(&self, output: &mut dyn Write) -> Result<u64> {
        let mut stream = self.source.open().map_err(ExtractError::io(&self.archive))?;
        stream
            .seek(SeekFrom::Start(self.data_offset + self.state.offset as u64))
            .map_err(ExtractError::io(&self.archive))?;
        copy_exact(
            &mut stream,
            output,
            self.size(),
            &self.archive,
            Some(&self.state.path),
        )
    }
}

/// Open Morrowind archive
pub struct Tes3Archive {
    name: Arc<str>,
    state: Tes3State,
    files: Vec<Tes3File>,
}

impl Tes3Archive {
    pub fn open(source: Arc<dyn StreamFactory>) -> Result<Self> {
        let name: Arc<str> = Arc::from(source.name());
        let mut stream = source.open().map_err(ExtractError::io(&name))?;
        let stream_len = stream
            .seek(SeekFrom::End(0))
            .and_then(|len| stream.seek(SeekFrom::Start(0)).map(|_| len))
            .map_err(ExtractError::io(&name))?;

        let header = Tes3Header::read(&mut stream)
            .map_err(ExtractError::binrw(&name, "Archive is not a TES3 BSA"))?;
        if header.version != TES3_VERSION {
            return Err(ExtractError::invalid(
                &*name,
                format!("Unknown TES3 version 0x{:x}", header.version),
            ));
        }

        let names_start = stream
            .stream_position()
            .map_err(ExtractError::io(&name))?;
        let hash_table = 12 + header.hash_offset as u64;
        if hash_table < names_start {
            return Err(ExtractError::invalid(&*name, "hash table overlaps the file table"));
        }
        let names = read_block(&mut stream, hash_table - names_start, &name, None)?;

        let hashes = read_block(&mut stream, 8 * header.file_count as u64, &name, None)?;
        let data_offset = hash_table + 8 * header.file_count as u64;
        let encoding = strings::encoding_for(None);

        let mut files = Vec::with_capacity(header.file_count as usize);
        for (index, (&(size, offset), &name_offset)) in
            header.records.iter().zip(&header.name_offsets).enumerate()
        {
            let start = name_offset as usize;
            let raw_name = names.get(start..).ok_or_else(|| {
                ExtractError::invalid(&*name, format!("name offset {} out of range", name_offset))
            })?;
            let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
            let path = strings::decode(&raw_name[..end], encoding);

            if data_offset + offset as u64 + size as u64 > stream_len {
                return Err(ExtractError::invalid(
                    &*name,
                    format!("{} points past the end of the archive", path),
                ));
            }

            let hash = &hashes[index * 8..index * 8 + 8];
            files.push(Tes3File {
                source: source.clone(),
                archive: name.clone(),
                data_offset,
                state: Tes3FileState {
                    path,
                    index,
                    size,
                    offset,
                    name_offset,
                    hash1: u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]),
                    hash2: u32::from_le_bytes([hash[4], hash[5], hash[6], hash[7]]),
                },
            });
        }

        debug!("Opened TES3 BSA {} ({} files)", name, files.len());
        Ok(Self {
            state: Tes3State {
                version_number: header.version,
                file_count: header.file_count,
                data_offset,
                hash_offset: header.hash_offset,
            },
            name,
            files,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Tes3State {
        self.state.clone()
    }

    pub fn files(&self) -> &[Tes3File] {
        &self.files
    }
}

struct PendingTes3 {
    state: Tes3FileState,
    data: Vec<u8>,
}

/// Builder for Morrowind archives. Hashes come from the file states;
/// offsets are recomputed.
pub struct Tes3Builder {
    archive: String,
    version_number: u32,
    files: Vec<PendingTes3>,
}

impl Tes3Builder {
    pub fn new(state: Tes3State, archive: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            version_number: state.version_number,
            files: Vec::new(),
        }
    }

    pub fn add_file(&mut self, state: Tes3FileState, src: &mut dyn Read) -> Result<()> {
        let mut data = Vec::new();
        src.read_to_end(&mut data)
            .map_err(ExtractError::io(&self.archive))?;
        self.files.push(PendingTes3 { state, data });
        Ok(())
    }

    pub fn build<W: Write + Seek>(mut self, out: &mut W) -> Result<()> {
        let archive = self.archive.clone();
        self.files.sort_by_key(|f| f.state.index);
        let encoding = strings::encoding_for(None);
        let count = self.files.len() as u64;

        let mut names = Vec::new();
        let mut name_offsets = Vec::with_capacity(self.files.len());
        let mut records = Vec::with_capacity(self.files.len());
        let mut data_len = 0u64;
        for file in &self.files {
            name_offsets.push(to_u32(names.len() as u64, &archive)?);
            names.extend_from_slice(&strings::encode(&file.state.path, encoding));
            names.push(0);

            records.push((to_u32(file.data.len() as u64, &archive)?, to_u32(data_len, &archive)?));
            data_len += file.data.len() as u64;
        }

        let header = Tes3Header {
            version: self.version_number,
            hash_offset: to_u32(12 * count + names.len() as u64, &archive)?,
            file_count: to_u32(count, &archive)?,
            records,
            name_offsets,
        };

        info!("Building TES3 BSA: {} ({} files)", archive, count);
        header
            .write(out)
            .map_err(ExtractError::binrw(&archive, "bad magic"))?;
        out.write_all(&names).map_err(ExtractError::io(&archive))?;
        for file in &self.files {
            out.write_all(&file.state.hash1.to_le_bytes())
                .and_then(|_| out.write_all(&file.state.hash2.to_le_bytes()))
                .map_err(ExtractError::io(&archive))?;
        }
        for file in &self.files {
            out.write_all(&file.data).map_err(ExtractError::io(&archive))?;
        }
        out.flush().map_err(ExtractError::io(&archive))?;
        Ok(())
    }
}

fn to_u32(value: u64, archive: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ExtractError::invalid(archive, "archive exceeds the 4 GiB BSA limit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::MemoryStreamFactory;
    use std::io::Cursor;

    fn file_state(index: usize, path: &str) -> Tes3FileState {
        Tes3FileState {
            path: path.into(),
            index,
            size: 0,
            offset: 0,
            name_offset: 0,
            hash1: 0x1000 + index as u32,
            hash2: 0x2000 + index as u32,
        }
    }

    #[test]
    fn test_build_then_read() -> anyhow::Result<()> {
        let state = Tes3State {
            version_number: TES3_VERSION,
            file_count: 0,
            data_offset: 0,
            hash_offset: 0,
        };
        let mut builder = Tes3Builder::new(state, "morrowind.bsa");
        builder.add_file(file_state(1, "meshes\\b.nif"), &mut Cursor::new(b"second".to_vec()))?;
        builder.add_file(file_state(0, "icons\\a.tga"), &mut Cursor::new(b"first!!".to_vec()))?;

        let mut out = Cursor::new(Vec::new());
        builder.build(&mut out)?;
        let bytes = out.into_inner();
        assert_eq!(&bytes[..4], &[0, 1, 0, 0]);

        let archive = Tes3Archive::open(Arc::new(MemoryStreamFactory::new("morrowind.bsa", bytes)))?;
        let files = archive.files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path(), "icons\\a.tga");
        assert_eq!(files[1].path(), "meshes\\b.nif");
        assert_eq!(files[1].state().hash1, 0x1001);
        assert_eq!(files[1].state().name_offset, 12);

        let mut data = Vec::new();
        files[1].copy_data_to(&mut data)?;
        assert_eq!(data, b"second");

        let state = archive.state();
        assert_eq!(state.file_count, 2);
        assert_eq!(state.data_offset, 12 + state.hash_offset as u64 + 16);
        Ok(())
    }

    #[test]
    fn test_rejects_truncated_table() {
        let bytes = vec![0, 1, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0];
        let result = Tes3Archive::open(Arc::new(MemoryStreamFactory::new("short.bsa", bytes)));
        assert!(matches!(result, Err(ExtractError::InvalidFormat { .. })));
    }
}
