//! BA2 (Fallout 4/Starfield) archive creation
//!
//! Writes general (GNRL) archives laid out the way [`Ba2Archive`] reads
//! them: header, records in index order, payloads, then the name table.
//!
//! [`Ba2Archive`]: super::ba2_reader::Ba2Archive

use binrw::prelude::*;
use rayon::prelude::*;
use std::io::{Read, Seek, Write};
use tracing::info;

use super::ba2_reader::{codec_for, header_len, is_supported_version, Ba2Header, GnrlRecord, GNRL, RECORD_LEN};
use super::compression;
use super::strings;
use super::{Ba2FileState, Ba2State};
use crate::error::{ExtractError, Result};

struct PendingBa2 {
    state: Ba2FileState,
    data: Vec<u8>,
}

/// Builder for general BA2 archives
pub struct Ba2Builder {
    archive: String,
    state: Ba2State,
    files: Vec<PendingBa2>,
}

impl Ba2Builder {
    pub fn new(state: Ba2State, archive: impl Into<String>) -> Result<Self> {
        let archive = archive.into();
        if state.header_magic != "BTDX" {
            return Err(ExtractError::invalid(
                archive,
                format!("Unknown header type: {}", state.header_magic),
            ));
        }
        if state.kind.as_bytes() != GNRL {
            return Err(ExtractError::invalid(
                archive,
                format!("{} archives cannot be built", state.kind),
            ));
        }
        if !is_supported_version(state.version) {
            return Err(ExtractError::invalid(
                archive,
                format!("Unknown BA2 version {}", state.version),
            ));
        }
        Ok(Self {
            archive,
            state,
            files: Vec::new(),
        })
    }

    /// Add a file; its payload is buffered until [`build`](Self::build).
    pub fn add_file(&mut self, state: Ba2FileState, src: &mut dyn Read) -> Result<()> {
        let mut data = Vec::new();
        src.read_to_end(&mut data)
            .map_err(ExtractError::io(&self.archive))?;
        self.files.push(PendingBa2 { state, data });
        Ok(())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn build<W: Write + Seek>(mut self, out: &mut W) -> Result<()> {
        let archive = self.archive.clone();
        self.files.sort_by_key(|f| f.state.index);
        let codec = codec_for(&self.state);

        // Compress in parallel, keep index order
        let packed: Vec<std::io::Result<Option<Vec<u8>>>> = self
            .files
            .par_iter()
            .map(|f| {
                if f.state.compressed {
                    compression::compress(codec, &f.data).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect();

        let count = self.files.len() as u64;
        let mut offset = header_len(self.state.version) + RECORD_LEN * count;
        let mut records = Vec::with_capacity(self.files.len());
        let mut payloads = Vec::with_capacity(self.files.len());
        for (file, packed) in self.files.iter().zip(packed) {
            let packed = packed.map_err(ExtractError::io(&archive))?;
            let unpacked_size = to_u32(file.data.len() as u64, &archive)?;
            let (packed_size, on_disk) = match &packed {
                Some(bytes) => (to_u32(bytes.len() as u64, &archive)?, bytes.len() as u64),
                None => (0, file.data.len() as u64),
            };

            let mut extension = [0u8; 4];
            for (slot, byte) in extension.iter_mut().zip(file.state.extension.bytes()) {
                *slot = byte;
            }
            records.push(GnrlRecord {
                name_hash: file.state.name_hash,
                extension,
                dir_hash: file.state.dir_hash,
                flags: file.state.flags,
                offset,
                packed_size,
                unpacked_size,
                align: file.state.align,
            });
            offset += on_disk;
            payloads.push(packed);
        }

        let header = Ba2Header {
            version: self.state.version,
            kind: GNRL,
            file_count: to_u32(count, &archive)?,
            name_table_offset: if self.state.has_name_table { offset } else { 0 },
        };

        info!(
            "Building BA2: {} ({} files, v{}, name table: {})",
            archive, count, self.state.version, self.state.has_name_table
        );

        let io = ExtractError::io;
        header
            .write(out)
            .map_err(ExtractError::binrw(&archive, "bad magic"))?;
        if self.state.version == 2 || self.state.version == 3 {
            out.write_all(&self.state.unk1.to_le_bytes())
                .and_then(|_| out.write_all(&self.state.unk2.to_le_bytes()))
                .map_err(io(&archive))?;
        }
        if self.state.version == 3 {
            out.write_all(&self.state.compression.to_le_bytes())
                .map_err(io(&archive))?;
        }
        for record in &records {
            record
                .write(out)
                .map_err(ExtractError::binrw(&archive, "bad magic"))?;
        }
        for (file, packed) in self.files.iter().zip(&payloads) {
            let bytes = packed.as_deref().unwrap_or(&file.data);
            out.write_all(bytes).map_err(io(&archive))?;
        }

        if self.state.has_name_table {
            let encoding = strings::encoding_for(None);
            for file in &self.files {
                let name = strings::encode(&file.state.path, encoding);
                let len = u16::try_from(name.len()).map_err(|_| {
                    ExtractError::invalid(&*archive, format!("path too long: {}", file.state.path))
                })?;
                out.write_all(&len.to_le_bytes())
                    .and_then(|_| out.write_all(&name))
                    .map_err(io(&archive))?;
            }
        }
        out.flush().map_err(io(&archive))?;
        Ok(())
    }
}

fn to_u32(value: u64, archive: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ExtractError::invalid(archive, "entry exceeds the 4 GiB BA2 limit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsa::ba2_reader::{Ba2Archive, COMPRESSION_LZ4, RECORD_SENTINEL};
    use crate::streams::MemoryStreamFactory;
    use std::io::Cursor;
    use std::sync::Arc;

    fn state(version: u32, compression: u32, has_name_table: bool) -> Ba2State {
        Ba2State {
            version,
            header_magic: "BTDX".into(),
            kind: "GNRL".into(),
            has_name_table,
            unk1: 0,
            unk2: 0,
            compression,
        }
    }

    fn file(index: usize, path: &str, compressed: bool) -> Ba2FileState {
        Ba2FileState {
            path: path.into(),
            index,
            name_hash: 0x100 + index as u32,
            extension: "nif".into(),
            dir_hash: 0xABCD,
            flags: 0,
            align: RECORD_SENTINEL,
            compressed,
        }
    }

    fn build(state: Ba2State, files: Vec<(Ba2FileState, Vec<u8>)>) -> anyhow::Result<Vec<u8>> {
        let mut builder = Ba2Builder::new(state, "test.ba2")?;
        for (f, data) in files {
            builder.add_file(f, &mut Cursor::new(data))?;
        }
        let mut out = Cursor::new(Vec::new());
        builder.build(&mut out)?;
        Ok(out.into_inner())
    }

    #[test]
    fn test_build_then_read_mixed_compression() -> anyhow::Result<()> {
        let big: Vec<u8> = std::iter::repeat(b"fallout ".iter().copied()).take(500).flatten().collect();
        let bytes = build(
            state(1, 0, true),
            vec![
                (file(1, "meshes\\b.nif", false), b"stored".to_vec()),
                (file(0, "meshes\\a.nif", true), big.clone()),
            ],
        )?;

        let archive = Ba2Archive::open(Arc::new(MemoryStreamFactory::new("test.ba2", bytes)))?;
        let files = archive.files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path(), "meshes\\a.nif");
        assert!(files[0].compressed());
        assert!(!files[1].compressed());
        assert_eq!(files[0].state().align, RECORD_SENTINEL);

        let mut data = Vec::new();
        files[0].copy_data_to(&mut data)?;
        assert_eq!(data, big);
        Ok(())
    }

    #[test]
    fn test_starfield_lz4_without_name_table() -> anyhow::Result<()> {
        let payload = vec![7u8; 4096];
        let bytes = build(
            state(3, COMPRESSION_LZ4, false),
            vec![(file(0, "ignored", true), payload.clone())],
        )?;
        let archive = Ba2Archive::open(Arc::new(MemoryStreamFactory::new("sf.ba2", bytes)))?;
        let entry = &archive.files()[0];
        assert_eq!(entry.path(), "00000100.nif");

        let mut data = Vec::new();
        entry.copy_data_to(&mut data)?;
        assert_eq!(data, payload);
        Ok(())
    }

    #[test]
    fn test_rejects_texture_state() {
        let mut s = state(1, 0, true);
        s.kind = "DX10".into();
        assert!(Ba2Builder::new(s, "tex.ba2").is_err());
    }
}
