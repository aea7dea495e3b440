//! BSA/BA2 (Bethesda Archive) handling
//!
//! Read and write support for:
//! - TES3 BSA files (Morrowind)
//! - TES4 format BSA files (Oblivion, FO3, FNV, Skyrim LE/SE)
//! - FO4 format general BA2 files (Fallout 4, Fallout 76, Starfield)
//!
//! Every layout is exposed through [`BsaArchive`] for reading and
//! [`ArchiveBuilder`] for writing. The serializable [`ArchiveState`] and
//! [`FileState`] are what a rebuild needs to reproduce an archive.

pub mod ba2_reader;
pub mod ba2_writer;
pub mod compression;
pub mod hash;
pub mod reader;
pub mod strings;
pub mod tes3_reader;
pub mod writer;

pub use ba2_reader::{Ba2Archive, Ba2File};
pub use ba2_writer::Ba2Builder;
pub use reader::{ArchiveFlags, FileRecord, FolderRecord, Tes4Archive, VersionType};
pub use tes3_reader::{Tes3Archive, Tes3Builder, Tes3File};
pub use writer::BsaBuilder;

use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Seek, Write};
use std::sync::Arc;
use tracing::{debug, info};

use crate::archive::signature::{self, FileType};
use crate::error::{ExtractError, Result};
use crate::streams::StreamFactory;

/// Header state of a TES4-family BSA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsaState {
    pub magic: String,
    pub version: VersionType,
    pub archive_flags: u32,
    pub file_flags: u32,
}

/// Per-file state of a TES4-family BSA entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsaFileState {
    pub path: String,
    pub index: usize,
    pub flip_compression: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tes3State {
    pub version_number: u32,
    pub file_count: u32,
    pub data_offset: u64,
    pub hash_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tes3FileState {
    pub path: String,
    pub index: usize,
    pub size: u32,
    pub offset: u32,
    pub name_offset: u32,
    pub hash1: u32,
    pub hash2: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ba2State {
    pub version: u32,
    pub header_magic: String,
    pub kind: String,
    pub has_name_table: bool,
    pub unk1: u32,
    pub unk2: u32,
    pub compression: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ba2FileState {
    pub path: String,
    pub index: usize,
    pub name_hash: u32,
    pub extension: String,
    pub dir_hash: u32,
    pub flags: u32,
    pub align: u32,
    pub compressed: bool,
}

/// Archive-level state for any supported layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format")]
pub enum ArchiveState {
    Bsa(BsaState),
    Tes3(Tes3State),
    Ba2(Ba2State),
}

/// Entry-level state for any supported layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format")]
pub enum FileState {
    Bsa(BsaFileState),
    Tes3(Tes3FileState),
    Ba2(Ba2FileState),
}

impl FileState {
    pub fn path(&self) -> &str {
        match self {
            FileState::Bsa(s) => &s.path,
            FileState::Tes3(s) => &s.path,
            FileState::Ba2(s) => &s.path,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            FileState::Bsa(s) => s.index,
            FileState::Tes3(s) => s.index,
            FileState::Ba2(s) => s.index,
        }
    }
}

/// Open archive of any supported layout
pub enum BsaArchive {
    Tes4(Tes4Archive),
    Tes3(Tes3Archive),
    Ba2(Ba2Archive),
}

impl BsaArchive {
    /// Open with an already sniffed signature.
    pub fn open(source: Arc<dyn StreamFactory>, file_type: FileType) -> Result<Self> {
        match file_type {
            FileType::Bsa => Ok(BsaArchive::Tes4(Tes4Archive::open(source)?)),
            FileType::Tes3 => Ok(BsaArchive::Tes3(Tes3Archive::open(source)?)),
            FileType::Ba2 => Ok(BsaArchive::Ba2(Ba2Archive::open(source)?)),
            other => Err(ExtractError::invalid(
                source.name(),
                format!("{} is not a Bethesda archive", other),
            )),
        }
    }

    /// Sniff the signature and open.
    pub fn open_detect(source: Arc<dyn StreamFactory>) -> Result<Self> {
        let name = source.name().to_string();
        let mut stream = source.open().map_err(ExtractError::io(&name))?;
        let file_type = signature::sniff(&mut stream)
            .map_err(ExtractError::io(&name))?
            .ok_or_else(|| ExtractError::invalid(&*name, format!("Invalid file format {}", name)))?;
        debug!("Detected {} as {}", name, file_type);
        Self::open(source, file_type)
    }

    pub fn name(&self) -> &str {
        match self {
            BsaArchive::Tes4(a) => a.name(),
            BsaArchive::Tes3(a) => a.name(),
            BsaArchive::Ba2(a) => a.name(),
        }
    }

    pub fn state(&self) -> ArchiveState {
        match self {
            BsaArchive::Tes4(a) => ArchiveState::Bsa(a.state()),
            BsaArchive::Tes3(a) => ArchiveState::Tes3(a.state()),
            BsaArchive::Ba2(a) => ArchiveState::Ba2(a.state()),
        }
    }

    /// All entries. TES4 folder records are loaded here on first call.
    pub fn files(&self) -> Result<Vec<ArchiveFile>> {
        Ok(match self {
            BsaArchive::Tes4(a) => a.files()?.cloned().map(ArchiveFile::Tes4).collect(),
            BsaArchive::Tes3(a) => a.files().iter().cloned().map(ArchiveFile::Tes3).collect(),
            BsaArchive::Ba2(a) => a.files().iter().cloned().map(ArchiveFile::Ba2).collect(),
        })
    }
}

/// Entry of any supported layout
#[derive(Debug, Clone)]
pub enum ArchiveFile {
    Tes4(FileRecord),
    Tes3(Tes3File),
    Ba2(Ba2File),
}

impl ArchiveFile {
    pub fn path(&self) -> &str {
        match self {
            ArchiveFile::Tes4(f) => f.path(),
            ArchiveFile::Tes3(f) => f.path(),
            ArchiveFile::Ba2(f) => f.path(),
        }
    }

    /// Decompressed size
    pub fn size(&self) -> Result<u64> {
        match self {
            ArchiveFile::Tes4(f) => f.size(),
            ArchiveFile::Tes3(f) => Ok(f.size()),
            ArchiveFile::Ba2(f) => Ok(f.size()),
        }
    }

    pub fn state(&self) -> FileState {
        match self {
            ArchiveFile::Tes4(f) => FileState::Bsa(f.state()),
            ArchiveFile::Tes3(f) => FileState::Tes3(f.state()),
            ArchiveFile::Ba2(f) => FileState::Ba2(f.state()),
        }
    }

    /// Decompress the entry into `output`, returning the bytes written.
    pub fn copy_data_to(&self, output: &mut dyn Write) -> Result<u64> {
        match self {
            ArchiveFile::Tes4(f) => f.copy_data_to(output),
            ArchiveFile::Tes3(f) => f.copy_data_to(output),
            ArchiveFile::Ba2(f) => f.copy_data_to(output),
        }
    }
}

/// Builder for any supported layout
pub enum ArchiveBuilder {
    Bsa(BsaBuilder),
    Tes3(Tes3Builder),
    Ba2(Ba2Builder),
}

impl ArchiveBuilder {
    /// Start a new archive from a header state. `archive` only names the
    /// output in errors and logs.
    pub fn create(state: &ArchiveState, archive: impl Into<String>) -> Result<Self> {
        Ok(match state {
            ArchiveState::Bsa(s) => ArchiveBuilder::Bsa(BsaBuilder::new(s.clone(), archive)?),
            ArchiveState::Tes3(s) => ArchiveBuilder::Tes3(Tes3Builder::new(s.clone(), archive)),
            ArchiveState::Ba2(s) => ArchiveBuilder::Ba2(Ba2Builder::new(s.clone(), archive)?),
        })
    }

    pub fn add_file(&mut self, state: FileState, src: &mut dyn Read) -> Result<()> {
        match (self, state) {
            (ArchiveBuilder::Bsa(b), FileState::Bsa(s)) => b.add_file(s, src),
            (ArchiveBuilder::Tes3(b), FileState::Tes3(s)) => b.add_file(s, src),
            (ArchiveBuilder::Ba2(b), FileState::Ba2(s)) => b.add_file(s, src),
            (_, s) => Err(ExtractError::invalid(
                s.path(),
                "file state does not match the archive layout",
            )),
        }
    }

    pub fn build<W: Write + Seek>(self, out: &mut W) -> Result<()> {
        match self {
            ArchiveBuilder::Bsa(b) => b.build(out),
            ArchiveBuilder::Tes3(b) => b.build(out),
            ArchiveBuilder::Ba2(b) => b.build(out),
        }
    }
}

/// Rebuild `archive` from its own state and entries into `out`.
pub fn rebuild<W: Write + Seek>(archive: &BsaArchive, out: &mut W) -> Result<usize> {
    let mut builder = ArchiveBuilder::create(&archive.state(), archive.name())?;
    let files = archive.files()?;
    for file in &files {
        let mut data = Vec::new();
        file.copy_data_to(&mut data)?;
        builder.add_file(file.state(), &mut Cursor::new(data))?;
    }
    builder.build(out)?;
    info!("Rebuilt {} ({} files)", archive.name(), files.len());
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::MemoryStreamFactory;
    use std::collections::{BTreeMap, HashSet};

    type Snapshot = (ArchiveState, BTreeMap<String, (u64, Vec<u8>)>);

    fn snapshot(archive: &BsaArchive) -> anyhow::Result<Snapshot> {
        let mut files = BTreeMap::new();
        for file in archive.files()? {
            let mut data = Vec::new();
            file.copy_data_to(&mut data)?;
            files.insert(file.path().to_string(), (file.size()?, data));
        }
        Ok((archive.state(), files))
    }

    fn build(state: ArchiveState, files: Vec<(FileState, Vec<u8>)>) -> anyhow::Result<Vec<u8>> {
        let mut builder = ArchiveBuilder::create(&state, "source")?;
        for (s, data) in files {
            builder.add_file(s, &mut Cursor::new(data))?;
        }
        let mut out = Cursor::new(Vec::new());
        builder.build(&mut out)?;
        Ok(out.into_inner())
    }

    /// Read, rebuild, read again, and compare everything that must survive.
    fn assert_round_trip(bytes: Vec<u8>, expected_files: usize) -> anyhow::Result<()> {
        let first = BsaArchive::open_detect(Arc::new(MemoryStreamFactory::new("a.bsa", bytes)))?;
        let mut out = Cursor::new(Vec::new());
        assert_eq!(rebuild(&first, &mut out)?, expected_files);

        let second =
            BsaArchive::open_detect(Arc::new(MemoryStreamFactory::new("a.bsa", out.into_inner())))?;
        let (state_a, files_a) = snapshot(&first)?;
        let (state_b, files_b) = snapshot(&second)?;

        assert_eq!(
            serde_json::to_string(&state_a)?,
            serde_json::to_string(&state_b)?
        );
        assert_eq!(files_a.len(), expected_files);
        assert_eq!(files_a, files_b);

        let lowered: HashSet<String> = files_b.keys().map(|k| k.to_lowercase()).collect();
        assert_eq!(lowered.len(), files_b.len());
        Ok(())
    }

    fn sample_payloads() -> Vec<(&'static str, Vec<u8>)> {
        vec![
            ("meshes\\armor\\iron\\cuirass.nif", b"nif data ".repeat(300)),
            ("meshes\\armor\\iron\\gauntlets.nif", b"more nif".repeat(50)),
            ("textures\\armor\\iron\\cuirass.dds", vec![0x44; 2048]),
            ("scripts\\quest.pex", b"pex".to_vec()),
            ("readme.txt", b"top level".to_vec()),
        ]
    }

    fn tes4_round_trip(version: VersionType, flags: u32) -> anyhow::Result<()> {
        let state = ArchiveState::Bsa(BsaState {
            magic: "BSA\0".into(),
            version,
            archive_flags: flags,
            file_flags: reader::file_flags::MESHES | reader::file_flags::TEXTURES,
        });
        let files = sample_payloads()
            .into_iter()
            .enumerate()
            .map(|(index, (path, data))| {
                let s = FileState::Bsa(BsaFileState {
                    path: path.into(),
                    index,
                    flip_compression: index % 2 == 1,
                });
                (s, data)
            })
            .collect();
        let bytes = build(state, files)?;
        assert_round_trip(bytes, 5)
    }

    const NAMED: u32 = ArchiveFlags::HAS_FOLDER_NAMES | ArchiveFlags::HAS_FILE_NAMES;

    #[test]
    fn test_round_trip_tes4() -> anyhow::Result<()> {
        tes4_round_trip(VersionType::Tes4, NAMED | ArchiveFlags::COMPRESSED)
    }

    #[test]
    fn test_round_trip_fo3_with_blobs() -> anyhow::Result<()> {
        tes4_round_trip(
            VersionType::Fo3,
            NAMED | ArchiveFlags::COMPRESSED | ArchiveFlags::HAS_FILE_NAME_BLOBS,
        )
    }

    #[test]
    fn test_round_trip_sse() -> anyhow::Result<()> {
        tes4_round_trip(VersionType::Sse, NAMED)
    }

    #[test]
    fn test_round_trip_tes3() -> anyhow::Result<()> {
        let state = ArchiveState::Tes3(Tes3State {
            version_number: tes3_reader::TES3_VERSION,
            file_count: 0,
            data_offset: 0,
            hash_offset: 0,
        });
        let files = sample_payloads()
            .into_iter()
            .enumerate()
            .map(|(index, (path, data))| {
                let s = FileState::Tes3(Tes3FileState {
                    path: path.into(),
                    index,
                    size: 0,
                    offset: 0,
                    name_offset: 0,
                    hash1: index as u32,
                    hash2: !(index as u32),
                });
                (s, data)
            })
            .collect();
        let bytes = build(state, files)?;
        assert_round_trip(bytes, 5)
    }

    #[test]
    fn test_round_trip_ba2() -> anyhow::Result<()> {
        let state = ArchiveState::Ba2(Ba2State {
            version: 1,
            header_magic: "BTDX".into(),
            kind: "GNRL".into(),
            has_name_table: true,
            unk1: 0,
            unk2: 0,
            compression: 0,
        });
        let files = sample_payloads()
            .into_iter()
            .enumerate()
            .map(|(index, (path, data))| {
                let s = FileState::Ba2(Ba2FileState {
                    path: path.into(),
                    index,
                    name_hash: index as u32,
                    extension: "bin".into(),
                    dir_hash: 0,
                    flags: 0,
                    align: ba2_reader::RECORD_SENTINEL,
                    compressed: index % 2 == 0,
                });
                (s, data)
            })
            .collect();
        let bytes = build(state, files)?;
        assert_round_trip(bytes, 5)
    }

    #[test]
    fn test_state_serializes_with_format_tag() -> anyhow::Result<()> {
        let state = ArchiveState::Bsa(BsaState {
            magic: "BSA\0".into(),
            version: VersionType::Sse,
            archive_flags: 3,
            file_flags: 1,
        });
        let json = serde_json::to_value(&state)?;
        assert_eq!(json["format"], "Bsa");
        assert_eq!(json["version"], "Sse");
        let back: ArchiveState = serde_json::from_value(json)?;
        assert_eq!(back, state);
        Ok(())
    }

    #[test]
    fn test_mismatched_file_state_is_rejected() -> anyhow::Result<()> {
        let state = ArchiveState::Tes3(Tes3State {
            version_number: tes3_reader::TES3_VERSION,
            file_count: 0,
            data_offset: 0,
            hash_offset: 0,
        });
        let mut builder = ArchiveBuilder::create(&state, "m.bsa")?;
        let wrong = FileState::Bsa(BsaFileState {
            path: "a.txt".into(),
            index: 0,
            flip_compression: false,
        });
        assert!(builder.add_file(wrong, &mut Cursor::new(Vec::new())).is_err());
        Ok(())
    }

    #[test]
    fn test_open_rejects_general_archives() {
        let source = Arc::new(MemoryStreamFactory::new("x.zip", b"PK\x03\x04rest".to_vec()));
        assert!(BsaArchive::open_detect(source).is_err());
    }
}
