//! TES4-family BSA creation
//!
//! Files are grouped into folders by parent path, folders are ordered by
//! folder hash and files by file hash, which is the order the reader hands
//! them back in. Each file keeps its own compression-flip bit so a rebuilt
//! archive stores every entry the same way the source did.

use binrw::BinWrite;
use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use tracing::info;

use super::compression;
use super::hash::{file_hash, folder_hash};
use super::reader::{has_name_blobs, ArchiveFlags, RawHeader, VersionType, FLIP_COMPRESSION, HEADER_LEN};
use super::strings;
use super::{BsaFileState, BsaState};
use crate::error::{ExtractError, Result};
use crate::paths::to_archive_path;

struct PendingFile {
    state: BsaFileState,
    path: String,
    name: String,
    hash: u64,
    /// Payload as it will sit on disk (already compressed if needed)
    data: Vec<u8>,
    original_len: u64,
    compressed: bool,
}

struct FolderBuild {
    hash: u64,
    name_bz: Vec<u8>,
    files: Vec<PendingFile>,
}

/// Builder for TES4/FO3/SSE archives
pub struct BsaBuilder {
    archive: String,
    version: VersionType,
    flags: ArchiveFlags,
    file_flags: u32,
    files: Vec<PendingFile>,
}

impl BsaBuilder {
    /// Start an archive with the given header state. `archive` names the
    /// output in errors and logs.
    pub fn new(state: BsaState, archive: impl Into<String>) -> Result<Self> {
        let archive = archive.into();
        if state.magic != "BSA\0" {
            return Err(ExtractError::invalid(
                &archive,
                format!("cannot build a BSA with magic {:?}", state.magic),
            ));
        }
        Ok(Self {
            archive,
            version: state.version,
            flags: ArchiveFlags(state.archive_flags),
            file_flags: state.file_flags,
            files: Vec::new(),
        })
    }

    fn compressed_by_default(&self) -> bool {
        self.flags.contains(ArchiveFlags::COMPRESSED)
    }

    /// Read an entry and compress it if its flip bit says so.
    pub fn add_file(&mut self, state: BsaFileState, src: &mut dyn Read) -> Result<()> {
        let path = to_archive_path(&state.path);
        let mut raw = Vec::new();
        src.read_to_end(&mut raw)
            .map_err(ExtractError::io(&self.archive))?;

        let compressed = state.flip_compression != self.compressed_by_default();
        let data = if compressed {
            compression::compress(self.version.codec(), &raw).map_err(ExtractError::io(&self.archive))?
        } else {
            raw.clone()
        };

        let name = crate::paths::file_name(&path).to_string();
        self.files.push(PendingFile {
            hash: file_hash(&name),
            name,
            path,
            original_len: raw.len() as u64,
            data,
            compressed,
            state,
        });
        Ok(())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn group_folders(&mut self) -> Result<Vec<FolderBuild>> {
        let encoding = strings::encoding_for(Some(self.version));
        let mut groups: HashMap<String, FolderBuild> = HashMap::new();

        for file in self.files.drain(..) {
            let folder = crate::paths::parent_path(&file.path).unwrap_or("").to_string();
            let key = folder.to_lowercase();
            if !groups.contains_key(&key) {
                let mut name_bz = Vec::new();
                strings::write_bzstring(&mut name_bz, &strings::encode(&folder, encoding))
                    .map_err(ExtractError::io(&self.archive))?;
                groups.insert(
                    key.clone(),
                    FolderBuild {
                        hash: folder_hash(&folder),
                        name_bz,
                        files: Vec::new(),
                    },
                );
            }
            if let Some(group) = groups.get_mut(&key) {
                group.files.push(file);
            }
        }

        let mut folders: Vec<FolderBuild> = groups.into_values().collect();
        folders.sort_by_key(|f| f.hash);
        for folder in &mut folders {
            folder.files.sort_by_key(|f| f.hash);
            if let Some(pair) = folder.files.windows(2).find(|w| w[0].hash == w[1].hash) {
                return Err(ExtractError::DuplicateEntry {
                    archive: self.archive.clone(),
                    entry: pair[1].path.clone(),
                });
            }
        }
        Ok(folders)
    }

    /// Write the archive.
    pub fn build<W: Write + Seek>(mut self, out: &mut W) -> Result<()> {
        let archive = self.archive.clone();
        let version = self.version;
        let encoding = strings::encoding_for(Some(version));
        let has_folder_names = self.flags.contains(ArchiveFlags::HAS_FOLDER_NAMES);
        let has_file_names = self.flags.contains(ArchiveFlags::HAS_FILE_NAMES);
        let name_blobs = has_name_blobs(version, self.flags);
        let file_count = self.files.len();

        info!(
            "Building BSA: {} ({} files, version {:?}, flags 0x{:x})",
            archive, file_count, version, self.flags.0
        );

        let folders = self.group_folders()?;

        let file_names: Vec<Vec<u8>> = folders
            .iter()
            .flat_map(|f| f.files.iter())
            .map(|f| {
                let mut bytes = strings::encode(&f.name, encoding);
                bytes.push(0);
                bytes
            })
            .collect();
        let name_blob_bytes: Vec<Vec<u8>> = if name_blobs {
            folders
                .iter()
                .flat_map(|f| f.files.iter())
                .map(|f| {
                    let mut blob = Vec::new();
                    strings::write_bstring(&mut blob, &strings::encode(&f.path, encoding))
                        .map(|_| blob)
                        .map_err(ExtractError::io(&archive))
                })
                .collect::<Result<_>>()?
        } else {
            Vec::new()
        };

        let total_folder_name_length: u64 =
            folders.iter().map(|f| f.name_bz.len() as u64 - 1).sum();
        let total_file_name_length: u64 = file_names.iter().map(|n| n.len() as u64).sum();

        let record_len = version.folder_record_len();
        let records_end = HEADER_LEN as u64 + record_len * folders.len() as u64;
        let block_len = |f: &FolderBuild| {
            let name = if has_folder_names { f.name_bz.len() as u64 } else { 0 };
            name + 16 * f.files.len() as u64
        };
        let blocks_len: u64 = folders.iter().map(block_len).sum();
        let mut data_offset =
            records_end + blocks_len + if has_file_names { total_file_name_length } else { 0 };

        // Header
        RawHeader {
            version: version.as_u32(),
            folder_record_offset: HEADER_LEN,
            archive_flags: self.flags.0,
            folder_count: to_u32(folders.len() as u64, &archive)?,
            file_count: to_u32(file_count as u64, &archive)?,
            total_folder_name_length: to_u32(total_folder_name_length, &archive)?,
            total_file_name_length: to_u32(total_file_name_length, &archive)?,
            file_flags: self.file_flags,
        }
        .write(out)
        .map_err(ExtractError::binrw(&archive, "bad magic"))?;

        // Folder records. Offsets point at the file record block plus the
        // total file name length, as the games expect.
        let mut preceding_blocks = 0u64;
        for folder in &folders {
            let offset = records_end + total_file_name_length + preceding_blocks;
            preceding_blocks += block_len(folder);

            let mut record = Vec::with_capacity(record_len as usize);
            record.extend_from_slice(&folder.hash.to_le_bytes());
            record.extend_from_slice(&(folder.files.len() as u32).to_le_bytes());
            match version {
                VersionType::Sse => {
                    record.extend_from_slice(&0u32.to_le_bytes());
                    record.extend_from_slice(&offset.to_le_bytes());
                }
                VersionType::Tes4 | VersionType::Fo3 => {
                    record.extend_from_slice(&to_u32(offset, &archive)?.to_le_bytes());
                }
            }
            out.write_all(&record).map_err(ExtractError::io(&archive))?;
        }

        // File record blocks, with data offsets computed up front
        let mut overall = 0usize;
        for folder in &folders {
            if has_folder_names {
                out.write_all(&folder.name_bz).map_err(ExtractError::io(&archive))?;
            }
            for file in &folder.files {
                let blob_len = name_blob_bytes.get(overall).map_or(0, |b| b.len() as u64);
                let stored_len =
                    file.data.len() as u64 + blob_len + if file.compressed { 4 } else { 0 };
                if stored_len >= FLIP_COMPRESSION as u64 {
                    return Err(ExtractError::invalid(
                        &archive,
                        format!("{} is too large for a BSA entry", file.path),
                    ));
                }
                let mut size_field = stored_len as u32;
                if file.state.flip_compression {
                    size_field |= FLIP_COMPRESSION;
                }

                let mut record = [0u8; 16];
                record[0..8].copy_from_slice(&file.hash.to_le_bytes());
                record[8..12].copy_from_slice(&size_field.to_le_bytes());
                record[12..16].copy_from_slice(&to_u32(data_offset, &archive)?.to_le_bytes());
                out.write_all(&record).map_err(ExtractError::io(&archive))?;

                data_offset += stored_len;
                overall += 1;
            }
        }

        if has_file_names {
            for name in &file_names {
                out.write_all(name).map_err(ExtractError::io(&archive))?;
            }
        }

        // Data, in the same order as the records
        let mut overall = 0usize;
        for folder in &folders {
            for file in &folder.files {
                if let Some(blob) = name_blob_bytes.get(overall) {
                    out.write_all(blob).map_err(ExtractError::io(&archive))?;
                }
                if file.compressed {
                    let original = to_u32(file.original_len, &archive)?;
                    out.write_all(&original.to_le_bytes())
                        .map_err(ExtractError::io(&archive))?;
                }
                out.write_all(&file.data).map_err(ExtractError::io(&archive))?;
                overall += 1;
            }
        }

        out.flush().map_err(ExtractError::io(&archive))?;
        info!("Built BSA {} ({} folders, {} files)", archive, folders.len(), file_count);
        Ok(())
    }
}

fn to_u32(value: u64, archive: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ExtractError::invalid(archive, "archive exceeds the 4 GiB BSA limit"))
}
