//! TES4-family BSA reading (Oblivion, Fallout 3/NV, Skyrim LE/SE)
//!
//! The 0x24-byte header is parsed on open. Folder and file records are
//! only read the first time someone asks for them, then kept for the life
//! of the archive. Entry payloads are never cached here: every
//! [`FileRecord::copy_data_to`] opens its own stream from the factory.

use binrw::prelude::*;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::debug;

use super::compression::{self, Codec};
use super::strings;
use super::{BsaFileState, BsaState};
use crate::error::{ExtractError, Result};
use crate::streams::{copy_exact, read_block, ReadSeek, StreamFactory};

pub const HEADER_LEN: u32 = 0x24;

/// Bit in a file record's size field that inverts the archive default.
pub const FLIP_COMPRESSION: u32 = 1 << 30;

const FILE_RECORD_LEN: u64 = 16;

/// Header version field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionType {
    /// Oblivion
    Tes4,
    /// Fallout 3, New Vegas, Skyrim LE
    Fo3,
    /// Skyrim Special Edition
    Sse,
}

impl VersionType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x67 => Some(VersionType::Tes4),
            0x68 => Some(VersionType::Fo3),
            0x69 => Some(VersionType::Sse),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            VersionType::Tes4 => 0x67,
            VersionType::Fo3 => 0x68,
            VersionType::Sse => 0x69,
        }
    }

    /// Codec for entries that end up compressed.
    pub fn codec(self) -> Codec {
        match self {
            VersionType::Sse => Codec::Lz4Frame,
            VersionType::Tes4 | VersionType::Fo3 => Codec::Zlib,
        }
    }

    pub fn folder_record_len(self) -> u64 {
        match self {
            VersionType::Sse => 24,
            VersionType::Tes4 | VersionType::Fo3 => 16,
        }
    }
}

/// Archive flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveFlags(pub u32);

impl ArchiveFlags {
    pub const HAS_FOLDER_NAMES: u32 = 0x1;
    pub const HAS_FILE_NAMES: u32 = 0x2;
    pub const COMPRESSED: u32 = 0x4;
    pub const HAS_FILE_NAME_BLOBS: u32 = 0x100;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// File flag bits (content types stored in the archive)
pub mod file_flags {
    pub const MESHES: u32 = 0x1;
    pub const TEXTURES: u32 = 0x2;
    pub const MENUS: u32 = 0x4;
    pub const SOUNDS: u32 = 0x8;
    pub const VOICES: u32 = 0x10;
    pub const SHADERS: u32 = 0x20;
    pub const TREES: u32 = 0x40;
    pub const FONTS: u32 = 0x80;
    pub const MISC: u32 = 0x100;
}

/// On-disk header after the magic
#[binrw]
#[brw(little, magic = b"BSA\0")]
#[derive(Debug, Clone)]
pub(crate) struct RawHeader {
    pub version: u32,
    pub folder_record_offset: u32,
    pub archive_flags: u32,
    pub folder_count: u32,
    pub file_count: u32,
    pub total_folder_name_length: u32,
    pub total_file_name_length: u32,
    pub file_flags: u32,
}

/// Parsed header
#[derive(Debug, Clone)]
pub struct BsaHeader {
    pub version: VersionType,
    pub folder_record_offset: u32,
    pub archive_flags: ArchiveFlags,
    pub folder_count: u32,
    pub file_count: u32,
    pub total_folder_name_length: u32,
    pub total_file_name_length: u32,
    pub file_flags: u32,
}

impl BsaHeader {
    pub fn has_folder_names(&self) -> bool {
        self.archive_flags.contains(ArchiveFlags::HAS_FOLDER_NAMES)
    }

    pub fn has_file_names(&self) -> bool {
        self.archive_flags.contains(ArchiveFlags::HAS_FILE_NAMES)
    }

    pub fn compressed_by_default(&self) -> bool {
        self.archive_flags.contains(ArchiveFlags::COMPRESSED)
    }

    /// Name blobs only exist in FO3 and SSE archives with bit 9 set.
    pub fn has_name_blobs(&self) -> bool {
        has_name_blobs(self.version, self.archive_flags)
    }
}

pub(crate) fn has_name_blobs(version: VersionType, flags: ArchiveFlags) -> bool {
    matches!(version, VersionType::Fo3 | VersionType::Sse)
        && flags.contains(ArchiveFlags::HAS_FILE_NAME_BLOBS)
}

struct ArchiveContext {
    source: Arc<dyn StreamFactory>,
    name: String,
    header: BsaHeader,
    stream_len: u64,
}

impl ArchiveContext {
    fn open(&self) -> Result<Box<dyn ReadSeek>> {
        self.source.open().map_err(ExtractError::io(&self.name))
    }
}

/// Folder record with its files
#[derive(Debug, Clone)]
pub struct FolderRecord {
    pub hash: u64,
    pub file_count: u32,
    pub offset: u64,
    pub name: Option<String>,
    pub files: Vec<FileRecord>,
}

/// Sizes read from a file's data offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSizes {
    /// Bytes of payload stored on disk
    pub on_disk: u64,
    /// Decompressed size (or on-disk size for stored entries)
    pub size: u64,
}

/// One file record
#[derive(Clone)]
pub struct FileRecord {
    ctx: Arc<ArchiveContext>,
    hash: u64,
    raw_size: u32,
    offset: u32,
    index: usize,
    overall_index: usize,
    path: String,
    sizes: Arc<OnceCell<FileSizes>>,
}

impl std::fmt::Debug for FileRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRecord")
            .field("path", &self.path)
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("raw_size", &self.raw_size)
            .field("offset", &self.offset)
            .finish()
    }
}

impl FileRecord {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Position within its folder
    pub fn index(&self) -> usize {
        self.index
    }

    /// Position within the whole archive
    pub fn overall_index(&self) -> usize {
        self.overall_index
    }

    pub fn flip_compression(&self) -> bool {
        self.raw_size & FLIP_COMPRESSION != 0
    }

    pub fn compressed(&self) -> bool {
        self.flip_compression() != self.ctx.header.compressed_by_default()
    }

    pub fn state(&self) -> BsaFileState {
        BsaFileState {
            path: self.path.clone(),
            index: self.index,
            flip_compression: self.flip_compression(),
        }
    }

    /// Sizes, read from the data offset on first use.
    pub fn sizes(&self) -> Result<FileSizes> {
        self.sizes
            .get_or_try_init(|| {
                let mut stream = self.ctx.open()?;
                self.seek_to_data(&mut stream)?;
                self.read_sizes(&mut stream)
            })
            .copied()
    }

    /// Decompressed size
    pub fn size(&self) -> Result<u64> {
        Ok(self.sizes()?.size)
    }

    /// Stream the decompressed entry into `output`. Exactly `size()` bytes
    /// are written or the call fails.
    pub fn copy_data_to(&self, output: &mut dyn Write) -> Result<u64> {
        let mut stream = self.ctx.open()?;
        self.seek_to_data(&mut stream)?;
        let sizes = self.read_sizes(&mut stream)?;
        let _ = self.sizes.set(sizes);

        let codec = if self.compressed() {
            self.ctx.header.version.codec()
        } else {
            Codec::Stored
        };
        let mut decoder = compression::decoder(codec, stream, sizes.on_disk, sizes.size)
            .map_err(ExtractError::io(&self.ctx.name))?;
        copy_exact(&mut decoder, output, sizes.size, &self.ctx.name, Some(&self.path))
    }

    fn seek_to_data(&self, stream: &mut Box<dyn ReadSeek>) -> Result<()> {
        stream
            .seek(SeekFrom::Start(self.offset as u64))
            .map_err(ExtractError::io(&self.ctx.name))?;
        Ok(())
    }

    fn read_sizes(&self, stream: &mut Box<dyn ReadSeek>) -> Result<FileSizes> {
        let name = &self.ctx.name;
        let compressed = self.compressed();
        let mut size = (self.raw_size & !FLIP_COMPRESSION) as u64;
        if compressed {
            size = size.checked_sub(4).ok_or_else(|| {
                ExtractError::invalid(name, format!("{}: size field too small", self.path))
            })?;
        }

        let mut blob_overhead = 0u64;
        if self.ctx.header.has_name_blobs() {
            let len = read_block(stream, 1, name, Some(&self.path))?[0];
            stream
                .seek(SeekFrom::Current(len as i64))
                .map_err(ExtractError::io(name))?;
            blob_overhead = len as u64 + 1;
        }

        let original = if compressed {
            let raw = read_block(stream, 4, name, Some(&self.path))?;
            u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
        } else {
            0
        };

        let on_disk = size.checked_sub(blob_overhead).ok_or_else(|| {
            ExtractError::invalid(name, format!("{}: name blob larger than entry", self.path))
        })?;

        Ok(FileSizes {
            on_disk,
            size: if compressed { original } else { on_disk },
        })
    }
}

/// Open TES4-family archive
pub struct Tes4Archive {
    ctx: Arc<ArchiveContext>,
    folders: OnceCell<Vec<FolderRecord>>,
}

impl Tes4Archive {
    /// Parse the header. Records are loaded lazily.
    pub fn open(source: Arc<dyn StreamFactory>) -> Result<Self> {
        let name = source.name().to_string();
        let mut stream = source.open().map_err(ExtractError::io(&name))?;
        let stream_len = stream
            .seek(SeekFrom::End(0))
            .and_then(|len| stream.seek(SeekFrom::Start(0)).map(|_| len))
            .map_err(ExtractError::io(&name))?;

        let raw = RawHeader::read(&mut stream)
            .map_err(ExtractError::binrw(&name, "Archive is not a BSA"))?;
        let version = VersionType::from_u32(raw.version).ok_or_else(|| {
            ExtractError::invalid(&name, format!("Unknown BSA version 0x{:x}", raw.version))
        })?;

        let header = BsaHeader {
            version,
            folder_record_offset: raw.folder_record_offset,
            archive_flags: ArchiveFlags(raw.archive_flags),
            folder_count: raw.folder_count,
            file_count: raw.file_count,
            total_folder_name_length: raw.total_folder_name_length,
            total_file_name_length: raw.total_file_name_length,
            file_flags: raw.file_flags,
        };

        debug!(
            "Opened BSA {} (version {:?}, {} folders, {} files, flags 0x{:x})",
            name, header.version, header.folder_count, header.file_count, header.archive_flags.0
        );

        Ok(Self {
            ctx: Arc::new(ArchiveContext {
                source,
                name,
                header,
                stream_len,
            }),
            folders: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn header(&self) -> &BsaHeader {
        &self.ctx.header
    }

    pub fn state(&self) -> BsaState {
        let header = &self.ctx.header;
        BsaState {
            magic: "BSA\0".to_string(),
            version: header.version,
            archive_flags: header.archive_flags.0,
            file_flags: header.file_flags,
        }
    }

    pub fn folders(&self) -> Result<&[FolderRecord]> {
        self.folders
            .get_or_try_init(|| self.load_folders())
            .map(Vec::as_slice)
    }

    /// All files in folder order
    pub fn files(&self) -> Result<impl Iterator<Item = &FileRecord>> {
        Ok(self.folders()?.iter().flat_map(|f| f.files.iter()))
    }

    fn load_folders(&self) -> Result<Vec<FolderRecord>> {
        let ctx = &self.ctx;
        let header = &ctx.header;
        let name = ctx.name.as_str();
        let encoding = strings::encoding_for(Some(header.version));

        let mut stream = ctx.open()?;
        stream
            .seek(SeekFrom::Start(header.folder_record_offset as u64))
            .map_err(ExtractError::io(name))?;

        let record_len = header.version.folder_record_len();
        let block = read_block(
            &mut stream,
            record_len * header.folder_count as u64,
            name,
            None,
        )?;

        let mut raw_folders = Vec::with_capacity(header.folder_count as usize);
        for record in block.chunks_exact(record_len as usize) {
            let hash = u64::from_le_bytes(le_array(&record[0..8]));
            let file_count = u32::from_le_bytes(le_array(&record[8..12]));
            let offset = match header.version {
                VersionType::Sse => u64::from_le_bytes(le_array(&record[16..24])),
                _ => u32::from_le_bytes(le_array(&record[12..16])) as u64,
            };
            raw_folders.push((hash, file_count, offset));
        }

        // File record blocks follow the folder records in folder order
        let mut folder_names = Vec::with_capacity(raw_folders.len());
        let mut file_blocks = Vec::with_capacity(raw_folders.len());
        for &(_, file_count, _) in &raw_folders {
            let folder_name = if header.has_folder_names() {
                Some(
                    strings::read_bzstring(&mut stream, encoding).map_err(|e| {
                        truncated_or_io(name, e)
                    })?,
                )
            } else {
                None
            };
            folder_names.push(folder_name);
            file_blocks.push(read_block(
                &mut stream,
                FILE_RECORD_LEN * file_count as u64,
                name,
                None,
            )?);
        }

        let file_names = if header.has_file_names() {
            let block = read_block(&mut stream, header.total_file_name_length as u64, name, None)?;
            strings::split_null_terminated(&block, encoding)
        } else {
            Vec::new()
        };

        let mut folders = Vec::with_capacity(raw_folders.len());
        let mut overall_index = 0usize;
        for (((hash, file_count, offset), folder_name), block) in
            raw_folders.into_iter().zip(folder_names).zip(file_blocks)
        {
            let mut files = Vec::with_capacity(file_count as usize);
            for (index, record) in block.chunks_exact(FILE_RECORD_LEN as usize).enumerate() {
                let file_hash = u64::from_le_bytes(le_array(&record[0..8]));
                let raw_size = u32::from_le_bytes(le_array(&record[8..12]));
                let data_offset = u32::from_le_bytes(le_array(&record[12..16]));

                let file_name = file_names
                    .get(overall_index)
                    .cloned()
                    .unwrap_or_else(|| format!("{:016x}", file_hash));
                let path = match folder_name.as_deref() {
                    Some(folder) if !folder.is_empty() => format!("{}\\{}", folder, file_name),
                    _ => file_name,
                };

                let end = data_offset as u64 + (raw_size & !FLIP_COMPRESSION) as u64;
                if end > ctx.stream_len {
                    return Err(ExtractError::invalid(
                        name,
                        format!("{} points past the end of the archive", path),
                    ));
                }

                files.push(FileRecord {
                    ctx: ctx.clone(),
                    hash: file_hash,
                    raw_size,
                    offset: data_offset,
                    index,
                    overall_index,
                    path,
                    sizes: Arc::new(OnceCell::new()),
                });
                overall_index += 1;
            }

            folders.push(FolderRecord {
                hash,
                file_count,
                offset,
                name: folder_name,
                files,
            });
        }

        debug!("Loaded {} folders, {} files from {}", folders.len(), overall_index, name);
        Ok(folders)
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn truncated_or_io(archive: &str, err: std::io::Error) -> ExtractError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ExtractError::invalid(archive, "folder name block is truncated")
    } else {
        ExtractError::Io {
            archive: archive.to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsa::writer::BsaBuilder;
    use crate::streams::MemoryStreamFactory;
    use std::io::Cursor;

    fn build(state: &BsaState, files: &[(&str, bool, &[u8])]) -> anyhow::Result<Vec<u8>> {
        let mut builder = BsaBuilder::new(state.clone(), "test.bsa")?;
        for (index, (path, flip, data)) in files.iter().enumerate() {
            builder.add_file(
                BsaFileState {
                    path: path.to_string(),
                    index,
                    flip_compression: *flip,
                },
                &mut Cursor::new(data.to_vec()),
            )?;
        }
        let mut out = Cursor::new(Vec::new());
        builder.build(&mut out)?;
        Ok(out.into_inner())
    }

    fn open(bytes: Vec<u8>) -> anyhow::Result<Tes4Archive> {
        Ok(Tes4Archive::open(Arc::new(MemoryStreamFactory::new("test.bsa", bytes)))?)
    }

    fn state(version: VersionType, flags: u32) -> BsaState {
        BsaState {
            magic: "BSA\0".into(),
            version,
            archive_flags: flags,
            file_flags: file_flags::MESHES,
        }
    }

    const NAMED: u32 = ArchiveFlags::HAS_FOLDER_NAMES | ArchiveFlags::HAS_FILE_NAMES;

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = vec![0u8; HEADER_LEN as usize];
        bytes[..4].copy_from_slice(b"BSB\0");
        let err = Tes4Archive::open(Arc::new(MemoryStreamFactory::new("x.bsa", bytes)))
            .err()
            .map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("x.bsa: Archive is not a BSA"));
    }

    #[test]
    fn test_rejects_truncated_header() {
        let err = Tes4Archive::open(Arc::new(MemoryStreamFactory::new("x.bsa", b"BSA\0\x68".to_vec())));
        assert!(matches!(err, Err(ExtractError::InvalidFormat { .. })));
    }

    #[test]
    fn test_flip_inverts_default_compression() -> anyhow::Result<()> {
        let payload: &[u8] = b"compressible compressible compressible compressible";

        // Compressed by default: flipped entry is stored
        let bytes = build(
            &state(VersionType::Fo3, NAMED | ArchiveFlags::COMPRESSED),
            &[("meshes\\a.nif", false, payload), ("meshes\\b.nif", true, payload)],
        )?;
        let archive = open(bytes)?;
        for file in archive.files()? {
            let expect_compressed = !file.flip_compression();
            assert_eq!(file.compressed(), expect_compressed, "{}", file.path());
            let mut out = Vec::new();
            file.copy_data_to(&mut out)?;
            assert_eq!(out, payload);
        }

        // Stored by default: flipped entry is compressed
        let bytes = build(
            &state(VersionType::Tes4, NAMED),
            &[("meshes\\a.nif", false, payload), ("meshes\\b.nif", true, payload)],
        )?;
        let archive = open(bytes)?;
        for file in archive.files()? {
            assert_eq!(file.compressed(), file.flip_compression(), "{}", file.path());
            assert_eq!(file.size()?, payload.len() as u64);
        }
        Ok(())
    }

    #[test]
    fn test_name_blobs_and_sse_lz4() -> anyhow::Result<()> {
        let flags = NAMED | ArchiveFlags::COMPRESSED | ArchiveFlags::HAS_FILE_NAME_BLOBS;
        let bytes = build(
            &state(VersionType::Sse, flags),
            &[
                ("textures\\armor\\iron.dds", false, &[7u8; 300]),
                ("root.txt", true, b"plain"),
            ],
        )?;
        let archive = open(bytes)?;
        assert!(archive.header().has_name_blobs());

        let files: Vec<_> = archive.files()?.cloned().collect();
        assert_eq!(files.len(), 2);
        let iron = files
            .iter()
            .find(|f| f.path() == "textures\\armor\\iron.dds")
            .ok_or_else(|| anyhow::anyhow!("missing iron.dds"))?;
        assert!(iron.compressed());
        let mut out = Vec::new();
        iron.copy_data_to(&mut out)?;
        assert_eq!(out, vec![7u8; 300]);

        let root = files
            .iter()
            .find(|f| f.path() == "root.txt")
            .ok_or_else(|| anyhow::anyhow!("missing root.txt"))?;
        assert!(!root.compressed());
        assert_eq!(root.size()?, 5);
        Ok(())
    }

    #[test]
    fn test_name_blobs_ignored_for_tes4() {
        let flags = ArchiveFlags(ArchiveFlags::HAS_FILE_NAME_BLOBS);
        assert!(!has_name_blobs(VersionType::Tes4, flags));
        assert!(has_name_blobs(VersionType::Fo3, flags));
        assert!(has_name_blobs(VersionType::Sse, flags));
    }

    #[test]
    fn test_offset_past_end_is_fatal() -> anyhow::Result<()> {
        let mut bytes = build(&state(VersionType::Fo3, NAMED), &[("a\\b.txt", false, b"hello")])?;
        bytes.truncate(bytes.len() - 2);
        let archive = open(bytes)?;
        assert!(matches!(archive.folders(), Err(ExtractError::InvalidFormat { .. })));
        Ok(())
    }

    #[test]
    fn test_records_load_once() -> anyhow::Result<()> {
        let bytes = build(&state(VersionType::Fo3, NAMED), &[("a\\b.txt", false, b"hello")])?;
        let archive = open(bytes)?;
        let first = archive.folders()?.as_ptr();
        let second = archive.folders()?.as_ptr();
        assert_eq!(first, second);
        Ok(())
    }
}
