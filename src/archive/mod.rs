//! Multi-format extraction.
//!
//! [`FileExtractor::gathering_extract`] sniffs a source, picks a
//! [`Strategy`] and feeds every wanted entry through a caller-supplied
//! projection. Bethesda archives and BTAR streams are read in-process,
//! OMOD packages are reconstructed into a scratch directory, and
//! ZIP/RAR/7z go through the 7z binary.

pub mod btar;
pub mod entry;
pub mod omod;
pub mod sevenzip;
pub mod signature;
pub mod sparse;

pub use entry::{BsaEntry, BtarEntry, ExtractedEntry, NativeFileEntry};
pub use sevenzip::{Archiver, SevenZipBinary};
pub use signature::FileType;

use once_cell::sync::OnceCell;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::bsa::BsaArchive;
use crate::config::ExtractorConfig;
use crate::error::{ExtractError, Result};
use crate::limiter::{CancellationToken, Progress, ResourceLimiter};
use crate::paths::{has_extension, is_safe_file_name, join_windows_path, normalize_for_lookup, to_archive_path};
use crate::streams::{NativeFileStreamFactory, StreamFactory};
use btar::BtarReader;
use omod::OmodArchive;

/// How a sniffed source gets extracted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// BSA/BA2/TES3, read in-process
    Bsa(FileType),
    /// ZIP/RAR/7z through the external archiver
    SevenZip,
    /// OMOD package (a zip named `*.omod`)
    Omod,
    Btar,
}

impl Strategy {
    /// Pick a strategy from the sniffed signature and the source name.
    pub fn select(file_type: Option<FileType>, name: &str) -> Result<Self> {
        let invalid = || ExtractError::invalid(name, format!("Invalid file format {}", name));
        let file_type = file_type.ok_or_else(invalid)?;
        if file_type.is_general_archive() {
            if has_extension(name, "omod") {
                return Ok(Strategy::Omod);
            }
            return Ok(Strategy::SevenZip);
        }
        match file_type {
            FileType::Btar => Ok(Strategy::Btar),
            t @ (FileType::Bsa | FileType::Ba2) => Ok(Strategy::Bsa(t)),
            FileType::Tes3 if has_extension(name, "bsa") => Ok(Strategy::Bsa(FileType::Tes3)),
            _ => Err(invalid()),
        }
    }
}

/// Borrowed callbacks shared by every strategy
struct Gather<'a, T> {
    archive: &'a str,
    should_extract: &'a (dyn Fn(&str) -> bool + Sync),
    project: &'a (dyn Fn(&str, &dyn ExtractedEntry) -> anyhow::Result<T> + Sync),
    token: &'a CancellationToken,
    progress: Option<&'a Progress>,
}

impl<T> Gather<'_, T> {
    fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(ExtractError::Cancelled {
                archive: self.archive.to_string(),
            });
        }
        Ok(())
    }

    fn project(&self, path: &str, entry: &dyn ExtractedEntry) -> Result<T> {
        (self.project)(path, entry).map_err(|source| ExtractError::Projection {
            archive: self.archive.to_string(),
            entry: path.to_string(),
            source,
        })
    }

    fn report(&self, bytes: u64) {
        if let Some(progress) = self.progress {
            progress.add(bytes);
        }
    }
}

/// Extraction entry point. Cheap to share across threads; every call takes
/// its own limiter slot.
pub struct FileExtractor {
    config: ExtractorConfig,
    limiter: ResourceLimiter,
    archiver: OnceCell<Arc<dyn Archiver>>,
}

impl FileExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let limiter = ResourceLimiter::new(config.max_jobs, config.max_throughput);
        Self {
            config,
            limiter,
            archiver: OnceCell::new(),
        }
    }

    /// Use `archiver` instead of locating the 7z binary.
    pub fn with_archiver(self, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            archiver: OnceCell::with_value(archiver),
            ..self
        }
    }

    /// Share a limiter with other extractors.
    pub fn with_limiter(self, limiter: ResourceLimiter) -> Self {
        Self { limiter, ..self }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn limiter(&self) -> &ResourceLimiter {
        &self.limiter
    }

    fn archiver(&self, archive: &str) -> Result<&Arc<dyn Archiver>> {
        self.archiver
            .get_or_try_init(|| {
                let binary = SevenZipBinary::locate(self.config.sevenzip_path.as_deref())?;
                debug!("Using 7z at {}", binary.path().display());
                Ok::<Arc<dyn Archiver>, io::Error>(Arc::new(binary))
            })
            .map_err(ExtractError::io(archive))
    }

    /// Extract `source`, projecting each entry that passes `should_extract`.
    ///
    /// Keys are archive-relative paths with `\` separators. When `only_files`
    /// is given the result must hold exactly that many entries.
    pub fn gathering_extract<T, F, P>(
        &self,
        source: Arc<dyn StreamFactory>,
        should_extract: F,
        project: P,
        only_files: Option<&HashSet<String>>,
        token: &CancellationToken,
        progress: Option<&Progress>,
    ) -> Result<HashMap<String, T>>
    where
        T: Send,
        F: Fn(&str) -> bool + Sync,
        P: Fn(&str, &dyn ExtractedEntry) -> anyhow::Result<T> + Sync,
    {
        let name = source.name().to_string();
        let file_type = {
            let mut stream = source.open().map_err(ExtractError::io(&name))?;
            signature::sniff(&mut stream).map_err(ExtractError::io(&name))?
        };
        let strategy = Strategy::select(file_type, &name)?;
        info!("Extracting {}", name);
        debug!("{} sniffed as {:?}, using {:?}", name, file_type, strategy);

        let gather = Gather {
            archive: &name,
            should_extract: &should_extract,
            project: &project,
            token,
            progress,
        };
        let results = match strategy {
            Strategy::Bsa(file_type) => self.extract_bsa(&source, file_type, &gather)?,
            Strategy::Btar => self.extract_btar(&source, &gather)?,
            Strategy::Omod => self.extract_omod(&source, &gather)?,
            Strategy::SevenZip => self.extract_sevenzip(&source, only_files, &gather)?,
        };

        if let Some(only) = only_files {
            if only.len() != results.len() {
                return Err(ExtractError::SanityCheck {
                    archive: name,
                    found: results.len(),
                    expected: only.len(),
                });
            }
        }

        info!("Finished extracting {}", name);
        Ok(results)
    }

    /// Extract every entry (or just `only_files`) under `dest`. Returns the
    /// number of files written.
    pub fn extract_all(
        &self,
        source: &Path,
        dest: &Path,
        only_files: Option<&HashSet<String>>,
        token: &CancellationToken,
        progress: Option<&Progress>,
    ) -> Result<usize> {
        let wanted: Option<HashSet<String>> =
            only_files.map(|files| files.iter().map(|f| normalize_for_lookup(f)).collect());
        let source: Arc<dyn StreamFactory> = Arc::new(NativeFileStreamFactory::new(source));

        let results = self.gathering_extract(
            source,
            |path| {
                wanted
                    .as_ref()
                    .is_none_or(|w| w.contains(&normalize_for_lookup(path)))
            },
            |path, entry| {
                if !is_safe_file_name(path) {
                    anyhow::bail!("refusing to write {} outside the destination", path);
                }
                entry.move_to(&join_windows_path(dest, path))?;
                Ok(())
            },
            only_files,
            token,
            progress,
        )?;
        Ok(results.len())
    }

    fn extract_bsa<T>(
        &self,
        source: &Arc<dyn StreamFactory>,
        file_type: FileType,
        gather: &Gather<'_, T>,
    ) -> Result<HashMap<String, T>> {
        let job = self.limiter.begin(
            gather.archive,
            format!("Extracting {}", gather.archive),
            0,
            gather.token,
        )?;
        let archive = BsaArchive::open(source.clone(), file_type)?;
        let modified = source.last_modified();

        let mut results = HashMap::new();
        for file in archive.files()? {
            gather.check_cancelled()?;
            let path = file.path().to_string();
            if !(gather.should_extract)(&path) {
                continue;
            }
            let size = file.size()?;
            let entry = BsaEntry::new(file, modified);
            let value = gather.project(&path, &entry)?;
            job.report(size);
            gather.report(size);
            results.insert(path, value);
        }
        Ok(results)
    }

    fn extract_btar<T>(
        &self,
        source: &Arc<dyn StreamFactory>,
        gather: &Gather<'_, T>,
    ) -> Result<HashMap<String, T>> {
        let job = self.limiter.begin(
            gather.archive,
            format!("Extracting {}", gather.archive),
            0,
            gather.token,
        )?;
        let mut reader = BtarReader::open(source)?;

        let mut results = HashMap::new();
        while let Some(record) = reader.next_record()? {
            gather.check_cancelled()?;
            if !(gather.should_extract)(&record.name) {
                continue;
            }
            let entry = BtarEntry::new(source.clone(), record.name.clone(), record.offset, record.len);
            let value = gather.project(&record.name, &entry)?;
            job.report(record.len);
            gather.report(record.len);
            results.insert(record.name, value);
        }
        Ok(results)
    }

    fn scratch_dir(&self, archive: &str) -> Result<tempfile::TempDir> {
        let root = self.config.temp_root();
        fs::create_dir_all(&root).map_err(ExtractError::io(archive))?;
        tempfile::Builder::new()
            .prefix("modarc-")
            .tempdir_in(&root)
            .map_err(ExtractError::io(archive))
    }

    /// Path of the source on disk, spooling it into `scratch` if needed.
    fn local_path(
        &self,
        source: &Arc<dyn StreamFactory>,
        scratch: &Path,
        gather: &Gather<'_, impl Sized>,
    ) -> Result<PathBuf> {
        if let Some(path) = source.path() {
            return Ok(path.to_path_buf());
        }
        let spool = scratch.join(format!("spool-{}", sanitize_spool_name(gather.archive)));
        let mut input = source.open().map_err(ExtractError::io(gather.archive))?;
        let mut output = File::create(&spool).map_err(ExtractError::io(gather.archive))?;
        let copied = io::copy(&mut input, &mut output).map_err(ExtractError::io(gather.archive))?;
        debug!("Spooled {} ({} bytes) to {}", gather.archive, copied, spool.display());
        Ok(spool)
    }

    fn extract_omod<T>(
        &self,
        source: &Arc<dyn StreamFactory>,
        gather: &Gather<'_, T>,
    ) -> Result<HashMap<String, T>> {
        let job = self.limiter.begin(
            gather.archive,
            format!("Extracting {}", gather.archive),
            0,
            gather.token,
        )?;
        let scratch = self.scratch_dir(gather.archive)?;
        let path = self.local_path(source, scratch.path(), gather)?;
        let dest = scratch.path().join("out");
        let size = fs::metadata(&path).map_err(ExtractError::io(gather.archive))?.len();

        let mut omod = OmodArchive::open(gather.archive, &path)?;
        let mut files = omod.extract_data(&dest)?;
        files.extend(omod.extract_plugins(&dest)?);
        job.report(size);
        gather.report(size);

        let mut results = HashMap::new();
        for file in files {
            gather.check_cancelled()?;
            if !(gather.should_extract)(&file.name) {
                continue;
            }
            let entry = NativeFileEntry::new(file.name.clone(), &file.path);
            let value = gather.project(&file.name, &entry)?;
            results.insert(file.name, value);
        }
        Ok(results)
    }

    fn extract_sevenzip<T: Send>(
        &self,
        source: &Arc<dyn StreamFactory>,
        only_files: Option<&HashSet<String>>,
        gather: &Gather<'_, T>,
    ) -> Result<HashMap<String, T>> {
        let archive = gather.archive;
        let archiver = self.archiver(archive)?.clone();
        let scratch = self.scratch_dir(archive)?;
        let dest = scratch.path().join("out");
        fs::create_dir_all(&dest).map_err(ExtractError::io(archive))?;

        {
            let job = self
                .limiter
                .begin(archive, format!("Extracting {}", archive), 0, gather.token)?;
            let path = self.local_path(source, scratch.path(), gather)?;
            sevenzip::extract_to(
                archiver.as_ref(),
                archive,
                &path,
                &dest,
                only_files,
                scratch.path(),
                &mut |delta| {
                    job.report(delta);
                    gather.report(delta);
                },
            )?;
        }
        gather.check_cancelled()?;

        let files: Vec<(String, PathBuf)> = WalkDir::new(&dest)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let relative = e.path().strip_prefix(&dest).ok()?;
                let path = to_archive_path(&relative.to_string_lossy());
                Some((path, e.into_path()))
            })
            .collect();
        debug!("7z produced {} files for {}", files.len(), archive);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallelism.max(1))
            .build()
            .map_err(|e| ExtractError::Io {
                archive: archive.to_string(),
                source: io::Error::other(e),
            })?;

        let projected: Vec<Result<Option<(String, T)>>> = pool.install(|| {
            files
                .into_par_iter()
                .map(|(path, file)| {
                    gather.check_cancelled()?;
                    if !(gather.should_extract)(&path) {
                        return Ok(None);
                    }
                    let entry = NativeFileEntry::new(path.clone(), &file);
                    let value = gather.project(&path, &entry)?;
                    match fs::remove_file(&file) {
                        Err(e) if e.kind() != io::ErrorKind::NotFound => {
                            warn!("Failed to remove {}: {}", file.display(), e);
                        }
                        _ => {}
                    }
                    Ok(Some((path, value)))
                })
                .collect()
        });

        let mut results = HashMap::new();
        for item in projected {
            if let Some((path, value)) = item? {
                results.insert(path, value);
            }
        }
        Ok(results)
    }
}

/// Source name with path-hostile characters replaced; keeps the extension.
fn sanitize_spool_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::omod::tests::build_omod;
    use crate::archive::sevenzip::tests::FakeArchiver;
    use crate::bsa::{
        reader, ArchiveBuilder, ArchiveFlags, ArchiveState, BsaFileState, BsaState, FileState,
        VersionType,
    };
    use crate::hash::hash_reader;
    use crate::streams::MemoryStreamFactory;
    use std::io::{Cursor, Read};

    fn extractor(temp: &Path) -> FileExtractor {
        FileExtractor::new(ExtractorConfig {
            temp_dir: Some(temp.to_path_buf()),
            max_jobs: 2,
            parallelism: 2,
            ..Default::default()
        })
    }

    fn read_all(_: &str, entry: &dyn ExtractedEntry) -> anyhow::Result<Vec<u8>> {
        let mut data = Vec::new();
        entry.open()?.read_to_end(&mut data)?;
        Ok(data)
    }

    fn sample_bsa() -> anyhow::Result<Vec<u8>> {
        let state = ArchiveState::Bsa(BsaState {
            magic: "BSA\0".into(),
            version: VersionType::Sse,
            archive_flags: ArchiveFlags::HAS_FOLDER_NAMES
                | ArchiveFlags::HAS_FILE_NAMES
                | ArchiveFlags::COMPRESSED,
            file_flags: reader::file_flags::MESHES,
        });
        let mut builder = ArchiveBuilder::create(&state, "sample.bsa")?;
        let files: [(&str, &[u8]); 3] = [
            ("meshes\\a.nif", b"first mesh"),
            ("meshes\\b.nif", b"second mesh"),
            ("scripts\\c.pex", b"script"),
        ];
        for (index, (path, data)) in files.iter().enumerate() {
            let s = FileState::Bsa(BsaFileState {
                path: path.to_string(),
                index,
                flip_compression: false,
            });
            builder.add_file(s, &mut Cursor::new(data.to_vec()))?;
        }
        let mut out = Cursor::new(Vec::new());
        builder.build(&mut out)?;
        Ok(out.into_inner())
    }

    fn sample_btar() -> Vec<u8> {
        let mut writer = btar::BtarWriter::new(Vec::new()).unwrap();
        writer.add("a/one.txt", 3, &mut Cursor::new(b"one".to_vec())).unwrap();
        writer.add("two.txt", 3, &mut Cursor::new(b"two".to_vec())).unwrap();
        writer.add("skip.bin", 4, &mut Cursor::new(b"skip".to_vec())).unwrap();
        writer.finish().unwrap()
    }

    fn memory(name: &str, bytes: Vec<u8>) -> Arc<dyn StreamFactory> {
        Arc::new(MemoryStreamFactory::new(name, bytes))
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(Strategy::select(Some(FileType::Zip), "a.zip").unwrap(), Strategy::SevenZip);
        assert_eq!(Strategy::select(Some(FileType::Zip), "A.OMOD").unwrap(), Strategy::Omod);
        assert_eq!(Strategy::select(Some(FileType::RarNew), "x.rar").unwrap(), Strategy::SevenZip);
        assert_eq!(Strategy::select(Some(FileType::Btar), "x.btar").unwrap(), Strategy::Btar);
        assert_eq!(
            Strategy::select(Some(FileType::Ba2), "x.ba2").unwrap(),
            Strategy::Bsa(FileType::Ba2)
        );
        assert_eq!(
            Strategy::select(Some(FileType::Tes3), "Morrowind.bsa").unwrap(),
            Strategy::Bsa(FileType::Tes3)
        );

        let err = Strategy::select(Some(FileType::Tes3), "data.bin").unwrap_err();
        assert_eq!(err.to_string(), "data.bin: Invalid file format data.bin");
        assert!(Strategy::select(None, "notes.txt").is_err());
    }

    #[test]
    fn test_gather_bsa_with_filter() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let results = extractor(dir.path()).gathering_extract(
            memory("sample.bsa", sample_bsa()?),
            |path| path.starts_with("meshes"),
            read_all,
            None,
            &CancellationToken::new(),
            None,
        )?;

        assert_eq!(results.len(), 2);
        assert_eq!(results["meshes\\a.nif"], b"first mesh");
        assert_eq!(results["meshes\\b.nif"], b"second mesh");
        Ok(())
    }

    #[test]
    fn test_entries_carry_source_time_and_share_limiter() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let stamp = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        let source: Arc<dyn StreamFactory> =
            Arc::new(MemoryStreamFactory::new("sample.bsa", sample_bsa()?).with_modified(stamp));

        let limiter = ResourceLimiter::new(1, 0);
        let extractor = extractor(dir.path()).with_limiter(limiter.clone());
        let results = extractor.gathering_extract(
            source,
            |_| true,
            |_, entry| {
                assert_eq!(limiter.running_jobs(), 1);
                Ok(entry.last_modified())
            },
            None,
            &CancellationToken::new(),
            None,
        )?;

        assert!(results.values().all(|t| *t == stamp));
        assert_eq!(limiter.running_jobs(), 0);
        assert_eq!(limiter.total_bytes(), 27);
        Ok(())
    }

    #[test]
    fn test_gather_btar_counts_progress() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let progress = Progress::new();
        let results = extractor(dir.path()).gathering_extract(
            memory("pack.btar", sample_btar()),
            |path| !path.ends_with(".bin"),
            |_, entry| Ok(hash_reader(&mut entry.open()?)?.size),
            None,
            &CancellationToken::new(),
            Some(&progress),
        )?;

        assert_eq!(results.len(), 2);
        assert_eq!(results["a\\one.txt"], 3);
        assert_eq!(progress.done(), 6);
        Ok(())
    }

    #[test]
    fn test_sanity_check() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let only: HashSet<String> = ["two.txt".to_string(), "missing.txt".to_string()].into();
        let err = extractor(dir.path())
            .gathering_extract(
                memory("pack.btar", sample_btar()),
                |path| only.contains(path),
                read_all,
                Some(&only),
                &CancellationToken::new(),
                None,
            )
            .unwrap_err();

        match err {
            ExtractError::SanityCheck { found, expected, .. } => assert_eq!((found, expected), (1, 2)),
            other => panic!("expected sanity check failure, got {other}"),
        }
        Ok(())
    }

    #[test]
    fn test_cancellation_returns_no_partial_map() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let token = CancellationToken::new();
        let seen = std::sync::atomic::AtomicUsize::new(0);
        let result = extractor(dir.path()).gathering_extract(
            memory("pack.btar", sample_btar()),
            |_| true,
            |_, _| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                token.cancel();
                Ok(())
            },
            None,
            &token,
            None,
        );

        assert!(matches!(result, Err(ExtractError::Cancelled { .. })));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_projection_error_names_entry() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let err = extractor(dir.path())
            .gathering_extract(
                memory("pack.btar", sample_btar()),
                |_| true,
                |path, _| -> anyhow::Result<()> { anyhow::bail!("cannot handle {}", path) },
                None,
                &CancellationToken::new(),
                None,
            )
            .unwrap_err();

        match err {
            ExtractError::Projection { archive, entry, .. } => {
                assert_eq!(archive, "pack.btar");
                assert_eq!(entry, "a\\one.txt");
            }
            other => panic!("expected projection error, got {other}"),
        }
        Ok(())
    }

    #[test]
    fn test_gather_sevenzip_spools_and_cleans_up() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fake = Arc::new(FakeArchiver::new(&[
            ("docs\\readme.txt", b"readme"),
            ("data\\plugin.esp", b"TES4"),
        ]));
        let extractor = extractor(dir.path()).with_archiver(fake.clone());

        // A zip signature with no path on disk forces a spool
        let mut bytes = b"PK\x03\x04".to_vec();
        bytes.extend_from_slice(&[0u8; 96]);
        let progress = Progress::new();
        let results = extractor.gathering_extract(
            memory("mod.zip", bytes),
            |path| path.ends_with(".esp"),
            read_all,
            None,
            &CancellationToken::new(),
            Some(&progress),
        )?;

        assert_eq!(results.len(), 1);
        assert_eq!(results["data\\plugin.esp"], b"TES4");
        assert_eq!(progress.done(), 100);
        assert_eq!(fake.calls.lock().unwrap().len(), 1);
        assert_eq!(extractor.limiter().running_jobs(), 0);

        // Scratch directories are gone once the call returns
        let leftovers = fs::read_dir(dir.path())?.count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn test_sevenzip_failure_releases_slot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut fake = FakeArchiver::new(&[]);
        fake.exit_code = 2;
        let extractor = extractor(dir.path()).with_archiver(Arc::new(fake));

        let result = extractor.gathering_extract(
            memory("bad.7z", vec![0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0, 4]),
            |_| true,
            read_all,
            None,
            &CancellationToken::new(),
            None,
        );
        assert!(matches!(result, Err(ExtractError::ArchiverFailed { code: 2, .. })));
        assert_eq!(extractor.limiter().running_jobs(), 0);
        Ok(())
    }

    #[test]
    fn test_gather_omod() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("Mod.omod");
        build_omod(
            &path,
            1,
            &[("meshes\\x.nif", b"mesh"), ("textures\\x.dds", b"tex")],
            &[("x.esp", b"TES4")],
        )?;

        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch)?;
        let limiter = ResourceLimiter::new(2, 0);
        let progress = Progress::new();
        let results = extractor(&scratch).with_limiter(limiter.clone()).gathering_extract(
            Arc::new(NativeFileStreamFactory::new(&path)),
            |_| true,
            read_all,
            None,
            &CancellationToken::new(),
            Some(&progress),
        )?;

        assert_eq!(results.len(), 3);
        assert_eq!(results["textures\\x.dds"], b"tex");
        assert_eq!(results["x.esp"], b"TES4");
        let size = fs::metadata(&path)?.len();
        assert_eq!(progress.done(), size);
        assert_eq!(limiter.total_bytes(), size);
        Ok(())
    }

    #[test]
    fn test_extract_all_writes_tree() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("sample.bsa");
        fs::write(&source, sample_bsa()?)?;
        let out = dir.path().join("out");

        let only: HashSet<String> = ["meshes/b.nif".to_string()].into();
        let written = extractor(dir.path()).extract_all(
            &source,
            &out,
            Some(&only),
            &CancellationToken::new(),
            None,
        )?;
        assert_eq!(written, 1);
        assert_eq!(fs::read(out.join("meshes/b.nif"))?, b"second mesh");
        assert!(!out.join("meshes/a.nif").exists());

        let written = extractor(dir.path()).extract_all(&source, &out, None, &CancellationToken::new(), None)?;
        assert_eq!(written, 3);
        assert_eq!(fs::read(out.join("scripts/c.pex"))?, b"script");
        Ok(())
    }

    #[test]
    fn test_extract_all_matches_names_ignoring_case_and_separators() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("sample.bsa");
        fs::write(&source, sample_bsa()?)?;
        let out = dir.path().join("out");

        let only: HashSet<String> = ["/MESHES\\B.NIF".to_string(), "Scripts/C.pex".to_string()].into();
        let written = extractor(dir.path()).extract_all(
            &source,
            &out,
            Some(&only),
            &CancellationToken::new(),
            None,
        )?;
        assert_eq!(written, 2);
        assert_eq!(fs::read(out.join("meshes/b.nif"))?, b"second mesh");
        assert_eq!(fs::read(out.join("scripts/c.pex"))?, b"script");
        assert!(!out.join("meshes/a.nif").exists());
        Ok(())
    }
}
