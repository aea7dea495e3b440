//! 7z binary integration for archive extraction.
//!
//! ZIP, RAR and 7z sources are all handed to the 7zz binary, which extracts
//! into a scratch directory. The process sits behind the [`Archiver`] trait
//! so the dispatcher can be driven by a fake in tests.
//!
//! # 7z Commands Reference
//!
//! - Extract all to directory: `7zz x -bsp1 -y -o{dir} archive.zip -mmt=off`
//!   - `-bsp1`: Progress on stdout (`" 42% 3 - name"`)
//!   - `-y`: Yes to all prompts
//!   - `-mmt=off`: Single threaded; the limiter does the scheduling
//! - Extract a subset: add `@listfile` after the archive path
//!
//! 7z's pattern matching is not very fuzzy, so every requested path goes
//! into the list file in four spellings (see [`list_file_variants`]).
//!
//! The 7z binary is looked up in the config, `bin/7zz` next to the
//! executable, and finally `PATH`.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, trace};

use crate::error::{ExtractError, Result};

/// Runs an external archiver
pub trait Archiver: Send + Sync {
    /// Run with `args`, feeding each stdout line to `on_line`. Returns the
    /// exit code.
    fn run(&self, args: &[OsString], on_line: &mut dyn FnMut(&str)) -> io::Result<i32>;
}

/// The real 7zz/7z binary
#[derive(Debug, Clone)]
pub struct SevenZipBinary {
    path: PathBuf,
}

impl SevenZipBinary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Locate the binary, preferring `configured` when given.
    pub fn locate(configured: Option<&Path>) -> io::Result<Self> {
        get_7z_path(configured).map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Archiver for SevenZipBinary {
    fn run(&self, args: &[OsString], on_line: &mut dyn FnMut(&str)) -> io::Result<i32> {
        trace!("{} {:?}", self.path.display(), args);
        let mut child = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("7z stdout was not captured"))?;

        // 7z redraws its progress line with backspaces and carriage returns
        let mut pending = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stdout.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            for &byte in &chunk[..n] {
                if matches!(byte, b'\n' | b'\r' | 0x08) {
                    if !pending.is_empty() {
                        on_line(&String::from_utf8_lossy(&pending));
                        pending.clear();
                    }
                } else {
                    pending.push(byte);
                }
            }
        }
        if !pending.is_empty() {
            on_line(&String::from_utf8_lossy(&pending));
        }

        let status = child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Get the path to the 7z binary.
///
/// Looks for the binary in the following locations:
/// 1. `configured` (config file or `MODARC_7Z`)
/// 2. `bin/7zz`, `bin/7z.exe` or `7zz` relative to the executable
/// 3. `bin/7zz` relative to the current directory
/// 4. System PATH (`7zz` or `7z`)
pub fn get_7z_path(configured: Option<&Path>) -> io::Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("configured 7z binary not found: {}", path.display()),
        ));
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            for candidate in ["bin/7zz", "bin/7z.exe", "7zz"] {
                let bin_path = exe_dir.join(candidate);
                if bin_path.exists() {
                    return Ok(bin_path);
                }
            }
        }
    }

    let cwd_path = PathBuf::from("bin/7zz");
    if cwd_path.exists() {
        return Ok(cwd_path);
    }

    for name in ["7zz", "7z"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "7z binary not found. Please install p7zip or place 7zz in the bin/ directory.",
    ))
}

/// The four spellings of `path` written to a 7z list file.
pub fn list_file_variants(path: &str) -> [String; 4] {
    let forward = path.replace('\\', "/");
    [
        format!("\"{}\"", path),
        format!("\"\\{}\"", path),
        format!("\"{}\"", forward),
        format!("\"/{}\"", forward),
    ]
}

/// Command line for extracting `source` into `dest`.
pub fn build_args(source: &Path, dest: &Path, list_file: Option<&Path>) -> Vec<OsString> {
    let mut out_dir = OsString::from("-o");
    out_dir.push(dest);

    let mut args: Vec<OsString> = vec!["x".into(), "-bsp1".into(), "-y".into(), out_dir];
    args.push(source.as_os_str().to_owned());
    if let Some(list) = list_file {
        let mut arg = OsString::from("@");
        arg.push(list);
        args.push(arg);
    }
    args.push("-mmt=off".into());
    args
}

/// Percentage from a `-bsp1` progress line (`" 42% ..."`).
pub fn parse_progress_line(line: &str) -> Option<u8> {
    if line.len() <= 4 || line.as_bytes()[3] != b'%' {
        return None;
    }
    line.get(..3)?.trim().parse::<u8>().ok()
}

/// Turns percentages into byte deltas of the source size.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: u64,
    position: u64,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self { total, position: 0 }
    }

    /// Bytes newly accounted for at `percent`.
    pub fn advance(&mut self, percent: u8) -> u64 {
        let position = self.total.saturating_mul(percent.min(100) as u64) / 100;
        let delta = position.saturating_sub(self.position);
        self.position = self.position.max(position);
        delta
    }
}

/// Extract `source` into `dest`, optionally restricted to `only_files`.
/// `on_progress` receives each byte delta parsed from the archiver output.
pub fn extract_to(
    archiver: &dyn Archiver,
    archive: &str,
    source: &Path,
    dest: &Path,
    only_files: Option<&HashSet<String>>,
    temp_root: &Path,
    on_progress: &mut dyn FnMut(u64),
) -> Result<()> {
    let total = fs::metadata(source)
        .map(|m| m.len())
        .map_err(ExtractError::io(archive))?;

    let list_file = match only_files {
        Some(files) => {
            let mut list = tempfile::Builder::new()
                .prefix("modarc-")
                .suffix(".lst")
                .tempfile_in(temp_root)
                .map_err(ExtractError::io(archive))?;
            for file in files {
                for variant in list_file_variants(file) {
                    writeln!(list, "{}", variant).map_err(ExtractError::io(archive))?;
                }
            }
            list.flush().map_err(ExtractError::io(archive))?;
            Some(list)
        }
        None => None,
    };

    let args = build_args(source, dest, list_file.as_ref().map(|f| f.path()));
    info!("Extracting {} with 7z", archive);

    let mut tracker = ProgressTracker::new(total);
    let code = archiver
        .run(&args, &mut |line| {
            if let Some(percent) = parse_progress_line(line) {
                let delta = tracker.advance(percent);
                if delta > 0 {
                    on_progress(delta);
                }
            }
        })
        .map_err(ExtractError::io(archive))?;

    if code != 0 {
        return Err(ExtractError::ArchiverFailed {
            archive: archive.to_string(),
            code,
        });
    }
    debug!("7z finished {} ({} bytes)", archive, total);
    Ok(())
}
