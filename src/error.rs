//! Typed extraction failures.
//!
//! Every variant names the archive it came from and, where one is known,
//! the entry inside it. Nothing here is retried; callers decide.

use std::io;

/// Result alias used throughout the codec and dispatcher.
pub type Result<T, E = ExtractError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("{archive}: {reason}")]
    InvalidFormat { archive: String, reason: String },

    #[error("{archive}: unsupported compression {kind}")]
    UnsupportedCompression { archive: String, kind: String },

    #[error("Sanity check error extracting {archive} - {found} results, expected {expected}")]
    SanityCheck {
        archive: String,
        found: usize,
        expected: usize,
    },

    #[error("{archive}: Compressed data file stream didn't contain enough information to fill all files (stopped at {entry})")]
    OmodUnderrun { archive: String, entry: String },

    #[error("{archive}: archiver exited with code {code}")]
    ArchiverFailed { archive: String, code: i32 },

    #[error("{archive}{}: expected {expected} bytes, got {actual}", entry_suffix(.entry))]
    Truncated {
        archive: String,
        entry: Option<String>,
        expected: u64,
        actual: u64,
    },

    #[error("{archive}: duplicate entry {entry}")]
    DuplicateEntry { archive: String, entry: String },

    #[error("{archive}: extraction cancelled")]
    Cancelled { archive: String },

    #[error("{archive}: projection failed for {entry}: {source:#}")]
    Projection {
        archive: String,
        entry: String,
        source: anyhow::Error,
    },

    #[error("{archive}: {source}")]
    Io {
        archive: String,
        #[source]
        source: io::Error,
    },
}

fn entry_suffix(entry: &Option<String>) -> String {
    match entry {
        Some(e) => format!(" ({})", e),
        None => String::new(),
    }
}

impl ExtractError {
    pub fn invalid(archive: impl Into<String>, reason: impl Into<String>) -> Self {
        ExtractError::InvalidFormat {
            archive: archive.into(),
            reason: reason.into(),
        }
    }

    /// Closure for `map_err` that tags an IO error with its archive.
    pub fn io(archive: &str) -> impl FnOnce(io::Error) -> ExtractError + '_ {
        move |source| ExtractError::Io {
            archive: archive.to_string(),
            source,
        }
    }

    /// Closure for `map_err` on binrw parses. Short reads and bad magic are
    /// format errors; other IO failures stay IO.
    pub fn binrw<'a>(
        archive: &'a str,
        bad_magic: &'static str,
    ) -> impl FnOnce(binrw::Error) -> ExtractError + 'a {
        move |err| {
            if err.is_eof() {
                return ExtractError::invalid(archive, "truncated header");
            }
            if matches!(err.root_cause(), binrw::Error::BadMagic { .. }) {
                return ExtractError::invalid(archive, bad_magic);
            }
            match err {
                binrw::Error::Io(source) => ExtractError::Io {
                    archive: archive.to_string(),
                    source,
                },
                other => ExtractError::invalid(archive, other.to_string()),
            }
        }
    }

    /// Name of the archive the error is attached to.
    pub fn archive(&self) -> &str {
        match self {
            ExtractError::InvalidFormat { archive, .. }
            | ExtractError::UnsupportedCompression { archive, .. }
            | ExtractError::SanityCheck { archive, .. }
            | ExtractError::OmodUnderrun { archive, .. }
            | ExtractError::ArchiverFailed { archive, .. }
            | ExtractError::Truncated { archive, .. }
            | ExtractError::DuplicateEntry { archive, .. }
            | ExtractError::Cancelled { archive }
            | ExtractError::Projection { archive, .. }
            | ExtractError::Io { archive, .. } => archive,
        }
    }
}
