//! modarc - Bethesda archive codec and mod archive extraction
//!
//! Reads and rebuilds BSA/BA2 containers, and extracts ZIP/RAR/7z, OMOD
//! and BTAR sources through one dispatcher.

pub mod archive;
pub mod bsa;
pub mod config;
pub mod error;
pub mod hash;
pub mod limiter;
pub mod paths;
pub mod streams;

pub use archive::{ExtractedEntry, FileExtractor, Strategy};
pub use config::ExtractorConfig;
pub use error::{ExtractError, Result};
pub use limiter::{CancellationToken, Progress, ResourceLimiter};
pub use streams::{MemoryStreamFactory, NativeFileStreamFactory, StreamFactory};
