//! Extractor configuration
//!
//! Stored as JSON in ~/.config/modarc/config.json. Every field has a
//! default, and a few can be overridden from the environment:
//! `MODARC_TEMP_DIR`, `MODARC_7Z`, `MODARC_MAX_JOBS`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Settings shared by every extraction in a process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Where spooled archives and 7-Zip output go (None = system temp)
    pub temp_dir: Option<PathBuf>,

    /// Explicit 7-Zip binary (None = search bin/ and PATH)
    pub sevenzip_path: Option<PathBuf>,

    /// Concurrent extraction jobs allowed by the resource limiter
    pub max_jobs: usize,

    /// Byte throughput budget per second across all jobs (0 = unlimited)
    pub max_throughput: u64,

    /// Worker threads used to project files after a 7-Zip extraction
    pub parallelism: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        let threads = available_threads();
        Self {
            temp_dir: None,
            sevenzip_path: None,
            max_jobs: threads,
            max_throughput: 0,
            parallelism: threads,
        }
    }
}

fn available_threads() -> usize {
    static THREADS: OnceLock<usize> = OnceLock::new();
    *THREADS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    })
}

impl ExtractorConfig {
    /// Default config file location (~/.config/modarc/config.json)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("modarc").join("config.json"))
    }

    /// Load a config file and apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config.with_env_overrides())
    }

    /// Load from the default location, or fall back to defaults if absent
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default().with_env_overrides()),
        }
    }

    /// Apply `MODARC_*` environment variables on top of the loaded values
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("MODARC_TEMP_DIR").filter(|v| !v.is_empty()) {
            self.temp_dir = Some(PathBuf::from(dir));
        }
        if let Some(bin) = lookup("MODARC_7Z").filter(|v| !v.is_empty()) {
            self.sevenzip_path = Some(PathBuf::from(bin));
        }
        if let Some(jobs) = lookup("MODARC_MAX_JOBS")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
        {
            self.max_jobs = jobs;
        }
        self
    }

    /// Directory for temporary files
    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(dir) = &self.temp_dir {
            if !dir.is_dir() {
                return Err(ConfigError::TempDirNotFound(dir.clone()));
            }
        }

        if let Some(bin) = &self.sevenzip_path {
            if !bin.exists() {
                return Err(ConfigError::SevenZipNotFound(bin.clone()));
            }
        }

        if self.max_jobs == 0 {
            return Err(ConfigError::ZeroJobs);
        }

        if self.parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Temp directory not found: {0}")]
    TempDirNotFound(PathBuf),

    #[error("7-Zip binary not found: {0}")]
    SevenZipNotFound(PathBuf),

    #[error("max_jobs must be at least 1")]
    ZeroJobs,

    #[error("parallelism must be at least 1")]
    ZeroParallelism,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_keeps_defaults() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "max_throughput": 1048576 }"#)?;

        let config: ExtractorConfig = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(config.max_throughput, 1048576);
        assert_eq!(config.max_jobs, ExtractorConfig::default().max_jobs);
        assert!(config.sevenzip_path.is_none());
        Ok(())
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("MODARC_TEMP_DIR", "/scratch"),
            ("MODARC_MAX_JOBS", "3"),
            ("MODARC_7Z", ""),
        ]
        .into_iter()
        .collect();

        let config = ExtractorConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.temp_dir, Some(PathBuf::from("/scratch")));
        assert_eq!(config.max_jobs, 3);
        assert!(config.sevenzip_path.is_none());
    }

    #[test]
    fn test_invalid_values() {
        let config = ExtractorConfig {
            max_jobs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroJobs)));

        let config = ExtractorConfig {
            sevenzip_path: Some(PathBuf::from("/nonexistent/7zz")),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::SevenZipNotFound(_))));
    }

    #[test]
    fn test_bad_json_is_parse_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json")?;
        assert!(matches!(
            ExtractorConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
        Ok(())
    }
}
