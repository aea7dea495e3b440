//! Content hashes in the modlist format.
//!
//! Modlists identify files by xxHash64 encoded as base64 of the
//! little-endian digest. The dispatcher's callers typically project every
//! extracted entry through [`hash_reader`].

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Digest of a stream plus the number of bytes it held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    pub hash: String,
    pub size: u64,
}

/// Stream a reader through xxHash64.
pub fn hash_reader<R: Read + ?Sized>(reader: &mut R) -> io::Result<ContentHash> {
    let mut buf = vec![0u8; 1024 * 1024];
    let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
    let mut size = 0u64;

    loop {
        let bytes_read = reader.read(&mut buf)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buf[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(ContentHash {
        hash: encode(hasher.digest()),
        size,
    })
}

/// Hash of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    encode(xxhash_rust::xxh64::xxh64(data, 0))
}

/// Compute the hash of a file on disk.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let digest = hash_reader(&mut file)
        .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
    Ok(digest.hash)
}

fn encode(hash: u64) -> String {
    STANDARD.encode(hash.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_input() -> Result<()> {
        let digest = hash_reader(&mut Cursor::new(Vec::new()))?;
        // xxh64("") = 0xef46db3751d8e999
        assert_eq!(digest.hash, STANDARD.encode(0xef46db3751d8e999u64.to_le_bytes()));
        assert_eq!(digest.size, 0);
        Ok(())
    }

    #[test]
    fn test_reader_and_file_agree() -> Result<()> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(b"Hello, World!")?;
        tmp.flush()?;

        let from_file = compute_file_hash(tmp.path())?;
        let from_reader = hash_reader(&mut Cursor::new(b"Hello, World!".to_vec()))?;
        assert_eq!(from_file, from_reader.hash);
        assert_eq!(from_file, hash_bytes(b"Hello, World!"));
        assert_eq!(from_reader.size, 13);
        Ok(())
    }
}
