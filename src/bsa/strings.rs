//! Name encodings and length-prefixed string helpers.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::io::{self, Read, Write};

use super::reader::VersionType;

/// Encoding used for folder and file names by each container version.
pub fn encoding_for(version: Option<VersionType>) -> &'static Encoding {
    match version {
        Some(VersionType::Fo3) => UTF_8,
        // TES3, TES4 and SSE names are 8-bit Windows code page strings
        _ => WINDOWS_1252,
    }
}

pub fn decode(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

pub fn encode(text: &str, encoding: &'static Encoding) -> Vec<u8> {
    let (bytes, _, _) = encoding.encode(text);
    bytes.into_owned()
}

/// Read a `u8` length (including the trailing null), the bytes, and the null.
pub fn read_bzstring<R: Read + ?Sized>(
    reader: &mut R,
    encoding: &'static Encoding,
) -> io::Result<String> {
    let mut len = [0u8; 1];
    reader.read_exact(&mut len)?;
    let mut buf = vec![0u8; len[0] as usize];
    reader.read_exact(&mut buf)?;
    if buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(decode(&buf, encoding))
}

/// Write a null-terminated string with a `u8` length prefix that counts the null.
pub fn write_bzstring<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u8::try_from(bytes.len() + 1).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "name longer than 254 bytes")
    })?;
    writer.write_all(&[len])?;
    writer.write_all(bytes)?;
    writer.write_all(&[0])
}

/// Write a `u8` length prefix then the bytes, no terminator.
pub fn write_bstring<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u8::try_from(bytes.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "name longer than 255 bytes")
    })?;
    writer.write_all(&[len])?;
    writer.write_all(bytes)
}

/// Split a block of null-terminated names.
pub fn split_null_terminated(block: &[u8], encoding: &'static Encoding) -> Vec<String> {
    let block = block.strip_suffix(&[0]).unwrap_or(block);
    if block.is_empty() {
        return Vec::new();
    }
    block.split(|&b| b == 0).map(|name| decode(name, encoding)).collect()
}
