//! Magic-byte detection.
//!
//! Uses magic byte detection rather than file extension to handle
//! mislabeled archives (e.g., a `.zip` that's actually a RAR file). The
//! only ambiguity left, TES3 versus an arbitrary file starting with
//! `00 01 00 00`, is settled by the dispatcher from the extension.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

/// Container formats the dispatcher knows how to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Morrowind BSA
    Tes3,
    /// Oblivion through Skyrim SE BSA
    Bsa,
    /// Fallout 4 / Starfield BA2
    Ba2,
    /// Length-prefixed record stream
    Btar,
    Zip,
    /// RAR 1.5 - 4.x
    RarOld,
    /// RAR 5
    RarNew,
    SevenZip,
}

impl FileType {
    /// Formats handled by the external archiver (or OMOD when so named).
    pub fn is_general_archive(self) -> bool {
        matches!(
            self,
            FileType::Zip | FileType::RarOld | FileType::RarNew | FileType::SevenZip
        )
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Tes3 => "TES3",
            FileType::Bsa => "BSA",
            FileType::Ba2 => "BA2",
            FileType::Btar => "BTAR",
            FileType::Zip => "ZIP",
            FileType::RarOld => "RAR_OLD",
            FileType::RarNew => "RAR_NEW",
            FileType::SevenZip => "7Z",
        };
        f.write_str(name)
    }
}

/// Longest signature first so RAR5 wins over the shorter RAR4 prefix.
const SIGNATURES: &[(FileType, &[u8])] = &[
    (FileType::RarNew, &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x01, 0x00]),
    (FileType::RarOld, &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00]),
    (FileType::SevenZip, &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]),
    (FileType::Zip, &[0x50, 0x4B, 0x03, 0x04]),
    (FileType::Zip, &[0x50, 0x4B, 0x05, 0x06]),
    (FileType::Zip, &[0x50, 0x4B, 0x07, 0x08]),
    (FileType::Bsa, b"BSA\0"),
    (FileType::Ba2, b"BTDX"),
    (FileType::Btar, b"BTAR"),
    (FileType::Tes3, &[0x00, 0x01, 0x00, 0x00]),
];

const MAX_SIGNATURE_LEN: usize = 8;

/// Classify a stream by its leading bytes.
///
/// The stream is returned to the position it had on entry. Unknown or
/// too-short input is `Ok(None)`, never an error.
pub fn sniff<R: Read + Seek + ?Sized>(stream: &mut R) -> io::Result<Option<FileType>> {
    let start = stream.stream_position()?;

    let mut head = [0u8; MAX_SIGNATURE_LEN];
    let mut filled = 0;
    while filled < head.len() {
        match stream.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                stream.seek(SeekFrom::Start(start))?;
                return Err(e);
            }
        }
    }
    stream.seek(SeekFrom::Start(start))?;

    Ok(match_signature(&head[..filled]))
}

/// Classify a byte prefix.
pub fn match_signature(head: &[u8]) -> Option<FileType> {
    SIGNATURES
        .iter()
        .find(|(_, magic)| head.starts_with(magic))
        .map(|(kind, _)| *kind)
}
