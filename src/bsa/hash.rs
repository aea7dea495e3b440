//! TES4-family name hashes.
//!
//! Folder and file records are sorted by these 64-bit values, so a builder
//! that gets them wrong produces archives the game cannot search.

/// Hash of a folder path such as `meshes\armor`.
pub fn folder_hash(folder: &str) -> u64 {
    let folder = normalize(folder);
    hash_parts(folder.as_bytes(), b"")
}

/// Hash of a file name such as `armor.nif` (no folder part).
pub fn file_hash(name: &str) -> u64 {
    let name = normalize(name);
    let bytes = name.as_bytes();
    match bytes.iter().rposition(|&b| b == b'.') {
        Some(dot) => hash_parts(&bytes[..dot], &bytes[dot..]),
        None => hash_parts(bytes, b""),
    }
}

fn normalize(name: &str) -> String {
    name.to_lowercase().replace('/', "\\")
}

fn hash_parts(stem: &[u8], ext: &[u8]) -> u64 {
    let len = stem.len();
    if len == 0 {
        return 0;
    }

    let last = stem[len - 1] as u32;
    let second_last = if len >= 3 { stem[len - 2] as u32 } else { 0 };
    let mut hash1 = last | (second_last << 8) | ((len as u32 & 0xff) << 16) | ((stem[0] as u32) << 24);

    hash1 |= match ext {
        b".kf" => 0x80,
        b".nif" => 0x8000,
        b".dds" => 0x8080,
        b".wav" => 0x8000_0000,
        _ => 0,
    };

    let hash2 = if len > 3 { rolling(&stem[1..len - 2]) } else { 0 };
    let hash3 = rolling(ext);
    let high = hash2.wrapping_add(hash3);

    ((high as u64) << 32) | hash1 as u64
}

fn rolling(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |h, &c| h.wrapping_mul(0x1003f).wrapping_add(c as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_folder_hashes() {
        assert_eq!(
            folder_hash("textures\\actors\\character\\facegendata\\facetint\\darkend.esp"),
            0x38c7a858743a7370
        );
        assert_eq!(folder_hash("meshes\\armor"), 0xb6e5bfe86d0c6f72);
        assert_eq!(folder_hash("a"), 0x61010061);
        assert_eq!(folder_hash("ab"), 0x61020062);
        assert_eq!(folder_hash(""), 0);
    }

    #[test]
    fn test_pinned_file_hashes() {
        assert_eq!(file_hash("darkend.esp"), 0x680bd77f64076e64);
        assert_eq!(file_hash("00000d01.dds"), 0x1b4792293008b0b1);
        assert_eq!(file_hash("test.nif"), 0x92cd46627404f374);
    }

    #[test]
    fn test_case_and_separator_insensitive() {
        assert_eq!(
            folder_hash("Textures/Actors/Character"),
            folder_hash("textures\\actors\\character")
        );
        assert_eq!(file_hash("Darkend.ESP"), file_hash("darkend.esp"));
    }
}
