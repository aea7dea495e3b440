//! Archive-relative path handling
//!
//! Game archives store Windows-style paths with backslashes.
//! This module handles:
//! - Normalising entry names to the `folder\file` form used as result keys
//! - Case-insensitive comparisons (the archive namespace is case-insensitive)
//! - Deciding whether an entry name is safe to write under a destination

use std::path::{Path, PathBuf};

/// Convert Windows path separators to Linux
/// `Data\Textures\armor.dds` -> `Data/Textures/armor.dds`
pub fn to_linux_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Convert an entry name to the archive form: backslashes, no leading separator
/// `/meshes/armor.nif` -> `meshes\armor.nif`
pub fn to_archive_path(path: &str) -> String {
    path.replace('/', "\\").trim_start_matches('\\').to_string()
}

/// Normalize a path for lookups and comparisons (lowercase, forward slashes, trimmed)
pub fn normalize_for_lookup(path: &str) -> String {
    path.to_lowercase()
        .replace('\\', "/")
        .trim_matches('/')
        .to_string()
}

/// Get the parent directory of a path (handles both / and \)
pub fn parent_path(path: &str) -> Option<&str> {
    path.rfind(['\\', '/']).map(|idx| &path[..idx])
}

/// Get the filename from a path (handles both / and \)
pub fn file_name(path: &str) -> &str {
    path.rfind(['\\', '/'])
        .map(|idx| &path[idx + 1..])
        .unwrap_or(path)
}

/// Get file extension (without the dot, case preserved)
pub fn extension(path: &str) -> Option<&str> {
    let name = file_name(path);
    name.rfind('.').map(|idx| &name[idx + 1..])
}

/// True when `name` has the given extension, ignoring case.
pub fn has_extension(name: &str, ext: &str) -> bool {
    extension(name).is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Join a base path with a Windows-style relative path
pub fn join_windows_path(base: &Path, relative: &str) -> PathBuf {
    base.join(to_linux_path(relative))
}

const INVALID_PATH_CHARS: &[char] = &['"', '<', '>', '|', '\0'];
const INVALID_NAME_CHARS: &[char] = &['"', '<', '>', '|', ':', '*', '?', '\\', '/', '\0'];

/// Whether an entry name can be written below a destination directory.
///
/// Rejects rooted and drive-qualified paths, parent traversal, names
/// starting or ending in `.`, and characters Windows refuses in paths.
pub fn is_safe_file_name(name: &str) -> bool {
    let name = name.replace('/', "\\");
    if name.is_empty() {
        return false;
    }
    if name.chars().any(|c| INVALID_PATH_CHARS.contains(&c) || (c as u32) < 0x20) {
        return false;
    }
    if name.starts_with('\\') || name.as_bytes().get(1) == Some(&b':') {
        return false;
    }
    if name.starts_with('.') || name.ends_with('.') || name.contains("\\..\\") {
        return false;
    }

    let leaf = file_name(&name);
    match (leaf.chars().next(), leaf.chars().last()) {
        (Some(first), Some(last)) => {
            !INVALID_NAME_CHARS.contains(&first) && !INVALID_NAME_CHARS.contains(&last)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_linux_path() {
        assert_eq!(to_linux_path("Data\\Textures\\armor.dds"), "Data/Textures/armor.dds");
        assert_eq!(to_linux_path("mixed\\path/style"), "mixed/path/style");
    }

    #[test]
    fn test_to_archive_path() {
        assert_eq!(to_archive_path("/meshes/armor.nif"), "meshes\\armor.nif");
        assert_eq!(to_archive_path("Meshes\\Armor.NIF"), "Meshes\\Armor.NIF");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_for_lookup("Data\\Textures\\Armor.dds"), "data/textures/armor.dds");
        assert_eq!(normalize_for_lookup("MESHES/Actor/Character"), "meshes/actor/character");
        assert_eq!(normalize_for_lookup("\\Meshes\\A.nif"), normalize_for_lookup("meshes/a.nif"));
    }

    #[test]
    fn test_file_name_and_extension() {
        assert_eq!(file_name("Data\\Textures\\armor.dds"), "armor.dds");
        assert_eq!(file_name("armor.dds"), "armor.dds");
        assert_eq!(extension("Data\\armor.dds"), Some("dds"));
        assert_eq!(extension("noext"), None);
        assert!(has_extension("Mod.OMOD", "omod"));
        assert!(!has_extension("mod.omod.zip", "omod"));
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("Data\\Textures\\armor.dds"), Some("Data\\Textures"));
        assert_eq!(parent_path("armor.dds"), None);
    }

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("meshes\\armor.nif"));
        assert!(is_safe_file_name("textures/a b/c.dds"));
        assert!(!is_safe_file_name("\\etc\\passwd"));
        assert!(!is_safe_file_name("C:\\windows\\x.dll"));
        assert!(!is_safe_file_name("..\\escape.txt"));
        assert!(!is_safe_file_name("a\\..\\..\\escape.txt"));
        assert!(!is_safe_file_name("trailing."));
        assert!(!is_safe_file_name("bad|pipe.txt"));
        assert!(!is_safe_file_name("dir\\"));
        assert!(!is_safe_file_name(""));
    }
}
