//! Hashing utilities for content-addressed identifiers.

use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::UtilError;

/// Compute the SHA-256 hex digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compute the SHA-256 hex digest of a file using streaming reads.
///
/// Uses a 64 KiB buffer to avoid loading the entire file into memory,
/// which matters for large build outputs and bundles.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> Result<String, UtilError> {
    let file = std::fs::File::open(path).map_err(|source| UtilError::io(path, source))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = std::io::Read::read(&mut reader, &mut buf)
            .map_err(|source| UtilError::io(path, source))?;
        if n == 0 {
            break;
        }
        let Some(chunk) = buf.get(..n) else {
            break; // unreachable: n is bounded by buf.len()
        };
        hasher.update(chunk);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Combine multiple string parts into a single composite SHA-256 hash.
///
/// Each part is hashed in order with a length prefix to prevent ambiguity.
pub fn sha256_multi(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        // Length-prefix each part to avoid collisions like ["ab","c"] vs ["a","bc"].
        let len_bytes = part.len().to_le_bytes();
        hasher.update(len_bytes);
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Hash a directory tree deterministically.
///
/// Entries are visited in sorted path order. File entries contribute their
/// relative path, executable bit and content digest; directories contribute
/// their path; symlinks contribute their target. Timestamps and ownership are
/// ignored.
///
/// # Errors
/// Returns an error if the tree cannot be walked or a file cannot be read.
pub fn sha256_tree(dir: &Path) -> Result<String, UtilError> {
    let mut records: Vec<String> = Vec::new();

    for entry in WalkDir::new(dir).sort_by_file_name().follow_links(false) {
        let entry = entry.map_err(|e| UtilError::Walk {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let rel = relative_slash_path(relative);

        let file_type = entry.file_type();
        let record = if file_type.is_file() {
            let exec = if is_executable(entry.path()) { "x" } else { "-" };
            format!("F:{rel}:{exec}:{}", sha256_file(entry.path())?)
        } else if file_type.is_dir() {
            format!("D:{rel}")
        } else if file_type.is_symlink() {
            let target =
                std::fs::read_link(entry.path()).map_err(|source| UtilError::io(entry.path(), source))?;
            format!("L:{rel}:{}", target.display())
        } else {
            continue;
        };
        records.push(record);
    }

    records.sort();
    let parts: Vec<&str> = records.iter().map(String::as_str).collect();
    Ok(sha256_multi(&parts))
}

/// Hash a path that may be either a file or a directory tree.
///
/// # Errors
/// Returns an error if the path does not exist or cannot be read.
pub fn sha256_path(path: &Path) -> Result<String, UtilError> {
    let meta = std::fs::symlink_metadata(path).map_err(|source| UtilError::io(path, source))?;
    if meta.is_dir() {
        sha256_tree(path)
    } else {
        sha256_file(path)
    }
}

/// Render a relative path with `/` separators on every platform.
pub fn relative_slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether the file at `path` has any executable bit set.
///
/// Always `false` on platforms without Unix permissions.
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}
