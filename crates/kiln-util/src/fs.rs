//! Filesystem utilities for kiln.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::UtilError;

/// Create a directory and all parent directories if they do not exist.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> Result<(), UtilError> {
    std::fs::create_dir_all(path).map_err(|source| UtilError::io(path, source))
}

/// Recursively copy the tree at `src` into `dest`.
///
/// Regular files are copied (never hard linked, so the copy can be mutated
/// freely), permissions are preserved, symlinks are recreated as symlinks.
/// `src` may also be a single file.
///
/// # Errors
/// Returns an error if the tree cannot be walked or any entry cannot be copied.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<(), UtilError> {
    let meta = std::fs::symlink_metadata(src).map_err(|source| UtilError::io(src, source))?;
    if !meta.is_dir() {
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        return copy_entry(src, dest, meta.file_type().is_symlink());
    }

    for entry in WalkDir::new(src).sort_by_file_name().follow_links(false) {
        let entry = entry.map_err(|e| UtilError::Walk {
            path: src.display().to_string(),
            message: e.to_string(),
        })?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            ensure_dir(&target)?;
        } else if file_type.is_file() || file_type.is_symlink() {
            copy_entry(entry.path(), &target, file_type.is_symlink())?;
        }
    }
    Ok(())
}

fn copy_entry(src: &Path, dest: &Path, is_symlink: bool) -> Result<(), UtilError> {
    if is_symlink {
        let link = std::fs::read_link(src).map_err(|source| UtilError::io(src, source))?;
        return symlink(&link, dest);
    }
    std::fs::copy(src, dest).map_err(|source| UtilError::io(dest, source))?;
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<(), UtilError> {
    std::os::unix::fs::symlink(target, link).map_err(|source| UtilError::io(link, source))
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> Result<(), UtilError> {
    std::os::windows::fs::symlink_file(target, link).map_err(|source| UtilError::io(link, source))
}

/// Write `content` to `path` atomically (write-to-temp-then-rename).
///
/// A crash mid-write leaves either the old file or the new one, never a
/// truncated file.
///
/// # Errors
/// Returns an error if the temp file cannot be written or renamed.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), UtilError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
    std::fs::write(&tmp_path, content).map_err(|source| UtilError::io(&tmp_path, source))?;
    std::fs::rename(&tmp_path, path).map_err(|source| {
        let _ = std::fs::remove_file(&tmp_path);
        UtilError::io(path, source)
    })
}

/// Remove a directory and all its contents. No error if the directory is absent.
///
/// A tree sealed by [`make_read_only`] is made writable and the removal retried.
///
/// # Errors
/// Returns an error if the directory exists but cannot be removed.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<(), UtilError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            make_writable(path)?;
            std::fs::remove_dir_all(path).map_err(|source| UtilError::io(path, source))
        }
        Err(source) => Err(UtilError::io(path, source)),
    }
}

/// Clear the write bits of every file and directory under `path`.
///
/// Executable bits are kept. Symlinks are left alone.
///
/// # Errors
/// Returns an error if the tree cannot be walked or a mode cannot be set.
pub fn make_read_only(path: &Path) -> Result<(), UtilError> {
    set_tree_writable(path, false)
}

/// Give the owner write access to every file and directory under `path`.
///
/// # Errors
/// Returns an error if the tree cannot be walked or a mode cannot be set.
pub fn make_writable(path: &Path) -> Result<(), UtilError> {
    set_tree_writable(path, true)
}

fn set_tree_writable(path: &Path, writable: bool) -> Result<(), UtilError> {
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| UtilError::Walk {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| UtilError::Walk {
            path: entry.path().display().to_string(),
            message: e.to_string(),
        })?;
        let perms = with_write_bits(meta.permissions(), meta.is_dir(), writable);
        std::fs::set_permissions(entry.path(), perms)
            .map_err(|source| UtilError::io(entry.path(), source))?;
    }
    Ok(())
}

#[cfg(unix)]
fn with_write_bits(
    perms: std::fs::Permissions,
    _is_dir: bool,
    writable: bool,
) -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    let mode = perms.mode();
    let mode = if writable { mode | 0o200 } else { mode & !0o222 };
    std::fs::Permissions::from_mode(mode)
}

#[cfg(not(unix))]
#[allow(clippy::permissions_set_readonly_false)]
fn with_write_bits(
    mut perms: std::fs::Permissions,
    is_dir: bool,
    writable: bool,
) -> std::fs::Permissions {
    if !is_dir {
        perms.set_readonly(!writable);
    }
    perms
}

/// Return the kiln home directory (`~/.kiln`).
///
/// Resolves via `HOME` (Unix) or `USERPROFILE` (Windows).
///
/// # Errors
/// Returns an error if neither environment variable is set.
pub fn kiln_home() -> Result<PathBuf, UtilError> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .map_err(|_| UtilError::NoHomeDir)?;
    Ok(home.join(".kiln"))
}
