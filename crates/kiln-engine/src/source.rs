//! Filtered, content-addressed source snapshots.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use glob::Pattern;
use kiln_config::manifest::SourceDecl;
use walkdir::WalkDir;

use crate::store::{ContentStore, StoreError};

/// Files that never influence a build and are skipped unless a source opts out.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".kiln",
    "dist",
    "result",
    ".direnv",
    ".envrc",
    "*.nix",
    "flake.lock",
    ".pre-commit-config.yaml",
    "kiln.toml",
];

/// Include/exclude rules applied to paths relative to a source root.
///
/// A file passes when it matches an include pattern (an empty include list
/// admits everything) and no exclude pattern. Exclude patterns are tried
/// against the whole `/`-separated path and against each of its components,
/// so `.git` drops the entire `.git/` directory.
#[derive(Debug, Clone)]
pub struct FilterPolicy {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl FilterPolicy {
    /// # Errors
    /// Returns an error if any pattern is not a valid glob.
    pub fn new(
        include: &[String],
        exclude: &[String],
        default_excludes: bool,
    ) -> Result<Self, SourceError> {
        let mut exclude_all: Vec<&str> = Vec::new();
        if default_excludes {
            exclude_all.extend(DEFAULT_EXCLUDES);
        }
        exclude_all.extend(exclude.iter().map(String::as_str));
        Ok(Self {
            include: compile(include.iter().map(String::as_str))?,
            exclude: compile(exclude_all)?,
        })
    }

    /// # Errors
    /// Returns an error if any pattern is not a valid glob.
    pub fn from_decl(decl: &SourceDecl) -> Result<Self, SourceError> {
        Self::new(&decl.include, &decl.exclude, decl.default_excludes)
    }

    /// Whether the relative path is dropped by an exclude pattern.
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.exclude.iter().any(|p| {
            p.matches(relative) || relative.split('/').any(|component| p.matches(component))
        })
    }

    /// Whether a file at the relative path belongs in the snapshot.
    pub fn admits_file(&self, relative: &str) -> bool {
        !self.is_excluded(relative)
            && (self.include.is_empty() || self.include.iter().any(|p| p.matches(relative)))
    }

    /// Digest of the policy's patterns, used to key in-process caches.
    pub fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = self
            .include
            .iter()
            .map(|p| format!("include:{}", p.as_str()))
            .collect();
        parts.extend(self.exclude.iter().map(|p| format!("exclude:{}", p.as_str())));
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        kiln_util::hash::sha256_multi(&refs)
    }
}

fn compile<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<Vec<Pattern>, SourceError> {
    patterns
        .into_iter()
        .map(|raw| {
            Pattern::new(raw).map_err(|e| SourceError::Pattern {
                pattern: raw.to_owned(),
                message: e.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File { executable: bool, digest: String },
    Symlink { target: String },
}

/// One admitted path of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// `/`-separated path relative to the source root.
    pub path: String,
    pub kind: EntryKind,
}

/// The filtered view of a source tree, before it is copied into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceScan {
    pub id: String,
    pub root: PathBuf,
    pub entries: Vec<SourceEntry>,
}

/// A snapshot materialized in the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub id: String,
    /// Store path of the snapshot tree.
    pub root: PathBuf,
    pub entries: Vec<SourceEntry>,
}

/// Walk `root` and record every admitted file and symlink in sorted order.
///
/// Directories in `skip` (absolute) are never entered. Special files (FIFOs,
/// sockets, devices) are ignored.
///
/// # Errors
/// Returns an error if the root is missing or the tree cannot be read.
pub fn scan(root: &Path, policy: &FilterPolicy, skip: &[PathBuf]) -> Result<SourceScan, SourceError> {
    if !root.is_dir() {
        return Err(SourceError::MissingRoot {
            path: root.display().to_string(),
        });
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            if skip.iter().any(|s| entry.path() == s.as_path()) {
                return false;
            }
            match relative_of(root, entry.path()) {
                Some(rel) => !policy.is_excluded(&rel),
                None => false,
            }
        });

    for entry in walker {
        let entry = entry.map_err(|e| SourceError::Walk {
            path: root.display().to_string(),
            message: e.to_string(),
        })?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let Some(rel) = relative_of(root, entry.path()) else {
            continue;
        };
        if !policy.admits_file(&rel) {
            continue;
        }
        let kind = if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|source| SourceError::Io {
                path: entry.path().display().to_string(),
                source,
            })?;
            EntryKind::Symlink {
                target: kiln_util::hash::relative_slash_path(&target),
            }
        } else if file_type.is_file() {
            EntryKind::File {
                executable: kiln_util::hash::is_executable(entry.path()),
                digest: kiln_util::hash::sha256_file(entry.path())?,
            }
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping special file");
            continue;
        };
        entries.push(SourceEntry { path: rel, kind });
    }

    let id = snapshot_id(&entries);
    Ok(SourceScan {
        id,
        root: root.to_path_buf(),
        entries,
    })
}

fn relative_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.components().all(|c| matches!(c, Component::Normal(_))) {
        Some(kiln_util::hash::relative_slash_path(rel))
    } else {
        None
    }
}

/// Identifier over sorted `(path, kind, executable bit, digest)` records.
pub fn snapshot_id(entries: &[SourceEntry]) -> String {
    let mut records: Vec<String> = entries
        .iter()
        .map(|e| match &e.kind {
            EntryKind::File { executable, digest } => {
                let mode = if *executable { "x" } else { "-" };
                format!("file\0{}\0{mode}\0{digest}", e.path)
            }
            EntryKind::Symlink { target } => format!("link\0{}\0{target}", e.path),
        })
        .collect();
    records.sort();
    let refs: Vec<&str> = records.iter().map(String::as_str).collect();
    kiln_util::hash::sha256_multi(&refs)
}

/// Scans and materializes source trees, memoizing per `(root, policy)`.
#[derive(Debug, Default)]
pub struct Snapshotter {
    skip: Vec<PathBuf>,
    scans: Mutex<HashMap<(PathBuf, String), Arc<SourceScan>>>,
}

impl Snapshotter {
    /// A snapshotter that never descends into `skip` (e.g. the store itself).
    ///
    /// Skip paths need not exist yet.
    pub fn new(skip: Vec<PathBuf>) -> Self {
        let skip = skip
            .into_iter()
            .map(|p| canonicalize_existing_prefix(&p))
            .collect();
        Self {
            skip,
            scans: Mutex::new(HashMap::new()),
        }
    }

    /// Scan `root` under `policy`, reusing an earlier scan of the same pair.
    ///
    /// # Errors
    /// See [`scan`].
    pub fn scan(&self, root: &Path, policy: &FilterPolicy) -> Result<Arc<SourceScan>, SourceError> {
        let canonical = std::fs::canonicalize(root).map_err(|_| SourceError::MissingRoot {
            path: root.display().to_string(),
        })?;
        let key = (canonical.clone(), policy.fingerprint());
        if let Some(hit) = self.scans.lock().ok().and_then(|m| m.get(&key).cloned()) {
            return Ok(hit);
        }
        let result = Arc::new(scan(&canonical, policy, &self.skip)?);
        tracing::debug!(root = %canonical.display(), id = %short(&result.id), files = result.entries.len(), "scanned source");
        if let Ok(mut scans) = self.scans.lock() {
            scans.insert(key, Arc::clone(&result));
        }
        Ok(result)
    }

    /// Scan `root` and make sure its snapshot exists in `store`.
    ///
    /// # Errors
    /// Returns an error if scanning fails, a file changed between scanning
    /// and copying, or the store cannot be written.
    pub fn snapshot(
        &self,
        root: &Path,
        policy: &FilterPolicy,
        store: &ContentStore,
    ) -> Result<SourceSnapshot, SourceError> {
        let scanned = self.scan(root, policy)?;
        materialize(&scanned, store)
    }
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// components below it.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(canonical) = std::fs::canonicalize(current) {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Copy a scanned tree into `store/snapshots/<id>` unless already present.
///
/// # Errors
/// Returns an error if a file changed since it was scanned or the store
/// cannot be written.
pub fn materialize(scanned: &SourceScan, store: &ContentStore) -> Result<SourceSnapshot, SourceError> {
    let snapshot = SourceSnapshot {
        id: scanned.id.clone(),
        root: store.snapshot_path(&scanned.id),
        entries: scanned.entries.clone(),
    };
    if store.has_snapshot(&scanned.id) {
        return Ok(snapshot);
    }

    let _lock = store.lock(&format!("snapshot-{}", scanned.id))?;
    if store.has_snapshot(&scanned.id) {
        return Ok(snapshot);
    }

    let staging = store.staging("snapshot")?;
    let tree = staging.path().join("tree");
    kiln_util::fs::ensure_dir(&tree)?;
    for entry in &scanned.entries {
        let src = scanned.root.join(&entry.path);
        let dest = tree.join(&entry.path);
        kiln_util::fs::copy_tree(&src, &dest)?;
        if let EntryKind::File { digest, .. } = &entry.kind {
            if kiln_util::hash::sha256_file(&dest)? != *digest {
                return Err(SourceError::Changed {
                    path: src.display().to_string(),
                });
            }
        }
    }
    store.install_snapshot(&tree, &scanned.id)?;
    tracing::debug!(id = %short(&scanned.id), "materialized snapshot");
    Ok(snapshot)
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source root {path} does not exist or is not a directory")]
    MissingRoot { path: String },

    #[error("invalid source pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },

    #[error("cannot walk {path}: {message}")]
    Walk { path: String, message: String },

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("{path} changed while it was being snapshotted — re-run once the tree is stable")]
    Changed { path: String },

    #[error("{0}")]
    Util(#[from] kiln_util::error::UtilError),

    #[error("{0}")]
    Store(#[from] StoreError),
}
