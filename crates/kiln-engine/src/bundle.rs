//! Deterministic release bundles.
//!
//! A bundle is a gzip-compressed tar archive named `<bundle>-<platform>.tar.gz`
//! whose entries all live under `<bundle>-<platform>/`. Headers are
//! normalized (mtime 0, uid/gid 0, no owner names, mode from the executable
//! bit) and the gzip header carries no timestamp or file name, so the same
//! artifacts always produce the same bytes.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use flate2::{Compression, GzBuilder};
use kiln_config::Manifest;
use kiln_targets::Platform;
use serde::{Deserialize, Serialize};
use tar::{EntryType, Header};
use walkdir::WalkDir;

use crate::graph::DerivationGraph;
use crate::realize::{Artifact, RealizeReport};

/// Name of the manifest file placed at the top of every bundle.
pub const MANIFEST_NAME: &str = "MANIFEST.json";

/// One bundle entry, resolved to a graph node but not yet built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    /// Normalized `/`-separated path inside the bundle directory.
    pub path: String,
    pub unit: String,
    pub node: String,
    pub output: String,
}

/// What a bundle needs for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePlan {
    pub name: String,
    pub platform: Platform,
    pub entries: Vec<PlannedEntry>,
}

impl BundlePlan {
    /// Graph nodes that must be realized, deduplicated, in entry order.
    pub fn nodes(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.node.as_str()))
            .map(|e| e.node.clone())
            .collect()
    }

    /// Directory name inside the archive, also the archive's base name.
    pub fn base_name(&self) -> String {
        format!("{}-{}", self.name, self.platform)
    }
}

/// One line of `MANIFEST.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub unit: String,
    pub derivation: String,
    pub output: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub bundle: String,
    pub platform: String,
    pub entries: Vec<ManifestEntry>,
}

/// A written bundle archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub name: String,
    pub platform: Platform,
    pub path: PathBuf,
    pub sha256: String,
    pub manifest: BundleManifest,
}

impl Bundle {
    /// Release asset name: `<bundle>-<platform>.tar.gz`.
    pub fn asset_name(&self) -> String {
        format!("{}-{}.tar.gz", self.name, self.platform)
    }
}

/// Resolve the bundle `name` for `platform` against the graph.
///
/// # Errors
/// Returns an error if the bundle is undeclared, a unit has no instance for
/// `platform`, or two entries claim overlapping paths.
pub fn plan_bundle(
    manifest: &Manifest,
    graph: &DerivationGraph,
    name: &str,
    platform: &Platform,
) -> Result<BundlePlan, BundleError> {
    let decl = manifest
        .bundles
        .get(name)
        .ok_or_else(|| BundleError::UnknownBundle {
            name: name.to_owned(),
        })?;

    let mut entries = Vec::with_capacity(decl.contents.len());
    for content in &decl.contents {
        let index = graph
            .instance(&content.unit, platform)
            .ok_or_else(|| BundleError::NoInstance {
                bundle: name.to_owned(),
                unit: content.unit.clone(),
                platform: platform.to_string(),
            })?;
        let node = graph
            .node(index)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| content.unit.clone());
        entries.push(PlannedEntry {
            path: normalize(content.bundle_path()),
            unit: content.unit.clone(),
            node,
            output: content.output.clone(),
        });
    }
    check_collisions(name, &entries)?;

    Ok(BundlePlan {
        name: name.to_owned(),
        platform: *platform,
        entries,
    })
}

fn normalize(path: &str) -> String {
    Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Two entries collide when their paths are equal or one contains the other.
fn check_collisions(bundle: &str, entries: &[PlannedEntry]) -> Result<(), BundleError> {
    let mut claimed: Vec<&str> = vec![MANIFEST_NAME];
    for entry in entries {
        if let Some(existing) = claimed.iter().find(|c| overlaps(c, &entry.path)) {
            return Err(BundleError::PathCollision {
                bundle: bundle.to_owned(),
                first: (*existing).to_owned(),
                second: entry.path.clone(),
            });
        }
        claimed.push(&entry.path);
    }
    Ok(())
}

fn overlaps(a: &str, b: &str) -> bool {
    a == b
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('/'))
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('/'))
}

/// Write the archive for `plan` using the realized outputs in `report`.
///
/// # Errors
/// Returns an error if a node was not realized or the archive cannot be
/// written.
pub fn write_bundle(
    plan: &BundlePlan,
    report: &RealizeReport,
    dist: &Path,
) -> Result<Bundle, BundleError> {
    let mut resolved = Vec::with_capacity(plan.entries.len());
    for entry in &plan.entries {
        let artifact = report
            .realized(&entry.node)
            .and_then(|r| r.artifact(&entry.output))
            .ok_or_else(|| BundleError::NotRealized {
                bundle: plan.name.clone(),
                unit: entry.node.clone(),
            })?;
        resolved.push((entry.clone(), artifact.clone()));
    }
    write_archive(plan, &resolved, dist)
}

/// Write `<dist>/<bundle>-<platform>.tar.gz` from resolved artifacts.
///
/// # Errors
/// Returns an error if an artifact cannot be read or the archive cannot be
/// written.
pub fn write_archive(
    plan: &BundlePlan,
    entries: &[(PlannedEntry, Artifact)],
    dist: &Path,
) -> Result<Bundle, BundleError> {
    kiln_util::fs::ensure_dir(dist)?;
    let base = plan.base_name();
    let manifest = BundleManifest {
        bundle: plan.name.clone(),
        platform: plan.platform.to_string(),
        entries: entries
            .iter()
            .map(|(entry, artifact)| ManifestEntry {
                path: entry.path.clone(),
                unit: entry.unit.clone(),
                derivation: artifact.derivation.to_string(),
                output: entry.output.clone(),
                sha256: artifact.digest.clone(),
            })
            .collect(),
    };
    let mut manifest_json =
        serde_json::to_vec_pretty(&manifest).map_err(|e| BundleError::Manifest {
            message: e.to_string(),
        })?;
    manifest_json.push(b'\n');

    let tmp = tempfile::Builder::new()
        .prefix(".bundle-")
        .tempfile_in(dist)
        .map_err(|source| io_err(dist, source))?;
    let gz = GzBuilder::new()
        .mtime(0)
        .operating_system(255)
        .write(tmp, Compression::default());
    let mut archive = ArchiveWriter {
        builder: tar::Builder::new(gz),
        dirs: BTreeSet::new(),
    };

    archive.dir(&base)?;
    archive.file_bytes(&format!("{base}/{MANIFEST_NAME}"), &manifest_json)?;
    for (entry, artifact) in entries {
        let dest = format!("{base}/{}", entry.path);
        archive.parents(&dest)?;
        archive.tree(&artifact.path, &dest)?;
    }

    let gz = archive
        .builder
        .into_inner()
        .map_err(|source| io_err(dist, source))?;
    let mut tmp = gz.finish().map_err(|source| io_err(dist, source))?;
    tmp.flush().map_err(|source| io_err(dist, source))?;

    let dest = dist.join(format!("{base}.tar.gz"));
    tmp.persist(&dest)
        .map_err(|e| io_err(&dest, e.error))?;
    let sha256 = kiln_util::hash::sha256_file(&dest)?;
    tracing::info!(bundle = %base, sha256 = %sha256.get(..12).unwrap_or(&sha256), "wrote bundle");

    Ok(Bundle {
        name: plan.name.clone(),
        platform: plan.platform,
        path: dest,
        sha256,
        manifest,
    })
}

struct ArchiveWriter<W: Write> {
    builder: tar::Builder<W>,
    dirs: BTreeSet<String>,
}

impl<W: Write> ArchiveWriter<W> {
    fn dir(&mut self, path: &str) -> Result<(), BundleError> {
        if !self.dirs.insert(path.to_owned()) {
            return Ok(());
        }
        let mut header = header(EntryType::Directory, 0o755, 0);
        self.builder
            .append_data(&mut header, format!("{path}/"), std::io::empty())
            .map_err(|source| io_err(Path::new(path), source))
    }

    /// Emit every missing ancestor directory of `path`.
    fn parents(&mut self, path: &str) -> Result<(), BundleError> {
        let parts: Vec<&str> = path.split('/').collect();
        for end in 1..parts.len() {
            if let Some(prefix) = parts.get(..end) {
                self.dir(&prefix.join("/"))?;
            }
        }
        Ok(())
    }

    fn file_bytes(&mut self, path: &str, data: &[u8]) -> Result<(), BundleError> {
        let mut header = header(EntryType::Regular, 0o644, data.len() as u64);
        self.builder
            .append_data(&mut header, path, data)
            .map_err(|source| io_err(Path::new(path), source))
    }

    fn file(&mut self, src: &Path, path: &str) -> Result<(), BundleError> {
        let mut file = File::open(src).map_err(|source| io_err(src, source))?;
        let len = file
            .metadata()
            .map_err(|source| io_err(src, source))?
            .len();
        let mode = if kiln_util::hash::is_executable(src) {
            0o755
        } else {
            0o644
        };
        let mut header = header(EntryType::Regular, mode, len);
        self.builder
            .append_data(&mut header, path, &mut file)
            .map_err(|source| io_err(src, source))
    }

    fn symlink(&mut self, src: &Path, path: &str) -> Result<(), BundleError> {
        let target = std::fs::read_link(src).map_err(|source| io_err(src, source))?;
        let mut header = header(EntryType::Symlink, 0o777, 0);
        self.builder
            .append_link(&mut header, path, &target)
            .map_err(|source| io_err(src, source))
    }

    /// Append a file, symlink, or directory tree (walked in sorted order).
    fn tree(&mut self, src: &Path, dest: &str) -> Result<(), BundleError> {
        let meta = std::fs::symlink_metadata(src).map_err(|source| io_err(src, source))?;
        if meta.file_type().is_symlink() {
            return self.symlink(src, dest);
        }
        if meta.is_file() {
            return self.file(src, dest);
        }
        for entry in WalkDir::new(src).sort_by_file_name().follow_links(false) {
            let entry = entry.map_err(|e| BundleError::Walk {
                path: src.display().to_string(),
                message: e.to_string(),
            })?;
            let Ok(rel) = entry.path().strip_prefix(src) else {
                continue;
            };
            let rel = kiln_util::hash::relative_slash_path(rel);
            let path = if rel.is_empty() {
                dest.to_owned()
            } else {
                format!("{dest}/{rel}")
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                self.dir(&path)?;
            } else if file_type.is_symlink() {
                self.symlink(entry.path(), &path)?;
            } else if file_type.is_file() {
                self.file(entry.path(), &path)?;
            }
        }
        Ok(())
    }
}

fn header(kind: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn io_err(path: &Path, source: std::io::Error) -> BundleError {
    BundleError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("no bundle named `{name}` in kiln.toml")]
    UnknownBundle { name: String },

    #[error("bundle `{bundle}` needs unit `{unit}` for {platform}, but the unit is not built for that platform")]
    NoInstance {
        bundle: String,
        unit: String,
        platform: String,
    },

    #[error("bundle `{bundle}`: entry `{second}` collides with `{first}` — give one of them a distinct `path`")]
    PathCollision {
        bundle: String,
        first: String,
        second: String,
    },

    #[error("bundle `{bundle}`: `{unit}` was not realized")]
    NotRealized { bundle: String, unit: String },

    #[error("cannot write bundle manifest: {message}")]
    Manifest { message: String },

    #[error("cannot walk {path}: {message}")]
    Walk { path: String, message: String },

    #[error("cannot write bundle entry {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("{0}")]
    Util(#[from] kiln_util::error::UtilError),
}

impl BundleError {
    /// Whether the error stems from the bundle declaration itself.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownBundle { .. } | Self::NoInstance { .. } | Self::PathCollision { .. }
        )
    }
}
