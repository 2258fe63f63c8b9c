//! Content-addressed store for source snapshots and derivation outputs.
//!
//! Layout under the store root:
//!
//! ```text
//! snapshots/<snapshot-id>/     filtered source trees
//! objects/<drv-id>/out/        declared outputs of a derivation
//! objects/<drv-id>/meta.toml   output digests and build metadata
//! logs/<drv-id>.log            combined build log of the last attempt
//! locks/<key>.lock             per-key exclusive locks
//! tmp/                         staging and scratch directories
//! ```
//!
//! Entries are immutable. A new entry is staged under `tmp/` and becomes
//! visible by a single rename, so readers never see a partial entry.
//! Registered objects are then sealed read-only.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

const META_FILE: &str = "meta.toml";

/// Metadata stored alongside a derivation's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub id: String,
    /// Graph node name (`<unit>` or `<unit>@<platform>`).
    pub name: String,
    pub platform: String,
    pub outputs: Vec<OutputMeta>,
    /// Epoch seconds timestamp of when the build was produced (e.g. "1708646400s-since-epoch").
    pub built_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMeta {
    pub name: String,
    pub digest: String,
}

/// An exclusive lock on one store key, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %e, "cannot release store lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) the store at `root`.
    ///
    /// # Errors
    /// Returns an error if the store directories cannot be created.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        for sub in ["snapshots", "objects", "logs", "locks", "tmp"] {
            kiln_util::fs::ensure_dir(&root.join(sub))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, id: &str) -> PathBuf {
        self.root.join("snapshots").join(id)
    }

    pub fn object_dir(&self, id: &str) -> PathBuf {
        self.root.join("objects").join(id)
    }

    /// Directory holding a derivation's declared outputs.
    pub fn object_out(&self, id: &str) -> PathBuf {
        self.object_dir(id).join("out")
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.root.join("logs").join(format!("{id}.log"))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Take the exclusive lock for `key`, blocking until it is available.
    ///
    /// Lock files are never deleted; deleting them would let two processes
    /// hold "the" lock on different inodes.
    ///
    /// # Errors
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn lock(&self, key: &str) -> Result<StoreLock, StoreError> {
        let path = self.root.join("locks").join(format!("{key}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| StoreError::Lock {
            path: path.display().to_string(),
            source,
        })?;
        Ok(StoreLock { file, path })
    }

    /// Look up a registered derivation.
    ///
    /// # Errors
    /// Returns an error if the entry exists but its metadata is unreadable.
    pub fn lookup(&self, id: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let meta_path = self.object_dir(id).join(META_FILE);
        let content = match std::fs::read_to_string(&meta_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: meta_path.display().to_string(),
                    source,
                })
            }
        };
        let meta = toml::from_str(&content).map_err(|e| StoreError::Metadata {
            path: meta_path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(meta))
    }

    pub fn has_snapshot(&self, id: &str) -> bool {
        self.snapshot_path(id).is_dir()
    }

    /// Create a private staging directory under `tmp/`, removed on drop.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn staging(&self, prefix: &str) -> Result<tempfile::TempDir, StoreError> {
        let tmp = self.tmp_dir();
        tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .tempdir_in(&tmp)
            .map_err(|source| StoreError::Io {
                path: tmp.display().to_string(),
                source,
            })
    }

    /// Register a staged derivation entry (an `out/` directory) under `id`.
    ///
    /// Writes `meta.toml` into the staged entry, renames it into place and
    /// clears its write bits. If another writer registered `id` first, the
    /// staged entry is discarded and the existing one is kept.
    ///
    /// # Errors
    /// Returns an error if the metadata cannot be written or the rename fails.
    pub fn register(&self, staged_entry: &Path, meta: &ObjectMeta) -> Result<(), StoreError> {
        let meta_path = staged_entry.join(META_FILE);
        let content = toml::to_string_pretty(meta).map_err(|e| StoreError::Metadata {
            path: meta_path.display().to_string(),
            message: e.to_string(),
        })?;
        kiln_util::fs::write_atomic(&meta_path, content.as_bytes())?;
        let dest = self.object_dir(&meta.id);
        if self.install(staged_entry, &dest)? {
            kiln_util::fs::make_read_only(&dest)?;
        }
        Ok(())
    }

    /// Install a staged snapshot tree under `id`. No-op if it already exists.
    ///
    /// # Errors
    /// Returns an error if the rename fails.
    pub fn install_snapshot(&self, staged: &Path, id: &str) -> Result<(), StoreError> {
        self.install(staged, &self.snapshot_path(id))?;
        Ok(())
    }

    /// Returns `false` when `dest` already existed and `staged` was discarded.
    fn install(&self, staged: &Path, dest: &Path) -> Result<bool, StoreError> {
        if dest.exists() {
            tracing::debug!(entry = %dest.display(), "entry already present, discarding staged copy");
            kiln_util::fs::remove_dir_all_if_exists(staged)?;
            return Ok(false);
        }
        match std::fs::rename(staged, dest) {
            Ok(()) => Ok(true),
            // Lost a race against a writer that does not share our lock.
            Err(_) if dest.exists() => {
                kiln_util::fs::remove_dir_all_if_exists(staged)?;
                Ok(false)
            }
            Err(source) => Err(StoreError::Io {
                path: dest.display().to_string(),
                source,
            }),
        }
    }

    /// Remove everything under `tmp/`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be recreated.
    pub fn clear_tmp(&self) -> Result<(), StoreError> {
        let tmp = self.tmp_dir();
        kiln_util::fs::remove_dir_all_if_exists(&tmp)?;
        kiln_util::fs::ensure_dir(&tmp)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot access store path {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot lock {path}: {source}")]
    Lock {
        path: String,
        source: std::io::Error,
    },

    #[error("corrupt store metadata at {path}: {message} — run `kiln clean` to reset the store")]
    Metadata { path: String, message: String },

    #[error("{0}")]
    Util(#[from] kiln_util::error::UtilError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Barrier};

    use super::*;

    fn meta(id: &str) -> ObjectMeta {
        ObjectMeta {
            id: id.to_owned(),
            name: "app".to_owned(),
            platform: "linux-x64".to_owned(),
            outputs: vec![OutputMeta {
                name: "bin".to_owned(),
                digest: "abc".to_owned(),
            }],
            built_at: "0s-since-epoch".to_owned(),
            duration_ms: 5,
        }
    }

    fn stage_entry(store: &ContentStore, content: &str) -> tempfile::TempDir {
        let staged = store.staging("entry").unwrap();
        fs::create_dir_all(staged.path().join("out")).unwrap();
        fs::write(staged.path().join("out/bin"), content).unwrap();
        staged
    }

    #[test]
    fn open_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(&tmp.path().join("store")).unwrap();
        for sub in ["snapshots", "objects", "logs", "locks", "tmp"] {
            assert!(store.root().join(sub).is_dir(), "missing {sub}");
        }
    }

    #[test]
    fn lookup_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        assert!(store.lookup("deadbeef").unwrap().is_none());
    }

    #[test]
    fn register_then_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let staged = stage_entry(&store, "binary");

        store.register(staged.path(), &meta("id1")).unwrap();

        assert_eq!(store.lookup("id1").unwrap(), Some(meta("id1")));
        assert_eq!(
            fs::read_to_string(store.object_out("id1").join("bin")).unwrap(),
            "binary"
        );
        assert!(!staged.path().exists());
    }

    #[test]
    fn second_register_keeps_first_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();

        let first = stage_entry(&store, "first");
        store.register(first.path(), &meta("same")).unwrap();
        let second = stage_entry(&store, "second");
        store.register(second.path(), &meta("same")).unwrap();

        assert_eq!(
            fs::read_to_string(store.object_out("same").join("bin")).unwrap(),
            "first"
        );
        assert!(!second.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn registered_objects_are_sealed_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let staged = stage_entry(&store, "binary");
        store.register(staged.path(), &meta("sealed")).unwrap();

        for path in [
            store.object_dir("sealed"),
            store.object_out("sealed"),
            store.object_out("sealed").join("bin"),
            store.object_dir("sealed").join("meta.toml"),
        ] {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o222, 0, "{} is writable", path.display());
        }

        kiln_util::fs::remove_dir_all_if_exists(store.root()).unwrap();
        assert!(!store.root().exists());
    }

    #[test]
    fn staging_dirs_are_cleaned_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let path = {
            let staged = store.staging("x").unwrap();
            staged.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_meta_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        fs::create_dir_all(store.object_dir("bad")).unwrap();
        fs::write(store.object_dir("bad").join("meta.toml"), "not = [valid").unwrap();
        let err = store.lookup("bad").unwrap_err();
        assert!(err.to_string().contains("kiln clean"), "error was: {err}");
    }

    #[test]
    fn lock_serializes_holders() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ContentStore::open(tmp.path()).unwrap());
        let counter = Arc::new(std::sync::Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                let counter = Arc::clone(&counter);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let _lock = store.lock("shared").unwrap();
                    counter.lock().unwrap().push(("enter", i));
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    counter.lock().unwrap().push(("leave", i));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let events = counter.lock().unwrap();
        for pair in events.chunks(2) {
            let [(enter, a), (leave, b)] = pair else {
                panic!("unbalanced events: {events:?}");
            };
            assert_eq!((*enter, *leave), ("enter", "leave"));
            assert_eq!(a, b, "lock holders interleaved: {events:?}");
        }
    }

    #[test]
    fn clear_tmp_empties_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        fs::write(store.tmp_dir().join("leftover"), "x").unwrap();
        store.clear_tmp().unwrap();
        assert!(store.tmp_dir().is_dir());
        assert_eq!(fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
    }
}
