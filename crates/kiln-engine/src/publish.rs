//! Publishing bundles as release assets.
//!
//! Each release label has an index (`release.toml`) mapping target platforms
//! to the asset published for them and its SHA-256. Publishing is idempotent
//! per `(label, platform)`: identical content is a no-op and different
//! content is refused unless overwriting was requested. All conflicts are
//! detected before the first upload. The index is written after the assets,
//! and assets it no longer names are deleted after that.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;

/// File name of the per-label release index.
pub const INDEX_NAME: &str = "release.toml";

/// Environment variable holding the bearer token for [`HttpBackend`].
pub const TOKEN_VAR: &str = "KILN_RELEASE_TOKEN";

/// Where release assets are stored.
pub trait ReleaseBackend {
    /// Human-readable location, for messages.
    fn describe(&self) -> String;

    /// Fetch an asset of `label`. `Ok(None)` when it does not exist.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be reached or read.
    fn fetch(&self, label: &str, asset: &str) -> Result<Option<Vec<u8>>, PublishError>;

    /// Store an asset of `label`, replacing any previous content.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be written.
    fn upload(&self, label: &str, asset: &str, data: &[u8]) -> Result<(), PublishError>;

    /// Delete an asset of `label`. Deleting a missing asset succeeds.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be written.
    fn remove(&self, label: &str, asset: &str) -> Result<(), PublishError>;
}

/// Releases in a local directory: `<root>/<label>/<asset>`.
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ReleaseBackend for DirectoryBackend {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn fetch(&self, label: &str, asset: &str) -> Result<Option<Vec<u8>>, PublishError> {
        let path = self.root.join(label).join(asset);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PublishError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn upload(&self, label: &str, asset: &str, data: &[u8]) -> Result<(), PublishError> {
        let path = self.root.join(label).join(asset);
        kiln_util::fs::write_atomic(&path, data)?;
        Ok(())
    }

    fn remove(&self, label: &str, asset: &str) -> Result<(), PublishError> {
        let path = self.root.join(label).join(asset);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PublishError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

/// Releases behind an HTTP endpoint: `GET`/`PUT`/`DELETE <base>/<label>/<asset>`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            token,
        }
    }

    /// Like [`new`](Self::new), taking the token from `KILN_RELEASE_TOKEN`.
    pub fn from_env(base_url: &str) -> Self {
        let token = std::env::var(TOKEN_VAR).ok().filter(|t| !t.is_empty());
        Self::new(base_url, token)
    }

    pub fn url(&self, label: &str, asset: &str) -> String {
        format!("{}/{label}/{asset}", self.base_url)
    }

    fn agent() -> ureq::Agent {
        ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_connect(Some(std::time::Duration::from_secs(30)))
                .timeout_global(Some(std::time::Duration::from_secs(600)))
                .build(),
        )
    }

    fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }
}

impl ReleaseBackend for HttpBackend {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    fn fetch(&self, label: &str, asset: &str) -> Result<Option<Vec<u8>>, PublishError> {
        let url = self.url(label, asset);
        let mut request = Self::agent().get(&url);
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth);
        }
        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(404)) => return Ok(None),
            Err(e) => {
                return Err(PublishError::Http {
                    url,
                    message: e.to_string(),
                })
            }
        };
        let mut body = response.into_body();
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut body.as_reader(), &mut data).map_err(|e| {
            PublishError::Http {
                url: url.clone(),
                message: e.to_string(),
            }
        })?;
        Ok(Some(data))
    }

    fn upload(&self, label: &str, asset: &str, data: &[u8]) -> Result<(), PublishError> {
        let url = self.url(label, asset);
        let mut request = Self::agent().put(&url);
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth);
        }
        request
            .header("Content-Type", "application/octet-stream")
            .send(data)
            .map_err(|e| PublishError::Http {
                url: url.clone(),
                message: e.to_string(),
            })?;
        tracing::debug!(%url, bytes = data.len(), "uploaded");
        Ok(())
    }

    fn remove(&self, label: &str, asset: &str) -> Result<(), PublishError> {
        let url = self.url(label, asset);
        let mut request = Self::agent().delete(&url);
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth);
        }
        match request.call() {
            Ok(_) | Err(ureq::Error::StatusCode(404)) => {
                tracing::debug!(%url, "deleted");
                Ok(())
            }
            Err(e) => Err(PublishError::Http {
                url,
                message: e.to_string(),
            }),
        }
    }
}

/// One platform's entry in a release index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub sha256: String,
    pub bundle: String,
}

/// The `release.toml` of one label.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReleaseIndex {
    pub label: String,
    #[serde(default)]
    pub assets: BTreeMap<String, ReleaseAsset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAction {
    Published,
    /// Same content was already published.
    Unchanged,
    /// Different content was replaced because overwriting was requested.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedAsset {
    pub platform: String,
    pub asset: String,
    pub sha256: String,
    pub action: PublishAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub label: String,
    pub location: String,
    pub assets: Vec<PublishedAsset>,
}

/// Check a release label is usable as a single path segment.
///
/// # Errors
/// Returns an error naming the problem.
pub fn validate_label(label: &str) -> Result<(), PublishError> {
    let invalid = |reason: &str| PublishError::InvalidLabel {
        label: label.to_owned(),
        reason: reason.to_owned(),
    };
    if label.is_empty() {
        return Err(invalid("label is empty"));
    }
    if label == "." || label == ".." {
        return Err(invalid("label cannot be a relative directory"));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
    {
        return Err(invalid("only letters, digits, `.`, `_`, `-` and `+` are allowed"));
    }
    Ok(())
}

/// Publish `bundles` (one per platform) under `label`.
///
/// # Errors
/// Returns `ReleaseConflict` without uploading anything when a platform
/// already has different content and `overwrite` is false. Other errors come
/// from the backend or from reading the bundles.
pub fn publish(
    backend: &dyn ReleaseBackend,
    label: &str,
    bundles: &[Bundle],
    overwrite: bool,
) -> Result<PublishReport, PublishError> {
    validate_label(label)?;

    let mut index = match backend.fetch(label, INDEX_NAME)? {
        Some(data) => {
            let text = String::from_utf8_lossy(&data);
            toml::from_str::<ReleaseIndex>(&text).map_err(|e| PublishError::Index {
                label: label.to_owned(),
                message: e.to_string(),
            })?
        }
        None => ReleaseIndex {
            label: label.to_owned(),
            assets: BTreeMap::new(),
        },
    };

    // Decide every action before touching the backend.
    let mut pending: Vec<(PublishedAsset, Vec<u8>, String)> = Vec::with_capacity(bundles.len());
    let mut stale: Vec<String> = Vec::new();
    for bundle in bundles {
        let platform = bundle.platform.to_string();
        if pending.iter().any(|(a, _, _)| a.platform == platform) {
            return Err(PublishError::DuplicatePlatform { platform });
        }
        let asset = bundle.asset_name();
        let data = std::fs::read(&bundle.path).map_err(|source| PublishError::Io {
            path: bundle.path.display().to_string(),
            source,
        })?;
        let sha256 = kiln_util::hash::sha256_bytes(&data);

        let existing = match index.assets.get(&platform) {
            Some(entry) => Some((entry.sha256.clone(), entry.name.clone())),
            None => backend
                .fetch(label, &asset)?
                .map(|bytes| (kiln_util::hash::sha256_bytes(&bytes), asset.clone())),
        };
        let action = match existing {
            None => PublishAction::Published,
            Some((digest, name)) if digest == sha256 && name == asset => PublishAction::Unchanged,
            Some((digest, name)) if digest == sha256 || overwrite => {
                if name != asset {
                    stale.push(name);
                }
                PublishAction::Replaced
            }
            Some((digest, _)) => {
                return Err(PublishError::ReleaseConflict {
                    label: label.to_owned(),
                    platform,
                    existing: digest,
                    new: sha256,
                })
            }
        };
        pending.push((
            PublishedAsset {
                platform,
                asset,
                sha256,
                action,
            },
            data,
            bundle.name.clone(),
        ));
    }

    let mut index_changed = false;
    for (asset, data, bundle_name) in &pending {
        if asset.action != PublishAction::Unchanged {
            backend.upload(label, &asset.asset, data)?;
            tracing::info!(label, platform = %asset.platform, asset = %asset.asset, action = ?asset.action, "uploaded release asset");
        }
        let entry = ReleaseAsset {
            name: asset.asset.clone(),
            sha256: asset.sha256.clone(),
            bundle: bundle_name.clone(),
        };
        if index.assets.get(&asset.platform) != Some(&entry) {
            index.assets.insert(asset.platform.clone(), entry);
            index_changed = true;
        }
    }
    if index_changed {
        let text = toml::to_string_pretty(&index).map_err(|e| PublishError::Index {
            label: label.to_owned(),
            message: e.to_string(),
        })?;
        backend.upload(label, INDEX_NAME, text.as_bytes())?;
    }
    for name in &stale {
        if index.assets.values().any(|entry| &entry.name == name) {
            continue;
        }
        backend.remove(label, name)?;
        tracing::info!(label, asset = %name, "removed replaced release asset");
    }

    Ok(PublishReport {
        label: label.to_owned(),
        location: backend.describe(),
        assets: pending.into_iter().map(|(a, _, _)| a).collect(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid release label `{label}`: {reason}")]
    InvalidLabel { label: String, reason: String },

    #[error("release {label} already has a different {platform} asset (published sha256 {existing}, new {new}) — pass --overwrite to replace it")]
    ReleaseConflict {
        label: String,
        platform: String,
        existing: String,
        new: String,
    },

    #[error("more than one bundle given for {platform}")]
    DuplicatePlatform { platform: String },

    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("corrupt release index for {label}: {message}")]
    Index { label: String, message: String },

    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("{0}")]
    Util(#[from] kiln_util::error::UtilError),
}
