//! Layered configuration.
//!
//! Each source of configuration (built-in defaults, the user file
//! `~/.kiln/config.toml`, the project `[settings]` table, `KILN_*` environment
//! variables, command-line flags) produces a [`PartialSettings`]. Layers are
//! combined with [`PartialSettings::merge`], lowest first, and the result is
//! turned into the immutable [`Settings`] with [`PartialSettings::resolve`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_STORE_DIR: &str = ".kiln/store";
pub const DEFAULT_DIST_DIR: &str = "dist";
pub const DEFAULT_PATH: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin"];

/// How strongly builds are isolated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Cleared environment and staged inputs.
    #[default]
    Hermetic,
    /// Hermetic plus a `bwrap` mount/network namespace.
    Namespaced,
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hermetic => f.write_str("hermetic"),
            Self::Namespaced => f.write_str("namespaced"),
        }
    }
}

impl FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hermetic" => Ok(Self::Hermetic),
            "namespaced" => Ok(Self::Namespaced),
            other => Err(format!(
                "unknown sandbox mode `{other}`, expected `hermetic` or `namespaced`"
            )),
        }
    }
}

/// A user-supplied toolchain entry for one `"<host>:<target>"` pair.
///
/// Replaces the built-in entry for that pair when present.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolchainOverride {
    pub name: Option<String>,
    /// Target triple for cross pairs. Ignored for native pairs.
    pub triple: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library_dirs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_libs: BTreeMap<String, PathBuf>,
}

/// One configuration layer. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialSettings {
    pub jobs: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub store: Option<PathBuf>,
    pub dist: Option<PathBuf>,
    pub sandbox: Option<SandboxMode>,
    pub fail_fast: Option<bool>,
    pub path: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub toolchains: BTreeMap<String, ToolchainOverride>,
}

impl PartialSettings {
    /// Overlay `upper` on top of `self`. Fields set in `upper` win; toolchain
    /// entries merge by key with `upper` winning.
    #[must_use]
    pub fn merge(self, upper: PartialSettings) -> PartialSettings {
        let mut toolchains = self.toolchains;
        toolchains.extend(upper.toolchains);
        PartialSettings {
            jobs: upper.jobs.or(self.jobs),
            timeout_secs: upper.timeout_secs.or(self.timeout_secs),
            store: upper.store.or(self.store),
            dist: upper.dist.or(self.dist),
            sandbox: upper.sandbox.or(self.sandbox),
            fail_fast: upper.fail_fast.or(self.fail_fast),
            path: upper.path.or(self.path),
            toolchains,
        }
    }

    /// Read the user configuration file. A missing file is an empty layer.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn from_user_file(path: &Path) -> Result<Self, SettingsError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(SettingsError::Read {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        toml::from_str(&content).map_err(|e| SettingsError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Build a layer from `KILN_*` environment variables.
    ///
    /// Takes the variables as an iterator so callers can pass
    /// `std::env::vars()` or a fixed list.
    ///
    /// # Errors
    /// Returns an error naming the variable when a value cannot be parsed.
    pub fn from_env_vars<I>(vars: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut layer = Self::default();
        for (key, value) in vars {
            match key.as_str() {
                "KILN_JOBS" => layer.jobs = Some(parse_env(&key, &value)?),
                "KILN_TIMEOUT" => layer.timeout_secs = Some(parse_env(&key, &value)?),
                "KILN_STORE" => layer.store = Some(PathBuf::from(value)),
                "KILN_SANDBOX" => layer.sandbox = Some(parse_env(&key, &value)?),
                "KILN_FAIL_FAST" => layer.fail_fast = Some(parse_bool(&key, &value)?),
                _ => {}
            }
        }
        Ok(layer)
    }

    /// Fill unset fields with built-in defaults and validate.
    ///
    /// # Errors
    /// Returns an error if `jobs` or `timeout_secs` is zero.
    pub fn resolve(self) -> Result<Settings, SettingsError> {
        let jobs = match self.jobs {
            Some(0) => {
                return Err(SettingsError::Invalid {
                    message: "jobs must be at least 1".to_owned(),
                })
            }
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        };
        let timeout_secs = match self.timeout_secs {
            Some(0) => {
                return Err(SettingsError::Invalid {
                    message: "timeout_secs must be at least 1".to_owned(),
                })
            }
            Some(n) => n,
            None => DEFAULT_TIMEOUT_SECS,
        };
        Ok(Settings {
            jobs,
            timeout_secs,
            store: self.store.unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR)),
            dist: self.dist.unwrap_or_else(|| PathBuf::from(DEFAULT_DIST_DIR)),
            sandbox: self.sandbox.unwrap_or_default(),
            fail_fast: self.fail_fast.unwrap_or(false),
            path: self
                .path
                .unwrap_or_else(|| DEFAULT_PATH.iter().map(PathBuf::from).collect()),
            toolchains: self.toolchains,
        })
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| SettingsError::Env {
        var: key.to_owned(),
        value: value.to_owned(),
        message: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(SettingsError::Env {
            var: key.to_owned(),
            value: value.to_owned(),
            message: "expected a boolean (1/0, true/false, yes/no)".to_owned(),
        }),
    }
}

/// Fully resolved configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub jobs: usize,
    pub timeout_secs: u64,
    pub store: PathBuf,
    pub dist: PathBuf,
    pub sandbox: SandboxMode,
    pub fail_fast: bool,
    /// Directories that make up `PATH` inside builds.
    pub path: Vec<PathBuf>,
    pub toolchains: BTreeMap<String, ToolchainOverride>,
}

impl Settings {
    /// The store directory, resolved against the project root when relative.
    pub fn store_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.store)
    }

    /// The bundle output directory, resolved against the project root when relative.
    pub fn dist_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.dist)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value `{value}` for {var}: {message}")]
    Env {
        var: String,
        value: String,
        message: String,
    },
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}
