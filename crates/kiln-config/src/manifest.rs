use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};

use crate::settings::PartialSettings;

/// File name of the project declaration.
pub const MANIFEST_FILE: &str = "kiln.toml";

/// The `kiln.toml` project declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub project: Project,
    /// Project-level configuration layer, merged above the user file.
    #[serde(default)]
    pub settings: PartialSettings,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceDecl>,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageDecl>,
    #[serde(default)]
    pub units: BTreeMap<String, UnitDecl>,
    #[serde(default)]
    pub bundles: BTreeMap<String, BundleDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    pub name: String,
}

/// A filtered source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDecl {
    /// Root of the tree, relative to the project directory.
    #[serde(default = "default_source_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    /// Whether the built-in exclude list applies.
    #[serde(default = "default_true")]
    pub default_excludes: bool,
}

fn default_source_path() -> String {
    ".".to_owned()
}

fn default_true() -> bool {
    true
}

/// An external, pre-built input (a directory or file supplied by a package
/// registry or overlay).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageDecl {
    pub path: String,
}

/// A build unit. Expands to one derivation per target platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Dependency units, in declared order. Order is part of the identifier.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl UnitDecl {
    /// Whether the unit fans out over a platform matrix.
    pub fn is_matrix(&self) -> bool {
        self.targets.is_some()
    }

    /// The platform names this unit is declared for. `None` entries mean
    /// "the platform requested by the caller".
    pub fn declared_targets(&self) -> Vec<Option<&str>> {
        match (&self.target, &self.targets) {
            (_, Some(list)) => list.iter().map(|t| Some(t.as_str())).collect(),
            (Some(t), None) => vec![Some(t.as_str())],
            (None, None) => vec![None],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleDecl {
    pub contents: Vec<BundleEntryDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleEntryDecl {
    pub unit: String,
    pub output: String,
    /// Path inside the bundle. Defaults to the output name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl BundleEntryDecl {
    pub fn bundle_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.output)
    }
}

impl Manifest {
    /// Read, parse and validate a `kiln.toml` from the given path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, contains invalid TOML, or
    /// fails validation.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content, &path.display().to_string())
    }

    /// Parse and validate declaration text. `origin` names the source in errors.
    ///
    /// # Errors
    /// Returns an error if the text is not valid TOML or fails validation.
    pub fn from_toml(content: &str, origin: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(content).map_err(|e| ManifestError::Parse {
            path: origin.to_owned(),
            source: e,
        })?;
        manifest.validate().map_err(|message| ManifestError::Invalid {
            path: origin.to_owned(),
            message,
        })?;
        Ok(manifest)
    }

    /// Check the structural rules that serde cannot express.
    ///
    /// References to undeclared sources, packages and dependency units are
    /// left to graph construction, which reports them with the referring unit.
    fn validate(&self) -> Result<(), String> {
        if self.project.name.trim().is_empty() {
            return Err("project.name must not be empty".to_owned());
        }

        for (name, unit) in &self.units {
            if name.is_empty() {
                return Err("unit names must not be empty".to_owned());
            }
            if name.contains('@') {
                return Err(format!(
                    "unit `{name}` contains `@`, which is reserved for platform instances"
                ));
            }
            if unit.command.trim().is_empty() {
                return Err(format!("unit `{name}` has an empty command"));
            }
            if unit.target.is_some() && unit.targets.is_some() {
                return Err(format!(
                    "unit `{name}` sets both `target` and `targets`; use one"
                ));
            }
            if let Some(targets) = &unit.targets {
                if targets.is_empty() {
                    return Err(format!("unit `{name}` has an empty `targets` list"));
                }
                if let Some(dup) = first_duplicate(targets) {
                    return Err(format!("unit `{name}` lists target `{dup}` twice"));
                }
            }
            if let Some(dup) = first_duplicate(&unit.deps) {
                return Err(format!("unit `{name}` lists dependency `{dup}` twice"));
            }
            if let Some(dup) = first_duplicate(&unit.outputs) {
                return Err(format!("unit `{name}` declares output `{dup}` twice"));
            }
            for output in &unit.outputs {
                if !is_clean_relative(output) {
                    return Err(format!(
                        "unit `{name}` output `{output}` must be a relative path without `..`"
                    ));
                }
            }
            if unit.timeout_secs == Some(0) {
                return Err(format!("unit `{name}` has timeout_secs = 0"));
            }
        }

        for (name, bundle) in &self.bundles {
            if bundle.contents.is_empty() {
                return Err(format!("bundle `{name}` has no contents"));
            }
            for entry in &bundle.contents {
                let Some(unit) = self.units.get(&entry.unit) else {
                    return Err(format!(
                        "bundle `{name}` references undeclared unit `{}`",
                        entry.unit
                    ));
                };
                if !unit.outputs.contains(&entry.output) {
                    return Err(format!(
                        "bundle `{name}` references output `{}` which unit `{}` does not declare",
                        entry.output, entry.unit
                    ));
                }
                if !is_clean_relative(entry.bundle_path()) {
                    return Err(format!(
                        "bundle `{name}` entry path `{}` must be a relative path without `..`",
                        entry.bundle_path()
                    ));
                }
            }
        }

        Ok(())
    }
}

fn first_duplicate(items: &[String]) -> Option<&str> {
    let mut seen = BTreeSet::new();
    items
        .iter()
        .find(|item| !seen.insert(item.as_str()))
        .map(String::as_str)
}

/// A relative path made only of normal components, with at least one.
fn is_clean_relative(path: &str) -> bool {
    let mut normal = 0usize;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            _ => return false,
        }
    }
    normal > 0
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid kiln.toml at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid kiln.toml at {path}: {message}")]
    Invalid { path: String, message: String },
}
