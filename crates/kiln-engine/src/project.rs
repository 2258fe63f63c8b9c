//! A loaded project: declaration, merged settings and toolchains.

use std::path::{Path, PathBuf};

use kiln_config::manifest::MANIFEST_FILE;
use kiln_config::{Manifest, PartialSettings, SandboxMode, Settings};
use kiln_sandbox::CancelToken;
use kiln_targets::{host_platform, resolve_platform, Platform};
use kiln_toolchain::ToolchainRegistry;

use crate::error::EngineError;
use crate::graph::DerivationGraph;
use crate::realize::RealizeOptions;

/// Name of the user configuration file inside `~/.kiln`.
pub const USER_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub manifest: Manifest,
    pub settings: Settings,
    pub host: Platform,
    pub registry: ToolchainRegistry,
}

impl Project {
    /// Load the project at `root`, merging configuration layers lowest first:
    /// built-in defaults, `~/.kiln/config.toml`, the manifest's `[settings]`,
    /// `KILN_*` environment variables, then `cli`. When no layer names a
    /// sandbox mode, `namespaced` is used if `bwrap` is installed.
    ///
    /// # Errors
    /// Returns an error if the manifest is missing or invalid, a layer cannot
    /// be parsed, or the host platform is unsupported.
    pub fn load(root: &Path, cli: PartialSettings) -> Result<Self, EngineError> {
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(EngineError::NoManifest {
                path: root.display().to_string(),
            });
        }
        let manifest = Manifest::from_path(&manifest_path)?;

        let user = match kiln_util::fs::kiln_home() {
            Ok(home) => PartialSettings::from_user_file(&home.join(USER_CONFIG_FILE))?,
            Err(_) => PartialSettings::default(),
        };
        let env = PartialSettings::from_env_vars(std::env::vars())?;
        let mut merged = user.merge(manifest.settings.clone()).merge(env).merge(cli);
        apply_sandbox_default(&mut merged, kiln_sandbox::bwrap_available().is_some());
        let settings = merged.resolve()?;

        Self::from_parts(root, manifest, settings, host_platform()?)
    }

    /// Assemble a project from already-resolved parts.
    ///
    /// # Errors
    /// Returns an error if a configured toolchain entry is invalid.
    pub fn from_parts(
        root: &Path,
        manifest: Manifest,
        settings: Settings,
        host: Platform,
    ) -> Result<Self, EngineError> {
        let registry = ToolchainRegistry::builtin().with_overrides(&settings.toolchains)?;
        tracing::debug!(root = %root.display(), %host, jobs = settings.jobs, "loaded project");
        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            settings,
            host,
            registry,
        })
    }

    /// Build the derivation graph. Units without a declared target are built
    /// for `target` (default: the host).
    ///
    /// # Errors
    /// Returns an error if `target` is unknown or the graph is invalid.
    pub fn graph(&self, target: Option<&str>) -> Result<DerivationGraph, EngineError> {
        let default_target = match target {
            Some(name) => resolve_platform(name, &self.host)?,
            None => self.host,
        };
        Ok(DerivationGraph::build(
            &self.manifest,
            &default_target,
            &self.host,
        )?)
    }

    pub fn realize_options(&self, cancel: CancelToken) -> RealizeOptions {
        RealizeOptions {
            jobs: self.settings.jobs,
            timeout: std::time::Duration::from_secs(self.settings.timeout_secs),
            fail_fast: self.settings.fail_fast,
            sandbox: self.settings.sandbox,
            cancel,
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.settings.store_dir(&self.root)
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.settings.dist_dir(&self.root)
    }
}

/// Fill in the sandbox mode when no configuration layer chose one.
fn apply_sandbox_default(settings: &mut PartialSettings, bwrap_available: bool) {
    if settings.sandbox.is_some() {
        return;
    }
    let mode = if bwrap_available {
        SandboxMode::Namespaced
    } else {
        tracing::warn!(
            "bwrap not found; builds run in hermetic mode and can read the host filesystem \
             and reach the network (install bubblewrap or set sandbox = \"hermetic\" to silence)"
        );
        SandboxMode::Hermetic
    };
    settings.sandbox = Some(mode);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_project(dir: &Path, extra: &str) {
        std::fs::write(
            dir.join(MANIFEST_FILE),
            format!("[project]\nname = \"p\"\n{extra}[units.a]\ncommand = \"true\"\n"),
        )
        .unwrap();
    }

    #[test]
    fn load_without_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Project::load(dir.path(), PartialSettings::default()).unwrap_err();
        assert!(matches!(err, EngineError::NoManifest { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn cli_layer_overrides_manifest_settings() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "[settings]\njobs = 2\ntimeout_secs = 10\n");
        let cli = PartialSettings {
            jobs: Some(7),
            ..PartialSettings::default()
        };
        let project = Project::load(dir.path(), cli).unwrap();
        assert_eq!(project.settings.jobs, 7);
    }

    #[test]
    fn sandbox_defaults_to_namespaced_when_bwrap_exists() {
        let mut settings = PartialSettings::default();
        apply_sandbox_default(&mut settings, true);
        assert_eq!(settings.sandbox, Some(SandboxMode::Namespaced));

        let mut settings = PartialSettings::default();
        apply_sandbox_default(&mut settings, false);
        assert_eq!(settings.sandbox, Some(SandboxMode::Hermetic));
    }

    #[test]
    fn configured_sandbox_mode_is_kept() {
        let mut settings = PartialSettings {
            sandbox: Some(SandboxMode::Hermetic),
            ..PartialSettings::default()
        };
        apply_sandbox_default(&mut settings, true);
        assert_eq!(settings.sandbox, Some(SandboxMode::Hermetic));
    }

    #[test]
    fn graph_uses_requested_target() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "");
        let manifest = Manifest::from_path(&dir.path().join(MANIFEST_FILE)).unwrap();
        let settings = PartialSettings::default().resolve().unwrap();
        let host: Platform = "linux-x64".parse().unwrap();
        let project = Project::from_parts(dir.path(), manifest, settings, host).unwrap();

        let graph = project.graph(Some("windows-x64")).unwrap();
        assert_eq!(graph.node(0).unwrap().platform.to_string(), "windows-x64");
        let graph = project.graph(None).unwrap();
        assert_eq!(graph.node(0).unwrap().platform, host);
        assert!(project.graph(Some("plan9-x64")).is_err());
    }

    #[test]
    fn invalid_toolchain_override_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "");
        let manifest = Manifest::from_path(&dir.path().join(MANIFEST_FILE)).unwrap();
        let mut settings = PartialSettings::default().resolve().unwrap();
        settings.toolchains.insert(
            "linux-x64".to_owned(),
            kiln_config::settings::ToolchainOverride::default(),
        );
        let host: Platform = "linux-x64".parse().unwrap();
        let err = Project::from_parts(dir.path(), manifest, settings, host).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
