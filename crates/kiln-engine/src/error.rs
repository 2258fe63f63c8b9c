//! Error types for kiln-engine.

use crate::bundle::BundleError;
use crate::graph::GraphError;
use crate::publish::PublishError;
use crate::realize::RealizeError;
use crate::source::SourceError;
use crate::store::StoreError;

/// Errors produced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A filesystem operation failed.
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// A utility operation failed.
    #[error("{0}")]
    Util(#[from] kiln_util::error::UtilError),

    /// A manifest operation failed.
    #[error("{0}")]
    Manifest(#[from] kiln_config::manifest::ManifestError),

    #[error("{0}")]
    Settings(#[from] kiln_config::settings::SettingsError),

    #[error("{0}")]
    Target(#[from] kiln_targets::TargetError),

    #[error("{0}")]
    Toolchain(#[from] kiln_toolchain::ToolchainError),

    #[error("{0}")]
    Graph(#[from] GraphError),

    #[error("{0}")]
    Source(#[from] SourceError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Realize(#[from] RealizeError),

    #[error("{0}")]
    Bundle(#[from] BundleError),

    #[error("{0}")]
    Publish(#[from] PublishError),

    /// Some derivations did not realize.
    #[error("{failed} build(s) failed, {unbuildable} unbuildable, {cancelled} cancelled")]
    BuildsFailed {
        failed: usize,
        unbuildable: usize,
        cancelled: usize,
    },

    /// A project already exists at the target path.
    #[error("kiln.toml already exists at {path} — cannot initialize over an existing project")]
    ProjectExists { path: String },

    #[error("no kiln.toml found in {path} — run `kiln init` to create a project")]
    NoManifest { path: String },
}

impl EngineError {
    /// Process exit code for this error.
    ///
    /// 2 for configuration and graph errors, 3 for build failures, 4 for
    /// publish failures, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        use kiln_toolchain::ToolchainError;

        match self {
            Self::Manifest(_)
            | Self::Settings(_)
            | Self::Target(_)
            | Self::Graph(_)
            | Self::ProjectExists { .. }
            | Self::NoManifest { .. } => 2,
            Self::Toolchain(ToolchainError::UnsupportedTarget { .. }) => 3,
            Self::Toolchain(_) => 2,
            Self::Source(SourceError::Pattern { .. } | SourceError::MissingRoot { .. }) => 2,
            Self::Bundle(e) if e.is_configuration() => 2,
            Self::Realize(
                RealizeError::MissingPackage { .. }
                | RealizeError::UnknownUnit { .. }
                | RealizeError::Source(SourceError::Pattern { .. } | SourceError::MissingRoot { .. }),
            ) => 2,
            Self::Realize(_) | Self::BuildsFailed { .. } => 3,
            Self::Publish(_) => 4,
            _ => 1,
        }
    }
}
