//! Error types for kiln-sandbox.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The namespaced mode was requested but `bwrap` is not installed.
    #[error("sandbox mode `namespaced` requires bwrap — install bubblewrap or set sandbox = \"hermetic\"")]
    Unavailable,

    /// The build process could not be started.
    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Waiting on or signalling the build process failed.
    #[error("cannot wait for build process: {source}")]
    Wait { source: std::io::Error },

    /// Interrupt handling could not be installed.
    #[error("cannot install interrupt handler: {message}")]
    Signal { message: String },

    /// The command has no working directory.
    #[error("sandbox command has no working directory")]
    NoWorkdir,

    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0}")]
    Util(#[from] kiln_util::error::UtilError),
}
