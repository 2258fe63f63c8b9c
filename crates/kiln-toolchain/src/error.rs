//! Error types for kiln-toolchain.

/// Errors produced by toolchain resolution.
#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    /// No toolchain can build for `target` on `host`.
    #[error("unsupported target: no toolchain builds {target} on {host} — add a [settings.toolchains.\"{host}:{target}\"] entry")]
    UnsupportedTarget { host: String, target: String },

    /// A configured toolchain entry could not be interpreted.
    #[error("invalid toolchain entry \"{key}\": {message}")]
    InvalidOverride { key: String, message: String },

    /// A platform name failed to parse.
    #[error("{0}")]
    Target(#[from] kiln_targets::TargetError),
}
