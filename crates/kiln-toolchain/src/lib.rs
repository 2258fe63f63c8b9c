//! Toolchain registry, build environment resolution and tool probing.

pub mod detect;
pub mod env;
pub mod error;
pub mod registry;

pub use detect::{probe, ToolProbe};
pub use env::{resolve_environment, BuildEnvironment, EnvKind};
pub use error::ToolchainError;
pub use registry::{ToolchainRegistry, ToolchainSpec};
