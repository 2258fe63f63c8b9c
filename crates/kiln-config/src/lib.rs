//! Parse and validate `kiln.toml` and layered kiln configuration.

pub mod manifest;
pub mod settings;

pub use manifest::Manifest;
pub use settings::{PartialSettings, SandboxMode, Settings};
