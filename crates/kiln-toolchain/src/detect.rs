//! Tool detection and version parsing for build environments.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::env::BuildEnvironment;

/// Variables whose values name programs that builds invoke.
const TOOL_VARS: &[&str] = &["CC", "CXX", "AR"];

/// Result of looking up one tool of a build environment.
#[derive(Debug, Clone)]
pub struct ToolProbe {
    /// Variable the tool was configured through (e.g. `CC`).
    pub var: String,
    /// Program name as configured.
    pub program: String,
    /// Absolute path, if the program is on the environment's `PATH`.
    pub location: Option<PathBuf>,
    /// Parsed version, if the program reported one.
    pub version: Option<String>,
}

impl ToolProbe {
    pub fn found(&self) -> bool {
        self.location.is_some()
    }
}

/// Check that the tools of `env` resolve on its own `PATH`.
///
/// Lookups use only the environment's `PATH` directories, so a tool that is
/// installed elsewhere on the host is reported missing: builds would not see it.
pub fn probe(env: &BuildEnvironment) -> Vec<ToolProbe> {
    let path_var = env.path_var();
    let cwd = std::env::temp_dir();
    TOOL_VARS
        .iter()
        .filter_map(|var| {
            let value = env.vars.get(*var)?;
            let program = value.split_whitespace().next()?.to_owned();
            let location = which::which_in(&program, Some(&path_var), &cwd).ok();
            let version = location.as_ref().and_then(|path| query_version(path));
            tracing::debug!(var = %var, program = %program, found = location.is_some(), "probe");
            Some(ToolProbe {
                var: (*var).to_owned(),
                program,
                location,
                version,
            })
        })
        .collect()
}

fn query_version(path: &Path) -> Option<String> {
    let output = kiln_util::process::run_command(Command::new(path).arg("--version")).ok()?;
    parse_version(output.first_line()?)
}

/// Parse a version number from a tool's `--version` banner.
///
/// Handles formats like:
/// - `gcc (GCC) 13.2.0`
/// - `clang version 17.0.6`
/// - `GNU ar (GNU Binutils) 2.41`
pub fn parse_version(raw: &str) -> Option<String> {
    raw.split_whitespace()
        .map(|token| token.trim_start_matches('v'))
        .find(|token| is_version_like(token))
        .map(str::to_owned)
}

fn is_version_like(s: &str) -> bool {
    let core = s.split('-').next().unwrap_or(s);
    let mut parts = core.split('.');
    let Some(major) = parts.next() else {
        return false;
    };
    let Some(minor) = parts.next() else {
        return false;
    };
    let rest: Vec<&str> = parts.collect();
    if rest.len() > 2 {
        return false;
    }
    std::iter::once(major)
        .chain(std::iter::once(minor))
        .chain(rest)
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
