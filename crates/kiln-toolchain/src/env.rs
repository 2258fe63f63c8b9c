//! Build environment resolution.
//!
//! A [`BuildEnvironment`] is the complete, immutable description of the
//! toolchain-facing environment one derivation is built in. It is computed
//! from a `(host, target)` pair and the registry; nothing is executed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln_targets::Platform;

use crate::error::ToolchainError;
use crate::registry::ToolchainRegistry;

/// Variables that only ever appear in cross environments.
const CROSS_ONLY_VARS: &[&str] = &[
    "KILN_CROSS_TRIPLE",
    "CARGO_BUILD_TARGET",
    "LIBRARY_PATH",
    "PKG_CONFIG_ALLOW_CROSS",
    "PKG_CONFIG_LIBDIR",
    "PKG_CONFIG_SYSROOT_DIR",
];

/// Whether a variable name carries cross-compilation parameters.
pub fn is_cross_var(name: &str) -> bool {
    CROSS_ONLY_VARS.contains(&name)
        || (name.starts_with("CARGO_TARGET_") && name.ends_with("_LINKER"))
        || name.starts_with("KILN_RUNTIME_")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvKind {
    Native,
    /// Cross compilation with the toolchain's tool-prefix triple.
    Cross { triple: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnvironment {
    pub host: Platform,
    pub target: Platform,
    pub kind: EnvKind,
    pub toolchain: String,
    pub vars: BTreeMap<String, String>,
    /// `PATH` inside builds, in order: toolchain directories, then the
    /// configured directories.
    pub path_dirs: Vec<PathBuf>,
    pub library_dirs: Vec<PathBuf>,
    pub runtime_libs: BTreeMap<String, PathBuf>,
}

impl BuildEnvironment {
    pub fn is_cross(&self) -> bool {
        matches!(self.kind, EnvKind::Cross { .. })
    }

    /// Deterministic digest of everything in this environment.
    pub fn fingerprint(&self) -> String {
        let host = self.host.to_string();
        let target = self.target.to_string();
        let kind = match &self.kind {
            EnvKind::Native => "native".to_owned(),
            EnvKind::Cross { triple } => format!("cross:{triple}"),
        };
        let mut parts: Vec<String> = vec![host, target, kind, self.toolchain.clone()];
        parts.extend(self.vars.iter().map(|(k, v)| format!("var:{k}={v}")));
        parts.extend(self.path_dirs.iter().map(|p| format!("path:{}", p.display())));
        parts.extend(self.library_dirs.iter().map(|p| format!("lib:{}", p.display())));
        parts.extend(
            self.runtime_libs
                .iter()
                .map(|(k, p)| format!("runtime:{k}={}", p.display())),
        );
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        kiln_util::hash::sha256_multi(&refs)
    }

    /// `PATH` value for builds.
    pub fn path_var(&self) -> String {
        join_paths(&self.path_dirs)
    }
}

fn join_paths(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Upper-case a triple for use inside a variable name (`x86_64-pc-windows-gnu`
/// becomes `X86_64_PC_WINDOWS_GNU`).
fn triple_var_segment(triple: &str) -> String {
    triple
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Upper-case a name into a variable suffix. Characters other than ASCII
/// letters and digits become `_`, so distinct names can share a suffix.
pub fn env_name_segment(name: &str) -> String {
    triple_var_segment(name)
}

/// Resolve the environment for building on `host` for `target`.
///
/// `path_dirs` are the configured `PATH` directories; toolchain directories are
/// placed in front of them.
///
/// # Errors
/// Returns `UnsupportedTarget` when `host != target` and the registry has no
/// toolchain for the pair.
pub fn resolve_environment(
    host: &Platform,
    target: &Platform,
    registry: &ToolchainRegistry,
    path_dirs: &[PathBuf],
) -> Result<BuildEnvironment, ToolchainError> {
    let spec = registry
        .lookup(host, target)
        .ok_or_else(|| ToolchainError::UnsupportedTarget {
            host: host.to_string(),
            target: target.to_string(),
        })?;

    let mut dirs = spec.path.clone();
    for dir in path_dirs {
        if !dirs.contains(dir) {
            dirs.push(dir.clone());
        }
    }

    let mut vars = spec.vars.clone();
    vars.insert("KILN_HOST".to_owned(), host.to_string());
    vars.insert("KILN_TARGET".to_owned(), target.to_string());

    if host == target {
        vars.retain(|k, _| !is_cross_var(k));
        return Ok(BuildEnvironment {
            host: *host,
            target: *target,
            kind: EnvKind::Native,
            toolchain: spec.name,
            vars,
            path_dirs: dirs,
            library_dirs: spec.library_dirs,
            runtime_libs: BTreeMap::new(),
        });
    }

    let prefix = spec.triple.clone().unwrap_or_else(|| target.triple());
    let rust_triple = target.triple();
    vars.insert("KILN_CROSS_TRIPLE".to_owned(), prefix.clone());
    vars.insert("CARGO_BUILD_TARGET".to_owned(), rust_triple.clone());
    if let Some(cc) = vars.get("CC").cloned() {
        vars.insert(
            format!("CARGO_TARGET_{}_LINKER", triple_var_segment(&rust_triple)),
            cc,
        );
    }
    vars.insert("PKG_CONFIG_ALLOW_CROSS".to_owned(), "1".to_owned());
    if !spec.library_dirs.is_empty() {
        vars.insert("LIBRARY_PATH".to_owned(), join_paths(&spec.library_dirs));
        let pkgconfig: Vec<PathBuf> = spec
            .library_dirs
            .iter()
            .map(|d| d.join("pkgconfig"))
            .collect();
        vars.insert("PKG_CONFIG_LIBDIR".to_owned(), join_paths(&pkgconfig));
    }
    for (name, path) in &spec.runtime_libs {
        vars.insert(
            format!("KILN_RUNTIME_{}", env_name_segment(name)),
            path.display().to_string(),
        );
    }

    tracing::debug!(%host, %target, toolchain = %spec.name, triple = %prefix, "cross environment");

    Ok(BuildEnvironment {
        host: *host,
        target: *target,
        kind: EnvKind::Cross { triple: prefix },
        toolchain: spec.name,
        vars,
        path_dirs: dirs,
        library_dirs: spec.library_dirs,
        runtime_libs: spec.runtime_libs,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kiln_config::settings::ToolchainOverride;
    use proptest::prelude::*;

    fn platform(s: &str) -> Platform {
        s.parse().unwrap()
    }

    fn default_path() -> Vec<PathBuf> {
        vec![PathBuf::from("/usr/bin"), PathBuf::from("/bin")]
    }

    #[test]
    fn native_has_no_cross_parameters() {
        let host = platform("linux-x64");
        let env =
            resolve_environment(&host, &host, &ToolchainRegistry::builtin(), &default_path()).unwrap();
        assert!(!env.is_cross());
        assert_eq!(env.kind, EnvKind::Native);
        assert_eq!(env.vars.get("CC").map(String::as_str), Some("cc"));
        assert_eq!(env.vars.get("KILN_TARGET").map(String::as_str), Some("linux-x64"));
        assert!(env.vars.keys().all(|k| !is_cross_var(k)), "vars: {:?}", env.vars);
    }

    #[test]
    fn cross_windows_from_linux() {
        let env = resolve_environment(
            &platform("linux-x64"),
            &platform("windows-x64"),
            &ToolchainRegistry::builtin(),
            &default_path(),
        )
        .unwrap();
        assert!(env.is_cross());
        assert_eq!(env.toolchain, "mingw-w64");
        let get = |k: &str| env.vars.get(k).map(String::as_str);
        assert_eq!(get("KILN_CROSS_TRIPLE"), Some("x86_64-w64-mingw32"));
        assert_eq!(get("CARGO_BUILD_TARGET"), Some("x86_64-pc-windows-gnu"));
        assert_eq!(
            get("CARGO_TARGET_X86_64_PC_WINDOWS_GNU_LINKER"),
            Some("x86_64-w64-mingw32-gcc")
        );
        assert_eq!(get("LIBRARY_PATH"), Some("/usr/x86_64-w64-mingw32/lib"));
        assert_eq!(get("PKG_CONFIG_ALLOW_CROSS"), Some("1"));
    }

    #[test]
    fn cross_differs_from_native_fingerprint() {
        let registry = ToolchainRegistry::builtin();
        let host = platform("linux-x64");
        let native = resolve_environment(&host, &host, &registry, &default_path()).unwrap();
        let cross =
            resolve_environment(&host, &platform("windows-x64"), &registry, &default_path()).unwrap();
        assert_ne!(native.fingerprint(), cross.fingerprint());
    }

    #[test]
    fn unsupported_pair_errors() {
        let result = resolve_environment(
            &platform("linux-x64"),
            &platform("macos-arm64"),
            &ToolchainRegistry::builtin(),
            &default_path(),
        );
        assert!(matches!(result, Err(ToolchainError::UnsupportedTarget { .. })));
    }

    #[test]
    fn runtime_libs_exposed_for_cross() {
        let overrides = std::collections::BTreeMap::from([(
            "linux-x64:windows-x64".to_owned(),
            ToolchainOverride {
                triple: Some("x86_64-w64-mingw32".to_owned()),
                runtime_libs: BTreeMap::from([(
                    "raylib".to_owned(),
                    PathBuf::from("/opt/raylib-win64"),
                )]),
                path: vec![PathBuf::from("/opt/mingw/bin")],
                ..ToolchainOverride::default()
            },
        )]);
        let registry = ToolchainRegistry::builtin().with_overrides(&overrides).unwrap();
        let env = resolve_environment(
            &platform("linux-x64"),
            &platform("windows-x64"),
            &registry,
            &default_path(),
        )
        .unwrap();
        assert_eq!(
            env.vars.get("KILN_RUNTIME_RAYLIB").map(String::as_str),
            Some("/opt/raylib-win64")
        );
        assert_eq!(env.path_var(), "/opt/mingw/bin:/usr/bin:/bin");
    }

    #[test]
    fn native_override_cannot_inject_cross_vars() {
        let overrides = std::collections::BTreeMap::from([(
            "linux-x64:linux-x64".to_owned(),
            ToolchainOverride {
                vars: BTreeMap::from([
                    ("CC".to_owned(), "clang".to_owned()),
                    ("KILN_CROSS_TRIPLE".to_owned(), "bogus".to_owned()),
                ]),
                ..ToolchainOverride::default()
            },
        )]);
        let registry = ToolchainRegistry::builtin().with_overrides(&overrides).unwrap();
        let host = platform("linux-x64");
        let env = resolve_environment(&host, &host, &registry, &default_path()).unwrap();
        assert_eq!(env.vars.get("CC").map(String::as_str), Some("clang"));
        assert!(!env.vars.contains_key("KILN_CROSS_TRIPLE"));
    }

    fn any_platform() -> impl Strategy<Value = Platform> {
        proptest::sample::select(kiln_targets::KNOWN_PLATFORMS).prop_map(platform)
    }

    proptest! {
        #[test]
        fn cross_parameters_iff_platforms_differ(host in any_platform(), target in any_platform()) {
            let registry = ToolchainRegistry::builtin();
            if let Ok(env) = resolve_environment(&host, &target, &registry, &default_path()) {
                let has_cross = env.vars.keys().any(|k| is_cross_var(k));
                prop_assert_eq!(has_cross, host != target);
                prop_assert_eq!(env.is_cross(), host != target);
            } else {
                prop_assert!(host != target);
            }
        }

        #[test]
        fn fingerprint_is_stable(host in any_platform()) {
            let registry = ToolchainRegistry::builtin();
            let a = resolve_environment(&host, &host, &registry, &default_path()).unwrap();
            let b = resolve_environment(&host, &host, &registry, &default_path()).unwrap();
            prop_assert_eq!(a.fingerprint(), b.fingerprint());
        }
    }
}
