//! Known toolchains keyed by (host, target) platform pair.

use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln_config::settings::ToolchainOverride;
use kiln_targets::Platform;

use crate::error::ToolchainError;

/// Description of one toolchain: the compilers and search paths it provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainSpec {
    pub name: String,
    /// GNU-style tool prefix triple (e.g. `x86_64-w64-mingw32`). `None` for
    /// native toolchains.
    pub triple: Option<String>,
    /// Variables such as `CC`, `CXX`, `AR`, `CFLAGS`.
    pub vars: BTreeMap<String, String>,
    /// Directories prepended to `PATH` inside builds.
    pub path: Vec<PathBuf>,
    pub library_dirs: Vec<PathBuf>,
    /// Libraries built for the target platform, exposed as `KILN_RUNTIME_<NAME>`.
    pub runtime_libs: BTreeMap<String, PathBuf>,
}

impl ToolchainSpec {
    /// The host system's own C toolchain.
    pub fn system_native() -> Self {
        Self {
            name: "system".to_owned(),
            triple: None,
            vars: tools("cc", "c++", "ar"),
            path: Vec::new(),
            library_dirs: Vec::new(),
            runtime_libs: BTreeMap::new(),
        }
    }

    fn gnu_cross(name: &str, prefix: &str, sysroot: &str) -> Self {
        let lib = PathBuf::from(sysroot).join("lib");
        Self {
            name: name.to_owned(),
            triple: Some(prefix.to_owned()),
            vars: tools(
                &format!("{prefix}-gcc"),
                &format!("{prefix}-g++"),
                &format!("{prefix}-ar"),
            ),
            path: Vec::new(),
            library_dirs: vec![lib],
            runtime_libs: BTreeMap::new(),
        }
    }

    fn apple_cross(arch_triple: &str) -> Self {
        let mut vars = tools("clang", "clang++", "ar");
        let flag = format!("-target {arch_triple}");
        vars.insert("CFLAGS".to_owned(), flag.clone());
        vars.insert("CXXFLAGS".to_owned(), flag.clone());
        vars.insert("LDFLAGS".to_owned(), flag);
        Self {
            name: "apple-clang".to_owned(),
            triple: Some(arch_triple.to_owned()),
            vars,
            path: Vec::new(),
            library_dirs: Vec::new(),
            runtime_libs: BTreeMap::new(),
        }
    }

    fn from_override(key: &str, entry: &ToolchainOverride, native: bool) -> Result<Self, ToolchainError> {
        if !native && entry.triple.is_none() {
            return Err(ToolchainError::InvalidOverride {
                key: key.to_owned(),
                message: "cross toolchain entries must set `triple`".to_owned(),
            });
        }
        let mut vars = if native {
            tools("cc", "c++", "ar")
        } else {
            BTreeMap::new()
        };
        vars.extend(entry.vars.clone());
        Ok(Self {
            name: entry.name.clone().unwrap_or_else(|| key.to_owned()),
            triple: if native { None } else { entry.triple.clone() },
            vars,
            path: entry.path.clone(),
            library_dirs: entry.library_dirs.clone(),
            runtime_libs: entry.runtime_libs.clone(),
        })
    }
}

fn tools(cc: &str, cxx: &str, ar: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("CC".to_owned(), cc.to_owned()),
        ("CXX".to_owned(), cxx.to_owned()),
        ("AR".to_owned(), ar.to_owned()),
    ])
}

/// Table of toolchains, looked up by `(host, target)`.
///
/// Native pairs (`host == target`) always resolve: a missing entry falls back
/// to [`ToolchainSpec::system_native`]. Cross pairs resolve only when an entry
/// exists.
#[derive(Debug, Clone, Default)]
pub struct ToolchainRegistry {
    entries: BTreeMap<(Platform, Platform), ToolchainSpec>,
}

impl ToolchainRegistry {
    /// The registry with kiln's built-in cross toolchains.
    pub fn builtin() -> Self {
        let p = |s: &str| s.parse::<Platform>();
        let mut registry = Self::default();
        let builtin = [
            (
                "linux-x64",
                "windows-x64",
                ToolchainSpec::gnu_cross("mingw-w64", "x86_64-w64-mingw32", "/usr/x86_64-w64-mingw32"),
            ),
            (
                "linux-x64",
                "linux-arm64",
                ToolchainSpec::gnu_cross("aarch64-linux-gnu", "aarch64-linux-gnu", "/usr/aarch64-linux-gnu"),
            ),
            (
                "linux-x64",
                "linux-x64-musl",
                ToolchainSpec::gnu_cross("musl-cross", "x86_64-linux-musl", "/usr/x86_64-linux-musl"),
            ),
            ("macos-arm64", "macos-x64", ToolchainSpec::apple_cross("x86_64-apple-darwin")),
            ("macos-x64", "macos-arm64", ToolchainSpec::apple_cross("arm64-apple-darwin")),
        ];
        for (host, target, spec) in builtin {
            if let (Ok(host), Ok(target)) = (p(host), p(target)) {
                registry.entries.insert((host, target), spec);
            }
        }
        registry
    }

    /// Apply user-configured entries keyed `"<host>:<target>"`, replacing any
    /// entry for the same pair.
    ///
    /// # Errors
    /// Returns an error if a key is malformed, names an unknown platform, or a
    /// cross entry lacks a triple.
    pub fn with_overrides(
        mut self,
        overrides: &BTreeMap<String, ToolchainOverride>,
    ) -> Result<Self, ToolchainError> {
        for (key, entry) in overrides {
            let Some((host, target)) = key.split_once(':') else {
                return Err(ToolchainError::InvalidOverride {
                    key: key.clone(),
                    message: "expected \"<host>:<target>\"".to_owned(),
                });
            };
            let host: Platform = host.parse()?;
            let target: Platform = target.parse()?;
            let spec = ToolchainSpec::from_override(key, entry, host == target)?;
            tracing::debug!(%host, %target, toolchain = %spec.name, "toolchain override");
            self.entries.insert((host, target), spec);
        }
        Ok(self)
    }

    /// Find the toolchain building for `target` on `host`.
    pub fn lookup(&self, host: &Platform, target: &Platform) -> Option<ToolchainSpec> {
        match self.entries.get(&(*host, *target)) {
            Some(spec) => Some(spec.clone()),
            None if host == target => Some(ToolchainSpec::system_native()),
            None => None,
        }
    }

    /// Targets reachable from `host`, in sorted order, including `host` itself.
    pub fn targets_for(&self, host: &Platform) -> Vec<Platform> {
        let mut targets: Vec<Platform> = self
            .entries
            .keys()
            .filter(|(h, _)| h == host)
            .map(|(_, t)| *t)
            .collect();
        if !targets.contains(host) {
            targets.push(*host);
        }
        targets.sort();
        targets
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn platform(s: &str) -> Platform {
        s.parse().unwrap()
    }

    #[test]
    fn native_always_resolves() {
        let registry = ToolchainRegistry::default();
        for name in kiln_targets::KNOWN_PLATFORMS {
            let p = platform(name);
            let spec = registry.lookup(&p, &p).unwrap();
            assert_eq!(spec.name, "system");
            assert!(spec.triple.is_none());
        }
    }

    #[test]
    fn builtin_mingw_pair() {
        let registry = ToolchainRegistry::builtin();
        let spec = registry
            .lookup(&platform("linux-x64"), &platform("windows-x64"))
            .unwrap();
        assert_eq!(spec.triple.as_deref(), Some("x86_64-w64-mingw32"));
        assert_eq!(
            spec.vars.get("CC").map(String::as_str),
            Some("x86_64-w64-mingw32-gcc")
        );
    }

    #[test]
    fn unknown_cross_pair_is_none() {
        let registry = ToolchainRegistry::builtin();
        assert!(registry
            .lookup(&platform("linux-x64"), &platform("macos-arm64"))
            .is_none());
    }

    #[test]
    fn override_replaces_builtin() {
        let overrides = BTreeMap::from([(
            "linux-x64:windows-x64".to_owned(),
            ToolchainOverride {
                name: Some("llvm-mingw".to_owned()),
                triple: Some("x86_64-w64-mingw32".to_owned()),
                vars: BTreeMap::from([("CC".to_owned(), "x86_64-w64-mingw32-clang".to_owned())]),
                path: vec![PathBuf::from("/opt/llvm-mingw/bin")],
                ..ToolchainOverride::default()
            },
        )]);
        let registry = ToolchainRegistry::builtin().with_overrides(&overrides).unwrap();
        let spec = registry
            .lookup(&platform("linux-x64"), &platform("windows-x64"))
            .unwrap();
        assert_eq!(spec.name, "llvm-mingw");
        assert_eq!(spec.path, vec![PathBuf::from("/opt/llvm-mingw/bin")]);
    }

    #[test]
    fn override_adds_new_pair() {
        let overrides = BTreeMap::from([(
            "linux-x64:macos-arm64".to_owned(),
            ToolchainOverride {
                triple: Some("aarch64-apple-darwin".to_owned()),
                ..ToolchainOverride::default()
            },
        )]);
        let registry = ToolchainRegistry::builtin().with_overrides(&overrides).unwrap();
        let spec = registry
            .lookup(&platform("linux-x64"), &platform("macos-arm64"))
            .unwrap();
        assert_eq!(spec.name, "linux-x64:macos-arm64");
    }

    #[test]
    fn override_cross_without_triple_rejected() {
        let overrides = BTreeMap::from([(
            "linux-x64:windows-x64".to_owned(),
            ToolchainOverride::default(),
        )]);
        let err = ToolchainRegistry::builtin().with_overrides(&overrides).unwrap_err();
        assert!(err.to_string().contains("triple"), "error was: {err}");
    }

    #[test]
    fn override_malformed_key_rejected() {
        let overrides = BTreeMap::from([("linux-x64".to_owned(), ToolchainOverride::default())]);
        assert!(matches!(
            ToolchainRegistry::builtin().with_overrides(&overrides),
            Err(ToolchainError::InvalidOverride { .. })
        ));
    }

    #[test]
    fn targets_for_includes_host() {
        let registry = ToolchainRegistry::builtin();
        let targets = registry.targets_for(&platform("linux-x64"));
        assert!(targets.contains(&platform("linux-x64")));
        assert!(targets.contains(&platform("windows-x64")));
        assert!(!targets.contains(&platform("macos-x64")));
    }
}
