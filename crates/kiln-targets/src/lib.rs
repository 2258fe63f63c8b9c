//! Platform descriptions, host detection and target triple mapping for kiln.

use std::fmt;
use std::str::FromStr;

/// CPU architecture of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    /// Short name used in platform identifiers (`x64`, `arm64`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
        }
    }

    fn triple_prefix(self) -> &'static str {
        match self {
            Self::X64 => "x86_64",
            Self::Arm64 => "aarch64",
        }
    }
}

/// Operating system of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Os {
    Linux,
    Windows,
    Macos,
}

impl Os {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::Macos => "macos",
        }
    }

    /// The ABI assumed when a platform identifier does not name one.
    pub fn default_abi(self) -> Abi {
        match self {
            Self::Linux | Self::Windows => Abi::Gnu,
            Self::Macos => Abi::Darwin,
        }
    }
}

/// Binary interface / C library flavour of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Abi {
    Gnu,
    Musl,
    Msvc,
    Darwin,
}

impl Abi {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gnu => "gnu",
            Self::Musl => "musl",
            Self::Msvc => "msvc",
            Self::Darwin => "darwin",
        }
    }
}

/// A platform a build runs on (host) or produces artifacts for (target).
///
/// The textual form is `<os>-<arch>[-<abi>]`, e.g. `linux-x64`,
/// `windows-x64`, `linux-x64-musl`. The ABI is omitted when it is the OS
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Platform {
    pub arch: Arch,
    pub os: Os,
    pub abi: Abi,
}

impl Platform {
    /// Construct a platform with the OS-default ABI.
    pub fn new(os: Os, arch: Arch) -> Self {
        Self {
            arch,
            os,
            abi: os.default_abi(),
        }
    }

    /// The LLVM/Rust style target triple (e.g. `x86_64-pc-windows-gnu`).
    pub fn triple(&self) -> String {
        let arch = self.arch.triple_prefix();
        match (self.os, self.abi) {
            (Os::Linux, abi) => format!("{arch}-unknown-linux-{}", abi.as_str()),
            (Os::Windows, abi) => format!("{arch}-pc-windows-{}", abi.as_str()),
            (Os::Macos, _) => format!("{arch}-apple-darwin"),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os.as_str(), self.arch.as_str())?;
        if self.abi != self.os.default_abi() {
            write!(f, "-{}", self.abi.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || TargetError::UnknownPlatform {
            name: s.to_owned(),
        };
        let mut parts = s.split('-');
        let os = match parts.next() {
            Some("linux") => Os::Linux,
            Some("windows") => Os::Windows,
            Some("macos") => Os::Macos,
            _ => return Err(unknown()),
        };
        let arch = match parts.next() {
            Some("x64") => Arch::X64,
            Some("arm64") => Arch::Arm64,
            _ => return Err(unknown()),
        };
        let abi = match parts.next() {
            None => os.default_abi(),
            Some("gnu") => Abi::Gnu,
            Some("musl") if os == Os::Linux => Abi::Musl,
            Some("msvc") if os == Os::Windows => Abi::Msvc,
            Some(_) => return Err(unknown()),
        };
        if parts.next().is_some() {
            return Err(unknown());
        }
        if os == Os::Macos && abi != Abi::Darwin {
            return Err(unknown());
        }
        Ok(Self { arch, os, abi })
    }
}

/// Every platform identifier kiln understands, in display form.
pub const KNOWN_PLATFORMS: &[&str] = &[
    "linux-x64",
    "linux-arm64",
    "linux-x64-musl",
    "linux-arm64-musl",
    "windows-x64",
    "windows-x64-msvc",
    "windows-arm64",
    "macos-x64",
    "macos-arm64",
];

/// Detect the host platform.
///
/// Maps the Rust compile-time target to a kiln platform.
///
/// # Errors
/// Returns an error if the current OS/arch is not supported.
pub fn host_platform() -> Result<Platform, TargetError> {
    let os = match std::env::consts::OS {
        "linux" => Os::Linux,
        "windows" => Os::Windows,
        "macos" => Os::Macos,
        other => {
            return Err(TargetError::UnsupportedHost {
                os: other.to_owned(),
                arch: std::env::consts::ARCH.to_owned(),
            })
        }
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => Arch::X64,
        "aarch64" => Arch::Arm64,
        other => {
            return Err(TargetError::UnsupportedHost {
                os: std::env::consts::OS.to_owned(),
                arch: other.to_owned(),
            })
        }
    };
    let abi = if cfg!(target_env = "musl") {
        Abi::Musl
    } else if cfg!(target_env = "msvc") {
        Abi::Msvc
    } else {
        os.default_abi()
    };
    Ok(Platform { arch, os, abi })
}

/// Resolve a platform name, treating `"host"` as the detected host platform.
///
/// # Errors
/// Returns an error if the name is not a known platform or host detection fails.
pub fn resolve_platform(name: &str, host: &Platform) -> Result<Platform, TargetError> {
    if name == "host" {
        Ok(*host)
    } else {
        name.parse()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("unsupported host: {os}/{arch} — kiln has no platform description for it")]
    UnsupportedHost { os: String, arch: String },

    #[error("unknown platform `{name}` — expected one of: {}", KNOWN_PLATFORMS.join(", "))]
    UnknownPlatform { name: String },
}
