//! Derivation identifiers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Everything that determines what a derivation builds. Timeouts are not
/// inputs.
#[derive(Debug, Clone)]
pub struct DerivationInputs {
    /// Unit name as declared, without a platform suffix.
    pub unit: String,
    pub command: String,
    pub outputs: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Target platform name.
    pub platform: String,
    /// Fingerprint of the resolved build environment.
    pub env_fingerprint: String,
    pub snapshot_id: Option<String>,
    /// `(reference, derivation id)` per dependency, in declared order.
    pub deps: Vec<(String, DerivationId)>,
    /// `(package name, content digest)`, in declared order.
    pub packages: Vec<(String, String)>,
}

/// A content-addressed derivation identifier (SHA-256 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DerivationId(String);

impl DerivationId {
    /// Hash all inputs. Every part carries a field tag.
    pub fn compute(inputs: &DerivationInputs) -> Self {
        let mut parts: Vec<String> = vec![
            format!("unit:{}", inputs.unit),
            format!("command:{}", inputs.command),
            format!("platform:{}", inputs.platform),
            format!("env-fingerprint:{}", inputs.env_fingerprint),
            format!("source:{}", inputs.snapshot_id.as_deref().unwrap_or("")),
        ];
        parts.extend(inputs.outputs.iter().map(|o| format!("output:{o}")));
        parts.extend(inputs.env.iter().map(|(k, v)| format!("env:{k}={v}")));
        parts.extend(inputs.deps.iter().map(|(name, id)| format!("dep:{name}={id}")));
        parts.extend(
            inputs
                .packages
                .iter()
                .map(|(name, digest)| format!("package:{name}={digest}")),
        );
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        Self(kiln_util::hash::sha256_multi(&refs))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for display.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for DerivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for DerivationId {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}
