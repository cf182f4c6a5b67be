use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a [`DiagnosticId`].
const ID_BYTES: usize = 12;

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Stable identity of a finding.
///
/// Derived from `(path, line, character, message, source)` so repeated scans
/// of unchanged content produce the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosticId(String);

impl DiagnosticId {
    #[must_use]
    pub fn derive(path: &Path, line: u32, character: u32, message: &str, source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(line.to_le_bytes());
        hasher.update(character.to_le_bytes());
        hasher.update(message.as_bytes());
        hasher.update([0]);
        hasher.update(source.as_bytes());
        let digest = hasher.finalize();
        Self(hex(&digest[..ID_BYTES]))
    }

    /// Wrap an id received from a caller (e.g. a `resolve_error` request).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiagnosticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content hash identifying the exact file state a diagnostic was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotVersion(String);

impl SnapshotVersion {
    #[must_use]
    pub fn of(content: &str) -> Self {
        Self(hex(&Sha256::digest(content.as_bytes())))
    }

    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
