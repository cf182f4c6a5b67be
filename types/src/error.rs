use std::time::Duration;

use thiserror::Error;

/// Failure of one source for one file.
///
/// Always isolated to that source's contribution; the aggregation path keeps
/// whatever the other sources produced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The backend could not be started or failed its handshake.
    #[error("backend unavailable: {backend}: {reason}")]
    Unavailable { backend: String, reason: String },
    /// A single call exceeded its deadline.
    #[error("backend timed out: {backend} after {elapsed:?}")]
    Timeout { backend: String, elapsed: Duration },
    /// The backend answered with something that could not be parsed at all.
    #[error("malformed output from {backend}: {reason}")]
    Malformed { backend: String, reason: String },
    /// The backend crashed or exited with an unexpected status.
    /// `retryable` means a later pass may succeed (e.g. session restarting).
    #[error("backend failed: {backend}: {reason}")]
    Failed {
        backend: String,
        reason: String,
        retryable: bool,
    },
}

impl SourceError {
    #[must_use]
    pub fn backend(&self) -> &str {
        match self {
            Self::Unavailable { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::Malformed { backend, .. }
            | Self::Failed { backend, .. } => backend,
        }
    }

    /// Whether the backend may succeed on a later pass.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } => true,
            Self::Malformed { .. } => false,
            Self::Failed { retryable, .. } => *retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_name_and_retry_policy() {
        let e = SourceError::Timeout {
            backend: "ruff".into(),
            elapsed: Duration::from_secs(5),
        };
        assert_eq!(e.backend(), "ruff");
        assert!(e.is_retryable());

        let e = SourceError::Malformed {
            backend: "mypy".into(),
            reason: "not json".into(),
        };
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("mypy"));
    }
}
