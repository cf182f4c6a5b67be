//! Public types for the session layer.
//!
//! The engine builds [`ServerConfig`]s and [`SessionSettings`] from its
//! configuration file, acquires sessions through the manager, and reads
//! [`SessionStatus`] snapshots for health reporting.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for a single language server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Executable command (e.g. "pyright-langserver").
    pub command: String,
    /// Backend name stamped on diagnostics. Defaults to the command's file stem.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// LSP language identifier sent in `didOpen` (e.g. "python").
    pub language_id: String,
    /// File extensions this server handles, without the dot.
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Files that indicate a workspace root (e.g. `["pyproject.toml"]`).
    #[serde(default)]
    pub root_markers: Vec<String>,
}

impl ServerConfig {
    #[must_use]
    pub fn source_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            Path::new(&self.command)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&self.command)
                .to_string()
        })
    }

    #[must_use]
    pub fn handles_path(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.file_extensions.iter().any(|e| e == ext))
    }
}

/// Timeouts and restart policy for every session the manager owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    /// Zero disables the liveness monitor.
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive restarts allowed before the session stays dead.
    pub max_restarts: u32,
    /// A server that stays up this long clears its consecutive restart count.
    pub stable_after: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(2),
            max_restarts: 5,
            stable_after: Duration::from_secs(300),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl SessionSettings {
    /// Delay before restart number `attempt` (zero-based):
    /// `min(base * 2^attempt, max)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }
}

/// Health of one backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Ready,
    /// Alive but missed a liveness probe.
    Degraded,
    Dead,
}

impl SessionState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Dead => "dead",
        }
    }

    /// Whether requests may be sent to the session.
    #[must_use]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

/// Point-in-time view of a session, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub language: String,
    /// `None` until the language is first acquired.
    pub state: Option<SessionState>,
    pub restart_count: u32,
    /// Outstanding [`SessionHandle`](crate::SessionHandle)s.
    pub handles: usize,
    /// Set when the restart budget is spent; the session fails fast until shutdown.
    pub exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_for: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The server could not be launched or failed its handshake.
    #[error("language server for {language} unavailable: {reason}")]
    Unavailable { language: String, reason: String },
    #[error("{method} to {language} server timed out after {elapsed:?}")]
    Timeout {
        language: String,
        method: String,
        elapsed: Duration,
    },
    /// The connection dropped with the request in flight.
    #[error("{language} server connection lost")]
    Crashed { language: String },
    #[error("{language} server transport error: {reason}")]
    Transport { language: String, reason: String },
    #[error("no language server configured for {0}")]
    NotConfigured(String),
    #[error("session manager is shutting down")]
    ShuttingDown,
}

impl SessionError {
    /// Whether a later attempt may succeed once the session recovers.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Crashed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_from_toml_defaults() {
        let config: ServerConfig = toml_like(
            r#"{"command": "pyright-langserver", "language_id": "python", "file_extensions": ["py", "pyi"]}"#,
        );
        assert!(config.args.is_empty());
        assert!(config.root_markers.is_empty());
        assert!(config.handles_path(Path::new("src/a.py")));
        assert!(config.handles_path(Path::new("stubs/a.pyi")));
        assert!(!config.handles_path(Path::new("src/a.rs")));
        assert!(!config.handles_path(Path::new("Makefile")));
        assert_eq!(config.source_name(), "pyright-langserver");
    }

    #[test]
    fn source_name_prefers_explicit_name() {
        let mut config = toml_like(
            r#"{"command": "/opt/bin/pylsp.exe", "language_id": "python"}"#,
        );
        assert_eq!(config.source_name(), "pylsp");
        config.name = Some("pyright".into());
        assert_eq!(config.source_name(), "pyright");
    }

    fn toml_like(json: &str) -> ServerConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let settings = SessionSettings {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(3),
            ..SessionSettings::default()
        };
        assert_eq!(settings.backoff(0), Duration::from_millis(500));
        assert_eq!(settings.backoff(1), Duration::from_secs(1));
        assert_eq!(settings.backoff(2), Duration::from_secs(2));
        assert_eq!(settings.backoff(3), Duration::from_secs(3));
        assert_eq!(settings.backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn state_labels_and_usability() {
        assert_eq!(SessionState::Degraded.label(), "degraded");
        assert!(SessionState::Ready.is_usable());
        assert!(SessionState::Degraded.is_usable());
        assert!(!SessionState::Starting.is_usable());
        assert!(!SessionState::Dead.is_usable());
        assert_eq!(
            serde_json::to_value(SessionState::Dead).unwrap(),
            serde_json::json!("dead")
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(
            SessionError::Crashed {
                language: "python".into()
            }
            .is_retryable()
        );
        assert!(!SessionError::NotConfigured("cobol".into()).is_retryable());
        assert!(!SessionError::ShuttingDown.is_retryable());
    }
}
