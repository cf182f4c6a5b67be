//! `triage` configuration.
//!
//! ```toml
//! [cache]
//! ttl_secs = 300
//!
//! [scheduler]
//! debounce_ms = 250
//! workers = 4
//!
//! [servers.python]
//! command = "pyright-langserver"
//! args = ["--stdio"]
//! language_id = "python"
//! file_extensions = ["py", "pyi"]
//!
//! [linters.ruff]
//! command = "ruff"
//! args = ["check", "--output-format=json", "--exit-zero", "{file}"]
//! language_id = "python"
//! file_extensions = ["py"]
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use triage_lsp::{ServerConfig, SessionSettings};
use triage_sources::LinterConfig;

/// Workspace-local config file name.
pub const WORKSPACE_CONFIG: &str = ".triage.toml";

const fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub sessions: SessionsConfig,
    pub dedup: DedupConfig,
    pub aggregation: AggregationConfig,
    /// Language servers keyed by language.
    pub servers: BTreeMap<String, ServerConfig>,
    /// One-shot linters keyed by backend name.
    pub linters: BTreeMap<String, LinterConfig>,
    pub analyzers: AnalyzersConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub debounce_ms: u64,
    pub workers: usize,
    /// Pending notifications kept per subscriber before the oldest is dropped.
    pub subscriber_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            workers: 4,
            subscriber_queue: 64,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Zero disables liveness probing.
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub max_restarts: u32,
    pub stable_after_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 5_000,
            probe_interval_ms: 15_000,
            probe_timeout_ms: 2_000,
            max_restarts: 5,
            stable_after_ms: 300_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl SessionsConfig {
    #[must_use]
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            max_restarts: self.max_restarts,
            stable_after: Duration::from_millis(self.stable_after_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Minimum token-set similarity for two messages on the same line to merge.
    pub similarity_threshold: f64,
    /// Normalized message characters compared for the exact-prefix match.
    pub prefix_chars: usize,
    /// Source names, most trusted first. Unlisted sources rank by family.
    pub source_priority: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            prefix_chars: 48,
            source_priority: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Outer deadline for any single source's collect call.
    pub source_timeout_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            source_timeout_ms: 30_000,
        }
    }
}

impl AggregationConfig {
    #[must_use]
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzersConfig {
    #[serde(default = "default_true")]
    pub builtin_python: bool,
}

impl Default for AnalyzersConfig {
    fn default() -> Self {
        Self {
            builtin_python: true,
        }
    }
}

/// Expand `${VAR}` references. Unset variables become empty.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                out.push_str(&env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            Some(_) => {
                // `${}` is left as written.
                out.push_str("${}");
                rest = &after[1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl TriageConfig {
    /// Load configuration.
    ///
    /// Lookup order: `explicit`, `<workspace>/.triage.toml`,
    /// `~/.triage/config.toml`, then built-in defaults. An explicit path
    /// that does not exist is an error; the other locations are optional.
    /// Returns the path that was read, if any.
    pub fn load(
        explicit: Option<&Path>,
        workspace_root: &Path,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Self::load_file(path).map(|config| (config, Some(path.to_path_buf())));
        }
        let candidates = [Some(workspace_root.join(WORKSPACE_CONFIG)), config_path()];
        for path in candidates.into_iter().flatten() {
            if path.is_file() {
                let config = Self::load_file(&path)?;
                return Ok((config, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        Self::parse(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    /// Parse TOML text and expand `${VAR}` in backend commands and arguments.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        for server in config.servers.values_mut() {
            server.command = expand_env_vars(&server.command);
            for arg in &mut server.args {
                *arg = expand_env_vars(arg);
            }
        }
        for linter in config.linters.values_mut() {
            linter.command = expand_env_vars(&linter.command);
            for arg in &mut linter.args {
                *arg = expand_env_vars(arg);
            }
        }
        Ok(config)
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".triage").join("config.toml"))
}
