use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::diagnostic::{Category, Diagnostic, Severity};

/// Query filter. Every populated field must match (AND semantics);
/// an empty filter matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiagnosticFilter {
    /// Exact file paths, or directory prefixes.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub min_severity: Option<Severity>,
    #[serde(default)]
    pub categories: BTreeSet<Category>,
    /// Only diagnostics produced within this window before the query.
    #[serde(default, with = "duration_secs")]
    pub within: Option<Duration>,
    #[serde(default)]
    pub fixable_only: bool,
}

impl DiagnosticFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    #[must_use]
    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    #[must_use]
    pub fn category(mut self, category: Category) -> Self {
        self.categories.insert(category);
        self
    }

    #[must_use]
    pub fn within(mut self, window: Duration) -> Self {
        self.within = Some(window);
        self
    }

    #[must_use]
    pub fn fixable_only(mut self) -> Self {
        self.fixable_only = true;
        self
    }

    /// Whether files at `path` can contain matches at all.
    #[must_use]
    pub fn matches_path(&self, path: &Path) -> bool {
        self.paths.is_empty() || self.paths.iter().any(|p| path.starts_with(p))
    }

    #[must_use]
    pub fn matches(&self, diag: &Diagnostic, now: DateTime<Utc>) -> bool {
        if !self.matches_path(diag.file_path()) {
            return false;
        }
        if let Some(min) = self.min_severity
            && diag.severity() < min
        {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&diag.category()) {
            return false;
        }
        if self.fixable_only && !diag.fixable() {
            return false;
        }
        if let Some(window) = self.within {
            let age = now.signed_duration_since(diag.produced_at());
            match age.to_std() {
                Ok(age) if age > window => return false,
                // Negative age (clock skew) counts as fresh.
                _ => {}
            }
        }
        true
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
