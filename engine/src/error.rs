use std::path::PathBuf;

use thiserror::Error;
use triage_types::{DiagnosticId, SourceError};

/// Query-level failures.
///
/// Partial backend failure never lands here: it shows up as a reduced
/// `sources_consulted` on the affected file's set instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Every source for the file's language failed this pass.
    #[error("no diagnostic sources reachable for {language} ({})", path.display())]
    NoSourcesReachable {
        language: String,
        path: PathBuf,
        failures: Vec<SourceError>,
    },
    /// The workspace could not supply the file.
    #[error("failed to read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },
    #[error("failed to list workspace files: {0}")]
    List(String),
}

/// Why a fix was not applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FixError {
    #[error("no diagnostic with id {0}")]
    NotFound(DiagnosticId),
    #[error("diagnostic {0} has no fix")]
    NotFixable(DiagnosticId),
    /// The file changed after the diagnostic was produced; re-query first.
    #[error("diagnostic {id} is stale: {} changed since it was produced", path.display())]
    StaleDiagnostic { id: DiagnosticId, path: PathBuf },
    #[error("fix for {id} cannot be applied: {reason}")]
    InvalidEdit { id: DiagnosticId, reason: String },
    #[error("failed to read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },
    #[error("failed to write {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },
}

/// Internal invariant violations detected by the aggregation cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache entry for {} is corrupt: {reason}", path.display())]
    Corruption { path: PathBuf, reason: String },
}
