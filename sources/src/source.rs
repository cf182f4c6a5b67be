//! The seam between the aggregation path and every backend family.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use triage_types::{Diagnostic, SnapshotVersion, SourceError, SourceKind};

/// One file's content at one version, as handed to every source.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    /// Workspace-relative path; what diagnostics are keyed by.
    pub path: PathBuf,
    /// Absolute path, for backends that read the file or need a `file://` URI.
    pub absolute_path: PathBuf,
    pub content: Arc<str>,
    pub version: SnapshotVersion,
}

impl FileSnapshot {
    pub fn new(workspace_root: &Path, path: impl Into<PathBuf>, content: impl Into<Arc<str>>) -> Self {
        let path = path.into();
        let content = content.into();
        Self {
            absolute_path: workspace_root.join(&path),
            version: SnapshotVersion::of(&content),
            path,
            content,
        }
    }
}

pub type CollectFut<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Diagnostic>, SourceError>> + Send + 'a>>;

pub type ForgetFut<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A backend that can produce diagnostics for a file.
///
/// A failing source only loses its own contribution: the aggregation path
/// keeps whatever the other sources returned.
pub trait DiagnosticSource: Send + Sync {
    /// Stable backend name; ends up in `Diagnostic::source` and `sources_consulted`.
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Language this source serves. Query-level unavailability is judged per language.
    fn language(&self) -> &str;

    fn handles(&self, path: &Path) -> bool;

    fn collect<'a>(&'a self, file: &'a FileSnapshot) -> CollectFut<'a>;

    /// Drop any per-file state (open documents, memoized results). `path` is
    /// workspace-relative, like `FileSnapshot::path`.
    fn forget<'a>(&'a self, _path: &'a Path) -> ForgetFut<'a> {
        Box::pin(async {})
    }
}

pub type SharedSource = Arc<dyn DiagnosticSource>;
