//! Per-file diagnostic sets and the cross-file, immutable query snapshot.
//!
//! Counts are computed from the canonical per-file data on access, so there
//! are no cached totals to keep in sync.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::diagnostic::{Category, Diagnostic, Severity};
use crate::ids::{DiagnosticId, SnapshotVersion};

/// All diagnostics for one file at one content snapshot.
///
/// Built wholesale by the aggregation path and never patched afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticSet {
    file_path: PathBuf,
    snapshot_version: SnapshotVersion,
    diagnostics: Vec<Diagnostic>,
    sources_consulted: BTreeSet<String>,
    /// Sources that were asked but failed this pass, with the reason.
    degraded_sources: BTreeMap<String, String>,
    produced_at: DateTime<Utc>,
}

impl DiagnosticSet {
    /// Diagnostics are ordered by position, then most important first, then source.
    #[must_use]
    pub fn new(
        file_path: PathBuf,
        snapshot_version: SnapshotVersion,
        mut diagnostics: Vec<Diagnostic>,
        sources_consulted: BTreeSet<String>,
        produced_at: DateTime<Utc>,
    ) -> Self {
        diagnostics.sort_by(|a, b| {
            (a.line(), a.character())
                .cmp(&(b.line(), b.character()))
                .then_with(|| b.severity().cmp(&a.severity()))
                .then_with(|| a.source().cmp(b.source()))
                .then_with(|| a.message().cmp(b.message()))
        });
        Self {
            file_path,
            snapshot_version,
            diagnostics,
            sources_consulted,
            degraded_sources: BTreeMap::new(),
            produced_at,
        }
    }

    /// An empty set, e.g. for a file no source covers.
    #[must_use]
    pub fn empty(file_path: PathBuf, snapshot_version: SnapshotVersion) -> Self {
        Self::new(
            file_path,
            snapshot_version,
            Vec::new(),
            BTreeSet::new(),
            Utc::now(),
        )
    }

    #[must_use]
    pub fn with_degraded_sources(mut self, degraded: BTreeMap<String, String>) -> Self {
        self.degraded_sources = degraded;
        self
    }

    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    #[must_use]
    pub fn snapshot_version(&self) -> &SnapshotVersion {
        &self.snapshot_version
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    #[must_use]
    pub fn sources_consulted(&self) -> &BTreeSet<String> {
        &self.sources_consulted
    }

    #[must_use]
    pub fn degraded_sources(&self) -> &BTreeMap<String, String> {
        &self.degraded_sources
    }

    #[must_use]
    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    #[must_use]
    pub fn find(&self, id: &DiagnosticId) -> Option<&Diagnostic> {
        self.diagnostics.iter().find(|d| d.id() == id)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity().is_error())
    }

    /// Copy of this set keeping only diagnostics matching `keep`.
    #[must_use]
    pub fn retain(&self, mut keep: impl FnMut(&Diagnostic) -> bool) -> Self {
        Self {
            file_path: self.file_path.clone(),
            snapshot_version: self.snapshot_version.clone(),
            diagnostics: self
                .diagnostics
                .iter()
                .filter(|d| keep(d))
                .cloned()
                .collect(),
            sources_consulted: self.sources_consulted.clone(),
            degraded_sources: self.degraded_sources.clone(),
            produced_at: self.produced_at,
        }
    }
}

/// Counts by severity plus the number of files carrying at least one error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SummaryStats {
    pub total_errors: usize,
    pub total_warnings: usize,
    pub total_info: usize,
    pub total_hints: usize,
    pub files_with_errors: usize,
}

impl SummaryStats {
    #[must_use]
    pub fn total(&self) -> usize {
        self.total_errors + self.total_warnings + self.total_info + self.total_hints
    }

    /// Compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.total() == 0 {
            return String::new();
        }
        format!("E:{} W:{}", self.total_errors, self.total_warnings)
    }
}

/// Per-file counts, used for hotspot ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileErrorCount {
    pub path: PathBuf,
    pub errors: usize,
    pub warnings: usize,
    pub total: usize,
}

/// Immutable cross-file snapshot returned by queries.
///
/// Files are ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorCollection {
    files: Vec<DiagnosticSet>,
}

impl ErrorCollection {
    #[must_use]
    pub fn new(mut files: Vec<DiagnosticSet>) -> Self {
        files.sort_by(|a, b| a.file_path().cmp(b.file_path()));
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[DiagnosticSet] {
        &self.files
    }

    #[must_use]
    pub fn file(&self, path: &Path) -> Option<&DiagnosticSet> {
        self.files.iter().find(|s| s.file_path() == path)
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.files.iter().flat_map(DiagnosticSet::diagnostics)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.iter().all(DiagnosticSet::is_empty)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.files.iter().map(DiagnosticSet::len).sum()
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.files.iter().map(|s| s.count(severity)).sum()
    }

    #[must_use]
    pub fn by_severity(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for diag in self.diagnostics() {
            *counts.entry(diag.severity()).or_insert(0) += 1;
        }
        counts
    }

    #[must_use]
    pub fn by_category(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for diag in self.diagnostics() {
            *counts.entry(diag.category()).or_insert(0) += 1;
        }
        counts
    }

    #[must_use]
    pub fn files_with_errors(&self) -> usize {
        self.files.iter().filter(|s| s.has_errors()).count()
    }

    #[must_use]
    pub fn summary(&self) -> SummaryStats {
        SummaryStats {
            total_errors: self.count(Severity::Error),
            total_warnings: self.count(Severity::Warning),
            total_info: self.count(Severity::Info),
            total_hints: self.count(Severity::Hint),
            files_with_errors: self.files_with_errors(),
        }
    }

    /// Files ranked by error count, then total count, then path.
    #[must_use]
    pub fn hotspots(&self, limit: usize) -> Vec<FileErrorCount> {
        let mut counts: Vec<FileErrorCount> = self
            .files
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| FileErrorCount {
                path: s.file_path().to_path_buf(),
                errors: s.count(Severity::Error),
                warnings: s.count(Severity::Warning),
                total: s.len(),
            })
            .collect();
        counts.sort_by(|a, b| {
            b.errors
                .cmp(&a.errors)
                .then_with(|| b.total.cmp(&a.total))
                .then_with(|| a.path.cmp(&b.path))
        });
        counts.truncate(limit);
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::DiagnosticDraft;

    fn diag(path: &str, line: u32, severity: Severity, category: Category, msg: &str) -> Diagnostic {
        DiagnosticDraft::new(path, line, 0, severity, category, msg, "test")
            .into_diagnostic(SnapshotVersion::of(path), Utc::now())
    }

    fn set(path: &str, items: Vec<Diagnostic>) -> DiagnosticSet {
        DiagnosticSet::new(
            PathBuf::from(path),
            SnapshotVersion::of(path),
            items,
            BTreeSet::from(["test".to_string()]),
            Utc::now(),
        )
    }

    #[test]
    fn set_orders_by_position_then_severity() {
        let s = set(
            "a.py",
            vec![
                diag("a.py", 5, Severity::Warning, Category::Lint, "w"),
                diag("a.py", 1, Severity::Hint, Category::Style, "h"),
                diag("a.py", 5, Severity::Error, Category::Syntax, "e"),
            ],
        );
        let lines: Vec<(u32, Severity)> = s
            .diagnostics()
            .iter()
            .map(|d| (d.line(), d.severity()))
            .collect();
        assert_eq!(
            lines,
            vec![
                (1, Severity::Hint),
                (5, Severity::Error),
                (5, Severity::Warning)
            ]
        );
    }

    #[test]
    fn collection_counts() {
        let coll = ErrorCollection::new(vec![
            set(
                "b.py",
                vec![
                    diag("b.py", 0, Severity::Error, Category::Import, "e1"),
                    diag("b.py", 1, Severity::Warning, Category::Lint, "w1"),
                ],
            ),
            set(
                "a.py",
                vec![
                    diag("a.py", 0, Severity::Info, Category::Semantic, "i1"),
                    diag("a.py", 1, Severity::Hint, Category::Style, "h1"),
                    diag("a.py", 2, Severity::Warning, Category::Lint, "w2"),
                ],
            ),
        ]);
        assert_eq!(coll.files()[0].file_path(), Path::new("a.py"));
        assert_eq!(coll.total(), 5);
        assert_eq!(coll.files_with_errors(), 1);
        assert_eq!(coll.by_category()[&Category::Lint], 2);
        assert_eq!(coll.by_severity()[&Severity::Warning], 2);

        let summary = coll.summary();
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.total_warnings, 2);
        assert_eq!(summary.total_info, 1);
        assert_eq!(summary.total_hints, 1);
        assert_eq!(summary.total(), 5);
        assert_eq!(summary.status_string(), "E:1 W:2");
    }

    #[test]
    fn hotspots_rank_errors_first() {
        let coll = ErrorCollection::new(vec![
            set(
                "many_warnings.py",
                vec![
                    diag("many_warnings.py", 0, Severity::Warning, Category::Lint, "1"),
                    diag("many_warnings.py", 1, Severity::Warning, Category::Lint, "2"),
                    diag("many_warnings.py", 2, Severity::Warning, Category::Lint, "3"),
                ],
            ),
            set(
                "one_error.py",
                vec![diag("one_error.py", 0, Severity::Error, Category::Syntax, "e")],
            ),
            set("clean.py", vec![]),
        ]);
        let hot = coll.hotspots(10);
        assert_eq!(hot.len(), 2);
        assert_eq!(hot[0].path, PathBuf::from("one_error.py"));
        assert_eq!(hot[1].total, 3);
        assert_eq!(coll.hotspots(1).len(), 1);
    }

    #[test]
    fn retain_keeps_metadata() {
        let s = set(
            "a.py",
            vec![
                diag("a.py", 0, Severity::Error, Category::Syntax, "e"),
                diag("a.py", 1, Severity::Hint, Category::Style, "h"),
            ],
        );
        let only_errors = s.retain(|d| d.severity().is_error());
        assert_eq!(only_errors.len(), 1);
        assert_eq!(only_errors.sources_consulted(), s.sources_consulted());
        assert_eq!(only_errors.snapshot_version(), s.snapshot_version());
    }

    #[test]
    fn empty_summary_status_is_blank() {
        assert_eq!(ErrorCollection::default().summary().status_string(), "");
        assert!(ErrorCollection::default().is_empty());
    }
}
