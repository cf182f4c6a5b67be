//! The shared diagnostic record.
//!
//! Adapters build a [`DiagnosticDraft`] from backend-native output and seal it
//! with [`DiagnosticDraft::into_diagnostic`]. Sealed diagnostics have private
//! fields; nothing downstream can patch them in place.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DiagnosticId, SnapshotVersion};

/// Severity level for a diagnostic.
///
/// Ordered by importance: `Hint < Info < Warning < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Hint,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// All severities, most important first.
    pub const ALL: [Self; 4] = [Self::Error, Self::Warning, Self::Info, Self::Hint];

    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Info),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_lsp(self) -> u8 {
        match self {
            Self::Error => 1,
            Self::Warning => 2,
            Self::Info => 3,
            Self::Hint => 4,
        }
    }

    /// Parse the names backends and config files use for severities.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "error" | "err" | "fatal" | "e" => Some(Self::Error),
            "warning" | "warn" | "w" => Some(Self::Warning),
            "info" | "information" | "note" | "i" => Some(Self::Info),
            "hint" | "help" | "suggestion" | "h" => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Hint => "hint",
        }
    }
}

/// Classification of a finding, independent of which backend produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Syntax,
    Import,
    TypeCheck,
    Lint,
    Semantic,
    Undefined,
    Style,
    Security,
    Complexity,
}

impl Category {
    pub const ALL: [Self; 9] = [
        Self::Syntax,
        Self::Import,
        Self::TypeCheck,
        Self::Lint,
        Self::Semantic,
        Self::Undefined,
        Self::Style,
        Self::Security,
        Self::Complexity,
    ];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Import => "import",
            Self::TypeCheck => "type_check",
            Self::Lint => "lint",
            Self::Semantic => "semantic",
            Self::Undefined => "undefined",
            Self::Style => "style",
            Self::Security => "security",
            Self::Complexity => "complexity",
        }
    }

    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.label().eq_ignore_ascii_case(label.trim()))
    }
}

/// Backend family a source belongs to.
///
/// The declaration order is the default deduplication priority: protocol
/// servers carry the fullest semantic context, one-shot linters the least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Protocol,
    InProcess,
    Subprocess,
}

impl SourceKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::InProcess => "in_process",
            Self::Subprocess => "subprocess",
        }
    }
}

/// Zero-based position. `character` counts Unicode scalar values within the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// A single replacement of the half-open range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub start: Position,
    pub end: Position,
    pub new_text: String,
}

impl TextEdit {
    /// Edit that removes whole lines `[first, last]` including the trailing newline.
    #[must_use]
    pub fn delete_lines(first: u32, last: u32) -> Self {
        Self {
            start: Position::new(first, 0),
            end: Position::new(last + 1, 0),
            new_text: String::new(),
        }
    }
}

/// Backend-suggested quick fix.
///
/// `edits` is what the fix engine applies; `payload` carries whatever raw
/// structure the backend attached, kept for traceability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixDescriptor {
    pub title: String,
    pub edits: Vec<TextEdit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Unsealed diagnostic, built by adapters from raw backend output.
#[derive(Debug, Clone)]
pub struct DiagnosticDraft {
    pub file_path: PathBuf,
    pub line: u32,
    pub character: u32,
    pub end: Option<Position>,
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    pub source: String,
    pub code: Option<String>,
    pub fix: Option<FixDescriptor>,
}

impl DiagnosticDraft {
    #[must_use]
    pub fn new(
        file_path: impl Into<PathBuf>,
        line: u32,
        character: u32,
        severity: Severity,
        category: Category,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            line,
            character,
            end: None,
            severity,
            category,
            message: message.into(),
            source: source.into(),
            code: None,
            fix: None,
        }
    }

    #[must_use]
    pub fn with_end(mut self, end: Position) -> Self {
        self.end = Some(end);
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_fix(mut self, fix: FixDescriptor) -> Self {
        self.fix = Some(fix);
        self
    }

    /// Seal the draft against the content snapshot it was computed from.
    #[must_use]
    pub fn into_diagnostic(
        self,
        snapshot_version: SnapshotVersion,
        produced_at: DateTime<Utc>,
    ) -> Diagnostic {
        let id = DiagnosticId::derive(
            &self.file_path,
            self.line,
            self.character,
            &self.message,
            &self.source,
        );
        Diagnostic {
            id,
            file_path: self.file_path,
            line: self.line,
            character: self.character,
            end_line: self.end.map(|p| p.line),
            end_character: self.end.map(|p| p.character),
            severity: self.severity,
            category: self.category,
            message: self.message,
            source: self.source,
            code: self.code,
            fixable: self.fix.is_some(),
            fix_descriptor: self.fix,
            produced_at,
            snapshot_version,
        }
    }
}

/// One normalized code-health finding tied to a file position.
///
/// Fields are private; the only construction path is
/// [`DiagnosticDraft::into_diagnostic`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    id: DiagnosticId,
    file_path: PathBuf,
    line: u32,
    character: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_character: Option<u32>,
    severity: Severity,
    category: Category,
    message: String,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    fixable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    fix_descriptor: Option<FixDescriptor>,
    produced_at: DateTime<Utc>,
    snapshot_version: SnapshotVersion,
}

impl Diagnostic {
    #[must_use]
    pub fn id(&self) -> &DiagnosticId {
        &self.id
    }

    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 0-indexed column.
    #[must_use]
    pub fn character(&self) -> u32 {
        self.character
    }

    #[must_use]
    pub fn end(&self) -> Option<Position> {
        match (self.end_line, self.end_character) {
            (Some(line), Some(character)) => Some(Position::new(line, character)),
            _ => None,
        }
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Name of the producing backend (e.g. "pyright", "ruff").
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    #[must_use]
    pub fn fixable(&self) -> bool {
        self.fixable
    }

    #[must_use]
    pub fn fix_descriptor(&self) -> Option<&FixDescriptor> {
        self.fix_descriptor.as_ref()
    }

    #[must_use]
    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    #[must_use]
    pub fn snapshot_version(&self) -> &SnapshotVersion {
        &self.snapshot_version
    }

    /// Whether this diagnostic may drive a mutation of content at `current`.
    #[must_use]
    pub fn matches_snapshot(&self, current: &SnapshotVersion) -> bool {
        &self.snapshot_version == current
    }

    /// Standard LSP `Diagnostic` shape for LSP-speaking clients.
    #[must_use]
    pub fn to_lsp(&self) -> serde_json::Value {
        let end = self
            .end()
            .unwrap_or(Position::new(self.line, self.character));
        let mut value = serde_json::json!({
            "range": {
                "start": { "line": self.line, "character": self.character },
                "end": { "line": end.line, "character": end.character },
            },
            "severity": self.severity.to_lsp(),
            "message": self.message,
            "source": self.source,
        });
        if let Some(code) = &self.code {
            value["code"] = serde_json::Value::String(code.clone());
        }
        value
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_line(&self) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            self.file_path.display(),
            self.line + 1,
            self.character + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal(draft: DiagnosticDraft) -> Diagnostic {
        draft.into_diagnostic(SnapshotVersion::of("x"), Utc::now())
    }

    #[test]
    fn severity_orders_by_importance() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert!(Severity::Info > Severity::Hint);
        assert_eq!(
            Severity::Warning.max(Severity::Error),
            Severity::Error,
            "max must pick the more important severity"
        );
    }

    #[test]
    fn severity_lsp_mapping() {
        for sev in Severity::ALL {
            assert_eq!(Severity::from_lsp(u64::from(sev.to_lsp())), Some(sev));
        }
        assert_eq!(Severity::from_lsp(0), None);
        assert_eq!(Severity::from_lsp(99), None);
    }

    #[test]
    fn severity_from_label_accepts_backend_spellings() {
        assert_eq!(Severity::from_label("WARN"), Some(Severity::Warning));
        assert_eq!(Severity::from_label("note"), Some(Severity::Info));
        assert_eq!(Severity::from_label("help"), Some(Severity::Hint));
        assert_eq!(Severity::from_label("bogus"), None);
    }

    #[test]
    fn category_labels_round_trip() {
        for cat in Category::ALL {
            assert_eq!(Category::from_label(cat.label()), Some(cat));
        }
        assert_eq!(Category::from_label("TYPE_CHECK"), Some(Category::TypeCheck));
    }

    #[test]
    fn source_kind_default_priority() {
        assert!(SourceKind::Protocol < SourceKind::InProcess);
        assert!(SourceKind::InProcess < SourceKind::Subprocess);
    }

    #[test]
    fn sealing_derives_id_and_fixable() {
        let fix = FixDescriptor {
            title: "Remove unused import".into(),
            edits: vec![TextEdit::delete_lines(0, 0)],
            payload: None,
        };
        let diag = seal(
            DiagnosticDraft::new(
                "a.py",
                0,
                0,
                Severity::Warning,
                Category::Lint,
                "`os` imported but unused",
                "ruff",
            )
            .with_code("F401")
            .with_fix(fix.clone()),
        );
        assert!(diag.fixable());
        assert_eq!(diag.fix_descriptor(), Some(&fix));
        assert_eq!(
            diag.id(),
            &DiagnosticId::derive(Path::new("a.py"), 0, 0, "`os` imported but unused", "ruff")
        );
    }

    #[test]
    fn to_lsp_has_standard_shape() {
        let diag = seal(
            DiagnosticDraft::new(
                "a.py",
                4,
                2,
                Severity::Error,
                Category::Syntax,
                "unterminated string literal",
                "pyright",
            )
            .with_end(Position::new(4, 9))
            .with_code("reportSyntax"),
        );
        let lsp = diag.to_lsp();
        assert_eq!(lsp["range"]["start"]["line"], 4);
        assert_eq!(lsp["range"]["start"]["character"], 2);
        assert_eq!(lsp["range"]["end"]["character"], 9);
        assert_eq!(lsp["severity"], 1);
        assert_eq!(lsp["message"], "unterminated string literal");
        assert_eq!(lsp["code"], "reportSyntax");
        assert_eq!(lsp["source"], "pyright");
    }

    #[test]
    fn to_lsp_without_end_uses_start() {
        let diag = seal(DiagnosticDraft::new(
            "a.py",
            1,
            1,
            Severity::Hint,
            Category::Style,
            "m",
            "s",
        ));
        let lsp = diag.to_lsp();
        assert_eq!(lsp["range"]["end"]["line"], 1);
        assert_eq!(lsp["severity"], 4);
        assert!(lsp.get("code").is_none());
    }

    #[test]
    fn display_line_is_one_indexed() {
        let diag = seal(DiagnosticDraft::new(
            "src/main.py",
            10,
            5,
            Severity::Error,
            Category::Syntax,
            "expected `:`",
            "pyright",
        ));
        assert_eq!(
            diag.display_line(),
            "src/main.py:11:6: error: [pyright] expected `:`"
        );
    }

    #[test]
    fn snapshot_match_detects_drift() {
        let diag = DiagnosticDraft::new("a.py", 0, 0, Severity::Error, Category::Syntax, "m", "s")
            .into_diagnostic(SnapshotVersion::of("v1"), Utc::now());
        assert!(diag.matches_snapshot(&SnapshotVersion::of("v1")));
        assert!(!diag.matches_snapshot(&SnapshotVersion::of("v2")));
    }
}
