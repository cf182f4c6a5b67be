//! Fix resolution: preview and apply backend-suggested edits.
//!
//! Applying re-reads the file and refuses to touch it unless its content
//! hash still equals the diagnostic's snapshot version.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tokio::sync::Mutex;
use triage_types::{Diagnostic, DiagnosticId, Position, TextEdit};
use triage_utils::{compute_diff_stats, format_unified_diff};

use crate::error::FixError;
use crate::workspace::{FileContent, Workspace};

const DIFF_CONTEXT: usize = 3;

/// What applying a fix would do. Producing one never mutates anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixPreview {
    pub diagnostic_id: DiagnosticId,
    pub title: String,
    pub file_path: PathBuf,
    pub edits: Vec<TextEdit>,
    /// Unified diff against the file's current content.
    pub diff: String,
    pub additions: u32,
    pub deletions: u32,
    /// The file changed since the diagnostic was produced; `apply` would refuse.
    pub stale: bool,
}

/// Outcome of one `apply`. Batch resolution yields one per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixResult {
    pub diagnostic_id: DiagnosticId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    pub success: bool,
    pub edits: Vec<TextEdit>,
    pub resolved: Vec<DiagnosticId>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "error_message"
    )]
    pub error: Option<FixError>,
}

#[allow(clippy::ref_option)]
fn error_message<S: Serializer>(error: &Option<FixError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => s.collect_str(err),
        None => s.serialize_none(),
    }
}

impl FixResult {
    #[must_use]
    pub fn applied(diag: &Diagnostic, edits: Vec<TextEdit>) -> Self {
        Self {
            diagnostic_id: diag.id().clone(),
            file_path: Some(diag.file_path().to_path_buf()),
            success: true,
            edits,
            resolved: vec![diag.id().clone()],
            error: None,
        }
    }

    #[must_use]
    pub fn failed(id: DiagnosticId, file_path: Option<PathBuf>, err: FixError) -> Self {
        Self {
            diagnostic_id: id,
            file_path,
            success: false,
            edits: Vec::new(),
            resolved: Vec::new(),
            error: Some(err),
        }
    }
}

/// Applies fixes against the workspace. Applies are serialized so two fixes
/// never interleave their read-check-write sequences.
pub struct FixResolver {
    workspace: Arc<dyn Workspace>,
    apply_lock: Mutex<()>,
}

impl FixResolver {
    pub fn new(workspace: Arc<dyn Workspace>) -> Self {
        Self {
            workspace,
            apply_lock: Mutex::new(()),
        }
    }

    fn read(&self, path: &Path) -> Result<FileContent, FixError> {
        self.workspace.read_file(path).map_err(|e| FixError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn preview(&self, diag: &Diagnostic) -> Result<FixPreview, FixError> {
        let fix = diag
            .fix_descriptor()
            .ok_or_else(|| FixError::NotFixable(diag.id().clone()))?;
        let current = self.read(diag.file_path())?;
        let updated = apply_edits(&current.content, &fix.edits).map_err(|reason| {
            FixError::InvalidEdit {
                id: diag.id().clone(),
                reason,
            }
        })?;
        let stats = compute_diff_stats(&current.content, &updated);
        Ok(FixPreview {
            diagnostic_id: diag.id().clone(),
            title: fix.title.clone(),
            file_path: diag.file_path().to_path_buf(),
            edits: fix.edits.clone(),
            diff: format_unified_diff(
                &diag.file_path().to_string_lossy(),
                &current.content,
                &updated,
                DIFF_CONTEXT,
            ),
            additions: stats.additions,
            deletions: stats.deletions,
            stale: !diag.matches_snapshot(&current.version),
        })
    }

    /// Apply `diag`'s fix. Returns the edits written.
    ///
    /// The caller owns cache invalidation and re-analysis after a success.
    pub async fn apply(&self, diag: &Diagnostic) -> Result<Vec<TextEdit>, FixError> {
        let fix = diag
            .fix_descriptor()
            .ok_or_else(|| FixError::NotFixable(diag.id().clone()))?;
        let _guard = self.apply_lock.lock().await;

        let current = self.read(diag.file_path())?;
        if !diag.matches_snapshot(&current.version) {
            tracing::warn!(
                id = %diag.id(),
                path = %diag.file_path().display(),
                "Refusing stale fix"
            );
            return Err(FixError::StaleDiagnostic {
                id: diag.id().clone(),
                path: diag.file_path().to_path_buf(),
            });
        }

        let updated = apply_edits(&current.content, &fix.edits).map_err(|reason| {
            FixError::InvalidEdit {
                id: diag.id().clone(),
                reason,
            }
        })?;
        self.workspace
            .write_file(diag.file_path(), &updated)
            .map_err(|e| FixError::Write {
                path: diag.file_path().to_path_buf(),
                reason: e.to_string(),
            })?;
        tracing::info!(
            id = %diag.id(),
            path = %diag.file_path().display(),
            title = %fix.title,
            edits = fix.edits.len(),
            "Applied fix"
        );
        Ok(fix.edits.clone())
    }
}

/// Byte offset of the start of every line.
fn line_starts(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Byte offset of `pos`. Characters past the end of a line clamp to it;
/// `(line_count, 0)` addresses the end of the document.
fn offset(text: &str, starts: &[usize], pos: Position) -> Result<usize, String> {
    let line = pos.line as usize;
    let Some(&start) = starts.get(line) else {
        if line == starts.len() && pos.character == 0 {
            return Ok(text.len());
        }
        return Err(format!(
            "position {}:{} is past the end of the file ({} lines)",
            pos.line,
            pos.character,
            starts.len()
        ));
    };
    let end = starts.get(line + 1).map_or(text.len(), |next| next - 1);
    let content = text[start..end].trim_end_matches('\r');
    let within = content
        .char_indices()
        .nth(pos.character as usize)
        .map_or(content.len(), |(i, _)| i);
    Ok(start + within)
}

/// Apply non-overlapping edits to `text`.
pub fn apply_edits(text: &str, edits: &[TextEdit]) -> Result<String, String> {
    let starts = line_starts(text);
    let mut spans = edits
        .iter()
        .map(|edit| {
            let start = offset(text, &starts, edit.start)?;
            let end = offset(text, &starts, edit.end)?;
            if end < start {
                return Err(format!(
                    "edit ends ({}:{}) before it starts ({}:{})",
                    edit.end.line, edit.end.character, edit.start.line, edit.start.character
                ));
            }
            Ok((start, end, edit.new_text.as_str()))
        })
        .collect::<Result<Vec<_>, String>>()?;
    spans.sort_by_key(|&(start, end, _)| (start, end));
    if spans.windows(2).any(|w| w[0].1 > w[1].0) {
        return Err("edits overlap".to_string());
    }

    let mut out = text.to_string();
    for (start, end, new_text) in spans.into_iter().rev() {
        out.replace_range(start..end, new_text);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use triage_types::{Category, DiagnosticDraft, FixDescriptor, Severity, SnapshotVersion};

    use super::*;
    use crate::workspace::MemoryWorkspace;

    fn edit(sl: u32, sc: u32, el: u32, ec: u32, text: &str) -> TextEdit {
        TextEdit {
            start: Position::new(sl, sc),
            end: Position::new(el, ec),
            new_text: text.to_string(),
        }
    }

    fn unused_os(content: &str) -> Diagnostic {
        DiagnosticDraft::new(
            "a.py",
            0,
            7,
            Severity::Warning,
            Category::Lint,
            "`os` imported but unused",
            "builtin-python",
        )
        .with_fix(FixDescriptor {
            title: "Remove unused import `os`".into(),
            edits: vec![TextEdit::delete_lines(0, 0)],
            payload: None,
        })
        .into_diagnostic(SnapshotVersion::of(content), Utc::now())
    }

    #[test]
    fn edits_apply_by_character_position() {
        let text = "héllo wörld\nsecond\n";
        assert_eq!(
            apply_edits(text, &[edit(0, 6, 0, 11, "there")]).unwrap(),
            "héllo there\nsecond\n"
        );
        // Past the line end clamps; the newline survives.
        assert_eq!(
            apply_edits(text, &[edit(1, 0, 1, 99, "2nd")]).unwrap(),
            "héllo wörld\n2nd\n"
        );
        assert_eq!(
            apply_edits("a\nb", &[TextEdit::delete_lines(1, 1)]).unwrap(),
            "a\n"
        );
    }

    #[test]
    fn multiple_edits_apply_back_to_front() {
        let text = "import os, sys\nx = 1\n";
        let out = apply_edits(
            text,
            &[edit(1, 0, 1, 1, "y"), edit(0, 9, 0, 14, "")],
        )
        .unwrap();
        assert_eq!(out, "import os\ny = 1\n");
    }

    #[test]
    fn overlapping_or_out_of_range_edits_are_rejected() {
        let text = "abc\n";
        assert!(apply_edits(text, &[edit(0, 0, 0, 2, "x"), edit(0, 1, 0, 3, "y")]).is_err());
        assert!(apply_edits(text, &[edit(5, 0, 5, 0, "x")]).is_err());
        assert!(apply_edits(text, &[edit(0, 2, 0, 1, "x")]).is_err());
    }

    #[tokio::test]
    async fn apply_writes_the_fix_when_content_is_unchanged() {
        let content = "import os\nprint(1)\n";
        let ws = Arc::new(MemoryWorkspace::new("/ws"));
        ws.insert("a.py", content);
        let resolver = FixResolver::new(Arc::clone(&ws) as Arc<dyn Workspace>);
        let diag = unused_os(content);

        let preview = resolver.preview(&diag).unwrap();
        assert!(!preview.stale);
        assert_eq!(preview.deletions, 1);
        assert!(preview.diff.contains("-import os"));
        assert_eq!(ws.writes(), 0);

        let edits = resolver.apply(&diag).await.unwrap();
        assert_eq!(edits, vec![TextEdit::delete_lines(0, 0)]);
        assert_eq!(ws.get(Path::new("a.py")).as_deref(), Some("print(1)\n"));
    }

    #[tokio::test]
    async fn stale_fix_is_refused_without_writing() {
        let ws = Arc::new(MemoryWorkspace::new("/ws"));
        ws.insert("a.py", "import os\nprint(2)\n");
        let resolver = FixResolver::new(Arc::clone(&ws) as Arc<dyn Workspace>);
        let diag = unused_os("import os\nprint(1)\n");

        assert!(resolver.preview(&diag).unwrap().stale);
        let err = resolver.apply(&diag).await.unwrap_err();
        assert!(matches!(err, FixError::StaleDiagnostic { .. }));
        assert_eq!(ws.writes(), 0);
        assert_eq!(
            ws.get(Path::new("a.py")).as_deref(),
            Some("import os\nprint(2)\n")
        );
    }

    #[tokio::test]
    async fn diagnostic_without_fix_is_not_fixable() {
        let ws = Arc::new(MemoryWorkspace::new("/ws"));
        let resolver = FixResolver::new(ws as Arc<dyn Workspace>);
        let diag = DiagnosticDraft::new("a.py", 0, 0, Severity::Error, Category::Syntax, "bad", "t")
            .into_diagnostic(SnapshotVersion::of("x"), Utc::now());
        assert_eq!(
            resolver.apply(&diag).await.unwrap_err(),
            FixError::NotFixable(diag.id().clone())
        );
    }
}
