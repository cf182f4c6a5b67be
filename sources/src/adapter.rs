//! Translation contract shared by every backend family.
//!
//! Adapters are the only code allowed to branch on backend-specific shapes.
//! A record that cannot be translated is skipped and counted; it never
//! fails the batch.

use chrono::{DateTime, Utc};
use triage_types::{Diagnostic, DiagnosticDraft};

use crate::source::FileSnapshot;

/// Everything an adapter needs to seal drafts into diagnostics.
pub struct TranslateContext<'a> {
    pub file: &'a FileSnapshot,
    pub source: &'a str,
    pub produced_at: DateTime<Utc>,
}

impl<'a> TranslateContext<'a> {
    #[must_use]
    pub fn new(file: &'a FileSnapshot, source: &'a str) -> Self {
        Self {
            file,
            source,
            produced_at: Utc::now(),
        }
    }

    fn seal(&self, draft: DiagnosticDraft) -> Diagnostic {
        draft.into_diagnostic(self.file.version.clone(), self.produced_at)
    }
}

/// Result of translating one batch of raw backend output.
#[derive(Debug, Default)]
pub struct Translation {
    pub diagnostics: Vec<Diagnostic>,
    /// Records skipped as malformed.
    pub skipped: usize,
}

impl Translation {
    /// Seal `record` if it translated, otherwise log and count it.
    pub fn push(&mut self, ctx: &TranslateContext<'_>, record: Result<DiagnosticDraft, String>) {
        match record {
            Ok(draft) => self.diagnostics.push(ctx.seal(draft)),
            Err(reason) => {
                self.skipped += 1;
                tracing::warn!(
                    source = %ctx.source,
                    path = %ctx.file.path.display(),
                    "Skipping malformed diagnostic: {reason}"
                );
            }
        }
    }
}

/// Converts one backend family's native output into shared records.
pub trait SourceAdapter {
    type Raw: ?Sized;

    fn translate(&self, raw: &Self::Raw, ctx: &TranslateContext<'_>) -> Translation;
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use triage_types::{Category, Severity};

    use super::*;

    #[test]
    fn push_seals_good_records_and_counts_bad_ones() {
        let file = FileSnapshot::new(Path::new("/ws"), "a.py", "x = 1\n");
        let ctx = TranslateContext::new(&file, "ruff");
        let mut out = Translation::default();

        out.push(
            &ctx,
            Ok(DiagnosticDraft::new(
                "a.py",
                0,
                0,
                Severity::Warning,
                Category::Lint,
                "unused",
                "ruff",
            )),
        );
        out.push(&ctx, Err("missing location".to_string()));

        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.skipped, 1);
        assert!(out.diagnostics[0].matches_snapshot(&file.version));
        assert_eq!(out.diagnostics[0].produced_at(), ctx.produced_at);
    }
}
