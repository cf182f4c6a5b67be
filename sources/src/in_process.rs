//! Incremental in-process analyzers.
//!
//! Analysis results are memoized per file by content hash, so re-collecting
//! an unchanged file costs a map lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use triage_types::{
    Category, DiagnosticDraft, FixDescriptor, Position, Severity, SnapshotVersion, SourceKind,
};

use crate::adapter::{SourceAdapter, TranslateContext, Translation};
use crate::source::{CollectFut, DiagnosticSource, FileSnapshot, ForgetFut};

/// How a rule's findings are classified.
#[derive(Debug, Clone, Copy)]
pub struct RuleSpec {
    pub rule: &'static str,
    pub severity: Severity,
    pub category: Category,
}

/// One raw analyzer result, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub rule: &'static str,
    pub line: u32,
    pub character: u32,
    pub end: Option<Position>,
    pub message: String,
    pub fix: Option<FixDescriptor>,
}

pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    fn language(&self) -> &str;

    fn extensions(&self) -> &[&str];

    fn rules(&self) -> &[RuleSpec];

    fn analyze(&self, path: &Path, content: &str) -> Vec<Finding>;
}

/// Classifies findings through the analyzer's rule table.
pub struct InProcessAdapter<'r> {
    rules: &'r [RuleSpec],
}

impl<'r> InProcessAdapter<'r> {
    #[must_use]
    pub fn new(rules: &'r [RuleSpec]) -> Self {
        Self { rules }
    }
}

impl SourceAdapter for InProcessAdapter<'_> {
    type Raw = [Finding];

    fn translate(&self, raw: &[Finding], ctx: &TranslateContext<'_>) -> Translation {
        let mut out = Translation::default();
        for finding in raw {
            let record = self
                .rules
                .iter()
                .find(|r| r.rule == finding.rule)
                .ok_or_else(|| format!("unknown rule {}", finding.rule))
                .map(|rule| {
                    let mut draft = DiagnosticDraft::new(
                        ctx.file.path.clone(),
                        finding.line,
                        finding.character,
                        rule.severity,
                        rule.category,
                        finding.message.clone(),
                        ctx.source,
                    )
                    .with_code(finding.rule);
                    if let Some(end) = finding.end {
                        draft = draft.with_end(end);
                    }
                    if let Some(fix) = &finding.fix {
                        draft = draft.with_fix(fix.clone());
                    }
                    draft
                });
            out.push(ctx, record);
        }
        out
    }
}

struct Memo {
    version: SnapshotVersion,
    findings: Arc<[Finding]>,
}

/// Wraps an [`Analyzer`] with per-file memoization.
pub struct InProcessSource {
    analyzer: Arc<dyn Analyzer>,
    memo: Mutex<HashMap<PathBuf, Memo>>,
    memo_hits: AtomicU64,
    analyses: AtomicU64,
}

impl InProcessSource {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            analyzer,
            memo: Mutex::new(HashMap::new()),
            memo_hits: AtomicU64::new(0),
            analyses: AtomicU64::new(0),
        }
    }

    pub fn memo_hits(&self) -> u64 {
        self.memo_hits.load(Ordering::Relaxed)
    }

    pub fn analyses(&self) -> u64 {
        self.analyses.load(Ordering::Relaxed)
    }

    fn findings(&self, file: &FileSnapshot) -> Arc<[Finding]> {
        {
            let memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = memo.get(&file.path)
                && entry.version == file.version
            {
                self.memo_hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(&entry.findings);
            }
        }

        self.analyses.fetch_add(1, Ordering::Relaxed);
        let findings: Arc<[Finding]> = self.analyzer.analyze(&file.path, &file.content).into();
        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                file.path.clone(),
                Memo {
                    version: file.version.clone(),
                    findings: Arc::clone(&findings),
                },
            );
        findings
    }
}

impl DiagnosticSource for InProcessSource {
    fn name(&self) -> &str {
        self.analyzer.name()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::InProcess
    }

    fn language(&self) -> &str {
        self.analyzer.language()
    }

    fn handles(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.analyzer.extensions().contains(&ext))
    }

    fn collect<'a>(&'a self, file: &'a FileSnapshot) -> CollectFut<'a> {
        Box::pin(async move {
            let findings = self.findings(file);
            let ctx = TranslateContext::new(file, self.analyzer.name());
            let translation = InProcessAdapter::new(self.analyzer.rules()).translate(&findings, &ctx);
            Ok(translation.diagnostics)
        })
    }

    fn forget<'a>(&'a self, path: &'a Path) -> ForgetFut<'a> {
        Box::pin(async move {
            self.memo
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(path);
        })
    }
}
