//! Cross-source deduplication.
//!
//! Two diagnostics collapse only when they sit on the same line, share a
//! category, and their normalized messages either share a prefix or are
//! similar enough by token overlap. The survivor is the most severe entry;
//! equal severities go to the higher-priority source.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use triage_types::{Diagnostic, DiagnosticSet, SnapshotVersion, SourceKind};

use crate::config::DedupConfig;

/// One source's successful contribution for a file.
#[derive(Debug, Clone)]
pub struct SourceOutput {
    pub source: String,
    pub kind: SourceKind,
    pub diagnostics: Vec<Diagnostic>,
}

static SEVERITY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:error|warning|warn|info|note|hint|fatal)\s*[:\-]\s*")
        .expect("valid severity prefix regex")
});

static CODE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[a-z]+\d+\b:?\s*").expect("valid code prefix regex"));

static BRACKETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*(?:\[[a-z0-9_\-]+\]|\([a-z0-9_\-]+\))\s*$").expect("valid bracketed code regex")
});

static QUOTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["'`\u{2018}\u{2019}\u{201c}\u{201d}]"#).expect("valid quote regex"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Lowercased message with severity labels, rule codes, quoting and
/// repeated whitespace removed.
#[must_use]
pub fn normalize_message(message: &str) -> String {
    let lower = message.to_lowercase();
    let stripped = SEVERITY_PREFIX.replace(&lower, "");
    let stripped = CODE_PREFIX.replace(&stripped, "");
    let stripped = BRACKETED.replace(&stripped, "");
    let stripped = QUOTES.replace_all(&stripped, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

fn tokens(normalized: &str) -> HashSet<&str> {
    normalized
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .collect()
}

/// Jaccard ratio of the two messages' token sets.
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(&b).count();
    let union = a.union(&b).count();
    shared as f64 / union as f64
}

fn kind_rank(kind: SourceKind) -> usize {
    match kind {
        SourceKind::Protocol => 0,
        SourceKind::InProcess => 1,
        SourceKind::Subprocess => 2,
    }
}

struct Candidate {
    diagnostic: Diagnostic,
    normalized: String,
    rank: usize,
}

pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Lower is more trusted: configured order first, then by source family.
    fn rank(&self, source: &str, kind: SourceKind) -> usize {
        let listed = self.config.source_priority.len();
        self.config
            .source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(listed + kind_rank(kind))
    }

    fn prefix<'s>(&self, normalized: &'s str) -> &'s str {
        match normalized.char_indices().nth(self.config.prefix_chars) {
            Some((end, _)) => &normalized[..end],
            None => normalized,
        }
    }

    fn same_finding(&self, a: &Candidate, b: &Candidate) -> bool {
        if a.diagnostic.line() != b.diagnostic.line()
            || a.diagnostic.category() != b.diagnostic.category()
        {
            return false;
        }
        self.prefix(&a.normalized) == self.prefix(&b.normalized)
            || similarity(&a.normalized, &b.normalized) >= self.config.similarity_threshold
    }

    /// Merge every source's output for one file into a single set.
    ///
    /// `sources_consulted` is the union of the successful sources, including
    /// those whose findings all collapsed into another source's.
    #[must_use]
    pub fn merge(
        &self,
        file_path: PathBuf,
        snapshot_version: SnapshotVersion,
        outputs: Vec<SourceOutput>,
        produced_at: DateTime<Utc>,
    ) -> DiagnosticSet {
        let mut consulted = BTreeSet::new();
        let mut kept: Vec<Candidate> = Vec::new();
        let mut collapsed = 0usize;

        for output in outputs {
            let rank = self.rank(&output.source, output.kind);
            consulted.insert(output.source);
            for diagnostic in output.diagnostics {
                let candidate = Candidate {
                    normalized: normalize_message(diagnostic.message()),
                    diagnostic,
                    rank,
                };
                match kept.iter_mut().find(|k| self.same_finding(k, &candidate)) {
                    Some(existing) => {
                        collapsed += 1;
                        if outranks(&candidate, existing) {
                            *existing = candidate;
                        }
                    }
                    None => kept.push(candidate),
                }
            }
        }

        if collapsed > 0 {
            tracing::debug!(
                path = %file_path.display(),
                collapsed,
                kept = kept.len(),
                "Collapsed duplicate diagnostics"
            );
        }

        DiagnosticSet::new(
            file_path,
            snapshot_version,
            kept.into_iter().map(|c| c.diagnostic).collect(),
            consulted,
            produced_at,
        )
    }
}

/// Higher severity wins; ties go to the more trusted source, then the
/// earlier id so the outcome does not depend on arrival order.
fn outranks(challenger: &Candidate, holder: &Candidate) -> bool {
    let (c, h) = (&challenger.diagnostic, &holder.diagnostic);
    c.severity()
        .cmp(&h.severity())
        .then_with(|| holder.rank.cmp(&challenger.rank))
        .then_with(|| h.id().cmp(c.id()))
        .is_gt()
}

/// Per-source counts, for logging a merge.
#[must_use]
pub fn contributions(set: &DiagnosticSet) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for diag in set.diagnostics() {
        *counts.entry(diag.source()).or_insert(0) += 1;
    }
    counts
}
