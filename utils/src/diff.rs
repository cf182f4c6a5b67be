//! Unified diff formatting and stats.

use similar::{ChangeTag, TextDiff};

/// Lines added and removed by an edit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub additions: u32,
    pub deletions: u32,
}

/// Format a standard unified diff (`---`/`+++` headers, `@@` hunks) with
/// `context` unchanged lines around each change.
///
/// Returns an empty string when the texts are identical.
#[must_use]
pub fn format_unified_diff(path: &str, old_text: &str, new_text: &str, context: usize) -> String {
    if old_text == new_text {
        return String::new();
    }
    let old_header = format!("a/{path}");
    let new_header = format!("b/{path}");
    let diff = TextDiff::from_lines(old_text, new_text);
    diff.unified_diff()
        .context_radius(context)
        .header(&old_header, &new_header)
        .to_string()
}

#[must_use]
pub fn compute_diff_stats(old_text: &str, new_text: &str) -> DiffStats {
    let diff = TextDiff::from_lines(old_text, new_text);

    let mut stats = DiffStats::default();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stats.additions += 1,
            ChangeTag::Delete => stats.deletions += 1,
            ChangeTag::Equal => {}
        }
    }
    stats
}
