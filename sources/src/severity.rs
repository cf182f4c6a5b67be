//! Fixed per-backend severity lookup tables.
//!
//! Every backend's native severity (numeric LSP level, linter label, rule
//! code) resolves to one of the four unified levels. Unknown values map to
//! `warning` rather than failing the record.

use std::collections::HashMap;

use triage_types::Severity;

/// LSP numeric severity. Absent or out-of-range values become `warning`.
#[must_use]
pub fn from_lsp(value: Option<u64>) -> Severity {
    value.and_then(Severity::from_lsp).unwrap_or(Severity::Warning)
}

/// Label and rule-code table for one-shot linters.
#[derive(Debug, Clone)]
pub struct SeverityTable {
    labels: HashMap<String, Severity>,
    /// Leading letters of a rule code (`E` in `E0401`).
    code_prefixes: HashMap<String, Severity>,
    /// Exact rule codes, from configuration.
    overrides: HashMap<String, Severity>,
}

impl Default for SeverityTable {
    fn default() -> Self {
        let labels = [
            ("error", Severity::Error),
            ("fatal", Severity::Error),
            ("critical", Severity::Error),
            ("warning", Severity::Warning),
            ("warn", Severity::Warning),
            ("info", Severity::Info),
            ("information", Severity::Info),
            ("note", Severity::Info),
            ("convention", Severity::Info),
            ("hint", Severity::Hint),
            ("refactor", Severity::Hint),
            ("style", Severity::Hint),
        ];
        let code_prefixes = [
            ("E", Severity::Error),
            ("F", Severity::Error),
            ("W", Severity::Warning),
            ("C", Severity::Info),
            ("I", Severity::Info),
            ("R", Severity::Hint),
        ];
        Self {
            labels: labels.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
            code_prefixes: code_prefixes
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
            overrides: HashMap::new(),
        }
    }
}

impl SeverityTable {
    /// Default table plus exact-code overrides (`"F401" = "warning"`).
    ///
    /// Overrides with an unknown severity label are logged and ignored.
    #[must_use]
    pub fn with_overrides<'a>(overrides: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut table = Self::default();
        for (code, label) in overrides {
            match Severity::from_label(label) {
                Some(severity) => {
                    table.overrides.insert(code.to_string(), severity);
                }
                None => tracing::warn!(%code, %label, "Ignoring unknown severity override"),
            }
        }
        table
    }

    /// Resolve a record's severity from its label and/or rule code.
    ///
    /// Exact code overrides win, then the record's own label, then the code's
    /// letter prefix. Anything unrecognized is `warning`.
    #[must_use]
    pub fn resolve(&self, label: Option<&str>, code: Option<&str>) -> Severity {
        if let Some(severity) = code.and_then(|c| self.overrides.get(c)) {
            return *severity;
        }
        if let Some(label) = label {
            return self
                .labels
                .get(&label.trim().to_ascii_lowercase())
                .copied()
                .unwrap_or(Severity::Warning);
        }
        code.map(|c| {
            c.chars()
                .take_while(char::is_ascii_alphabetic)
                .collect::<String>()
        })
        .and_then(|prefix| self.code_prefixes.get(&prefix).copied())
        .unwrap_or(Severity::Warning)
    }
}
