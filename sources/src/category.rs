//! Category classification.
//!
//! Structured rule codes are authoritative when a backend supplies one we
//! know. The substring rules over message text are a best-effort fallback
//! and are applied in order; the first match wins.

use triage_types::Category;

/// Known rule codes and code prefixes, checked in order. Prefix entries end with `*`.
const CODE_RULES: &[(&str, Category)] = &[
    // pyflakes / ruff
    ("E999", Category::Syntax),
    ("F401", Category::Lint),
    ("F811", Category::Lint),
    ("F841", Category::Lint),
    ("F821", Category::Undefined),
    ("F822", Category::Undefined),
    ("F*", Category::Lint),
    ("C90*", Category::Complexity),
    ("S*", Category::Security),
    ("E*", Category::Style),
    ("W*", Category::Style),
    ("I*", Category::Style),
    ("N*", Category::Style),
    // pylint
    ("E0001", Category::Syntax),
    ("E0401", Category::Import),
    ("E0602", Category::Undefined),
    // pyright rule names
    ("reportMissingImports", Category::Import),
    ("reportMissingModuleSource", Category::Import),
    ("reportAttributeAccessIssue", Category::TypeCheck),
    ("reportUndefinedVariable", Category::Undefined),
    ("reportUnusedImport", Category::Lint),
    ("reportUnusedVariable", Category::Lint),
    ("report*", Category::TypeCheck),
    // mypy error codes
    ("syntax", Category::Syntax),
    ("import", Category::Import),
    ("import-not-found", Category::Import),
    ("import-untyped", Category::Import),
    ("name-defined", Category::Undefined),
    ("arg-type", Category::TypeCheck),
    ("assignment", Category::TypeCheck),
    ("return-value", Category::TypeCheck),
    ("attr-defined", Category::TypeCheck),
    ("call-arg", Category::TypeCheck),
];

/// Ordered substring rules over lowercased message text.
const MESSAGE_RULES: &[(&str, Category)] = &[
    ("syntax", Category::Syntax),
    ("unterminated", Category::Syntax),
    ("unexpected token", Category::Syntax),
    ("unexpected indent", Category::Syntax),
    ("import", Category::Import),
    ("no module named", Category::Import),
    ("undefined", Category::Undefined),
    ("is not defined", Category::Undefined),
    ("unresolved reference", Category::Undefined),
    ("incompatible type", Category::TypeCheck),
    ("type mismatch", Category::TypeCheck),
    ("is not assignable", Category::TypeCheck),
    ("argument of type", Category::TypeCheck),
    ("has no attribute", Category::TypeCheck),
    ("security", Category::Security),
    ("injection", Category::Security),
    ("hardcoded password", Category::Security),
    ("insecure", Category::Security),
    ("too complex", Category::Complexity),
    ("complexity", Category::Complexity),
    ("too many", Category::Complexity),
    ("line too long", Category::Style),
    ("whitespace", Category::Style),
    ("indentation", Category::Style),
    ("naming", Category::Style),
    ("unused", Category::Lint),
    ("redefinition", Category::Lint),
    ("shadows", Category::Lint),
];

/// Category for a known rule code, if any.
///
/// Exact entries beat prefix entries regardless of table order, so `E0401`
/// is an import problem even though `E*` means style.
#[must_use]
pub fn from_code(code: &str) -> Option<Category> {
    if let Some((_, category)) = CODE_RULES.iter().find(|(rule, _)| *rule == code) {
        return Some(*category);
    }
    CODE_RULES.iter().find_map(|(rule, category)| {
        let prefix = rule.strip_suffix('*')?;
        let rest = code.strip_prefix(prefix)?;
        // Letter-code families (`E*`) only cover `E` followed by digits.
        let letter_code = prefix.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if letter_code && !rest.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        Some(*category)
    })
}

/// Best-effort category from message text. Defaults to `semantic`.
#[must_use]
pub fn from_message(message: &str) -> Category {
    let lower = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map_or(Category::Semantic, |(_, category)| *category)
}

/// Structured code first, message text second.
#[must_use]
pub fn classify(code: Option<&str>, message: &str) -> Category {
    code.and_then(from_code)
        .unwrap_or_else(|| from_message(message))
}
