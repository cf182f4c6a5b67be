//! Built-in Python checker.
//!
//! A lightweight lexer blanks out string and comment text so later passes
//! only see code. Two rules run over the result: unterminated string
//! literals and unused imports.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use triage_types::{Category, FixDescriptor, Position, Severity, TextEdit};

use crate::in_process::{Analyzer, Finding, RuleSpec};

pub const UNTERMINATED_STRING: &str = "unterminated-string";
pub const UNUSED_IMPORT: &str = "unused-import";

const RULES: &[RuleSpec] = &[
    RuleSpec {
        rule: UNTERMINATED_STRING,
        severity: Severity::Error,
        category: Category::Syntax,
    },
    RuleSpec {
        rule: UNUSED_IMPORT,
        severity: Severity::Warning,
        category: Category::Lint,
    },
];

static IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid identifier regex"));

static QUOTED_IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"['"]([A-Za-z_][A-Za-z0-9_]*)['"]"#).expect("valid quoted identifier regex")
});

#[derive(Debug, Default, Clone, Copy)]
pub struct PythonAnalyzer;

impl Analyzer for PythonAnalyzer {
    fn name(&self) -> &str {
        "builtin-python"
    }

    fn language(&self) -> &str {
        "python"
    }

    fn extensions(&self) -> &[&str] {
        &["py", "pyi"]
    }

    fn rules(&self) -> &[RuleSpec] {
        RULES
    }

    fn analyze(&self, path: &Path, content: &str) -> Vec<Finding> {
        let lexed = lex(content);
        let mut findings: Vec<Finding> = lexed
            .unterminated
            .iter()
            .map(|open| Finding {
                rule: UNTERMINATED_STRING,
                line: open.line,
                character: open.character,
                end: None,
                message: if open.triple {
                    "unterminated triple-quoted string literal".to_string()
                } else {
                    "unterminated string literal".to_string()
                },
                fix: None,
            })
            .collect();

        // Package initializers import to re-export.
        let is_init = path.file_name().is_some_and(|n| n == "__init__.py");
        if !is_init {
            findings.extend(unused_imports(&lexed.code, content));
        }
        findings
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenString {
    quote: char,
    triple: bool,
    line: u32,
    character: u32,
}

struct Lexed {
    /// Source lines with string bodies and comments replaced by spaces.
    /// Character columns are preserved.
    code: Vec<String>,
    unterminated: Vec<OpenString>,
}

fn lex(content: &str) -> Lexed {
    let chars: Vec<char> = content.chars().collect();
    let mut code = Vec::new();
    let mut unterminated = Vec::new();
    let mut current = String::new();
    let mut open: Option<OpenString> = None;
    let (mut line, mut col) = (0u32, 0u32);
    let mut i = 0;

    let tripled = |i: usize, q: char| chars.get(i + 1) == Some(&q) && chars.get(i + 2) == Some(&q);

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            if let Some(s) = open
                && !s.triple
            {
                unterminated.push(s);
                open = None;
            }
            code.push(std::mem::take(&mut current));
            line += 1;
            col = 0;
            i += 1;
            continue;
        }

        match open {
            None if c == '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    current.push(' ');
                    i += 1;
                    col += 1;
                }
            }
            None if c == '\'' || c == '"' => {
                let triple = tripled(i, c);
                open = Some(OpenString {
                    quote: c,
                    triple,
                    line,
                    character: col,
                });
                let width = if triple { 3 } else { 1 };
                for _ in 0..width {
                    current.push(c);
                }
                i += width;
                col += u32::try_from(width).unwrap_or(1);
            }
            None => {
                current.push(c);
                i += 1;
                col += 1;
            }
            Some(_) if c == '\\' => {
                current.push(' ');
                i += 1;
                col += 1;
                match chars.get(i) {
                    // Escaped newline continues the literal on the next line.
                    Some('\n') => {
                        code.push(std::mem::take(&mut current));
                        line += 1;
                        col = 0;
                        i += 1;
                    }
                    Some(_) => {
                        current.push(' ');
                        i += 1;
                        col += 1;
                    }
                    None => {}
                }
            }
            Some(s) if c == s.quote && (!s.triple || tripled(i, c)) => {
                let width = if s.triple { 3 } else { 1 };
                for _ in 0..width {
                    current.push(c);
                }
                i += width;
                col += u32::try_from(width).unwrap_or(1);
                open = None;
            }
            Some(_) => {
                current.push(' ');
                i += 1;
                col += 1;
            }
        }
    }
    if let Some(s) = open {
        unterminated.push(s);
    }
    code.push(current);
    Lexed { code, unterminated }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ImportKind {
    Plain,
    From { module: String },
}

/// One imported name as written (`a.b as c`) and the name it binds (`c`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    written: String,
    bound: String,
}

#[derive(Debug, Clone)]
struct ImportStmt {
    kind: ImportKind,
    bindings: Vec<Binding>,
    indent: String,
    first: usize,
    last: usize,
}

impl ImportStmt {
    /// The statement with binding `skip` removed, or `None` if nothing remains.
    fn without(&self, skip: usize) -> Option<String> {
        let kept: Vec<&str> = self
            .bindings
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .map(|(_, b)| b.written.as_str())
            .collect();
        if kept.is_empty() {
            return None;
        }
        let names = kept.join(", ");
        Some(match &self.kind {
            ImportKind::Plain => format!("{}import {names}\n", self.indent),
            ImportKind::From { module } => format!("{}from {module} import {names}\n", self.indent),
        })
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_binding(part: &str, dotted: bool) -> Option<Binding> {
    let words: Vec<&str> = part.split_whitespace().collect();
    let (name, alias) = match words.as_slice() {
        [name] => (*name, None),
        [name, "as", alias] => (*name, Some(*alias)),
        _ => return None,
    };
    let valid_name = if dotted {
        name.split('.').all(is_identifier)
    } else {
        is_identifier(name)
    };
    if !valid_name || alias.is_some_and(|a| !is_identifier(a)) {
        return None;
    }
    let bound = alias.unwrap_or_else(|| name.split('.').next().unwrap_or(name));
    Some(Binding {
        written: words.join(" "),
        bound: bound.to_string(),
    })
}

/// Parse a joined import statement. Anything unusual (star imports,
/// `__future__`, semicolons) yields `None` and is left alone.
fn parse_import(text: &str) -> Option<(ImportKind, Vec<Binding>)> {
    let text = text.trim();
    if text.contains(';') {
        return None;
    }
    let (kind, names, dotted) = if let Some(rest) = text.strip_prefix("import ") {
        (ImportKind::Plain, rest, true)
    } else {
        let rest = text.strip_prefix("from ")?;
        let (module, names) = rest.split_once(" import ")?;
        let module = module.trim();
        if module == "__future__" || module.is_empty() {
            return None;
        }
        let names = names.trim();
        let names = names
            .strip_prefix('(')
            .and_then(|n| n.strip_suffix(')'))
            .unwrap_or(names);
        if names.contains('*') {
            return None;
        }
        (
            ImportKind::From {
                module: module.to_string(),
            },
            names,
            false,
        )
    };
    let bindings: Option<Vec<Binding>> = names
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| parse_binding(p, dotted))
        .collect();
    let bindings = bindings.filter(|b| !b.is_empty())?;
    Some((kind, bindings))
}

fn collect_imports(code: &[String]) -> Vec<ImportStmt> {
    let mut out = Vec::new();
    let mut idx = 0;
    while idx < code.len() {
        let line = &code[idx];
        let trimmed = line.trim_start();
        if !(trimmed.starts_with("import ") || trimmed.starts_with("from ")) {
            idx += 1;
            continue;
        }
        let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
        let first = idx;
        let mut text = String::new();
        loop {
            let piece = code[idx].trim_end();
            let continued = piece.ends_with('\\');
            text.push_str(piece.strip_suffix('\\').unwrap_or(piece));
            text.push(' ');
            let unbalanced = text.matches('(').count() > text.matches(')').count();
            if !(continued || unbalanced) || idx + 1 >= code.len() {
                break;
            }
            idx += 1;
        }
        let last = idx;
        idx += 1;
        if let Some((kind, bindings)) = parse_import(&text) {
            out.push(ImportStmt {
                kind,
                bindings,
                indent,
                first,
                last,
            });
        }
    }
    out
}

/// Character column of `word` as a whole identifier in `line`.
fn find_word(line: &str, word: &str) -> Option<u32> {
    IDENT
        .find_iter(line)
        .find(|m| m.as_str() == word)
        .and_then(|m| u32::try_from(line[..m.start()].chars().count()).ok())
}

fn unused_imports(code: &[String], content: &str) -> Vec<Finding> {
    let imports = collect_imports(code);
    if imports.is_empty() {
        return Vec::new();
    }

    let mut import_lines = HashSet::new();
    for stmt in &imports {
        import_lines.extend(stmt.first..=stmt.last);
    }
    let mut used: HashSet<&str> = HashSet::new();
    for (n, line) in code.iter().enumerate() {
        if import_lines.contains(&n) {
            continue;
        }
        for m in IDENT.find_iter(line) {
            // `x.os` does not use a module bound as `os`.
            if line[..m.start()].ends_with('.') {
                continue;
            }
            used.insert(m.as_str());
        }
    }
    if content.contains("__all__") {
        used.extend(
            QUOTED_IDENT
                .captures_iter(content)
                .filter_map(|c| c.get(1).map(|m| m.as_str())),
        );
    }

    let mut findings = Vec::new();
    for stmt in &imports {
        for (index, binding) in stmt.bindings.iter().enumerate() {
            if used.contains(binding.bound.as_str()) {
                continue;
            }
            let (line, character) = (stmt.first..=stmt.last)
                .find_map(|n| find_word(&code[n], &binding.bound).map(|c| (n, c)))
                .unwrap_or((stmt.first, u32::try_from(stmt.indent.chars().count()).unwrap_or(0)));
            let Ok(line) = u32::try_from(line) else {
                continue;
            };
            let (Ok(first), Ok(last)) = (u32::try_from(stmt.first), u32::try_from(stmt.last))
            else {
                continue;
            };
            let edit = match stmt.without(index) {
                None => TextEdit::delete_lines(first, last),
                Some(rewritten) => TextEdit {
                    start: Position::new(first, 0),
                    end: Position::new(last + 1, 0),
                    new_text: rewritten,
                },
            };
            let width = u32::try_from(binding.bound.chars().count()).unwrap_or(0);
            findings.push(Finding {
                rule: UNUSED_IMPORT,
                line,
                character,
                end: Some(Position::new(line, character + width)),
                message: format!("`{}` imported but unused", binding.bound),
                fix: Some(FixDescriptor {
                    title: format!("Remove unused import `{}`", binding.bound),
                    edits: vec![edit],
                    payload: None,
                }),
            });
        }
    }
    findings
}
