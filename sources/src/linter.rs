//! One-shot subprocess linters.
//!
//! Each collect spawns the configured command against one file, waits for
//! it under a deadline, and translates its stdout. Linters conventionally
//! exit non-zero when they find something, so the exit status alone is not
//! treated as failure.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use triage_types::{DiagnosticDraft, FixDescriptor, Position, SourceError, SourceKind, TextEdit};

use crate::adapter::{SourceAdapter, TranslateContext, Translation};
use crate::category;
use crate::severity::SeverityTable;
use crate::source::{CollectFut, DiagnosticSource, FileSnapshot};

const FILE_PLACEHOLDER: &str = "{file}";
const MAX_STDERR_EXCERPT: usize = 512;

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

/// `[linters.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct LinterConfig {
    pub command: String,
    /// `{file}` is replaced by the file's absolute path. Without a
    /// placeholder the path is appended.
    #[serde(default)]
    pub args: Vec<String>,
    pub language_id: String,
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Optional workspace-relative globs further restricting which files run.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Exact rule code to severity label (`"F401" = "warning"`).
    #[serde(default)]
    pub severity_map: BTreeMap<String, String>,
    /// Pipe the in-memory content on stdin instead of relying on the file on disk.
    #[serde(default)]
    pub stdin: bool,
}

impl LinterConfig {
    fn command_args(&self, file: &Path) -> Vec<String> {
        let file = file.to_string_lossy();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(FILE_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(FILE_PLACEHOLDER, &file)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted && !self.stdin {
            args.push(file.into_owned());
        }
        args
    }
}

/// Translates linter stdout in either supported format.
#[derive(Debug, Clone)]
pub struct LinterAdapter {
    format: OutputFormat,
    severities: SeverityTable,
}

impl LinterAdapter {
    #[must_use]
    pub fn new(format: OutputFormat, severities: SeverityTable) -> Self {
        Self { format, severities }
    }

    /// Parse a whole stdout buffer.
    ///
    /// Output that is not valid for the configured format as a whole (JSON
    /// that does not parse) is an error; individual bad records are skipped.
    pub fn parse(&self, stdout: &str, ctx: &TranslateContext<'_>) -> Result<Translation, String> {
        match self.format {
            OutputFormat::Json => {
                let trimmed = stdout.trim();
                if trimmed.is_empty() {
                    return Ok(Translation::default());
                }
                let value: Value =
                    serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON: {e}"))?;
                let records = match &value {
                    Value::Array(items) => items.as_slice(),
                    Value::Object(map) => map
                        .get("diagnostics")
                        .or_else(|| map.get("results"))
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .ok_or("JSON object without a diagnostics array")?,
                    _ => return Err("expected a JSON array of diagnostics".to_string()),
                };
                Ok(self.translate(records, ctx))
            }
            OutputFormat::Text => {
                let lines: Vec<&str> = stdout.lines().collect();
                Ok(self.translate_text(&lines, ctx))
            }
        }
    }

    fn translate_text(&self, lines: &[&str], ctx: &TranslateContext<'_>) -> Translation {
        let mut out = Translation::default();
        for line in lines {
            let Some(caps) = TEXT_LINE.captures(line) else {
                continue;
            };
            if !names_file(&caps["path"], ctx.file) {
                continue;
            }
            out.push(ctx, self.text_record(&caps, ctx));
        }
        out
    }

    fn text_record(
        &self,
        caps: &regex::Captures<'_>,
        ctx: &TranslateContext<'_>,
    ) -> Result<DiagnosticDraft, String> {
        let line = one_based(caps["line"].parse().map_err(|_| "line out of range")?)?;
        let character = match caps.name("col") {
            Some(col) => one_based(col.as_str().parse().map_err(|_| "column out of range")?)?,
            None => 0,
        };
        let message = caps["message"].trim();
        if message.is_empty() {
            return Err("empty message".to_string());
        }
        let code = caps.name("code").map(|c| c.as_str());
        let severity = self
            .severities
            .resolve(caps.name("severity").map(|s| s.as_str()), code);
        let mut draft = DiagnosticDraft::new(
            ctx.file.path.clone(),
            line,
            character,
            severity,
            category::classify(code, message),
            message,
            ctx.source,
        );
        if let Some(code) = code {
            draft = draft.with_code(code);
        }
        Ok(draft)
    }

    fn json_record(
        &self,
        record: &Value,
        ctx: &TranslateContext<'_>,
    ) -> Result<DiagnosticDraft, String> {
        let start = json_position(record, "location", "line", "column")
            .ok_or("missing or invalid location")?;
        let message = record
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or("missing message")?;
        let code = ["code", "message-id", "rule", "ruleId"]
            .iter()
            .find_map(|key| record.get(*key).and_then(Value::as_str))
            .filter(|c| !c.is_empty());
        let label = ["severity", "type", "level"]
            .iter()
            .find_map(|key| record.get(*key).and_then(Value::as_str));

        let mut draft = DiagnosticDraft::new(
            ctx.file.path.clone(),
            start.line,
            start.character,
            self.severities.resolve(label, code),
            category::classify(code, message),
            message,
            ctx.source,
        );
        if let Some(end) = json_position(record, "end_location", "endLine", "endColumn") {
            draft = draft.with_end(end);
        }
        if let Some(code) = code {
            draft = draft.with_code(code);
        }
        if let Some(fix) = record.get("fix").and_then(json_fix) {
            draft = draft.with_fix(fix);
        }
        Ok(draft)
    }
}

impl SourceAdapter for LinterAdapter {
    type Raw = [Value];

    fn translate(&self, raw: &[Value], ctx: &TranslateContext<'_>) -> Translation {
        let mut out = Translation::default();
        for record in raw {
            if let Some(path) = record
                .get("filename")
                .or_else(|| record.get("path"))
                .and_then(Value::as_str)
                && !names_file(path, ctx.file)
            {
                continue;
            }
            out.push(ctx, self.json_record(record, ctx));
        }
        out
    }
}

/// `path:line[:col]: [severity:] [CODE] message`
static TEXT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<path>[^:]+):(?P<line>\d+)(?::(?P<col>\d+))?:\s*(?:(?P<severity>(?i:error|warning|warn|info|note|hint|fatal)):\s*)?(?:(?P<code>[A-Z]+\d+)\b:?\s*)?(?P<message>.*)$",
    )
    .expect("valid linter line regex")
});

fn one_based(value: u64) -> Result<u32, String> {
    value
        .checked_sub(1)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| format!("position {value} is not 1-based"))
}

/// Whether a path printed by a linter refers to the file being checked.
fn names_file(printed: &str, file: &FileSnapshot) -> bool {
    let printed = Path::new(printed);
    printed == file.absolute_path || printed == file.path || file.absolute_path.ends_with(printed)
}

/// Nested `{row, column}` objects are 1-based on both axes; flat
/// `line`/`column` fields are 1-based lines with 0-based columns.
fn json_position(record: &Value, nested: &str, line_key: &str, col_key: &str) -> Option<Position> {
    if let Some(location) = record.get(nested) {
        let line = one_based(location.get("row")?.as_u64()?).ok()?;
        let character = one_based(location.get("column")?.as_u64()?).ok()?;
        return Some(Position::new(line, character));
    }
    let line = one_based(record.get(line_key)?.as_u64()?).ok()?;
    let character = record
        .get(col_key)
        .and_then(Value::as_u64)
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or(0);
    Some(Position::new(line, character))
}

fn json_fix(fix: &Value) -> Option<FixDescriptor> {
    let edits: Option<Vec<TextEdit>> = fix
        .get("edits")?
        .as_array()?
        .iter()
        .map(|edit| {
            Some(TextEdit {
                start: json_position(edit, "location", "line", "column")?,
                end: json_position(edit, "end_location", "endLine", "endColumn")?,
                new_text: edit.get("content")?.as_str()?.to_string(),
            })
        })
        .collect();
    let edits = edits.filter(|e| !e.is_empty())?;
    let title = fix
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Apply fix")
        .to_string();
    Some(FixDescriptor {
        title,
        edits,
        payload: Some(fix.clone()),
    })
}

/// A configured linter run once per collect.
pub struct LinterSource {
    name: String,
    config: LinterConfig,
    include: Option<GlobSet>,
    adapter: LinterAdapter,
}

impl LinterSource {
    #[must_use]
    pub fn new(name: impl Into<String>, config: LinterConfig) -> Self {
        let name = name.into();
        let severities = SeverityTable::with_overrides(
            config
                .severity_map
                .iter()
                .map(|(code, label)| (code.as_str(), label.as_str())),
        );
        let include = build_include(&name, &config.include);
        Self {
            adapter: LinterAdapter::new(config.format, severities),
            name,
            config,
            include,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn run(&self, file: &FileSnapshot) -> Result<String, SourceError> {
        let backend = || self.name.clone();
        let binary = which::which(&self.config.command).map_err(|e| SourceError::Unavailable {
            backend: backend(),
            reason: format!("{} not found: {e}", self.config.command),
        })?;

        let mut cmd = Command::new(&binary);
        cmd.args(self.config.command_args(&file.absolute_path))
            .stdin(if self.config.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = file.absolute_path.parent().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| SourceError::Unavailable {
            backend: backend(),
            reason: format!("failed to spawn {}: {e}", binary.display()),
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            let content = file.content.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(content.as_bytes()).await;
            });
        }

        let started = Instant::now();
        let output = match tokio::time::timeout(self.timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SourceError::Failed {
                    backend: backend(),
                    reason: e.to_string(),
                    retryable: false,
                });
            }
            Err(_) => {
                return Err(SourceError::Timeout {
                    backend: backend(),
                    elapsed: started.elapsed(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.trim().is_empty() && !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(MAX_STDERR_EXCERPT).collect();
            return Err(SourceError::Failed {
                backend: backend(),
                reason: format!("exited with {}: {excerpt}", output.status),
                retryable: false,
            });
        }
        Ok(stdout)
    }
}

fn build_include(name: &str, patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => tracing::warn!(linter = %name, %pattern, "Ignoring invalid include glob: {e}"),
        }
    }
    builder.build().ok()
}

impl DiagnosticSource for LinterSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Subprocess
    }

    fn language(&self) -> &str {
        &self.config.language_id
    }

    fn handles(&self, path: &Path) -> bool {
        let by_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.config.file_extensions.iter().any(|e| e == ext));
        by_extension && self.include.as_ref().is_none_or(|set| set.is_match(path))
    }

    fn collect<'a>(&'a self, file: &'a FileSnapshot) -> CollectFut<'a> {
        Box::pin(async move {
            let stdout = self.run(file).await?;
            let ctx = TranslateContext::new(file, &self.name);
            let translation =
                self.adapter
                    .parse(&stdout, &ctx)
                    .map_err(|reason| SourceError::Malformed {
                        backend: self.name.clone(),
                        reason,
                    })?;
            tracing::debug!(
                source = %self.name,
                path = %file.path.display(),
                count = translation.diagnostics.len(),
                skipped = translation.skipped,
                "Collected linter diagnostics"
            );
            Ok(translation.diagnostics)
        })
    }
}
