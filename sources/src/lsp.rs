//! Protocol-backed sources: a language server behind the session manager.

use std::path::Path;

use serde_json::Value;
use triage_lsp::{SessionError, SessionManager, path_to_file_uri};
use triage_types::{DiagnosticDraft, FixDescriptor, Position, SourceError, SourceKind, TextEdit};

use crate::adapter::{SourceAdapter, TranslateContext, Translation};
use crate::category;
use crate::severity;
use crate::source::{CollectFut, DiagnosticSource, FileSnapshot, ForgetFut};

/// Translates `textDocument/publishDiagnostics` entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct LspAdapter;

impl SourceAdapter for LspAdapter {
    type Raw = [Value];

    fn translate(&self, raw: &[Value], ctx: &TranslateContext<'_>) -> Translation {
        let uri = path_to_file_uri(&ctx.file.absolute_path)
            .map(|u| u.to_string())
            .ok();
        let mut out = Translation::default();
        for record in raw {
            out.push(ctx, translate_record(record, ctx, uri.as_deref()));
        }
        out
    }
}

fn translate_record(
    record: &Value,
    ctx: &TranslateContext<'_>,
    uri: Option<&str>,
) -> Result<DiagnosticDraft, String> {
    let range = record.get("range").ok_or("missing range")?;
    let start = parse_position(range.get("start")).ok_or("missing or invalid range.start")?;
    let message = record
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or("missing message")?;

    let code = match record.get("code") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let severity = severity::from_lsp(record.get("severity").and_then(Value::as_u64));
    let category = category::classify(code.as_deref(), message);

    let mut draft = DiagnosticDraft::new(
        ctx.file.path.clone(),
        start.line,
        start.character,
        severity,
        category,
        message,
        ctx.source,
    );
    if let Some(end) = parse_position(range.get("end")) {
        draft = draft.with_end(end);
    }
    if let Some(code) = code {
        draft = draft.with_code(code);
    }
    if let Some(fix) = inline_fix(record, uri) {
        draft = draft.with_fix(fix);
    }
    Ok(draft)
}

fn parse_position(value: Option<&Value>) -> Option<Position> {
    let value = value?;
    let line = u32::try_from(value.get("line")?.as_u64()?).ok()?;
    let character = u32::try_from(value.get("character")?.as_u64()?).ok()?;
    Some(Position::new(line, character))
}

fn parse_edit(value: &Value) -> Option<TextEdit> {
    let range = value.get("range")?;
    Some(TextEdit {
        start: parse_position(range.get("start"))?,
        end: parse_position(range.get("end"))?,
        new_text: value.get("newText")?.as_str()?.to_string(),
    })
}

fn parse_edits(values: &Value) -> Option<Vec<TextEdit>> {
    let edits: Option<Vec<TextEdit>> = values.as_array()?.iter().map(parse_edit).collect();
    edits.filter(|e| !e.is_empty())
}

/// Quick fix attached to the diagnostic itself.
///
/// Two shapes are recognized: inline `codeActions` whose workspace edit
/// touches this document, and a `data.fix` object carrying `edits`.
fn inline_fix(record: &Value, uri: Option<&str>) -> Option<FixDescriptor> {
    if let Some(actions) = record.get("codeActions").and_then(Value::as_array) {
        for action in actions {
            let Some(changes) = action.pointer("/edit/changes").and_then(Value::as_object) else {
                continue;
            };
            // Fixes that edit other files are not ours to apply.
            if changes.keys().any(|k| Some(k.as_str()) != uri) {
                continue;
            }
            let Some(edits) = uri.and_then(|u| changes.get(u)).and_then(parse_edits) else {
                continue;
            };
            let title = action
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("Apply fix");
            return Some(FixDescriptor {
                title: title.to_string(),
                edits,
                payload: Some(action.clone()),
            });
        }
    }

    let fix = record.pointer("/data/fix")?;
    let edits = parse_edits(fix.get("edits")?)?;
    let title = fix
        .get("title")
        .or_else(|| fix.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("Apply fix");
    Some(FixDescriptor {
        title: title.to_string(),
        edits,
        payload: Some(fix.clone()),
    })
}

/// Maps session failures onto the backend-neutral error shape.
fn source_error(backend: &str, err: SessionError) -> SourceError {
    let backend = backend.to_string();
    match err {
        SessionError::Timeout { elapsed, .. } => SourceError::Timeout { backend, elapsed },
        SessionError::Crashed { .. } => SourceError::Failed {
            backend,
            reason: "language server crashed mid-request".to_string(),
            retryable: true,
        },
        SessionError::Transport { reason, .. } => SourceError::Failed {
            backend,
            reason,
            retryable: false,
        },
        err @ (SessionError::Unavailable { .. }
        | SessionError::NotConfigured(_)
        | SessionError::ShuttingDown) => SourceError::Unavailable {
            backend,
            reason: err.to_string(),
        },
    }
}

/// A language server reached through the shared [`SessionManager`].
pub struct LspSource {
    name: String,
    language: String,
    manager: SessionManager,
}

impl LspSource {
    /// Source for the server the manager keys under `language`.
    #[must_use]
    pub fn new(language: impl Into<String>, manager: SessionManager) -> Self {
        let language = language.into();
        let name = manager
            .config(&language)
            .map_or_else(|| language.clone(), triage_lsp::ServerConfig::source_name);
        Self {
            name,
            language,
            manager,
        }
    }
}

impl DiagnosticSource for LspSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Protocol
    }

    fn language(&self) -> &str {
        &self.language
    }

    fn handles(&self, path: &Path) -> bool {
        self.manager.language_for(path) == Some(self.language.as_str())
    }

    fn collect<'a>(&'a self, file: &'a FileSnapshot) -> CollectFut<'a> {
        Box::pin(async move {
            let handle = self
                .manager
                .acquire(&self.language)
                .await
                .map_err(|e| source_error(&self.name, e))?;
            let raw = handle
                .diagnostics(&file.absolute_path, &file.content)
                .await
                .map_err(|e| source_error(&self.name, e));
            self.manager.release(handle);
            let raw = raw?;

            let ctx = TranslateContext::new(file, &self.name);
            let translation = LspAdapter.translate(raw.as_slice(), &ctx);
            tracing::debug!(
                source = %self.name,
                path = %file.path.display(),
                count = translation.diagnostics.len(),
                skipped = translation.skipped,
                "Collected language server diagnostics"
            );
            Ok(translation.diagnostics)
        })
    }

    fn forget<'a>(&'a self, path: &'a Path) -> ForgetFut<'a> {
        Box::pin(async move {
            // Never start a server just to close a document.
            let Some(handle) = self.manager.current(&self.language) else {
                return;
            };
            let path = self.manager.workspace_root().join(path);
            if let Err(e) = handle.close_document(&path).await {
                tracing::debug!(source = %self.name, "didClose failed: {e}");
            }
        })
    }
}
