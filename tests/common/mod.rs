//! Shared test utilities and fixtures
//!
//! Scripted diagnostic sources, in-memory workspaces and engine builders.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use triage_engine::sources::{CollectFut, DiagnosticSource, FileSnapshot, SharedSource};
use triage_engine::{DiagnosticsEngine, MemoryWorkspace, TriageConfig, Workspace};
use triage_types::{Category, DiagnosticDraft, Severity, SourceError, SourceKind};

/// One finding a scripted source reports for every file it sees.
#[derive(Debug, Clone)]
pub struct Report {
    pub line: u32,
    pub severity: Severity,
    pub category: Category,
    pub message: &'static str,
}

impl Report {
    pub fn new(line: u32, severity: Severity, category: Category, message: &'static str) -> Self {
        Self {
            line,
            severity,
            category,
            message,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    Report(Vec<Report>),
    /// Report after the backend takes this long.
    Slow(Duration, Vec<Report>),
    Fail,
    Hang,
}

/// Python source with scripted output that counts its backend calls.
pub struct ScriptedSource {
    name: &'static str,
    kind: SourceKind,
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(name: &'static str, kind: SourceKind, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            script,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn reporting(name: &'static str, reports: Vec<Report>) -> Arc<Self> {
        Self::new(name, SourceKind::Subprocess, Script::Report(reports))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DiagnosticSource for ScriptedSource {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn language(&self) -> &str {
        "python"
    }

    fn handles(&self, path: &Path) -> bool {
        path.extension().is_some_and(|e| e == "py")
    }

    fn collect<'a>(&'a self, file: &'a FileSnapshot) -> CollectFut<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let reports = match &self.script {
                Script::Report(reports) => reports,
                Script::Slow(delay, reports) => {
                    tokio::time::sleep(*delay).await;
                    reports
                }
                Script::Fail => {
                    return Err(SourceError::Failed {
                        backend: self.name.to_string(),
                        reason: "exit status 2".into(),
                        retryable: false,
                    });
                }
                Script::Hang => std::future::pending().await,
            };
            Ok(reports
                .iter()
                .map(|r| {
                    DiagnosticDraft::new(
                        file.path.clone(),
                        r.line,
                        0,
                        r.severity,
                        r.category,
                        r.message,
                        self.name,
                    )
                    .into_diagnostic(file.version.clone(), Utc::now())
                })
                .collect())
        })
    }
}

pub fn workspace(files: &[(&str, &str)]) -> Arc<MemoryWorkspace> {
    let ws = Arc::new(MemoryWorkspace::new("/ws"));
    for (path, content) in files {
        ws.insert(*path, content);
    }
    ws
}

/// Defaults with the built-in analyzer switched off.
pub fn bare_config() -> TriageConfig {
    let mut config = TriageConfig::default();
    config.analyzers.builtin_python = false;
    config
}

pub fn fast_config() -> TriageConfig {
    let mut config = bare_config();
    config.scheduler.debounce_ms = 100;
    config.aggregation.source_timeout_ms = 200;
    config
}

/// Engine over `ws` using only `sources`.
pub fn engine_with(
    ws: &Arc<MemoryWorkspace>,
    config: TriageConfig,
    sources: Vec<SharedSource>,
) -> DiagnosticsEngine {
    sources
        .into_iter()
        .fold(
            DiagnosticsEngine::builder(Arc::clone(ws) as Arc<dyn Workspace>).config(config),
            |builder, source| builder.source(source),
        )
        .build()
}

/// Engine over `ws` with the default configuration: built-in analyzer only.
pub fn default_engine(ws: &Arc<MemoryWorkspace>) -> DiagnosticsEngine {
    DiagnosticsEngine::builder(Arc::clone(ws) as Arc<dyn Workspace>).build()
}

/// Let spawned dispatch tasks run.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
