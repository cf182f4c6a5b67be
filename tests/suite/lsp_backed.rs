//! Engine behavior over a fake language server.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use triage_engine::{DiagnosticsEngine, TriageConfig};
use triage_lsp::SessionState;
use triage_lsp::fake::{FakeLauncher, FakeServer};
use triage_types::{Category, DiagnosticFilter, Severity};

use crate::common::workspace;

fn python_server_config() -> TriageConfig {
    TriageConfig::parse(
        r#"
        [servers.python]
        command = "pyright-langserver"
        args = ["--stdio"]
        language_id = "python"
        file_extensions = ["py"]
        "#,
    )
    .unwrap()
}

fn undefined_name_server() -> FakeServer {
    FakeServer::publishing(|_uri, text| {
        if text.contains("undefined_thing") {
            vec![json!({
                "range": {
                    "start": {"line": 0, "character": 4},
                    "end": {"line": 0, "character": 19}
                },
                "severity": 1,
                "code": "reportUndefinedVariable",
                "message": "\"undefined_thing\" is not defined",
            })]
        } else {
            vec![]
        }
    })
}

#[tokio::test]
async fn session_starts_lazily_and_reports_ready() {
    let ws = workspace(&[("a.py", "x = undefined_thing\n")]);
    let launcher = Arc::new(FakeLauncher::new(undefined_name_server()));
    let engine = DiagnosticsEngine::builder(ws.clone())
        .config(python_server_config())
        .launcher(launcher.clone())
        .build();

    let health = engine.health_check();
    assert_eq!(health.sessions.len(), 1);
    assert_eq!(health.sessions[0].language, "python");
    assert_eq!(health.sessions[0].state, None);
    assert_eq!(launcher.launches(), 0);
    assert!(!health.watching);

    let all = engine.query(&DiagnosticFilter::all()).await.unwrap();
    let set = all.file(Path::new("a.py")).unwrap();
    assert!(set.sources_consulted().contains("pyright-langserver"));
    let from_server: Vec<_> = set
        .diagnostics()
        .iter()
        .filter(|d| d.source() == "pyright-langserver")
        .collect();
    assert_eq!(from_server.len(), 1);
    assert_eq!(from_server[0].severity(), Severity::Error);
    assert_eq!(from_server[0].code(), Some("reportUndefinedVariable"));
    assert_eq!(from_server[0].character(), 4);

    let health = engine.health_check();
    assert_eq!(health.sessions[0].state, Some(SessionState::Ready));
    assert_eq!(health.cache.entries, 1);
    assert_eq!(launcher.launches(), 1);

    // Served from cache: no second document sync.
    let synced = launcher.documents_synced();
    engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert_eq!(launcher.documents_synced(), synced);

    engine.shutdown().await;
    assert_eq!(launcher.shutdown_requests(), 1);
}

#[tokio::test]
async fn missing_server_degrades_to_builtin_analysis() {
    let ws = workspace(&[("a.py", "import os\n")]);
    let launcher = Arc::new(FakeLauncher::new(undefined_name_server()));
    launcher.set_fail_launch(true);
    let engine = DiagnosticsEngine::builder(ws.clone())
        .config(python_server_config())
        .launcher(launcher.clone())
        .build();

    let all = engine.query(&DiagnosticFilter::all()).await.unwrap();
    let set = all.file(Path::new("a.py")).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.diagnostics()[0].category(), Category::Lint);
    assert_eq!(set.diagnostics()[0].source(), "builtin-python");
    assert!(set.degraded_sources().contains_key("pyright-langserver"));
    assert!(!set.sources_consulted().contains("pyright-langserver"));

    engine.shutdown().await;
}
