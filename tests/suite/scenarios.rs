//! End-to-end scenarios over the built-in analyzer, scripted backends and a
//! fake language server.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use triage_engine::TriageConfig;
use triage_lsp::fake::{FakeLauncher, FakeServer};
use triage_types::{Category, DiagnosticFilter, Severity, SourceKind};

use crate::common::{
    Report, Script, ScriptedSource, bare_config, default_engine, engine_with, workspace,
};

#[tokio::test]
async fn unterminated_string_is_one_syntax_error_on_its_line() {
    let ws = workspace(&[(
        "a.py",
        "def greet():\n    return 1\n\nmsg = \"hello\nprint(msg)\n",
    )]);
    let engine = default_engine(&ws);

    let all = engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert_eq!(all.total(), 1);
    let diag = all.diagnostics().next().unwrap();
    assert_eq!(diag.category(), Category::Syntax);
    assert_eq!(diag.severity(), Severity::Error);
    assert_eq!(diag.line(), 3);
    assert_eq!(diag.file_path(), Path::new("a.py"));
}

#[cfg(unix)]
#[tokio::test]
async fn import_reported_by_two_backends_collapses_to_the_server() {
    let ws = workspace(&[("b.py", "import requests\n\nrequests.get('x')\n")]);
    let server = FakeServer::publishing(|_uri, text| {
        if text.starts_with("import requests") {
            vec![json!({
                "range": {
                    "start": {"line": 0, "character": 7},
                    "end": {"line": 0, "character": 15}
                },
                "severity": 1,
                "code": "reportMissingImports",
                "message": "Import \"requests\" could not be resolved",
            })]
        } else {
            vec![]
        }
    });
    let launcher = Arc::new(FakeLauncher::new(server));
    // A text-format linter reporting the same import as a warning.
    let config = TriageConfig::parse(
        r#"
        [servers.python]
        command = "pyright-langserver"
        args = ["--stdio"]
        language_id = "python"
        file_extensions = ["py"]

        [linters.pylint]
        command = "sh"
        args = ['-c', 'echo "$1:1:8: warning: E0401 Import \"requests\" could not be resolved"', 'sh', '{file}']
        language_id = "python"
        file_extensions = ["py"]
        format = "text"
        "#,
    )
    .unwrap();
    let engine = triage_engine::DiagnosticsEngine::builder(ws.clone())
        .config(config)
        .launcher(launcher.clone())
        .build();

    let all = engine.query(&DiagnosticFilter::all()).await.unwrap();
    let set = all.file(Path::new("b.py")).unwrap();
    assert!(set.degraded_sources().is_empty(), "{:?}", set.degraded_sources());
    assert_eq!(set.len(), 1, "{:#?}", set.diagnostics());
    let diag = &set.diagnostics()[0];
    assert_eq!(diag.category(), Category::Import);
    assert_eq!(diag.severity(), Severity::Error.max(Severity::Warning));
    assert_eq!(diag.source(), "pyright-langserver");
    assert_eq!(
        set.sources_consulted().iter().collect::<Vec<_>>(),
        vec!["builtin-python", "pylint", "pyright-langserver"]
    );
    assert_eq!(launcher.launches(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn equal_severity_duplicates_go_to_the_more_trusted_backend() {
    let ws = workspace(&[("b.py", "import requests\n")]);
    let mypy = ScriptedSource::new(
        "mypy",
        SourceKind::Subprocess,
        Script::Report(vec![Report::new(
            0,
            Severity::Error,
            Category::Import,
            "Import 'requests' could not be resolved  [import]",
        )]),
    );
    let checker = ScriptedSource::new(
        "checker",
        SourceKind::InProcess,
        Script::Report(vec![Report::new(
            0,
            Severity::Error,
            Category::Import,
            "Import \"requests\" could not be resolved",
        )]),
    );
    let engine = engine_with(&ws, bare_config(), vec![mypy.clone(), checker.clone()]);

    let all = engine.query(&DiagnosticFilter::all()).await.unwrap();
    let set = all.file(Path::new("b.py")).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.diagnostics()[0].source(), "checker");
    assert_eq!(mypy.calls(), 1);
    assert_eq!(checker.calls(), 1);
}

#[tokio::test]
async fn resolving_an_unused_import_removes_it() {
    let ws = workspace(&[("a.py", "import os\nimport sys\n\nprint(sys.argv)\n")]);
    let engine = default_engine(&ws);

    let before = engine
        .query(&DiagnosticFilter::all().fixable_only())
        .await
        .unwrap();
    assert_eq!(before.total(), 1);
    let target = before.diagnostics().next().unwrap().clone();
    assert_eq!(target.message(), "`os` imported but unused");

    let result = engine.resolve_error(target.id()).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.resolved, vec![target.id().clone()]);
    assert_eq!(
        ws.get(Path::new("a.py")).as_deref(),
        Some("import sys\n\nprint(sys.argv)\n")
    );

    let after = engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert!(after.diagnostics().all(|d| d.id() != target.id()));
    assert!(after.is_empty());
}
