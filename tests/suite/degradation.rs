//! Partial backend failure degrades a file's set instead of failing the query.

use std::path::Path;

use triage_engine::QueryError;
use triage_types::{Category, DiagnosticFilter, Severity, SourceKind};

use crate::common::{Report, Script, ScriptedSource, engine_with, fast_config, workspace};

fn lint() -> Vec<Report> {
    vec![Report::new(1, Severity::Warning, Category::Lint, "Unused variable 'x'")]
}

#[tokio::test(start_paused = true)]
async fn timed_out_backend_drops_only_its_contribution() {
    let ws = workspace(&[("a.py", "def f():\n    x = 1\n")]);
    let engine = engine_with(
        &ws,
        fast_config(),
        vec![
            ScriptedSource::reporting("ruff", lint()),
            ScriptedSource::new("pyright", SourceKind::Protocol, Script::Hang),
        ],
    );

    let all = engine.query(&DiagnosticFilter::all()).await.unwrap();
    let set = all.file(Path::new("a.py")).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.diagnostics()[0].source(), "ruff");
    assert!(set.sources_consulted().contains("ruff"));
    assert!(!set.sources_consulted().contains("pyright"));
    assert!(set.degraded_sources()["pyright"].contains("timed out"));
}

#[tokio::test]
async fn failing_backend_is_reported_as_degraded() {
    let ws = workspace(&[("a.py", "x = 1\n")]);
    let healthy = ScriptedSource::reporting("ruff", lint());
    let broken = ScriptedSource::new("mypy", SourceKind::Subprocess, Script::Fail);
    let engine = engine_with(&ws, fast_config(), vec![healthy, broken]);

    let all = engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert_eq!(all.total(), 1);
    let set = &all.files()[0];
    assert!(set.degraded_sources().contains_key("mypy"));
    assert!(!set.sources_consulted().contains("mypy"));
}

#[tokio::test]
async fn every_backend_failing_is_a_query_error() {
    let ws = workspace(&[("a.py", "x = 1\n")]);
    let engine = engine_with(
        &ws,
        fast_config(),
        vec![
            ScriptedSource::new("mypy", SourceKind::Subprocess, Script::Fail),
            ScriptedSource::new("ruff", SourceKind::Subprocess, Script::Fail),
        ],
    );

    match engine.query(&DiagnosticFilter::all()).await {
        Err(QueryError::NoSourcesReachable {
            language,
            path,
            failures,
        }) => {
            assert_eq!(language, "python");
            assert_eq!(path, Path::new("a.py"));
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected NoSourcesReachable, got {other:?}"),
    }
}
