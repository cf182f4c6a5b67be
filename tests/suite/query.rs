//! Pull-path behavior: caching, staleness and filters.

use std::path::Path;
use std::time::Duration;

use triage_engine::RefreshScope;
use triage_types::{Category, DiagnosticFilter, Severity, SnapshotVersion, SourceKind};

use crate::common::{
    Report, Script, ScriptedSource, bare_config, default_engine, engine_with, workspace,
};

fn two_findings() -> Vec<Report> {
    vec![
        Report::new(0, Severity::Error, Category::TypeCheck, "Incompatible return value"),
        Report::new(2, Severity::Warning, Category::Style, "Line too long (101 > 88)"),
    ]
}

#[tokio::test]
async fn repeated_query_is_served_from_cache() {
    let ws = workspace(&[("a.py", "x = 1\n"), ("pkg/b.py", "y = 2\n")]);
    let source = ScriptedSource::reporting("checker", two_findings());
    let engine = engine_with(&ws, bare_config(), vec![source.clone()]);

    let first = engine.query(&DiagnosticFilter::all()).await.unwrap();
    let second = engine.query(&DiagnosticFilter::all()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.total(), 4);
    assert_eq!(source.calls(), 2);
    let stats = engine.cache_stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.entries, 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_queries_share_one_analysis() {
    let ws = workspace(&[("a.py", "x = 1\n")]);
    let source = ScriptedSource::new(
        "checker",
        SourceKind::Subprocess,
        Script::Slow(Duration::from_millis(100), two_findings()),
    );
    let engine = engine_with(&ws, bare_config(), vec![source.clone()]);

    let all = DiagnosticFilter::all();
    let (first, second) = tokio::join!(engine.query(&all), engine.query(&all));

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(source.calls(), 1);
    assert_eq!(engine.cache_stats().entries, 1);
}

#[tokio::test]
async fn changed_content_never_returns_old_snapshot() {
    let ws = workspace(&[("a.py", "x = 1\n")]);
    let source = ScriptedSource::reporting("checker", two_findings());
    let engine = engine_with(&ws, bare_config(), vec![source.clone()]);

    engine.query(&DiagnosticFilter::all()).await.unwrap();
    ws.insert("a.py", "x = 2\n");
    let after = engine.query(&DiagnosticFilter::all()).await.unwrap();

    let old = SnapshotVersion::of("x = 1\n");
    let new = SnapshotVersion::of("x = 2\n");
    assert_eq!(after.total(), 2);
    assert!(after.diagnostics().all(|d| !d.matches_snapshot(&old)));
    assert!(after.diagnostics().all(|d| d.matches_snapshot(&new)));
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn filters_compose_and_errors_are_flattened_by_path() {
    let ws = workspace(&[
        ("src/b.py", "b\n"),
        ("src/a.py", "a\n"),
        ("tests/t.py", "t\n"),
        ("README.md", "# readme\n"),
    ]);
    let source = ScriptedSource::reporting("checker", two_findings());
    let engine = engine_with(&ws, bare_config(), vec![source.clone()]);

    let errors = engine
        .errors(&DiagnosticFilter::all().path("src").min_severity(Severity::Error))
        .await
        .unwrap();
    let paths: Vec<&Path> = errors.iter().map(|d| d.file_path()).collect();
    assert_eq!(paths, vec![Path::new("src/a.py"), Path::new("src/b.py")]);
    assert!(errors.iter().all(|d| d.severity() == Severity::Error));

    let style = engine
        .query(&DiagnosticFilter::all().category(Category::Style))
        .await
        .unwrap();
    assert_eq!(style.total(), 3);

    // The markdown file is never handed to a python source.
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn summary_and_hotspots_cover_the_whole_workspace() {
    let ws = workspace(&[
        ("clean.py", "print('ok')\n"),
        ("messy.py", "import os\nimport sys\nx = 'open\n"),
        ("one.py", "import json\n"),
    ]);
    let engine = default_engine(&ws);

    let summary = engine.summary().await.unwrap();
    assert_eq!(summary.total_errors, 1);
    assert_eq!(summary.total_warnings, 3);
    assert_eq!(summary.files_with_errors, 1);
    assert_eq!(engine.error_summary().await.unwrap(), summary);

    let hot = engine.hotspots(5).await.unwrap();
    assert_eq!(hot.len(), 2);
    assert_eq!(hot[0].path, Path::new("messy.py"));
    assert_eq!(hot[0].errors, 1);
    assert_eq!(hot[1].path, Path::new("one.py"));
}

#[tokio::test]
async fn refresh_file_reanalyzes_only_that_file() {
    let ws = workspace(&[("a.py", "a\n"), ("b.py", "b\n")]);
    let source = ScriptedSource::reporting("checker", two_findings());
    let engine = engine_with(&ws, bare_config(), vec![source.clone()]);
    engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert_eq!(source.calls(), 2);

    let refreshed = engine
        .refresh(RefreshScope::File("a.py".into()))
        .await
        .unwrap();
    assert_eq!(refreshed.files().len(), 1);
    assert_eq!(source.calls(), 3);

    engine.refresh(RefreshScope::All).await.unwrap();
    assert_eq!(source.calls(), 5);
    assert_eq!(engine.trends(10).len(), 2);
}

#[tokio::test]
async fn expired_entries_are_recomputed() {
    let ws = workspace(&[("a.py", "a\n")]);
    let source = ScriptedSource::reporting("checker", two_findings());
    let mut config = bare_config();
    config.cache.ttl_secs = 0;
    let engine = engine_with(&ws, config, vec![source.clone()]);

    engine.query(&DiagnosticFilter::all()).await.unwrap();
    engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert_eq!(source.calls(), 2);
}
