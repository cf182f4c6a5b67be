//! Fix resolution against in-memory and on-disk workspaces.

use std::path::Path;
use std::sync::Arc;

use triage_engine::{DiagnosticsEngine, FixError, FsWorkspace, Workspace};
use triage_types::{DiagnosticFilter, DiagnosticId};

use crate::common::{default_engine, workspace};

#[tokio::test]
async fn fix_against_changed_file_is_stale_and_writes_nothing() {
    let ws = workspace(&[("a.py", "import os\nprint(1)\n")]);
    let engine = default_engine(&ws);
    let fixable = engine
        .errors(&DiagnosticFilter::all().fixable_only())
        .await
        .unwrap();
    let id = fixable[0].id().clone();

    ws.insert("a.py", "import os\nprint(2)\n");
    let result = engine.resolve_error(&id).await;

    assert!(!result.success);
    assert!(
        matches!(result.error, Some(FixError::StaleDiagnostic { .. })),
        "{:?}",
        result.error
    );
    assert!(result.resolved.is_empty());
    assert_eq!(ws.writes(), 0);
    assert_eq!(
        ws.get(Path::new("a.py")).as_deref(),
        Some("import os\nprint(2)\n")
    );
}

#[tokio::test]
async fn fix_after_change_notification_is_stale() {
    let ws = workspace(&[("a.py", "import os\nprint(1)\n")]);
    let engine = default_engine(&ws);
    let fixable = engine
        .errors(&DiagnosticFilter::all().fixable_only())
        .await
        .unwrap();
    let id = fixable[0].id().clone();

    ws.insert("a.py", "import os\nprint(2)\n");
    engine.notify_changed("a.py");
    let result = engine.resolve_error(&id).await;
    assert!(
        matches!(result.error, Some(FixError::StaleDiagnostic { .. })),
        "{:?}",
        result.error
    );
    assert!(engine.preview_fix(&id).unwrap().stale);

    // The import moved, so re-analysis no longer reports this id.
    ws.insert("a.py", "\nimport os\nprint(3)\n");
    engine.notify_changed("a.py");
    let fresh = engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert!(fresh.diagnostics().all(|d| d.id() != &id));
    let result = engine.resolve_error(&id).await;
    assert!(
        matches!(result.error, Some(FixError::StaleDiagnostic { .. })),
        "{:?}",
        result.error
    );
    assert_eq!(ws.writes(), 0);
}

#[tokio::test]
async fn preview_is_repeatable_and_read_only() {
    let ws = workspace(&[("a.py", "import os, sys\nprint(sys.argv)\n")]);
    let engine = default_engine(&ws);
    let fixable = engine
        .errors(&DiagnosticFilter::all().fixable_only())
        .await
        .unwrap();
    assert_eq!(fixable.len(), 1);
    let id = fixable[0].id();

    let first = engine.preview_fix(id).unwrap();
    let second = engine.preview_fix(id).unwrap();
    assert_eq!(first, second);
    assert!(!first.stale);
    assert_eq!(first.title, "Remove unused import `os`");
    assert!(first.diff.contains("-import os, sys"));
    assert!(first.diff.contains("+import sys"));
    assert_eq!(ws.writes(), 0);
}

#[tokio::test]
async fn batch_resolution_reports_each_id() {
    let ws = workspace(&[("a.py", "import os\nx = 1\n"), ("b.py", "import json\n")]);
    let engine = default_engine(&ws);
    let fixable = engine
        .errors(&DiagnosticFilter::all().fixable_only())
        .await
        .unwrap();
    assert_eq!(fixable.len(), 2);

    let missing = DiagnosticId::from_raw("missing");
    let ids = vec![fixable[0].id().clone(), missing.clone(), fixable[1].id().clone()];
    let results = engine.resolve_many(&ids).await;

    assert_eq!(results.len(), 3);
    assert!(results[0].success);
    assert_eq!(results[1].error, Some(FixError::NotFound(missing)));
    assert!(results[2].success);
    assert_eq!(ws.get(Path::new("a.py")).as_deref(), Some("x = 1\n"));
    assert_eq!(ws.get(Path::new("b.py")).as_deref(), Some(""));
}

#[tokio::test]
async fn fixes_land_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
    std::fs::write(
        dir.path().join("pkg/mod.py"),
        "from typing import (\n    Any,\n    List,\n)\n\nx: List[int] = []\n",
    )
    .unwrap();
    let ws: Arc<dyn Workspace> = Arc::new(FsWorkspace::new(dir.path()));
    let engine = DiagnosticsEngine::builder(ws).build();

    let results = engine
        .resolve_errors(&DiagnosticFilter::all(), 5)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success, "{:?}", results[0].error);

    let on_disk = std::fs::read_to_string(dir.path().join("pkg/mod.py")).unwrap();
    assert!(!on_disk.contains("Any"), "{on_disk}");
    assert!(on_disk.contains("List"));
    assert!(engine.query(&DiagnosticFilter::all()).await.unwrap().is_empty());
}
