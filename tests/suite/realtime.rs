//! Watch-mode behavior: debounced passes, change notifications, deletions.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use triage_engine::FileState;
use triage_types::{Category, DiagnosticFilter, DiagnosticSet, Severity, SourceKind};

use crate::common::{
    Report, Script, ScriptedSource, engine_with, fast_config, settle, sleep_ms, workspace,
};

fn finding() -> Vec<Report> {
    vec![Report::new(0, Severity::Error, Category::TypeCheck, "Incompatible types in assignment")]
}

#[tokio::test(start_paused = true)]
async fn burst_of_changes_runs_one_pass() {
    let ws = workspace(&[("a.py", "x: int = 'a'\n")]);
    let source = ScriptedSource::reporting("mypy", finding());
    let engine = engine_with(&ws, fast_config(), vec![source.clone()]);
    engine.start_watching();

    for _ in 0..10 {
        engine.notify_changed("a.py");
        sleep_ms(10).await;
    }
    assert_eq!(engine.file_state(Path::new("a.py")), FileState::Queued);

    sleep_ms(500).await;
    settle().await;
    assert_eq!(engine.scheduler().passes(), 1);
    assert_eq!(engine.scheduler().tracked(), 0);
    assert_eq!(source.calls(), 1);
    assert_eq!(engine.file_state(Path::new("a.py")), FileState::Idle);
    assert_eq!(engine.cache_stats().entries, 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_only_changed_sets() {
    let ws = workspace(&[("a.py", "x: int = 'a'\n")]);
    let source = ScriptedSource::reporting("mypy", finding());
    let engine = engine_with(&ws, fast_config(), vec![source.clone()]);

    let seen: Arc<Mutex<Vec<Arc<DiagnosticSet>>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let handle = engine.subscribe(move |set| sink.lock().unwrap().push(set));
    engine.start_watching();

    engine.notify_changed("a.py");
    sleep_ms(500).await;
    settle().await;
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].file_path(), Path::new("a.py"));
        assert_eq!(seen[0].len(), 1);
    }

    // Same content, same findings: the pass runs but nothing is pushed.
    engine.notify_changed("a.py");
    sleep_ms(500).await;
    settle().await;
    assert_eq!(source.calls(), 2);
    assert_eq!(seen.lock().unwrap().len(), 1);

    ws.insert("a.py", "x: int = 'b'\n");
    engine.notify_changed("a.py");
    sleep_ms(500).await;
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(engine.subscriber_stats(handle).unwrap().delivered, 2);

    assert!(engine.unsubscribe(handle));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn deleted_file_leaves_cache_and_results() {
    let ws = workspace(&[("a.py", "x: int = 'a'\n"), ("b.py", "y = 1\n")]);
    let source = ScriptedSource::reporting("mypy", finding());
    let engine = engine_with(&ws, fast_config(), vec![source.clone()]);

    assert_eq!(engine.query(&DiagnosticFilter::all()).await.unwrap().files().len(), 2);
    assert_eq!(engine.cache_stats().entries, 2);

    ws.remove(Path::new("a.py"));
    engine.notify_deleted(Path::new("a.py")).await;
    assert_eq!(engine.cache_stats().entries, 1);

    let all = engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert_eq!(all.files().len(), 1);
    assert!(all.file(Path::new("a.py")).is_none());
    // b.py was served from cache.
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn changes_before_watching_only_invalidate() {
    let ws = workspace(&[("a.py", "x: int = 'a'\n")]);
    let source = ScriptedSource::reporting("mypy", finding());
    let engine = engine_with(&ws, fast_config(), vec![source.clone()]);

    engine.query(&DiagnosticFilter::all()).await.unwrap();
    engine.notify_changed("a.py");
    sleep_ms(500).await;
    settle().await;
    assert_eq!(engine.scheduler().passes(), 0);
    assert_eq!(engine.cache_stats().entries, 0);

    engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn query_during_a_scheduled_pass_waits_for_it() {
    let ws = workspace(&[("a.py", "x: int = 'a'\n")]);
    let source = ScriptedSource::new(
        "mypy",
        SourceKind::Subprocess,
        Script::Slow(Duration::from_millis(100), finding()),
    );
    let engine = engine_with(&ws, fast_config(), vec![source.clone()]);
    let published = Arc::new(Mutex::new(0));
    let _handle = engine.subscribe({
        let published = Arc::clone(&published);
        move |_set: Arc<DiagnosticSet>| *published.lock().unwrap() += 1
    });
    engine.start_watching();

    engine.notify_changed("a.py");
    // Past the debounce; the pass is inside the slow backend.
    sleep_ms(150).await;
    assert_eq!(source.calls(), 1);

    let collection = engine.query(&DiagnosticFilter::all()).await.unwrap();
    assert_eq!(collection.total(), 1);
    assert_eq!(source.calls(), 1);

    settle().await;
    assert_eq!(*published.lock().unwrap(), 1);
    engine.shutdown().await;
}
