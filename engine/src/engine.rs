//! The unified query API.
//!
//! One `DiagnosticsEngine` per workspace owns the aggregation cache, the
//! backend session manager and the realtime scheduler. The pull path
//! (`query`, `refresh`) and scheduled passes share one fan-out, dedup and
//! cache-write sequence.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use triage_lsp::{ServerLauncher, SessionManager, SessionStatus};
use triage_sources::{
    FileSnapshot, InProcessSource, LinterSource, LspSource, PythonAnalyzer, SharedSource,
};
use triage_types::{
    Diagnostic, DiagnosticFilter, DiagnosticId, DiagnosticSet, ErrorCollection, FileErrorCount,
    SourceKind, SummaryStats,
};

use crate::aggregate::Aggregator;
use crate::cache::{AggregationCache, AnalysisGates, CacheStats};
use crate::config::TriageConfig;
use crate::dedup::Deduplicator;
use crate::error::{FixError, QueryError};
use crate::fix::{FixPreview, FixResolver, FixResult};
use crate::scheduler::{FileState, PassFut, PassRunner, Scheduler};
use crate::subscribe::{Callback, SubscriberStats, SubscriptionHandle, Subscriptions};
use crate::workspace::{FileContent, Workspace};

/// Summary snapshots kept for `trends`.
const TREND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    File(PathBuf),
    All,
}

/// One point in the summary history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub recorded_at: DateTime<Utc>,
    pub stats: SummaryStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub kind: SourceKind,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub sessions: Vec<SessionStatus>,
    pub sources: Vec<SourceInfo>,
    pub cache: CacheStats,
    pub cache_hit_rate: f64,
    pub queue_depth: usize,
    pub subscribers: usize,
    pub watching: bool,
}

/// State shared by the pull path and scheduled passes.
struct Core {
    workspace: Arc<dyn Workspace>,
    cache: AggregationCache,
    aggregator: Aggregator,
    subscriptions: Subscriptions,
    /// At most one analysis per file in flight.
    gates: AnalysisGates,
    /// Last set pushed to subscribers, per file.
    published: Mutex<HashMap<PathBuf, Arc<DiagnosticSet>>>,
    /// The published set each file's current one replaced. Keeps ids from
    /// the previous content resolvable so fixes on them fail as stale.
    superseded: Mutex<HashMap<PathBuf, Arc<DiagnosticSet>>>,
    fixes: FixResolver,
    trends: Mutex<VecDeque<TrendPoint>>,
    workers: usize,
}

impl Core {
    fn read(&self, path: &Path) -> Result<Option<FileContent>, QueryError> {
        match self.workspace.read_file(path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QueryError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    /// Current set for `path`, from cache when still valid. `None` if the
    /// file no longer exists.
    async fn diagnose(&self, path: &Path) -> Result<Option<Arc<DiagnosticSet>>, QueryError> {
        let Some(file) = self.read(path)? else {
            self.evict(path);
            return Ok(None);
        };
        if let Some(set) = self.cache.get(path, &file.version) {
            return Ok(Some(set));
        }
        let seen = self.cache.peek(path);
        let _gate = self.gates.enter(path).await;
        // The file may have changed, or been analyzed, while we waited.
        let Some(file) = self.read(path)? else {
            self.evict(path);
            return Ok(None);
        };
        if let Some(set) = self.filled_while_waiting(path, seen.as_ref(), &file) {
            return Ok(Some(set));
        }
        self.analyze(path, file).await.map(Some)
    }

    /// Entry stored for `file`'s content by a pass that finished after `seen`
    /// was observed.
    fn filled_while_waiting(
        &self,
        path: &Path,
        seen: Option<&Arc<DiagnosticSet>>,
        file: &FileContent,
    ) -> Option<Arc<DiagnosticSet>> {
        self.cache.peek(path).filter(|set| {
            set.snapshot_version() == &file.version
                && seen.is_none_or(|old| !Arc::ptr_eq(old, set))
        })
    }

    async fn analyze(&self, path: &Path, file: FileContent) -> Result<Arc<DiagnosticSet>, QueryError> {
        let snapshot = FileSnapshot {
            path: path.to_path_buf(),
            absolute_path: self.workspace.root().join(path),
            content: file.content,
            version: file.version,
        };
        let set = self.aggregator.analyze(&snapshot).await?;
        Ok(self.store(set))
    }

    /// Replace the cached set and notify subscribers if the findings changed
    /// since the last notification for this file.
    fn store(&self, set: DiagnosticSet) -> Arc<DiagnosticSet> {
        let set = Arc::new(set);
        self.cache.put(Arc::clone(&set));
        let changed = {
            let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = published
                .get(set.file_path())
                .is_none_or(|old| !same_findings(old, &set));
            if changed
                && let Some(old) =
                    published.insert(set.file_path().to_path_buf(), Arc::clone(&set))
            {
                self.superseded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(set.file_path().to_path_buf(), old);
            }
            changed
        };
        if changed {
            self.subscriptions.publish(&set);
        }
        set
    }

    fn snapshot(&self) -> ErrorCollection {
        ErrorCollection::new(
            self.cache
                .entries()
                .iter()
                .map(|set| DiagnosticSet::clone(set))
                .collect(),
        )
    }

    fn record_trend(&self) {
        let point = TrendPoint {
            recorded_at: Utc::now(),
            stats: self.snapshot().summary(),
        };
        let mut trends = self.trends.lock().unwrap_or_else(PoisonError::into_inner);
        if trends.len() == TREND_CAPACITY {
            trends.pop_front();
        }
        trends.push_back(point);
    }

    fn evict(&self, path: &Path) {
        self.cache.invalidate(path);
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        self.superseded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    /// Diagnostic with `id` from the live cache, then from sets that were
    /// invalidated or replaced since.
    fn find(&self, id: &DiagnosticId) -> Option<Diagnostic> {
        let lookup = |sets: &HashMap<PathBuf, Arc<DiagnosticSet>>| {
            sets.values().find_map(|set| set.find(id).cloned())
        };
        self.cache
            .entries()
            .iter()
            .find_map(|set| set.find(id).cloned())
            .or_else(|| lookup(&self.published.lock().unwrap_or_else(PoisonError::into_inner)))
            .or_else(|| lookup(&self.superseded.lock().unwrap_or_else(PoisonError::into_inner)))
    }

    async fn forget(&self, path: &Path) {
        self.evict(path);
        self.aggregator.forget(path).await;
    }
}

impl PassRunner for Core {
    fn run_pass<'a>(&'a self, path: &'a Path) -> PassFut<'a> {
        Box::pin(async move {
            let seen = self.cache.peek(path);
            let _gate = self.gates.enter(path).await;
            let file = match self.read(path) {
                Ok(Some(file)) => file,
                Ok(None) => {
                    self.forget(path).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!("Scheduled pass skipped: {err}");
                    return;
                }
            };
            if self.filled_while_waiting(path, seen.as_ref(), &file).is_some() {
                tracing::debug!(path = %path.display(), "Pass already served by a query");
                return;
            }
            match self.analyze(path, file).await {
                Ok(_) => self.record_trend(),
                Err(err) => tracing::warn!("Scheduled pass failed: {err}"),
            }
        })
    }

    fn file_deleted<'a>(&'a self, path: &'a Path) -> PassFut<'a> {
        Box::pin(self.forget(path))
    }
}

/// Same diagnostics from the same sources, ignoring when they were produced.
fn same_findings(old: &DiagnosticSet, new: &DiagnosticSet) -> bool {
    old.snapshot_version() == new.snapshot_version()
        && old.sources_consulted() == new.sources_consulted()
        && old.degraded_sources() == new.degraded_sources()
        && old
            .diagnostics()
            .iter()
            .map(|d| (d.id(), d.severity(), d.category()))
            .eq(new.diagnostics().iter().map(|d| (d.id(), d.severity(), d.category())))
}

pub struct EngineBuilder {
    workspace: Arc<dyn Workspace>,
    config: TriageConfig,
    sources: Vec<SharedSource>,
    launcher: Option<Arc<dyn ServerLauncher>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: TriageConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a source on top of the configured ones.
    pub fn source(mut self, source: SharedSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Start language servers through `launcher` instead of child processes.
    pub fn launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn build(self) -> DiagnosticsEngine {
        let Self {
            workspace,
            config,
            sources: extra,
            launcher,
        } = self;

        let servers = config.servers.clone();
        let settings = config.sessions.settings();
        let sessions = match launcher {
            Some(launcher) => {
                SessionManager::with_launcher(servers, settings, workspace.root(), launcher)
            }
            None => SessionManager::new(servers, settings, workspace.root()),
        };

        let mut sources: Vec<SharedSource> = Vec::new();
        let languages: Vec<String> = sessions.languages().map(str::to_string).collect();
        for language in languages {
            sources.push(Arc::new(LspSource::new(language, sessions.clone())));
        }
        for (name, linter) in &config.linters {
            sources.push(Arc::new(LinterSource::new(name.clone(), linter.clone())));
        }
        if config.analyzers.builtin_python {
            sources.push(Arc::new(InProcessSource::new(Arc::new(PythonAnalyzer))));
        }
        sources.extend(extra);

        tracing::info!(
            root = %workspace.root().display(),
            sources = ?sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Diagnostics engine ready"
        );

        let workers = config.scheduler.workers.max(1);
        let core = Arc::new(Core {
            cache: AggregationCache::new(config.cache.ttl()),
            aggregator: Aggregator::new(
                sources,
                Deduplicator::new(config.dedup.clone()),
                config.aggregation.source_timeout(),
            ),
            subscriptions: Subscriptions::new(config.scheduler.subscriber_queue),
            gates: AnalysisGates::new(),
            published: Mutex::new(HashMap::new()),
            superseded: Mutex::new(HashMap::new()),
            fixes: FixResolver::new(Arc::clone(&workspace)),
            workspace,
            trends: Mutex::new(VecDeque::new()),
            workers,
        });
        let scheduler = Scheduler::new(
            Arc::clone(&core) as Arc<dyn PassRunner>,
            config.scheduler.debounce(),
            workers,
        );
        DiagnosticsEngine {
            core,
            scheduler,
            sessions,
        }
    }
}

/// Entry point for every caller: dashboards, the CLI, agent tooling.
pub struct DiagnosticsEngine {
    core: Arc<Core>,
    scheduler: Scheduler,
    sessions: SessionManager,
}

impl DiagnosticsEngine {
    pub fn builder(workspace: Arc<dyn Workspace>) -> EngineBuilder {
        EngineBuilder {
            workspace,
            config: TriageConfig::default(),
            sources: Vec::new(),
            launcher: None,
        }
    }

    #[must_use]
    pub fn workspace(&self) -> &Arc<dyn Workspace> {
        &self.core.workspace
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    /// Diagnostics matching `filter` across the workspace.
    ///
    /// Files are served from cache when their entry is still valid and
    /// analyzed otherwise. Only total unavailability of a language's sources
    /// fails the query.
    pub async fn query(&self, filter: &DiagnosticFilter) -> Result<ErrorCollection, QueryError> {
        let core = &self.core;
        let files: Vec<PathBuf> = core
            .workspace
            .list_files()
            .map_err(|e| QueryError::List(e.to_string()))?
            .into_iter()
            .filter(|p| filter.matches_path(p) && core.aggregator.covers(p))
            .collect();

        let mut results: Vec<(PathBuf, Result<Option<Arc<DiagnosticSet>>, QueryError>)> =
            stream::iter(files)
                .map(|path| async move {
                    let result = core.diagnose(&path).await;
                    (path, result)
                })
                .buffer_unordered(core.workers)
                .collect()
                .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let now = Utc::now();
        let mut sets = Vec::with_capacity(results.len());
        for (path, result) in results {
            match result {
                Ok(Some(set)) => sets.push(set.retain(|d| filter.matches(d, now))),
                Ok(None) => {}
                Err(err @ QueryError::NoSourcesReachable { .. }) => return Err(err),
                Err(err) => tracing::warn!(path = %path.display(), "Skipping file: {err}"),
            }
        }
        Ok(ErrorCollection::new(sets))
    }

    /// Flattened diagnostics: files by path, most recent first within a file.
    pub async fn errors(&self, filter: &DiagnosticFilter) -> Result<Vec<Diagnostic>, QueryError> {
        let collection = self.query(filter).await?;
        let mut out = Vec::with_capacity(collection.total());
        for set in collection.files() {
            let mut diags = set.diagnostics().to_vec();
            diags.sort_by(|a, b| b.produced_at().cmp(&a.produced_at()));
            out.extend(diags);
        }
        Ok(out)
    }

    pub async fn summary(&self) -> Result<SummaryStats, QueryError> {
        Ok(self.query(&DiagnosticFilter::all()).await?.summary())
    }

    /// Alias of [`summary`](Self::summary).
    pub async fn error_summary(&self) -> Result<SummaryStats, QueryError> {
        self.summary().await
    }

    pub async fn hotspots(&self, limit: usize) -> Result<Vec<FileErrorCount>, QueryError> {
        Ok(self.query(&DiagnosticFilter::all()).await?.hotspots(limit))
    }

    /// Invalidate and synchronously re-analyze `scope`.
    pub async fn refresh(&self, scope: RefreshScope) -> Result<ErrorCollection, QueryError> {
        let collection = match scope {
            RefreshScope::File(path) => {
                self.core.cache.invalidate(&path);
                let set = self.core.diagnose(&path).await?;
                ErrorCollection::new(set.map(|s| DiagnosticSet::clone(&s)).into_iter().collect())
            }
            RefreshScope::All => {
                self.core.cache.invalidate_all();
                self.query(&DiagnosticFilter::all()).await?
            }
        };
        self.core.record_trend();
        Ok(collection)
    }

    /// Register `callback` for every changed set. Must be called inside a
    /// tokio runtime.
    pub fn subscribe(
        &self,
        callback: impl Fn(Arc<DiagnosticSet>) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.core.subscriptions.subscribe(Arc::new(callback) as Callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.core.subscriptions.unsubscribe(handle)
    }

    #[must_use]
    pub fn subscriber_stats(&self, handle: SubscriptionHandle) -> Option<SubscriberStats> {
        self.core.subscriptions.stats(handle)
    }

    pub fn preview_fix(&self, id: &DiagnosticId) -> Result<FixPreview, FixError> {
        let diag = self
            .core
            .find(id)
            .ok_or_else(|| FixError::NotFound(id.clone()))?;
        self.core.fixes.preview(&diag)
    }

    /// Apply the fix for `id`. The file's cache entry is dropped on success.
    pub async fn resolve_error(&self, id: &DiagnosticId) -> FixResult {
        let Some(diag) = self.core.find(id) else {
            return FixResult::failed(id.clone(), None, FixError::NotFound(id.clone()));
        };
        match self.core.fixes.apply(&diag).await {
            Ok(edits) => {
                self.core.cache.invalidate(diag.file_path());
                self.scheduler.notify_changed(diag.file_path());
                FixResult::applied(&diag, edits)
            }
            Err(err) => {
                tracing::debug!(id = %id, "Fix not applied: {err}");
                FixResult::failed(id.clone(), Some(diag.file_path().to_path_buf()), err)
            }
        }
    }

    /// Resolve each id independently; one failure does not stop the rest.
    pub async fn resolve_many(&self, ids: &[DiagnosticId]) -> Vec<FixResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.resolve_error(id).await);
        }
        results
    }

    /// Apply up to `max_fixes` fixes for diagnostics matching `filter`.
    ///
    /// Re-queries after every fix so later fixes in the same file are taken
    /// from fresh diagnostics rather than failing as stale.
    pub async fn resolve_errors(
        &self,
        filter: &DiagnosticFilter,
        max_fixes: usize,
    ) -> Result<Vec<FixResult>, QueryError> {
        let filter = filter.clone().fixable_only();
        let mut attempted = HashSet::new();
        let mut results = Vec::new();
        while results.len() < max_fixes {
            let collection = self.query(&filter).await?;
            let Some(next) = collection
                .diagnostics()
                .find(|d| !attempted.contains(d.id()))
                .map(|d| d.id().clone())
            else {
                break;
            };
            attempted.insert(next.clone());
            results.push(self.resolve_error(&next).await);
        }
        Ok(results)
    }

    #[must_use]
    pub fn health_check(&self) -> HealthReport {
        let cache = self.core.cache.stats();
        HealthReport {
            sessions: self.sessions.status(),
            sources: self
                .core
                .aggregator
                .sources()
                .iter()
                .map(|s| SourceInfo {
                    name: s.name().to_string(),
                    kind: s.kind(),
                    language: s.language().to_string(),
                })
                .collect(),
            cache_hit_rate: cache.hit_rate(),
            cache,
            queue_depth: self.scheduler.queue_depth(),
            subscribers: self.core.subscriptions.len(),
            watching: self.scheduler.is_running(),
        }
    }

    /// Up to `limit` most recent summary snapshots, oldest first.
    #[must_use]
    pub fn trends(&self, limit: usize) -> Vec<TrendPoint> {
        let trends = self.core.trends.lock().unwrap_or_else(PoisonError::into_inner);
        trends.iter().skip(trends.len().saturating_sub(limit)).copied().collect()
    }

    pub fn start_watching(&self) {
        self.scheduler.start();
    }

    /// Content of `path` changed. Drops its cache entry and schedules a pass
    /// when watching.
    pub fn notify_changed(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.core.cache.invalidate(&path);
        self.scheduler.notify_changed(path);
    }

    pub async fn notify_deleted(&self, path: &Path) {
        self.scheduler.notify_deleted(path).await;
    }

    #[must_use]
    pub fn file_state(&self, path: &Path) -> FileState {
        self.scheduler.state(path)
    }

    /// Stop the scheduler, drop subscriptions, and shut down backend sessions.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.core.subscriptions.clear();
        self.sessions.shutdown().await;
        tracing::info!("Diagnostics engine shut down");
    }
}
