//! Fan-out to every applicable source, then deduplicate.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use triage_sources::{FileSnapshot, SharedSource};
use triage_types::{DiagnosticSet, SourceError};

use crate::dedup::{Deduplicator, SourceOutput, contributions};
use crate::error::QueryError;

pub struct Aggregator {
    sources: Vec<SharedSource>,
    dedup: Deduplicator,
    source_timeout: Duration,
    passes: AtomicU64,
}

impl Aggregator {
    #[must_use]
    pub fn new(sources: Vec<SharedSource>, dedup: Deduplicator, source_timeout: Duration) -> Self {
        Self {
            sources,
            dedup,
            source_timeout,
            passes: AtomicU64::new(0),
        }
    }

    pub fn sources(&self) -> &[SharedSource] {
        &self.sources
    }

    /// Whether any source handles `path`.
    #[must_use]
    pub fn covers(&self, path: &Path) -> bool {
        self.sources.iter().any(|s| s.handles(path))
    }

    /// Number of fan-out passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Run every applicable source against `file` and merge the results.
    ///
    /// A failing source only loses its own contribution and is listed in
    /// `degraded_sources`. The pass fails only when every applicable source
    /// failed. A file no source covers yields an empty set.
    pub async fn analyze(&self, file: &FileSnapshot) -> Result<DiagnosticSet, QueryError> {
        let applicable: Vec<&SharedSource> =
            self.sources.iter().filter(|s| s.handles(&file.path)).collect();
        if applicable.is_empty() {
            return Ok(DiagnosticSet::empty(file.path.clone(), file.version.clone()));
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let results = join_all(applicable.iter().map(|source| async move {
            let outcome = match tokio::time::timeout(self.source_timeout, source.collect(file)).await
            {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout {
                    backend: source.name().to_string(),
                    elapsed: self.source_timeout,
                }),
            };
            (*source, outcome)
        }))
        .await;

        let mut outputs = Vec::new();
        let mut failures = Vec::new();
        for (source, outcome) in results {
            match outcome {
                Ok(diagnostics) => outputs.push(SourceOutput {
                    source: source.name().to_string(),
                    kind: source.kind(),
                    diagnostics,
                }),
                Err(err) => {
                    tracing::warn!(
                        source = %source.name(),
                        path = %file.path.display(),
                        retryable = err.is_retryable(),
                        "Source failed: {err}"
                    );
                    failures.push(err);
                }
            }
        }

        if outputs.is_empty() {
            return Err(QueryError::NoSourcesReachable {
                language: applicable[0].language().to_string(),
                path: file.path.clone(),
                failures,
            });
        }

        let degraded: BTreeMap<String, String> = failures
            .iter()
            .map(|e| (e.backend().to_string(), e.to_string()))
            .collect();
        let set = self
            .dedup
            .merge(file.path.clone(), file.version.clone(), outputs, Utc::now())
            .with_degraded_sources(degraded);

        tracing::debug!(
            path = %file.path.display(),
            version = %file.version.short(),
            total = set.len(),
            by_source = ?contributions(&set),
            elapsed_ms = started.elapsed().as_millis(),
            "Analysis pass complete"
        );
        Ok(set)
    }

    /// Drop per-file state held by sources (open documents, memoized results).
    pub async fn forget(&self, path: &Path) {
        join_all(
            self.sources
                .iter()
                .filter(|s| s.handles(path))
                .map(|s| s.forget(path)),
        )
        .await;
    }
}
