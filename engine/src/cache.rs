//! Aggregation cache: the most recent merged set per file.
//!
//! Each file has its own slot lock, so unrelated files never contend. Entries
//! are immutable `Arc<DiagnosticSet>` values replaced wholesale; a reader
//! racing a writer sees either the old set or the new one.
//!
//! [`AnalysisGates`] serializes analysis of one file so a cache miss is
//! filled by one pass while concurrent callers wait for its result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use triage_types::{DiagnosticSet, SnapshotVersion};

use crate::error::CacheError;

type Slot = Arc<Mutex<Option<Arc<DiagnosticSet>>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub corruptions: u64,
}

impl CacheStats {
    /// Fraction of lookups served from cache; zero before any lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct AggregationCache {
    ttl: Duration,
    slots: RwLock<HashMap<PathBuf, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    corruptions: AtomicU64,
}

impl AggregationCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
        }
    }

    fn slot(&self, path: &Path) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    fn slot_or_insert(&self, path: &Path) -> Slot {
        if let Some(slot) = self.slot(path) {
            return slot;
        }
        Arc::clone(
            self.slots
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(path.to_path_buf())
                .or_default(),
        )
    }

    /// Valid entry for `path` at content version `current`, if any.
    pub fn get(&self, path: &Path, current: &SnapshotVersion) -> Option<Arc<DiagnosticSet>> {
        self.get_at(path, current, Utc::now())
    }

    /// [`get`](Self::get) evaluated at `now`.
    ///
    /// An entry is valid while younger than the TTL and computed against
    /// `current`. A corrupt entry is evicted and reported as a miss.
    pub fn get_at(
        &self,
        path: &Path,
        current: &SnapshotVersion,
        now: DateTime<Utc>,
    ) -> Option<Arc<DiagnosticSet>> {
        let entry = self.slot(path).and_then(|slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(Arc::clone)
        });
        let Some(set) = entry else {
            return self.miss(path, "absent");
        };

        if let Err(err) = verify(path, &set) {
            tracing::warn!("{err}; evicting");
            self.corruptions.fetch_add(1, Ordering::Relaxed);
            self.invalidate(path);
            return self.miss(path, "corrupt");
        }
        if set.snapshot_version() != current {
            return self.miss(path, "stale");
        }
        let age = now.signed_duration_since(set.produced_at());
        if age.to_std().is_ok_and(|age| age >= self.ttl) {
            return self.miss(path, "expired");
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(path = %path.display(), "Cache hit");
        Some(set)
    }

    fn miss(&self, path: &Path, reason: &str) -> Option<Arc<DiagnosticSet>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(path = %path.display(), %reason, "Cache miss");
        None
    }

    /// Latest entry regardless of age or version. Not counted as a lookup.
    #[must_use]
    pub fn peek(&self, path: &Path) -> Option<Arc<DiagnosticSet>> {
        self.slot(path).and_then(|slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(Arc::clone)
        })
    }

    /// Store `set` under its own path, returning the entry it replaced.
    pub fn put(&self, set: Arc<DiagnosticSet>) -> Option<Arc<DiagnosticSet>> {
        let slot = self.slot_or_insert(set.file_path());
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(set)
    }

    /// Evict one file's entry. Returns whether anything was cached.
    pub fn invalidate(&self, path: &Path) -> bool {
        let removed = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        removed.is_some_and(|slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .is_some()
        })
    }

    pub fn invalidate_all(&self) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Every cached set, ordered by path.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<DiagnosticSet>> {
        let slots: Vec<Slot> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut sets: Vec<Arc<DiagnosticSet>> = slots
            .iter()
            .filter_map(|slot| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    .map(Arc::clone)
            })
            .collect();
        sets.sort_by(|a, b| a.file_path().cmp(b.file_path()));
        sets
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries().len(),
            corruptions: self.corruptions.load(Ordering::Relaxed),
        }
    }
}

/// One async gate per file with analysis in flight.
///
/// Gates are created on first use and dropped once nobody holds or waits on
/// them.
#[derive(Default)]
pub struct AnalysisGates {
    gates: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl AnalysisGates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other analysis of `path` is running.
    pub async fn enter(&self, path: &Path) -> GateGuard<'_> {
        let gate = Arc::clone(
            self.gates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(path.to_path_buf())
                .or_default(),
        );
        let guard = gate.lock_owned().await;
        GateGuard {
            gates: self,
            path: path.to_path_buf(),
            guard: Some(guard),
        }
    }

    /// Files with a gate currently held or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct GateGuard<'a> {
    gates: &'a AnalysisGates,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut gates = self
            .gates
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map's own reference left: nobody is waiting.
        if gates
            .get(&self.path)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&self.path);
        }
    }
}

/// Structural invariants every stored set must satisfy.
fn verify(path: &Path, set: &DiagnosticSet) -> Result<(), CacheError> {
    let corrupt = |reason: String| CacheError::Corruption {
        path: path.to_path_buf(),
        reason,
    };
    if set.file_path() != path {
        return Err(corrupt(format!(
            "stored under wrong key ({})",
            set.file_path().display()
        )));
    }
    if let Some(diag) = set
        .diagnostics()
        .iter()
        .find(|d| d.file_path() != path || !d.matches_snapshot(set.snapshot_version()))
    {
        return Err(corrupt(format!(
            "diagnostic {} does not belong to this snapshot",
            diag.id()
        )));
    }
    Ok(())
}
