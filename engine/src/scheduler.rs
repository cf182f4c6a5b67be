//! Realtime scheduler.
//!
//! Per file: `idle -> queued -> analyzing -> idle`. A change while queued
//! restarts the debounce window; a change while analyzing schedules exactly
//! one follow-up pass no matter how many changes arrive. Each file has at
//! most one driver task, so at most one pass per file is ever in flight.
//! Passes across files run in parallel up to the worker count. Idle files
//! are not tracked.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

pub type PassFut<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// What a scheduled pass does. The engine implements this with the same
/// fan-out, dedup and cache-write path as a pull query.
pub trait PassRunner: Send + Sync {
    fn run_pass<'a>(&'a self, path: &'a Path) -> PassFut<'a>;

    /// Drop everything held for a deleted file.
    fn file_deleted<'a>(&'a self, path: &'a Path) -> PassFut<'a>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Idle,
    Queued,
    Analyzing,
}

#[derive(Debug)]
struct Tracked {
    state: FileState,
    /// Bumped on every change event.
    generation: u64,
    /// A change arrived while analyzing.
    rerun: bool,
    deleted: bool,
}

impl Tracked {
    fn new() -> Self {
        Self {
            state: FileState::Idle,
            generation: 0,
            rerun: false,
            deleted: false,
        }
    }
}

struct Inner {
    runner: Arc<dyn PassRunner>,
    debounce: Duration,
    permits: Arc<Semaphore>,
    files: Mutex<HashMap<PathBuf, Tracked>>,
    running: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    passes: AtomicU64,
    coalesced: AtomicU64,
}

impl Inner {
    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Tracked>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Current generation of a queued file, or `None` if it was deleted
    /// (in which case its entry is dropped).
    fn pending_generation(&self, path: &Path) -> Option<u64> {
        let mut files = self.files();
        let entry = files.get(path)?;
        if entry.deleted {
            files.remove(path);
            tracing::debug!(path = %path.display(), "Dropped queued pass for deleted file");
            return None;
        }
        Some(entry.generation)
    }

    /// Abandon a queued entry on stop.
    fn abandon(&self, path: &Path) {
        self.files().remove(path);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// A stopped scheduler; call [`start`](Self::start) to accept events.
    pub fn new(runner: Arc<dyn PassRunner>, debounce: Duration, workers: usize) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                runner,
                debounce,
                permits: Arc::new(Semaphore::new(workers.max(1))),
                files: Mutex::new(HashMap::new()),
                running,
                tasks: Mutex::new(Vec::new()),
                passes: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    pub fn start(&self) {
        if !self.inner.running.send_replace(true) {
            tracing::info!(
                debounce_ms = self.inner.debounce.as_millis(),
                workers = self.inner.permits.available_permits(),
                "Scheduler started"
            );
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Stop accepting events, drop queued passes, and wait for in-flight
    /// passes to finish.
    pub async fn stop(&self) {
        if !self.inner.running.send_replace(false) {
            return;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        join_all(tasks).await;
        tracing::info!(passes = self.passes(), "Scheduler stopped");
    }

    /// Record a content change. Returns false if the scheduler is stopped.
    pub fn notify_changed(&self, path: impl Into<PathBuf>) -> bool {
        if !self.inner.is_running() {
            return false;
        }
        let path = path.into();
        let spawn = {
            let mut files = self.inner.files();
            let entry = files.entry(path.clone()).or_insert_with(Tracked::new);
            entry.generation += 1;
            entry.deleted = false;
            match entry.state {
                FileState::Idle => {
                    entry.state = FileState::Queued;
                    true
                }
                FileState::Queued => {
                    self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    false
                }
                FileState::Analyzing => {
                    if entry.rerun {
                        self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    }
                    entry.rerun = true;
                    false
                }
            }
        };
        tracing::trace!(path = %path.display(), spawn, "Change event");
        if spawn {
            let task = tokio::spawn(drive(Arc::clone(&self.inner), path));
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
        true
    }

    /// Record a deletion: queued work for the file is dropped and the
    /// runner discards whatever it holds for it.
    pub async fn notify_deleted(&self, path: &Path) {
        {
            if let Some(entry) = self.inner.files().get_mut(path) {
                entry.deleted = true;
                entry.rerun = false;
                entry.generation += 1;
            }
        }
        self.inner.runner.file_deleted(path).await;
    }

    #[must_use]
    pub fn state(&self, path: &Path) -> FileState {
        self.inner
            .files()
            .get(path)
            .map_or(FileState::Idle, |e| e.state)
    }

    /// Files waiting for a pass.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.inner
            .files()
            .values()
            .filter(|e| e.state == FileState::Queued)
            .count()
    }

    /// Passes completed across all files.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.inner.passes.load(Ordering::Relaxed)
    }

    /// Files with a pass queued or in flight.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.inner.files().len()
    }

    /// Change events folded into an already pending pass.
    #[must_use]
    pub fn coalesced(&self) -> u64 {
        self.inner.coalesced.load(Ordering::Relaxed)
    }
}

/// Drives one file from `queued` back to `idle`.
async fn drive(inner: Arc<Inner>, path: PathBuf) {
    let mut running = inner.running.subscribe();
    loop {
        // Debounce: wait until a whole window passes without a new change.
        let Some(mut seen) = inner.pending_generation(&path) else {
            return;
        };
        loop {
            tokio::select! {
                () = tokio::time::sleep(inner.debounce) => {}
                _ = running.wait_for(|r| !*r) => {
                    inner.abandon(&path);
                    return;
                }
            }
            match inner.pending_generation(&path) {
                None => return,
                Some(generation) if generation == seen => break,
                Some(generation) => seen = generation,
            }
        }

        let permit = tokio::select! {
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = running.wait_for(|r| !*r) => {
                inner.abandon(&path);
                return;
            }
        };

        {
            let mut files = inner.files();
            let Some(entry) = files.get_mut(&path) else {
                return;
            };
            if entry.deleted {
                files.remove(&path);
                return;
            }
            entry.state = FileState::Analyzing;
        }
        tracing::debug!(path = %path.display(), "Analysis pass started");
        inner.runner.run_pass(&path).await;
        drop(permit);
        inner.passes.fetch_add(1, Ordering::Relaxed);

        let deleted = {
            let mut files = inner.files();
            let Some(entry) = files.get_mut(&path) else {
                return;
            };
            if entry.deleted {
                files.remove(&path);
                true
            } else if entry.rerun && inner.is_running() {
                entry.rerun = false;
                entry.state = FileState::Queued;
                continue;
            } else {
                files.remove(&path);
                return;
            }
        };
        if deleted {
            // Deleted mid-pass; discard whatever the pass stored.
            inner.runner.file_deleted(&path).await;
        }
        return;
    }
}
