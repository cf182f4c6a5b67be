//! Per-language session record and the handle callers hold.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::server::RunningServer;
use crate::types::{ServerConfig, SessionError, SessionState, SessionStatus};

/// Mutable lifecycle record for one language. Only the manager touches it.
#[derive(Default)]
pub(crate) struct BackendSession {
    pub state: Option<SessionState>,
    pub server: Option<Arc<RunningServer>>,
    /// Restarts over the session's lifetime.
    pub restart_count: u32,
    /// Restarts since the server last stayed up for the stable period.
    pub consecutive_restarts: u32,
    pub ready_since: Option<tokio::time::Instant>,
    pub probe_failures: u32,
    pub last_activity: Option<Instant>,
    /// Bumped on every start so stale monitors and restarts stand down.
    pub generation: u64,
    pub last_error: Option<String>,
    pub restart_pending: bool,
    pub exhausted: bool,
    pub monitor: Option<JoinHandle<()>>,
    pub restart_task: Option<JoinHandle<()>>,
}

impl BackendSession {
    pub fn abort_tasks(&mut self) {
        if let Some(task) = self.monitor.take() {
            task.abort();
        }
        if let Some(task) = self.restart_task.take() {
            task.abort();
        }
    }
}

pub(crate) struct SessionSlot {
    pub language: String,
    pub config: ServerConfig,
    session: Mutex<BackendSession>,
    /// Serializes process starts so concurrent acquires share one launch.
    pub start_lock: tokio::sync::Mutex<()>,
    refs: AtomicUsize,
}

impl SessionSlot {
    pub fn new(language: String, config: ServerConfig) -> Self {
        Self {
            language,
            config,
            session: Mutex::new(BackendSession::default()),
            start_lock: tokio::sync::Mutex::new(()),
            refs: AtomicUsize::new(0),
        }
    }

    /// Never held across an await.
    pub fn lock(&self) -> MutexGuard<'_, BackendSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle onto the live server, if the session is usable right now.
    pub fn ready_handle(self: &Arc<Self>, request_timeout: Duration) -> Option<SessionHandle> {
        let mut session = self.lock();
        let usable = session.state.is_some_and(SessionState::is_usable);
        let server = session.server.as_ref().filter(|s| !s.is_closed())?;
        if !usable {
            return None;
        }
        let server = Arc::clone(server);
        session.last_activity = Some(Instant::now());
        let generation = session.generation;
        drop(session);
        Some(SessionHandle::new(self, server, generation, request_timeout))
    }

    pub fn touch(&self) {
        self.lock().last_activity = Some(Instant::now());
    }

    pub fn status(&self) -> SessionStatus {
        let session = self.lock();
        SessionStatus {
            language: self.language.clone(),
            state: session.state,
            restart_count: session.restart_count,
            handles: self.refs.load(Ordering::Relaxed),
            exhausted: session.exhausted,
            idle_for: session.last_activity.map(|t| t.elapsed()),
            last_error: session.last_error.clone(),
        }
    }
}

/// Shared, reference-counted access to one language's running server.
///
/// Read-only: the holder can sync documents and collect diagnostics but
/// cannot restart or stop the server.
pub struct SessionHandle {
    slot: Arc<SessionSlot>,
    server: Arc<RunningServer>,
    generation: u64,
    request_timeout: Duration,
}

impl SessionHandle {
    pub(crate) fn new(
        slot: &Arc<SessionSlot>,
        server: Arc<RunningServer>,
        generation: u64,
        request_timeout: Duration,
    ) -> Self {
        slot.refs.fetch_add(1, Ordering::Relaxed);
        Self {
            slot: Arc::clone(slot),
            server,
            generation,
            request_timeout,
        }
    }

    #[must_use]
    pub fn language(&self) -> &str {
        self.server.language()
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.slot.config.language_id
    }

    /// Which start of the session this handle points at.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send the file's current text and wait for the server's diagnostics.
    ///
    /// Fails with a retryable `Crashed` if the session dies mid-request.
    pub async fn diagnostics(
        &self,
        path: &Path,
        text: &str,
    ) -> Result<Vec<serde_json::Value>, SessionError> {
        self.slot.touch();
        self.server
            .diagnostics(path, text, self.request_timeout)
            .await
    }

    pub async fn close_document(&self, path: &Path) -> Result<(), SessionError> {
        self.server.close_document(path).await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.slot.refs.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("language", &self.slot.language)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
