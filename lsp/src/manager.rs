//! Backend Session Manager: one long-lived language server per language.
//!
//! Sessions start lazily on first [`SessionManager::acquire`]. Concurrent
//! acquires for the same language wait on one start and then share the
//! running server. A monitor task per session probes liveness; a session
//! that stops answering, or whose transport closes, is marked dead and
//! restarted after an exponential backoff until its restart budget is spent.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::process::Command;

use crate::server::{RunningServer, ServerTransport};
use crate::session::{BackendSession, SessionHandle, SessionSlot};
use crate::types::{ServerConfig, SessionError, SessionSettings, SessionState, SessionStatus};

/// Consecutive failed probes before a degraded session is declared dead.
const PROBE_FAILURES_BEFORE_DEAD: u32 = 2;

/// Environment variables never passed to language servers.
const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_TOKEN",
    "*_SECRET*",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
];

pub type LaunchFut<'a> =
    Pin<Box<dyn Future<Output = Result<ServerTransport, SessionError>> + Send + 'a>>;

type StartFut<'a> = Pin<Box<dyn Future<Output = Result<SessionHandle, SessionError>> + Send + 'a>>;

/// Produces the byte transport for a new server instance.
pub trait ServerLauncher: Send + Sync {
    fn launch<'a>(
        &'a self,
        language: &'a str,
        config: &'a ServerConfig,
        workspace_root: &'a Path,
    ) -> LaunchFut<'a>;
}

/// Launches servers as child processes speaking LSP over stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ServerLauncher for ProcessLauncher {
    fn launch<'a>(
        &'a self,
        language: &'a str,
        config: &'a ServerConfig,
        workspace_root: &'a Path,
    ) -> LaunchFut<'a> {
        Box::pin(async move {
            let unavailable = |reason: String| SessionError::Unavailable {
                language: language.to_string(),
                reason,
            };

            let resolved = which::which(&config.command)
                .map_err(|e| unavailable(format!("{} not found in PATH: {e}", config.command)))?;
            let mut cmd = Command::new(&resolved);
            cmd.args(&config.args)
                .current_dir(workspace_root)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            for (key, _) in std::env::vars() {
                let upper = key.to_uppercase();
                if ENV_SECRET_DENYLIST
                    .iter()
                    .any(|pat| env_glob_matches(pat, &upper))
                {
                    cmd.env_remove(&key);
                }
            }

            let mut child = cmd
                .spawn()
                .map_err(|e| unavailable(format!("spawning {}: {e}", config.command)))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| unavailable("no stdout from child".to_string()))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| unavailable("no stdin from child".to_string()))?;

            Ok(ServerTransport {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
                child: Some(child),
            })
        })
    }
}

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.strip_prefix('*'), pat.strip_suffix('*')) {
        (Some(rest), Some(_)) => key_upper.contains(rest.trim_end_matches('*')),
        (Some(suffix), None) => key_upper.ends_with(suffix),
        (None, Some(prefix)) => key_upper.starts_with(prefix),
        (None, None) => key_upper == pat,
    }
}

/// Build extension → language map. The first language (by name) wins a clash.
fn build_extension_map(servers: &BTreeMap<String, Arc<SessionSlot>>) -> HashMap<String, String> {
    let mut extension_map: HashMap<String, String> = HashMap::new();
    for (language, slot) in servers {
        for ext in &slot.config.file_extensions {
            if let Some(existing) = extension_map.get(ext) {
                tracing::warn!(
                    "Multiple language servers configured for extension '{ext}': '{existing}' and '{language}'. Using '{existing}'."
                );
                continue;
            }
            extension_map.insert(ext.clone(), language.clone());
        }
    }
    extension_map
}

struct ManagerInner {
    slots: BTreeMap<String, Arc<SessionSlot>>,
    extension_map: HashMap<String, String>,
    settings: SessionSettings,
    workspace_root: PathBuf,
    launcher: Arc<dyn ServerLauncher>,
    shutting_down: AtomicBool,
}

/// Owns every backend session. Cloning shares the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Manager that launches configured servers as child processes.
    pub fn new(
        servers: impl IntoIterator<Item = (String, ServerConfig)>,
        settings: SessionSettings,
        workspace_root: &Path,
    ) -> Self {
        Self::with_launcher(servers, settings, workspace_root, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(
        servers: impl IntoIterator<Item = (String, ServerConfig)>,
        settings: SessionSettings,
        workspace_root: &Path,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        let slots: BTreeMap<String, Arc<SessionSlot>> = servers
            .into_iter()
            .map(|(language, config)| {
                let slot = Arc::new(SessionSlot::new(language.clone(), config));
                (language, slot)
            })
            .collect();
        let extension_map = build_extension_map(&slots);
        Self {
            inner: Arc::new(ManagerInner {
                slots,
                extension_map,
                settings,
                workspace_root: workspace_root.to_path_buf(),
                launcher,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.inner.slots.keys().map(String::as_str)
    }

    /// Language whose server handles `path`, by file extension.
    #[must_use]
    pub fn language_for(&self, path: &Path) -> Option<&str> {
        let ext = path.extension().and_then(|e| e.to_str())?;
        self.inner.extension_map.get(ext).map(String::as_str)
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Get a handle onto the language's server, starting it if needed.
    ///
    /// A failed or timed-out handshake marks the session dead, schedules a
    /// background restart, and returns `Unavailable` without retrying here.
    /// While that restart is pending, or once the restart budget is spent,
    /// acquires fail fast.
    pub async fn acquire(&self, language: &str) -> Result<SessionHandle, SessionError> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(SessionError::ShuttingDown);
        }
        let slot = inner
            .slots
            .get(language)
            .ok_or_else(|| SessionError::NotConfigured(language.to_string()))?;
        let request_timeout = inner.settings.request_timeout;

        if let Some(handle) = slot.ready_handle(request_timeout) {
            return Ok(handle);
        }

        let _start = slot.start_lock.lock().await;
        if let Some(handle) = slot.ready_handle(request_timeout) {
            return Ok(handle);
        }
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(SessionError::ShuttingDown);
        }

        let unnoticed_crash = {
            let session = slot.lock();
            if session.exhausted || session.restart_pending {
                return Err(SessionError::Unavailable {
                    language: language.to_string(),
                    reason: session
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "session is dead".to_string()),
                });
            }
            session
                .state
                .is_some_and(SessionState::is_usable)
                .then_some(session.generation)
        };

        // Usable state but a closed transport: the monitor hasn't caught up yet.
        if let Some(generation) = unnoticed_crash {
            inner
                .handle_crash(slot, generation, "connection closed".to_string())
                .await;
            return Err(SessionError::Unavailable {
                language: language.to_string(),
                reason: "connection closed; restart scheduled".to_string(),
            });
        }

        inner.start_session(slot).await
    }

    /// A handle onto the language's server only if it is already running.
    #[must_use]
    pub fn current(&self, language: &str) -> Option<SessionHandle> {
        self.inner
            .slots
            .get(language)?
            .ready_handle(self.inner.settings.request_timeout)
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.inner.workspace_root
    }

    #[must_use]
    pub fn config(&self, language: &str) -> Option<&ServerConfig> {
        self.inner.slots.get(language).map(|slot| &slot.config)
    }

    /// Give a handle back. Equivalent to dropping it.
    pub fn release(&self, handle: SessionHandle) {
        drop(handle);
    }

    /// Stop every session, waiting up to the grace period for each before killing.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::Release);

        let servers: Vec<Arc<RunningServer>> = inner
            .slots
            .values()
            .filter_map(|slot| {
                let mut session = slot.lock();
                session.abort_tasks();
                session.restart_pending = false;
                if session.state.is_some() {
                    session.state = Some(SessionState::Dead);
                }
                session.server.take()
            })
            .collect();

        tracing::info!(count = servers.len(), "Shutting down language servers");
        let grace = inner.settings.shutdown_grace;
        futures_util::future::join_all(servers.iter().map(|server| server.shutdown(grace))).await;
    }

    #[must_use]
    pub fn status(&self) -> Vec<SessionStatus> {
        self.inner.slots.values().map(|slot| slot.status()).collect()
    }
}

impl ManagerInner {
    /// Launch and handshake a fresh server. Caller holds `slot.start_lock`.
    fn start_session<'a>(self: &'a Arc<Self>, slot: &'a Arc<SessionSlot>) -> StartFut<'a> {
        Box::pin(async move {
            let generation = {
                let mut session = slot.lock();
                session.generation += 1;
                session.state = Some(SessionState::Starting);
                session.probe_failures = 0;
                session.generation
            };

            let config = &slot.config;
            tracing::info!(
                server = %slot.language,
                command = %config.command,
                generation,
                "Starting language server"
            );
            if !config.root_markers.is_empty()
                && !config
                    .root_markers
                    .iter()
                    .any(|m| self.workspace_root.join(m).exists())
            {
                tracing::debug!(
                    server = %slot.language,
                    root = %self.workspace_root.display(),
                    "No root marker found in workspace root"
                );
            }

            let handshake_timeout = self.settings.handshake_timeout;
            let started = tokio::time::timeout(handshake_timeout, async {
                let transport = self
                    .launcher
                    .launch(&slot.language, config, &self.workspace_root)
                    .await?;
                let server = RunningServer::spawn(
                    &slot.language,
                    &config.language_id,
                    transport,
                    &self.workspace_root,
                );
                server.initialize(handshake_timeout).await?;
                Ok::<_, SessionError>(server)
            })
            .await
            .unwrap_or_else(|_| {
                Err(SessionError::Unavailable {
                    language: slot.language.clone(),
                    reason: format!("handshake timed out after {handshake_timeout:?}"),
                })
            });

            let server = match started {
                Ok(server) => Arc::new(server),
                Err(e) => {
                    let err = match e {
                        SessionError::Unavailable { .. } => e,
                        other => SessionError::Unavailable {
                            language: slot.language.clone(),
                            reason: other.to_string(),
                        },
                    };
                    tracing::warn!(server = %slot.language, "Language server failed to start: {err}");
                    let mut session = slot.lock();
                    session.state = Some(SessionState::Dead);
                    session.server = None;
                    session.last_error = Some(err.to_string());
                    self.schedule_restart(slot, &mut session);
                    return Err(err);
                }
            };

            if self.shutting_down.load(Ordering::Acquire) {
                let grace = self.settings.shutdown_grace;
                tokio::spawn(async move { server.shutdown(grace).await });
                return Err(SessionError::ShuttingDown);
            }

            tracing::info!(server = %slot.language, generation, "Language server ready");
            let mut session = slot.lock();
            session.state = Some(SessionState::Ready);
            session.ready_since = Some(tokio::time::Instant::now());
            session.server = Some(Arc::clone(&server));
            session.last_error = None;
            session.last_activity = Some(Instant::now());
            session.monitor = Some(self.spawn_monitor(slot, generation, Arc::clone(&server)));
            drop(session);

            Ok(SessionHandle::new(
                slot,
                server,
                generation,
                self.settings.request_timeout,
            ))
        })
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        slot: &Arc<SessionSlot>,
        generation: u64,
        server: Arc<RunningServer>,
    ) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(self);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            let interval = inner.settings.probe_interval;
            loop {
                let probe_due = async {
                    if interval.is_zero() {
                        std::future::pending::<()>().await;
                    } else {
                        tokio::time::sleep(interval).await;
                    }
                };
                tokio::select! {
                    () = server.closed() => {
                        inner.handle_crash(&slot, generation, "connection closed".to_string()).await;
                        return;
                    }
                    () = probe_due => {}
                }

                match server.probe(inner.settings.probe_timeout).await {
                    Ok(()) => {
                        let mut session = slot.lock();
                        if session.generation != generation {
                            return;
                        }
                        if session.state == Some(SessionState::Degraded) {
                            tracing::info!(server = %slot.language, "Language server recovered");
                        }
                        session.probe_failures = 0;
                        session.state = Some(SessionState::Ready);
                    }
                    Err(e) => {
                        let failures = {
                            let mut session = slot.lock();
                            if session.generation != generation {
                                return;
                            }
                            session.probe_failures += 1;
                            session.state = Some(SessionState::Degraded);
                            session.probe_failures
                        };
                        tracing::warn!(server = %slot.language, failures, "Liveness probe failed: {e}");
                        if failures >= PROBE_FAILURES_BEFORE_DEAD || server.is_closed() {
                            inner.handle_crash(&slot, generation, e.to_string()).await;
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Mark the session dead, fail its in-flight calls, and schedule a restart.
    async fn handle_crash(self: &Arc<Self>, slot: &Arc<SessionSlot>, generation: u64, reason: String) {
        let server = {
            let mut session = slot.lock();
            if session.generation != generation || session.state == Some(SessionState::Dead) {
                return;
            }
            session.state = Some(SessionState::Dead);
            session.last_error = Some(reason.clone());
            if session
                .ready_since
                .take()
                .is_some_and(|since| since.elapsed() >= self.settings.stable_after)
            {
                session.consecutive_restarts = 0;
            }
            // Our own task when called from the monitor; dropping detaches it.
            session.monitor = None;
            let server = session.server.take();
            self.schedule_restart(slot, &mut session);
            server
        };
        tracing::warn!(server = %slot.language, %reason, "Language server died");
        if let Some(server) = server {
            server.abort().await;
        }
    }

    fn schedule_restart(self: &Arc<Self>, slot: &Arc<SessionSlot>, session: &mut BackendSession) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if session.consecutive_restarts >= self.settings.max_restarts {
            session.exhausted = true;
            tracing::warn!(
                server = %slot.language,
                restarts = session.consecutive_restarts,
                "Restart budget exhausted; session stays dead"
            );
            return;
        }

        let attempt = session.consecutive_restarts;
        let delay = self.settings.backoff(attempt);
        session.restart_pending = true;

        let inner = Arc::clone(self);
        let slot = Arc::clone(slot);
        session.restart_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _start = slot.start_lock.lock().await;
            {
                let mut session = slot.lock();
                session.restart_pending = false;
                session.restart_task = None;
                session.restart_count += 1;
                session.consecutive_restarts += 1;
            }
            if inner.shutting_down.load(Ordering::Acquire) {
                return;
            }
            tracing::info!(server = %slot.language, attempt = attempt + 1, ?delay, "Restarting language server");
            if let Err(e) = inner.start_session(&slot).await {
                tracing::debug!(server = %slot.language, "Restart failed: {e}");
            }
        }));
    }
}
