//! In-process fake language server for tests.
//!
//! Speaks real Content-Length framing over a `tokio::io::duplex` pipe, so the
//! session manager, running-server connection, and LSP source adapter are
//! exercised end to end without spawning a process.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::io::DuplexStream;
use tokio::task::AbortHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::manager::{LaunchFut, ServerLauncher};
use crate::server::ServerTransport;
use crate::types::{ServerConfig, SessionError};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Builds the diagnostics published for `(uri, text)`.
pub type DiagnosticsFn = Arc<dyn Fn(&str, &str) -> Vec<serde_json::Value> + Send + Sync>;

/// Behavior of every server instance a [`FakeLauncher`] starts.
#[derive(Clone, Default)]
pub struct FakeServer {
    /// `None` publishes an empty list for every document.
    pub diagnostics: Option<DiagnosticsFn>,
    pub hang_on_initialize: bool,
    pub fail_initialize: bool,
    /// Leave liveness probes (and any other unknown request) unanswered.
    pub ignore_probes: bool,
    pub publish_delay: Option<Duration>,
    /// Publish without a document version, like older servers do.
    pub omit_version: bool,
}

impl FakeServer {
    pub fn publishing(
        diagnostics: impl Fn(&str, &str) -> Vec<serde_json::Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            diagnostics: Some(Arc::new(diagnostics)),
            ..Self::default()
        }
    }
}

#[derive(Clone, Default)]
struct Counters {
    shutdown_requests: Arc<AtomicUsize>,
    documents_synced: Arc<AtomicUsize>,
}

pub struct FakeLauncher {
    server: FakeServer,
    launches: AtomicUsize,
    fail_launch: AtomicBool,
    counters: Counters,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl FakeLauncher {
    #[must_use]
    pub fn new(server: FakeServer) -> Self {
        Self {
            server,
            launches: AtomicUsize::new(0),
            fail_launch: AtomicBool::new(false),
            counters: Counters::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn shutdown_requests(&self) -> usize {
        self.counters.shutdown_requests.load(Ordering::SeqCst)
    }

    /// `didOpen` plus `didChange` notifications received across all instances.
    pub fn documents_synced(&self) -> usize {
        self.counters.documents_synced.load(Ordering::SeqCst)
    }

    /// Make later launches fail as if the executable were missing.
    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Kill every running instance; clients see their transport close.
    pub fn crash_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

impl ServerLauncher for FakeLauncher {
    fn launch<'a>(
        &'a self,
        language: &'a str,
        _config: &'a ServerConfig,
        _workspace_root: &'a Path,
    ) -> LaunchFut<'a> {
        Box::pin(async move {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(SessionError::Unavailable {
                    language: language.to_string(),
                    reason: "fake launch failure".to_string(),
                });
            }

            let (client, server_end) = tokio::io::duplex(PIPE_CAPACITY);
            let task = tokio::spawn(serve(
                server_end,
                self.server.clone(),
                self.counters.clone(),
            ));
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task.abort_handle());

            let (reader, writer) = tokio::io::split(client);
            Ok(ServerTransport {
                reader: Box::new(reader),
                writer: Box::new(writer),
                child: None,
            })
        })
    }
}

fn error_reply(id: serde_json::Value, code: i64, message: &str) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

async fn serve(stream: DuplexStream, server: FakeServer, counters: Counters) {
    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);

    while let Ok(Some(frame)) = reader.read_frame().await {
        let method = frame
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        let id = frame.get("id").cloned();

        let reply = match (method, id) {
            ("initialize", Some(id)) => {
                if server.hang_on_initialize {
                    continue;
                }
                if server.fail_initialize {
                    Some(error_reply(id, -32603, "initialization failed"))
                } else {
                    Some(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": { "capabilities": { "textDocumentSync": 1 } }
                    }))
                }
            }
            ("shutdown", Some(id)) => {
                counters.shutdown_requests.fetch_add(1, Ordering::SeqCst);
                Some(json!({ "jsonrpc": "2.0", "id": id, "result": null }))
            }
            ("exit", None) => return,
            ("textDocument/didOpen" | "textDocument/didChange", None) => {
                counters.documents_synced.fetch_add(1, Ordering::SeqCst);
                let params = &frame["params"];
                let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
                let text = if method == "textDocument/didOpen" {
                    params["textDocument"]["text"].as_str()
                } else {
                    params["contentChanges"][0]["text"].as_str()
                }
                .unwrap_or_default();

                let diagnostics = server
                    .diagnostics
                    .as_ref()
                    .map(|build| build(uri, text))
                    .unwrap_or_default();
                if let Some(delay) = server.publish_delay {
                    tokio::time::sleep(delay).await;
                }
                let mut publish = json!({ "uri": uri, "diagnostics": diagnostics });
                if !server.omit_version {
                    publish["version"] = params["textDocument"]["version"].clone();
                }
                Some(json!({
                    "jsonrpc": "2.0",
                    "method": "textDocument/publishDiagnostics",
                    "params": publish
                }))
            }
            (_, Some(id)) => {
                if server.ignore_probes {
                    continue;
                }
                Some(error_reply(id, -32601, "Method not found"))
            }
            _ => None,
        };

        if let Some(reply) = reply
            && writer.write_frame(&reply).await.is_err()
        {
            return;
        }
    }
}
