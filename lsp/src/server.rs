//! Running server connection: request routing, document sync, diagnostics.
//!
//! A [`RunningServer`] owns one reader task and one writer task over an
//! arbitrary byte transport. Responses are routed to pending requests by id;
//! `publishDiagnostics` notifications are routed to per-document waiters
//! registered before the document was sent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{
    self, IncomingFrame, Notification, PROBE_METHOD, PublishDiagnosticsParams, Request,
};
use crate::types::SessionError;

const WRITER_CHANNEL_CAPACITY: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;
type WaiterMap = Arc<Mutex<HashMap<String, Vec<DiagnosticsWaiter>>>>;

/// Byte streams to a launched server plus its process, if it has one.
pub struct ServerTransport {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub child: Option<Child>,
}

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

/// Waits for a publication covering at least `min_version` of one document.
struct DiagnosticsWaiter {
    min_version: i32,
    tx: oneshot::Sender<Vec<serde_json::Value>>,
}

/// State the reader task needs to route frames.
struct ReaderContext {
    language: String,
    pending: PendingMap,
    waiters: WaiterMap,
    writer_tx: mpsc::Sender<WriterCommand>,
    workspace_root: PathBuf,
}

impl ReaderContext {
    async fn dispatch_frame(&self, frame: &serde_json::Value) {
        let Some(incoming) = protocol::parse_incoming(frame) else {
            tracing::trace!(server = %self.language, "Ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let sender = self.pending.lock().await.remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(body);
                }
            }
            IncomingFrame::ServerRequest { id, method, params } => {
                tracing::debug!(server = %self.language, %method, "Server request");
                let reply = protocol::reply_to_server_request(&id, &method, params.as_ref());
                let _ = self.writer_tx.send(WriterCommand::Send(reply)).await;
            }
            IncomingFrame::Notification { method, params } => {
                if method == "textDocument/publishDiagnostics" {
                    if let Some(params) = params {
                        self.handle_publish(params).await;
                    }
                } else {
                    tracing::trace!(server = %self.language, %method, "Ignoring notification");
                }
            }
        }
    }

    async fn handle_publish(&self, params: serde_json::Value) {
        let publish = match serde_json::from_value::<PublishDiagnosticsParams>(params) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(server = %self.language, "Unparseable publishDiagnostics: {e}");
                return;
            }
        };

        let Some(path) = protocol::file_uri_to_path(&publish.uri) else {
            tracing::debug!(server = %self.language, uri = %publish.uri, "Non-file diagnostics URI");
            return;
        };
        if !protocol::normalize_path(&path).starts_with(&self.workspace_root) {
            tracing::warn!(
                server = %self.language,
                path = %path.display(),
                "Diagnostics reported for path outside workspace"
            );
            return;
        }

        let mut waiters = self.waiters.lock().await;
        let Some(list) = waiters.get_mut(&publish.uri) else {
            return;
        };
        let (ready, still_waiting): (Vec<_>, Vec<_>) = list
            .drain(..)
            .partition(|w| publish.version.is_none_or(|v| v >= w.min_version));
        *list = still_waiting;
        if list.is_empty() {
            waiters.remove(&publish.uri);
        }
        drop(waiters);

        for waiter in ready {
            let _ = waiter.tx.send(publish.diagnostics.clone());
        }
    }
}

pub(crate) struct RunningServer {
    language: String,
    language_id: String,
    workspace_root: PathBuf,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: PendingMap,
    waiters: WaiterMap,
    /// Per-document version; presence means `didOpen` was sent.
    doc_versions: Mutex<HashMap<String, i32>>,
    closed_tx: Arc<watch::Sender<bool>>,
    child: Mutex<Option<Child>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl RunningServer {
    /// Spawn the reader and writer tasks over `transport`.
    ///
    /// No handshake happens here; call [`RunningServer::initialize`] next.
    pub fn spawn(
        language: &str,
        language_id: &str,
        transport: ServerTransport,
        workspace_root: &Path,
    ) -> Self {
        let ServerTransport {
            reader,
            writer,
            child,
        } = transport;
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let waiters: WaiterMap = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_language = language.to_string();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        tracing::trace!(server = %writer_language, %frame, "-> frame");
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(server = %writer_language, "LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let ctx = ReaderContext {
            language: language.to_string(),
            pending: Arc::clone(&pending),
            waiters: Arc::clone(&waiters),
            writer_tx: writer_tx.clone(),
            workspace_root: protocol::normalize_path(workspace_root),
        };
        let reader_closed = Arc::clone(&closed_tx);
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        tracing::trace!(server = %ctx.language, %frame, "<- frame");
                        ctx.dispatch_frame(&frame).await;
                    }
                    Ok(None) => {
                        tracing::info!(server = %ctx.language, "Language server closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(server = %ctx.language, "LSP reader error: {e}");
                        break;
                    }
                }
            }
            reader_closed.send_replace(true);
            // Dropping the senders fails every in-flight call with `Crashed`.
            ctx.pending.lock().await.clear();
            ctx.waiters.lock().await.clear();
        });

        Self {
            language: language.to_string(),
            language_id: language_id.to_string(),
            workspace_root: workspace_root.to_path_buf(),
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            waiters,
            doc_versions: Mutex::new(HashMap::new()),
            closed_tx,
            child: Mutex::new(child),
            reader_handle,
            writer_handle,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves once the transport is gone.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub async fn initialize(&self, timeout: Duration) -> Result<(), SessionError> {
        let root_uri =
            protocol::path_to_file_uri(&self.workspace_root).map_err(|e| SessionError::Unavailable {
                language: self.language.clone(),
                reason: e.to_string(),
            })?;

        let params = protocol::initialize_params(root_uri.as_str());
        let response = self.request("initialize", Some(params), timeout).await?;
        if let Some(error) = response.get("error") {
            return Err(SessionError::Unavailable {
                language: self.language.clone(),
                reason: format!(
                    "initialize failed: {}",
                    error["message"].as_str().unwrap_or("unknown error")
                ),
            });
        }

        self.notify("initialized", Some(serde_json::json!({}))).await
    }

    /// Send a no-op request. Any reply, including an error reply, proves liveness.
    pub async fn probe(&self, timeout: Duration) -> Result<(), SessionError> {
        self.request(PROBE_METHOD, None, timeout).await.map(|_| ())
    }

    /// Sync `text` for `path` and wait for the server's next publication for it.
    pub async fn diagnostics(
        &self,
        path: &Path,
        text: &str,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Value>, SessionError> {
        let uri = protocol::path_to_file_uri(path)
            .map_err(|e| self.transport_error(e))?
            .to_string();

        let (version, already_open) = {
            let mut versions = self.doc_versions.lock().await;
            match versions.get_mut(&uri) {
                Some(v) => {
                    *v += 1;
                    (*v, true)
                }
                None => {
                    versions.insert(uri.clone(), 1);
                    (1, false)
                }
            }
        };

        // Register before sending so a fast server cannot publish unseen.
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .entry(uri.clone())
            .or_default()
            .push(DiagnosticsWaiter {
                min_version: version,
                tx,
            });

        if already_open {
            let params = protocol::did_change_params(&uri, version, text);
            self.notify("textDocument/didChange", Some(params)).await?;
        } else {
            let params = protocol::did_open_params(&uri, &self.language_id, version, text);
            self.notify("textDocument/didOpen", Some(params)).await?;
        }

        let started = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(items)) => Ok(items),
            Ok(Err(_)) => Err(SessionError::Crashed {
                language: self.language.clone(),
            }),
            Err(_) => {
                if let Some(list) = self.waiters.lock().await.get_mut(&uri) {
                    list.retain(|w| !w.tx.is_closed());
                }
                Err(SessionError::Timeout {
                    language: self.language.clone(),
                    method: "textDocument/publishDiagnostics".to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Forget a document (sends `didClose` if it was opened).
    pub async fn close_document(&self, path: &Path) -> Result<(), SessionError> {
        let uri = protocol::path_to_file_uri(path)
            .map_err(|e| self.transport_error(e))?
            .to_string();
        if self.doc_versions.lock().await.remove(&uri).is_none() {
            return Ok(());
        }
        self.notify("textDocument/didClose", Some(protocol::did_close_params(&uri)))
            .await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| self.transport_error(e))?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(SessionError::Crashed {
                language: self.language.clone(),
            });
        }

        let started = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SessionError::Crashed {
                language: self.language.clone(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SessionError::Timeout {
                    language: self.language.clone(),
                    method: method.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), SessionError> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| self.transport_error(e))?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| SessionError::Crashed {
                language: self.language.clone(),
            })
    }

    fn transport_error(&self, e: impl std::fmt::Display) -> SessionError {
        SessionError::Transport {
            language: self.language.clone(),
            reason: e.to_string(),
        }
    }

    /// Tear the connection down immediately.
    ///
    /// Every in-flight request and diagnostics wait fails with `Crashed`.
    pub async fn abort(&self) {
        self.closed_tx.send_replace(true);
        self.reader_handle.abort();
        self.writer_handle.abort();
        self.pending.lock().await.clear();
        self.waiters.lock().await.clear();
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
    }

    /// Polite `shutdown`/`exit`, then wait up to `grace` before killing.
    pub async fn shutdown(&self, grace: Duration) {
        if !self.is_closed()
            && let Ok(response) = self.request("shutdown", None, grace).await
            && response.get("error").is_none()
        {
            let _ = self.notify("exit", None).await;
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        if let Some(mut child) = self.child.lock().await.take() {
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::debug!(server = %self.language, "Server didn't exit in time, killing");
                let _ = child.kill().await;
            }
        }
        self.abort().await;
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(windows)]
    fn test_workspace_root() -> PathBuf {
        PathBuf::from(r"C:\test")
    }

    #[cfg(not(windows))]
    fn test_workspace_root() -> PathBuf {
        PathBuf::from("/test")
    }

    #[cfg(windows)]
    const MAIN_URI: &str = "file:///C:/test/main.py";
    #[cfg(not(windows))]
    const MAIN_URI: &str = "file:///test/main.py";

    fn test_context() -> (ReaderContext, mpsc::Receiver<WriterCommand>) {
        let (writer_tx, writer_rx) = mpsc::channel(32);
        let ctx = ReaderContext {
            language: "python".into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            writer_tx,
            workspace_root: test_workspace_root(),
        };
        (ctx, writer_rx)
    }

    async fn add_waiter(
        ctx: &ReaderContext,
        uri: &str,
        min_version: i32,
    ) -> oneshot::Receiver<Vec<serde_json::Value>> {
        let (tx, rx) = oneshot::channel();
        ctx.waiters
            .lock()
            .await
            .entry(uri.to_string())
            .or_default()
            .push(DiagnosticsWaiter { min_version, tx });
        rx
    }

    fn publish(uri: &str, version: Option<i32>) -> serde_json::Value {
        let mut params = serde_json::json!({
            "uri": uri,
            "diagnostics": [{
                "range": { "start": { "line": 5, "character": 0 }, "end": { "line": 5, "character": 10 } },
                "severity": 1,
                "source": "pyright",
                "message": "\"foo\" is not defined"
            }]
        });
        if let Some(v) = version {
            params["version"] = serde_json::json!(v);
        }
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": params
        })
    }

    #[tokio::test]
    async fn response_routes_to_pending() {
        let (ctx, _writer_rx) = test_context();
        let (tx, rx) = oneshot::channel();
        ctx.pending.lock().await.insert(1, tx);

        ctx.dispatch_frame(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "capabilities": {} }
        }))
        .await;

        let response = rx.await.unwrap();
        assert!(response["result"]["capabilities"].is_object());
        assert!(ctx.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn response_for_unknown_id_ignored() {
        let (ctx, _writer_rx) = test_context();
        ctx.dispatch_frame(&serde_json::json!({"jsonrpc": "2.0", "id": 999, "result": {}}))
            .await;
        assert!(ctx.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn publication_wakes_waiter_for_matching_version() {
        let (ctx, _writer_rx) = test_context();
        let rx = add_waiter(&ctx, MAIN_URI, 2).await;

        ctx.dispatch_frame(&publish(MAIN_URI, Some(2))).await;

        let items = rx.await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["source"], "pyright");
        assert!(ctx.waiters.lock().await.is_empty());
    }

    #[tokio::test]
    async fn publication_for_older_version_keeps_waiting() {
        let (ctx, _writer_rx) = test_context();
        let mut rx = add_waiter(&ctx, MAIN_URI, 3).await;

        ctx.dispatch_frame(&publish(MAIN_URI, Some(2))).await;
        assert!(rx.try_recv().is_err(), "stale publication must not satisfy waiter");

        ctx.dispatch_frame(&publish(MAIN_URI, Some(3))).await;
        assert_eq!(rx.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unversioned_publication_satisfies_any_waiter() {
        let (ctx, _writer_rx) = test_context();
        let rx = add_waiter(&ctx, MAIN_URI, 7).await;
        ctx.dispatch_frame(&publish(MAIN_URI, None)).await;
        assert_eq!(rx.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_diagnostics_outside_workspace() {
        let (ctx, _writer_rx) = test_context();
        #[cfg(windows)]
        let uri = "file:///C:/test/../etc/passwd";
        #[cfg(not(windows))]
        let uri = "file:///test/../etc/passwd";
        let mut rx = add_waiter(&ctx, uri, 1).await;

        ctx.dispatch_frame(&publish(uri, Some(1))).await;

        assert!(
            rx.try_recv().is_err(),
            "path traversal diagnostics must be rejected"
        );
    }

    #[tokio::test]
    async fn configuration_request_is_answered() {
        let (ctx, mut writer_rx) = test_context();
        ctx.dispatch_frame(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "workspace/configuration",
            "params": { "items": [{ "section": "python" }] }
        }))
        .await;

        match writer_rx.try_recv().unwrap() {
            WriterCommand::Send(response) => {
                assert_eq!(response["id"], 5);
                assert_eq!(response["result"], serde_json::json!([null]));
            }
            WriterCommand::Shutdown => panic!("expected Send, got Shutdown"),
        }
    }

    #[tokio::test]
    async fn unknown_notification_ignored() {
        let (ctx, mut writer_rx) = test_context();
        ctx.dispatch_frame(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "window/logMessage",
            "params": { "type": 3, "message": "hello" }
        }))
        .await;
        assert!(writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn eof_fails_in_flight_requests_as_crashed() {
        let (client, server) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(client);
        let running = RunningServer::spawn(
            "python",
            "python",
            ServerTransport {
                reader: Box::new(read),
                writer: Box::new(write),
                child: None,
            },
            &test_workspace_root(),
        );

        let request = running.probe(Duration::from_secs(5));
        let hang_up = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(server);
        };
        let (result, ()) = tokio::join!(request, hang_up);

        assert_eq!(
            result,
            Err(SessionError::Crashed {
                language: "python".into()
            })
        );
        running.closed().await;
        assert!(running.is_closed());
    }

    #[tokio::test]
    async fn request_timeout_cleans_pending_entry() {
        let (client, _server) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(client);
        let running = RunningServer::spawn(
            "python",
            "python",
            ServerTransport {
                reader: Box::new(read),
                writer: Box::new(write),
                child: None,
            },
            &test_workspace_root(),
        );

        let err = running.probe(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert!(running.pending.lock().await.is_empty());
        assert!(!running.is_closed());
    }
}
