//! JSON-RPC over a duplex byte stream.
//!
//! A reader task decodes frames and routes them (responses to the
//! correlator, notifications to the diagnostics cache, server requests to a
//! canned reply). A writer task owns the outgoing half. Neither cares where
//! the bytes come from, so the same code drives a child process or an
//! in-memory pipe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{self, FrameDecoder, FrameWriter};
use crate::correlator::{Correlator, PendingGuard};
use crate::diagnostics::DiagnosticsCache;
use crate::error::LspError;
use crate::protocol::{self, ConfigurationParams, Incoming, Notification, PublishDiagnosticsParams, Request};

const WRITER_CHANNEL_CAPACITY: usize = 64;

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// How long `close` waits for queued frames to reach the peer.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Lifecycle of one connection. A connection that leaves `Ready` never
/// returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Ready,
    Disconnecting,
}

/// Connection state shared between the client and its reader task.
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<ConnectionState>);

impl StateCell {
    pub fn new() -> Self {
        Self(Mutex::new(ConnectionState::Unconnected))
    }

    pub fn get(&self) -> ConnectionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, state: ConnectionState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Move `from → to` atomically. Returns `false` if the state was not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut current = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != from {
            return false;
        }
        *current = to;
        true
    }
}

enum WriterCommand {
    Send(Vec<u8>),
    Shutdown,
}

pub(crate) struct Connection {
    name: String,
    writer_tx: mpsc::Sender<WriterCommand>,
    correlator: Arc<Correlator>,
    state: Arc<StateCell>,
    /// Set once the reader has seen the end of the stream.
    closed: Arc<AtomicBool>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Start reader and writer tasks over `reader`/`writer`.
    pub fn start<R, W>(
        name: String,
        reader: R,
        writer: W,
        state: Arc<StateCell>,
        diagnostics: DiagnosticsCache,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let correlator = Arc::new(Correlator::new());
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);

        let writer_name = name.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(server = %writer_name, "LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
        });

        let closed = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher {
            name: name.clone(),
            correlator: correlator.clone(),
            writer_tx: writer_tx.clone(),
            diagnostics,
            state: state.clone(),
            closed: closed.clone(),
        };
        let reader_handle = tokio::spawn(dispatcher.run(reader));

        Self {
            name,
            writer_tx,
            correlator,
            state,
            closed,
            writer_task: Mutex::new(Some(writer_handle)),
            tasks: Mutex::new(vec![reader_handle]),
        }
    }

    /// Attach an auxiliary task (e.g. a stderr logger) to this connection's
    /// lifetime.
    pub fn adopt_task(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), LspError> {
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| LspError::disconnected(format!("{}: writer closed", self.name)))
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// A timeout only forgets the pending entry; the server is not told.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, LspError> {
        // Register before checking liveness: the reader marks the stream
        // closed before failing pending entries, so this request is either
        // refused here or failed by the reader.
        let (id, rx) = self.correlator.register(method);
        let _pending = PendingGuard::new(&self.correlator, id);

        if self.closed.load(Ordering::SeqCst) || self.state.get() == ConnectionState::Unconnected {
            return Err(LspError::disconnected(format!(
                "{} is not connected",
                self.name
            )));
        }

        let frame = codec::encode_frame(&Request::new(id, method, params)).map_err(|source| {
            LspError::Encode {
                method: method.to_string(),
                source,
            }
        })?;
        tracing::debug!(server = %self.name, id, method, "LSP request");
        let started = Instant::now();
        let exchange = async {
            self.send_frame(frame).await?;
            rx.await.map_err(|_| {
                LspError::disconnected(format!("{} closed while {method} was pending", self.name))
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(LspError::Protocol {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::debug!(server = %self.name, id, method, "LSP request timed out");
                Err(LspError::Timeout {
                    method: method.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), LspError> {
        let frame = codec::encode_frame(&Notification::new(method, params)).map_err(|source| {
            LspError::Encode {
                method: method.to_string(),
                source,
            }
        })?;
        self.send_frame(frame).await
    }

    #[cfg(test)]
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn abandon_pending(&self) -> usize {
        self.correlator.fail_all()
    }

    /// Close the outgoing stream after queued frames are written, then stop
    /// every task attached to this connection.
    pub async fn close(&self) {
        let _ = tokio::time::timeout(WRITER_DRAIN, self.writer_tx.send(WriterCommand::Shutdown)).await;
        let writer = self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut writer) = writer
            && tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err()
        {
            writer.abort();
        }
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        if let Some(writer) = self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            writer.abort();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Routes incoming frames for one connection.
struct Dispatcher {
    name: String,
    correlator: Arc<Correlator>,
    writer_tx: mpsc::Sender<WriterCommand>,
    diagnostics: DiagnosticsCache,
    state: Arc<StateCell>,
    closed: Arc<AtomicBool>,
}

impl Dispatcher {
    async fn run<R: AsyncRead + Unpin>(self, mut reader: R) {
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    tracing::info!(server = %self.name, "LSP server closed stdout");
                    break;
                }
                Ok(n) => {
                    for frame in decoder.append(&chunk[..n]) {
                        self.dispatch(frame).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %self.name, "LSP reader error: {e}");
                    break;
                }
            }
        }
        self.on_closed();
    }

    /// The stream ended. Unless we were already tearing down, the server
    /// died: mark the connection dead before failing waiters so no new
    /// request can slip in and hang until its timeout.
    fn on_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.state.get() != ConnectionState::Disconnecting {
            tracing::warn!(server = %self.name, "LSP server exited unexpectedly");
            self.state.set(ConnectionState::Unconnected);
        }
        let abandoned = self.correlator.fail_all();
        if abandoned > 0 {
            tracing::debug!(server = %self.name, abandoned, "Failed pending requests after server exit");
        }
    }

    async fn dispatch(&self, frame: serde_json::Value) {
        let Some(incoming) = protocol::parse_incoming(frame) else {
            tracing::trace!(server = %self.name, "Ignoring unroutable JSON-RPC frame");
            return;
        };

        match incoming {
            Incoming::Response { id, outcome } => {
                self.correlator.complete(id, outcome);
            }
            Incoming::ServerRequest { id, method, params } => {
                tracing::debug!(server = %self.name, method = %method, "LSP server request");
                let reply = server_request_reply(id, &method, params);
                match codec::encode_frame(&reply) {
                    Ok(frame) => {
                        let _ = self.writer_tx.send(WriterCommand::Send(frame)).await;
                    }
                    Err(e) => {
                        tracing::debug!(server = %self.name, error = %e, "Cannot encode reply");
                    }
                }
            }
            Incoming::Notification { method, params } => {
                self.handle_notification(&method, params);
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<serde_json::Value>) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(published) => {
                        tracing::debug!(
                            server = %self.name,
                            uri = %published.uri,
                            count = published.diagnostics.len(),
                            "Diagnostics updated"
                        );
                        self.diagnostics
                            .update(&published.uri, published.diagnostics);
                    }
                    Err(e) => {
                        tracing::debug!(
                            server = %self.name,
                            "Failed to parse publishDiagnostics: {e}"
                        );
                    }
                }
            }
            "window/logMessage" | "window/showMessage" => {
                let message = params
                    .as_ref()
                    .and_then(|p| p.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or_default();
                tracing::debug!(server = %self.name, "{method}: {message}");
            }
            _ => {
                tracing::trace!(server = %self.name, "Ignoring notification: {method}");
            }
        }
    }
}

/// Servers block on some requests until answered. Answer the common ones
/// with neutral results and refuse the rest.
fn server_request_reply(
    id: serde_json::Value,
    method: &str,
    params: Option<serde_json::Value>,
) -> serde_json::Value {
    match method {
        "workspace/configuration" => {
            let items = params
                .and_then(|p| serde_json::from_value::<ConfigurationParams>(p).ok())
                .map_or(0, |p| p.items.len());
            protocol::result_response(id, serde_json::Value::Array(vec![serde_json::Value::Null; items]))
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => protocol::result_response(id, serde_json::Value::Null),
        _ => protocol::error_response(
            id,
            protocol::METHOD_NOT_FOUND,
            &format!("Method not found: {method}"),
        ),
    }
}
