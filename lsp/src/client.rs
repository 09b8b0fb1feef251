//! One connected language server and its typed queries.
//!
//! A client is single-use: [`LspClient::connect`] moves it to `Ready`, and
//! once it leaves `Ready` (explicit disconnect or the server dying) it stays
//! dead. The pool replaces dead clients with fresh ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use lsp_types::{
    CodeActionResponse, Diagnostic, DocumentSymbolResponse, GotoDefinitionResponse, Hover,
    Location, PrepareRenameResponse, Range, WorkspaceEdit, WorkspaceSymbolResponse,
};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::connection::{Connection, ConnectionState, StateCell};
use crate::diagnostics::DiagnosticsCache;
use crate::error::LspError;
use crate::process::{self, AnalyzerProcess};
use crate::protocol;
use crate::registry::ServerDescriptor;
use crate::types::LspConfig;

/// Lower bound for the `initialize` round trip. Large workspaces take a
/// while to index before the server answers.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-client timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Default timeout for every typed operation.
    pub request_timeout: Duration,
    /// Pause after `didOpen` before the first query against that document.
    pub settle_delay: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&LspConfig::default())
    }
}

impl From<&LspConfig> for ClientSettings {
    fn from(config: &LspConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            settle_delay: config.settle_delay(),
        }
    }
}

/// Wire plumbing that exists once a connection attempt has started.
struct Link {
    connection: Connection,
    process: tokio::sync::Mutex<Option<AnalyzerProcess>>,
}

pub struct LspClient {
    descriptor: ServerDescriptor,
    root: PathBuf,
    settings: ClientSettings,
    state: Arc<StateCell>,
    link: OnceLock<Link>,
    /// URIs that have had a `didOpen`, with the instant their settle delay
    /// ends.
    open_documents: tokio::sync::Mutex<HashMap<String, Instant>>,
    diagnostics: DiagnosticsCache,
}

impl LspClient {
    #[must_use]
    pub fn new(descriptor: ServerDescriptor, root: PathBuf, settings: ClientSettings) -> Self {
        Self {
            descriptor,
            root,
            settings,
            state: Arc::new(StateCell::new()),
            link: OnceLock::new(),
            open_documents: tokio::sync::Mutex::new(HashMap::new()),
            diagnostics: DiagnosticsCache::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// Spawn the analyzer in the workspace root and run the handshake.
    pub async fn connect(&self) -> Result<(), LspError> {
        self.begin_connect()?;
        let (child, io) = match AnalyzerProcess::spawn(&self.descriptor, &self.root) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.state.set(ConnectionState::Unconnected);
                return Err(e);
            }
        };

        let link = self.attach(io.stdout, io.stdin, Some(child))?;
        if let Some(stderr) = io.stderr {
            link.connection.adopt_task(process::spawn_stderr_logger(
                stderr,
                self.descriptor.name.clone(),
            ));
        }
        self.finish_connect().await
    }

    /// Run the handshake over an already-established byte stream instead of
    /// a child process.
    pub async fn connect_over<R, W>(&self, reader: R, writer: W) -> Result<(), LspError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.begin_connect()?;
        self.attach(reader, writer, None)?;
        self.finish_connect().await
    }

    fn begin_connect(&self) -> Result<(), LspError> {
        if self.link.get().is_none()
            && self
                .state
                .transition(ConnectionState::Unconnected, ConnectionState::Connecting)
        {
            return Ok(());
        }
        Err(LspError::disconnected(format!(
            "{} client cannot be reconnected",
            self.descriptor.name
        )))
    }

    fn attach<R, W>(
        &self,
        reader: R,
        writer: W,
        process: Option<AnalyzerProcess>,
    ) -> Result<&Link, LspError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::start(
            self.descriptor.name.clone(),
            reader,
            writer,
            self.state.clone(),
            self.diagnostics.clone(),
        );
        let link = Link {
            connection,
            process: tokio::sync::Mutex::new(process),
        };
        if self.link.set(link).is_err() {
            return Err(LspError::disconnected(format!(
                "{} client is already connected",
                self.descriptor.name
            )));
        }
        self.link().ok_or_else(|| {
            LspError::disconnected(format!("{} client has no connection", self.descriptor.name))
        })
    }

    async fn finish_connect(&self) -> Result<(), LspError> {
        match self.handshake().await {
            Ok(()) => {
                tracing::info!(
                    server = %self.descriptor.name,
                    root = %self.root.display(),
                    "Language server initialized"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %self.descriptor.name, error = %e, "LSP handshake failed");
                let _ = self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<(), LspError> {
        let connection = &self.link_or_disconnected()?.connection;
        let root_uri = protocol::path_to_file_uri(&self.root).ok_or_else(|| LspError::InvalidPath {
            path: self.root.clone(),
        })?;

        let params = protocol::initialize_params(
            &self.root,
            root_uri.as_str(),
            self.descriptor.initialization_options.as_ref(),
        );
        connection
            .request(
                "initialize",
                Some(params),
                self.settings.request_timeout.max(INITIALIZE_TIMEOUT),
            )
            .await?;
        connection
            .notify("initialized", Some(serde_json::json!({})))
            .await?;

        if self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Ready)
        {
            Ok(())
        } else {
            Err(LspError::disconnected(format!(
                "{} exited during initialization",
                self.descriptor.name
            )))
        }
    }

    /// Shut the analyzer down and forget all per-connection state.
    ///
    /// The graceful `shutdown`/`exit` exchange is best effort. Pending
    /// requests, open documents and diagnostics are cleared even when the
    /// process cannot be stopped; that failure is still reported.
    pub async fn disconnect(&self) -> Result<(), LspError> {
        let previous = self.state.get();
        self.state.set(ConnectionState::Disconnecting);

        let mut result = Ok(());
        if let Some(link) = self.link() {
            let connection = &link.connection;
            if previous == ConnectionState::Ready {
                if let Err(e) = connection.request("shutdown", None, SHUTDOWN_TIMEOUT).await {
                    tracing::debug!(server = %self.descriptor.name, error = %e, "LSP shutdown request failed");
                }
                let _ = connection.notify("exit", None).await;
            }
            connection.close().await;

            if let Some(mut child) = link.process.lock().await.take()
                && let Err(source) = child.terminate().await
            {
                result = Err(LspError::Terminate {
                    server: self.descriptor.name.clone(),
                    source,
                });
            }
            let abandoned = connection.abandon_pending();
            if abandoned > 0 {
                tracing::debug!(server = %self.descriptor.name, abandoned, "Dropped pending requests on disconnect");
            }
        }

        self.open_documents.lock().await.clear();
        self.diagnostics.clear();
        self.state.set(ConnectionState::Unconnected);
        if previous != ConnectionState::Unconnected {
            tracing::info!(server = %self.descriptor.name, root = %self.root.display(), "Language server shut down");
        }
        result
    }

    fn link(&self) -> Option<&Link> {
        self.link.get()
    }

    fn link_or_disconnected(&self) -> Result<&Link, LspError> {
        self.link().ok_or_else(|| {
            LspError::disconnected(format!("{} is not connected", self.descriptor.name))
        })
    }

    fn ready_connection(&self) -> Result<&Connection, LspError> {
        let state = self.state.get();
        if state != ConnectionState::Ready {
            return Err(LspError::disconnected(format!(
                "{} is {state:?}",
                self.descriptor.name
            )));
        }
        Ok(&self.link_or_disconnected()?.connection)
    }

    /// Send an arbitrary request with an explicit timeout and return the raw
    /// result.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, LspError> {
        self.ready_connection()?
            .request(method, params, timeout)
            .await
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), LspError> {
        self.ready_connection()?.notify(method, params).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, LspError> {
        let value = self
            .send_request(method, Some(params), self.settings.request_timeout)
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| LspError::InvalidResponse {
                method: method.to_string(),
                source,
            })
    }

    /// Push the full text of `path` to the server unless it is already
    /// open, and return its URI. Re-opening sends nothing but still waits
    /// out the settle delay of the original open.
    pub async fn open_document(&self, path: &Path) -> Result<String, LspError> {
        let connection = self.ready_connection()?;
        let path = protocol::absolute_path(path);
        let uri = document_uri(&path)?;

        let settled_at = {
            let mut open = self.open_documents.lock().await;
            if let Some(&settled_at) = open.get(&uri) {
                drop(open);
                settle(settled_at).await;
                return Ok(uri);
            }
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| LspError::Io {
                    path: path.clone(),
                    source,
                })?;
            let language_id = self
                .descriptor
                .language_id
                .clone()
                .unwrap_or_else(|| protocol::language_id_for_path(&path));
            connection
                .notify(
                    "textDocument/didOpen",
                    Some(protocol::did_open_params(&uri, &language_id, 1, &text)),
                )
                .await?;
            let settled_at = Instant::now() + self.settings.settle_delay;
            open.insert(uri.clone(), settled_at);
            tracing::debug!(server = %self.descriptor.name, uri = %uri, "Opened document");
            settled_at
        };

        settle(settled_at).await;
        Ok(uri)
    }

    pub async fn hover(&self, path: &Path, line: u32, character: u32) -> Result<Option<Hover>, LspError> {
        let uri = self.open_document(path).await?;
        self.call(
            "textDocument/hover",
            protocol::position_params(&uri, line, character),
        )
        .await
    }

    /// Servers may answer with one location, a list, or location links. See
    /// [`definition_locations`] to flatten the result.
    pub async fn definition(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<GotoDefinitionResponse>, LspError> {
        let uri = self.open_document(path).await?;
        self.call(
            "textDocument/definition",
            protocol::position_params(&uri, line, character),
        )
        .await
    }

    pub async fn references(
        &self,
        path: &Path,
        line: u32,
        character: u32,
        include_declaration: bool,
    ) -> Result<Option<Vec<Location>>, LspError> {
        let uri = self.open_document(path).await?;
        self.call(
            "textDocument/references",
            protocol::references_params(&uri, line, character, include_declaration),
        )
        .await
    }

    /// Nested `DocumentSymbol`s or flat `SymbolInformation`, whichever the
    /// server produces.
    pub async fn document_symbols(&self, path: &Path) -> Result<Option<DocumentSymbolResponse>, LspError> {
        let uri = self.open_document(path).await?;
        self.call(
            "textDocument/documentSymbol",
            protocol::text_document_params(&uri),
        )
        .await
    }

    pub async fn workspace_symbols(&self, query: &str) -> Result<Option<WorkspaceSymbolResponse>, LspError> {
        self.call("workspace/symbol", protocol::workspace_symbol_params(query))
            .await
    }

    /// `None` when the server says the position cannot be renamed, including
    /// by answering with an error.
    pub async fn prepare_rename(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Option<PrepareRenameResponse>, LspError> {
        let uri = self.open_document(path).await?;
        match self
            .call(
                "textDocument/prepareRename",
                protocol::position_params(&uri, line, character),
            )
            .await
        {
            Err(e) if e.is_protocol() => {
                tracing::debug!(server = %self.descriptor.name, error = %e, "Rename rejected");
                Ok(None)
            }
            other => other,
        }
    }

    pub async fn rename(
        &self,
        path: &Path,
        line: u32,
        character: u32,
        new_name: &str,
    ) -> Result<Option<WorkspaceEdit>, LspError> {
        let uri = self.open_document(path).await?;
        self.call(
            "textDocument/rename",
            protocol::rename_params(&uri, line, character, new_name),
        )
        .await
    }

    pub async fn code_actions(
        &self,
        path: &Path,
        range: Range,
        diagnostics: &[Diagnostic],
    ) -> Result<Option<CodeActionResponse>, LspError> {
        let uri = self.open_document(path).await?;
        self.call(
            "textDocument/codeAction",
            protocol::code_action_params(&uri, range, diagnostics),
        )
        .await
    }

    /// Last diagnostics the server pushed for `path`. Never waits.
    pub fn get_diagnostics(&self, path: &Path) -> Vec<Diagnostic> {
        match document_uri(&protocol::absolute_path(path)) {
            Ok(uri) => self.diagnostics.get(&uri),
            Err(_) => Vec::new(),
        }
    }
}

async fn settle(until: Instant) {
    if until > Instant::now() {
        tokio::time::sleep_until(until).await;
    }
}

fn document_uri(path: &Path) -> Result<String, LspError> {
    protocol::path_to_file_uri(path)
        .map(String::from)
        .ok_or_else(|| LspError::InvalidPath {
            path: path.to_path_buf(),
        })
}

/// Flatten every legal `textDocument/definition` result shape into plain
/// locations. Links resolve to their target selection range.
#[must_use]
pub fn definition_locations(response: GotoDefinitionResponse) -> Vec<Location> {
    match response {
        GotoDefinitionResponse::Scalar(location) => vec![location],
        GotoDefinitionResponse::Array(locations) => locations,
        GotoDefinitionResponse::Link(links) => links
            .into_iter()
            .map(|link| Location {
                uri: link.target_uri,
                range: link.target_selection_range,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakePeer, wait_until};
    use lsp_types::{HoverContents, Position};

    fn test_settings() -> ClientSettings {
        ClientSettings {
            request_timeout: Duration::from_secs(5),
            settle_delay: Duration::ZERO,
        }
    }

    async fn connected_client(root: &Path) -> (LspClient, FakePeer) {
        connected_client_with(root, test_settings()).await
    }

    async fn connected_client_with(root: &Path, settings: ClientSettings) -> (LspClient, FakePeer) {
        let (io, mut peer) = FakePeer::pair();
        let (reader, writer) = tokio::io::split(io);
        let client = LspClient::new(
            ServerDescriptor::new("fake", "fake-ls"),
            root.to_path_buf(),
            settings,
        );
        let (connected, _) = tokio::join!(client.connect_over(reader, writer), peer.handshake());
        connected.unwrap();
        (client, peer)
    }

    fn write_source(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    fn uri_of(path: &Path) -> String {
        url::Url::from_file_path(path).unwrap().to_string()
    }

    #[tokio::test]
    async fn test_handshake_sends_root_and_options() {
        let dir = tempfile::tempdir().unwrap();
        let (io, mut peer) = FakePeer::pair();
        let (reader, writer) = tokio::io::split(io);
        let mut descriptor = ServerDescriptor::new("fake", "fake-ls");
        descriptor.initialization_options = Some(serde_json::json!({ "lint": true }));
        let client = LspClient::new(descriptor, dir.path().to_path_buf(), test_settings());

        assert_eq!(client.state(), ConnectionState::Unconnected);
        let (connected, init) = tokio::join!(client.connect_over(reader, writer), peer.handshake());
        connected.unwrap();

        assert!(client.is_ready());
        assert_eq!(init["id"], 0);
        assert_eq!(init["params"]["rootUri"], uri_of(dir.path()));
        assert_eq!(init["params"]["initializationOptions"]["lint"], true);
        assert_eq!(
            init["params"]["capabilities"]["textDocument"]["definition"]["linkSupport"],
            true
        );
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_client_dead() {
        let dir = tempfile::tempdir().unwrap();
        let (io, mut peer) = FakePeer::pair();
        let (reader, writer) = tokio::io::split(io);
        let client = LspClient::new(
            ServerDescriptor::new("fake", "fake-ls"),
            dir.path().to_path_buf(),
            test_settings(),
        );

        let server = async {
            let init = peer.next_with_method("initialize").await.unwrap();
            peer.send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "error": { "code": -32002, "message": "not today" }
            }))
            .await;
        };
        let (connected, ()) = tokio::join!(client.connect_over(reader, writer), server);

        assert!(connected.unwrap_err().is_protocol());
        assert_eq!(client.state(), ConnectionState::Unconnected);
    }

    #[tokio::test]
    async fn test_operation_before_connect_is_disconnected() {
        let client = LspClient::new(
            ServerDescriptor::new("fake", "fake-ls"),
            PathBuf::from("/nowhere"),
            test_settings(),
        );
        let err = client
            .hover(Path::new("/nowhere/a.rs"), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Disconnected { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_hover_opens_document_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "main.rs", "fn main() {}\n");
        let (client, mut peer) = connected_client(dir.path()).await;

        let server = async {
            let open = peer.next_message().await.unwrap();
            assert_eq!(open["method"], "textDocument/didOpen");
            assert_eq!(open["params"]["textDocument"]["uri"], uri_of(&file));
            assert_eq!(open["params"]["textDocument"]["languageId"], "rust");
            assert_eq!(open["params"]["textDocument"]["version"], 1);
            assert_eq!(open["params"]["textDocument"]["text"], "fn main() {}\n");

            for _ in 0..2 {
                // No second didOpen: the next frame is the request itself.
                let hover = peer.next_message().await.unwrap();
                assert_eq!(hover["method"], "textDocument/hover");
                assert_eq!(hover["params"]["position"]["character"], 3);
                peer.respond(
                    &hover,
                    serde_json::json!({ "contents": { "kind": "markdown", "value": "fn main()" } }),
                )
                .await;
            }
        };
        let client_side = async {
            let first = client.hover(&file, 0, 3).await.unwrap().unwrap();
            let second = client.hover(&file, 0, 3).await.unwrap().unwrap();
            (first, second)
        };
        let ((first, second), ()) = tokio::join!(client_side, server);

        match first.contents {
            HoverContents::Markup(markup) => assert_eq!(markup.value, "fn main()"),
            other => panic!("expected markup, got {other:?}"),
        }
        assert_eq!(second.range, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_open_waits_for_first_settle() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "main.rs", "fn main() {}\n");
        let settle_delay = Duration::from_millis(100);
        let (client, mut peer) = connected_client_with(
            dir.path(),
            ClientSettings {
                settle_delay,
                ..test_settings()
            },
        )
        .await;

        let start = Instant::now();
        let first = async {
            client.open_document(&file).await.unwrap();
            start.elapsed()
        };
        let second = async {
            // The first open has registered the document by the time its
            // didOpen reaches the server.
            peer.next_with_method("textDocument/didOpen").await.unwrap();
            client.open_document(&file).await.unwrap();
            start.elapsed()
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first >= settle_delay, "first open returned after {first:?}");
        assert!(second >= settle_delay, "second open returned after {second:?}");
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _peer) = connected_client(dir.path()).await;
        let err = client
            .hover(&dir.path().join("absent.rs"), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Io { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_null_result_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "lib.rs", "");
        let (client, mut peer) = connected_client(dir.path()).await;

        let server = async {
            let req = peer.next_with_method("textDocument/references").await.unwrap();
            assert_eq!(req["params"]["context"]["includeDeclaration"], true);
            peer.respond(&req, serde_json::Value::Null).await;
        };
        let (result, ()) = tokio::join!(client.references(&file, 0, 0, true), server);
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_definition_scalar_and_list_flatten_identically() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "lib.rs", "pub fn f() {}\n");
        let (client, mut peer) = connected_client(dir.path()).await;
        let location = serde_json::json!({
            "uri": "file:///proj/src/def.rs",
            "range": { "start": { "line": 4, "character": 7 }, "end": { "line": 4, "character": 8 } }
        });

        let server = async {
            let req = peer.next_with_method("textDocument/definition").await.unwrap();
            peer.respond(&req, location.clone()).await;
            let req = peer.next_with_method("textDocument/definition").await.unwrap();
            peer.respond(&req, serde_json::json!([location.clone()])).await;
        };
        let client_side = async {
            let scalar = client.definition(&file, 0, 7).await.unwrap().unwrap();
            let list = client.definition(&file, 0, 7).await.unwrap().unwrap();
            (scalar, list)
        };
        let ((scalar, list), ()) = tokio::join!(client_side, server);

        assert!(matches!(scalar, GotoDefinitionResponse::Scalar(_)));
        let scalar = definition_locations(scalar);
        assert_eq!(scalar, definition_locations(list));
        assert_eq!(scalar.len(), 1);
        assert_eq!(scalar[0].range.start, Position::new(4, 7));
    }

    #[test]
    fn test_definition_links_use_target_selection_range() {
        let response: GotoDefinitionResponse = serde_json::from_value(serde_json::json!([{
            "targetUri": "file:///a.rs",
            "targetRange": { "start": { "line": 1, "character": 0 }, "end": { "line": 9, "character": 1 } },
            "targetSelectionRange": { "start": { "line": 1, "character": 3 }, "end": { "line": 1, "character": 6 } }
        }]))
        .unwrap();
        let locations = definition_locations(response);
        assert_eq!(locations[0].range.start, Position::new(1, 3));
    }

    #[tokio::test]
    async fn test_document_symbols_accepts_nested_shape() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "lib.rs", "struct S;\n");
        let (client, mut peer) = connected_client(dir.path()).await;
        let range = serde_json::json!({ "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 9 } });

        let server = async {
            let req = peer.next_with_method("textDocument/documentSymbol").await.unwrap();
            peer.respond(
                &req,
                serde_json::json!([{ "name": "S", "kind": 23, "range": range, "selectionRange": range, "children": [] }]),
            )
            .await;
        };
        let (result, ()) = tokio::join!(client.document_symbols(&file), server);
        match result.unwrap().unwrap() {
            DocumentSymbolResponse::Nested(symbols) => assert_eq!(symbols[0].name, "S"),
            DocumentSymbolResponse::Flat(_) => panic!("expected nested symbols"),
        }
    }

    #[tokio::test]
    async fn test_workspace_symbols_does_not_open_documents() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut peer) = connected_client(dir.path()).await;

        let server = async {
            let req = peer.next_message().await.unwrap();
            assert_eq!(req["method"], "workspace/symbol");
            assert_eq!(req["params"]["query"], "Pool");
            peer.respond(&req, serde_json::json!([])).await;
        };
        let (result, ()) = tokio::join!(client.workspace_symbols("Pool"), server);
        assert!(result.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_prepare_rename_rejection_is_none_but_rename_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "lib.rs", "fn f() {}\n");
        let (client, mut peer) = connected_client(dir.path()).await;

        let server = async {
            for method in ["textDocument/prepareRename", "textDocument/rename"] {
                let req = peer.next_with_method(method).await.unwrap();
                peer.send(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "error": { "code": -32803, "message": "cannot rename here" }
                }))
                .await;
            }
        };
        let client_side = async {
            let prepared = client.prepare_rename(&file, 0, 3).await;
            let renamed = client.rename(&file, 0, 3, "g").await;
            (prepared, renamed)
        };
        let ((prepared, renamed), ()) = tokio::join!(client_side, server);

        assert!(prepared.unwrap().is_none());
        let err = renamed.unwrap_err();
        assert!(err.is_protocol());
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_code_actions_forward_range_and_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "lib.rs", "let x = 1;\n");
        let (client, mut peer) = connected_client(dir.path()).await;
        let range = Range::new(Position::new(0, 4), Position::new(0, 5));
        let diagnostic = Diagnostic::new_simple(range, String::from("unused variable"));

        let server = async {
            let req = peer.next_with_method("textDocument/codeAction").await.unwrap();
            assert_eq!(req["params"]["range"]["start"]["character"], 4);
            assert_eq!(
                req["params"]["context"]["diagnostics"][0]["message"],
                "unused variable"
            );
            peer.respond(&req, serde_json::json!([{ "title": "Prefix with _" }]))
                .await;
        };
        let (result, ()) = tokio::join!(
            client.code_actions(&file, range, std::slice::from_ref(&diagnostic)),
            server
        );
        assert_eq!(result.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_shape_is_invalid_response() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "lib.rs", "");
        let (client, mut peer) = connected_client(dir.path()).await;

        let server = async {
            let req = peer.next_with_method("textDocument/references").await.unwrap();
            peer.respond(&req, serde_json::json!("nonsense")).await;
        };
        let (result, ()) = tokio::join!(client.references(&file, 0, 0, false), server);
        assert!(matches!(result.unwrap_err(), LspError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_diagnostics_are_push_driven() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "main.rs", "fn main() {\n");
        let (client, mut peer) = connected_client(dir.path()).await;
        assert!(client.get_diagnostics(&file).is_empty());

        peer.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": uri_of(&file),
                "diagnostics": [{
                    "range": { "start": { "line": 0, "character": 11 }, "end": { "line": 0, "character": 12 } },
                    "severity": 1,
                    "message": "unclosed delimiter"
                }]
            }
        }))
        .await;
        wait_until(|| !client.get_diagnostics(&file).is_empty()).await;
        assert_eq!(client.get_diagnostics(&file)[0].message, "unclosed delimiter");
    }

    #[tokio::test]
    async fn test_disconnect_runs_shutdown_and_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_source(dir.path(), "main.rs", "fn main() {}\n");
        let (client, mut peer) = connected_client(dir.path()).await;

        peer.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": uri_of(&file),
                "diagnostics": [{
                    "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
                    "message": "warning"
                }]
            }
        }))
        .await;
        wait_until(|| !client.get_diagnostics(&file).is_empty()).await;

        let server = async {
            let shutdown = peer.next_with_method("shutdown").await.unwrap();
            peer.respond(&shutdown, serde_json::Value::Null).await;
            let exit = peer.next_message().await.unwrap();
            assert_eq!(exit["method"], "exit");
            assert!(exit.get("id").is_none());
        };
        let (result, ()) = tokio::join!(client.disconnect(), server);
        result.unwrap();

        assert_eq!(client.state(), ConnectionState::Unconnected);
        assert!(client.get_diagnostics(&file).is_empty());
        let err = client.hover(&file, 0, 0).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_disconnect_tolerates_dead_server() {
        let dir = tempfile::tempdir().unwrap();
        let (client, peer) = connected_client(dir.path()).await;
        drop(peer);

        client.disconnect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Unconnected);
    }

    #[tokio::test]
    async fn test_server_exit_marks_client_dead() {
        let dir = tempfile::tempdir().unwrap();
        let (client, peer) = connected_client(dir.path()).await;

        drop(peer);
        wait_until(|| !client.is_ready()).await;
        assert_eq!(client.state(), ConnectionState::Unconnected);
        let err = client.workspace_symbols("x").await.unwrap_err();
        assert!(matches!(err, LspError::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_client_cannot_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _peer) = connected_client(dir.path()).await;
        let (io, _other) = FakePeer::pair();
        let (reader, writer) = tokio::io::split(io);
        let err = client.connect_over(reader, writer).await.unwrap_err();
        assert!(matches!(err, LspError::Disconnected { .. }));
        assert!(client.is_ready());
    }
}
