//! Internal LSP message serde types for JSON-RPC communication.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

pub(crate) const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for requests the client does not implement.
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// A decoded message from the server, classified by envelope shape.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        outcome: Result<serde_json::Value, ResponseError>,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

/// Classify a decoded frame. Returns `None` for shapes that cannot be
/// routed anywhere (including responses with non-integer ids).
pub(crate) fn parse_incoming(mut frame: serde_json::Value) -> Option<Incoming> {
    let obj = frame.as_object_mut()?;
    let id = obj.remove("id");
    let method = obj
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let params = obj.remove("params");

    match (id, method) {
        (Some(id), Some(method)) => Some(Incoming::ServerRequest { id, method, params }),
        (None, Some(method)) => Some(Incoming::Notification { method, params }),
        (Some(id), None) => {
            let id = id.as_u64()?;
            let outcome = match obj.remove("error") {
                Some(error) => Err(serde_json::from_value(error).unwrap_or_else(|_| {
                    ResponseError {
                        code: 0,
                        message: String::from("malformed error object"),
                    }
                })),
                None => Ok(obj.remove("result").unwrap_or(serde_json::Value::Null)),
            };
            Some(Incoming::Response { id, outcome })
        }
        (None, None) => None,
    }
}

pub(crate) fn result_response(id: serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result
    })
}

pub(crate) fn error_response(id: serde_json::Value, code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message
        }
    })
}

pub(crate) fn initialize_params(
    root_path: &Path,
    root_uri: &str,
    initialization_options: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": "sextant",
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootPath": root_path.to_string_lossy(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["markdown", "plaintext"]
                },
                "definition": {
                    "dynamicRegistration": false,
                    "linkSupport": true
                },
                "references": {
                    "dynamicRegistration": false
                },
                "documentSymbol": {
                    "dynamicRegistration": false,
                    "hierarchicalDocumentSymbolSupport": true
                },
                "codeAction": {
                    "dynamicRegistration": false,
                    "codeActionLiteralSupport": {
                        "codeActionKind": {
                            "valueSet": [
                                "",
                                "quickfix",
                                "refactor",
                                "refactor.extract",
                                "refactor.inline",
                                "refactor.rewrite",
                                "source",
                                "source.organizeImports"
                            ]
                        }
                    }
                },
                "rename": {
                    "dynamicRegistration": false,
                    "prepareSupport": true
                },
                "publishDiagnostics": {
                    "relatedInformation": true
                }
            },
            "workspace": {
                "symbol": {
                    "dynamicRegistration": false
                },
                "workspaceFolders": true,
                "configuration": true
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": root_path
                .file_name()
                .map_or_else(|| String::from("workspace"), |n| n.to_string_lossy().into_owned())
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn text_document_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn position_params(uri: &str, line: u32, character: u32) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

pub(crate) fn references_params(
    uri: &str,
    line: u32,
    character: u32,
    include_declaration: bool,
) -> serde_json::Value {
    let mut params = position_params(uri, line, character);
    params["context"] = serde_json::json!({ "includeDeclaration": include_declaration });
    params
}

pub(crate) fn rename_params(uri: &str, line: u32, character: u32, new_name: &str) -> serde_json::Value {
    let mut params = position_params(uri, line, character);
    params["newName"] = serde_json::Value::from(new_name);
    params
}

pub(crate) fn code_action_params(
    uri: &str,
    range: lsp_types::Range,
    diagnostics: &[lsp_types::Diagnostic],
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "range": range,
        "context": { "diagnostics": diagnostics }
    })
}

pub(crate) fn workspace_symbol_params(query: &str) -> serde_json::Value {
    serde_json::json!({ "query": query })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<lsp_types::Diagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConfigurationParams {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

pub(crate) fn path_to_file_uri(path: &Path) -> Option<url::Url> {
    url::Url::from_file_path(path).ok()
}

/// Canonical spelling of a URI for use as a map key.
pub(crate) fn normalize_uri(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(parsed) => parsed.into(),
        Err(_) => uri.to_string(),
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Absolute, lexically normalized form of `path`.
pub(crate) fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return normalize_path(path);
    }
    match std::env::current_dir() {
        Ok(cwd) => normalize_path(&cwd.join(path)),
        Err(_) => normalize_path(path),
    }
}

/// LSP language identifier for a file, derived from its extension.
#[must_use]
pub fn language_id_for_path(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let id = match ext.as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "go" => "go",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "java" => "java",
        "rb" => "ruby",
        "lua" => "lua",
        "zig" => "zig",
        "sh" | "bash" => "shellscript",
        "" => "plaintext",
        other => other,
    };
    id.to_string()
}
