//! Error taxonomy for the LSP client.
//!
//! Malformed frames never appear here: the decoder resynchronizes and the
//! offending message is dropped before any caller can observe it.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// The launch command is not on `PATH`.
    #[error("language server `{command}` not found in PATH; {hint}")]
    AnalyzerNotFound { command: String, hint: String },

    /// The OS refused to start the process.
    #[error("failed to spawn language server `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The analyzer answered with an error object.
    #[error("{method} failed: {message} (code {code})")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },

    /// No response arrived within the request's window.
    #[error("{method} timed out after {}ms", elapsed.as_millis())]
    Timeout { method: String, elapsed: Duration },

    /// The connection is not in the `Ready` state.
    #[error("language server connection unavailable: {reason}")]
    Disconnected { reason: String },

    #[error("failed to stop language server `{server}`")]
    Terminate {
        server: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot convert path to file URI: {}", path.display())]
    InvalidPath { path: PathBuf },

    #[error("cannot encode {method} message")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    /// The result did not have any shape the operation accepts.
    #[error("unexpected {method} response shape")]
    InvalidResponse {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LspError {
    pub(crate) fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Whether the analyzer could not be reached at all, as opposed to
    /// reachable but declining the request.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::AnalyzerNotFound { .. }
                | Self::Spawn { .. }
                | Self::Timeout { .. }
                | Self::Disconnected { .. }
        )
    }

    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}
