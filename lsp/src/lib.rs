//! Pooled LSP client for external language analyzers.
//!
//! [`LspPool`] hands out [`LspClient`]s keyed by workspace root and launch
//! command; each client owns one analyzer process spoken to over stdio.

pub mod codec;
pub mod types;

pub(crate) mod connection;
pub(crate) mod correlator;
pub(crate) mod diagnostics;
pub(crate) mod process;
pub(crate) mod protocol;

mod client;
mod error;
mod pool;
mod registry;

#[cfg(test)]
mod test_support;

pub use client::{ClientSettings, LspClient, definition_locations};
pub use connection::ConnectionState;
pub use error::LspError;
pub use pool::{Connector, LspPool, PooledClient, ProcessConnector, find_workspace_root};
pub use protocol::language_id_for_path;
pub use registry::{ConfigRegistry, ServerDescriptor, ServerRegistry};
pub use types::{LspConfig, PoolConfig, ServerConfig};

/// Protocol data types used in the client's signatures.
pub use lsp_types;
