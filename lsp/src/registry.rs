//! Server descriptors and file → server routing.
//!
//! The pool consumes descriptors through [`ServerRegistry`]; the host decides
//! where they come from. [`ConfigRegistry`] routes by file extension using
//! an [`LspConfig`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::LspError;
use crate::types::{LspConfig, ServerConfig};

/// Everything needed to launch and initialize one kind of language server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub extensions: Vec<String>,
    pub language_id: Option<String>,
    pub root_markers: Vec<String>,
    pub install_hint: String,
    pub initialization_options: Option<serde_json::Value>,
}

impl ServerDescriptor {
    /// Descriptor with no extensions, markers, or options.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            name: name.into(),
            install_hint: default_install_hint(&command),
            command,
            args: Vec::new(),
            extensions: Vec::new(),
            language_id: None,
            root_markers: Vec::new(),
            initialization_options: None,
        }
    }

    fn from_config(name: &str, config: &ServerConfig, global_markers: &[String]) -> Self {
        let root_markers = if config.root_markers.is_empty() {
            global_markers.to_vec()
        } else {
            config.root_markers.clone()
        };
        Self {
            name: name.to_string(),
            command: config.command.clone(),
            args: config.args.clone(),
            extensions: config
                .file_extensions
                .iter()
                .map(|e| normalize_extension(e))
                .collect(),
            language_id: config.language_id.clone(),
            root_markers,
            install_hint: config
                .install_hint
                .clone()
                .unwrap_or_else(|| default_install_hint(&config.command)),
            initialization_options: config.initialization_options.clone(),
        }
    }

    /// Resolve the launch command on `PATH`, failing with the install hint.
    pub fn resolve_command(&self) -> Result<PathBuf, LspError> {
        which::which(&self.command).map_err(|_| LspError::AnalyzerNotFound {
            command: self.command.clone(),
            hint: self.install_hint.clone(),
        })
    }
}

fn default_install_hint(command: &str) -> String {
    format!("install `{command}` and make sure it is on PATH")
}

fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

/// Maps a file to the server able to analyze it.
pub trait ServerRegistry: Send + Sync {
    /// `None` means no analyzer handles this file, which is not an error.
    fn server_for(&self, path: &Path) -> Option<ServerDescriptor>;
}

/// Extension-routed registry built from configuration.
#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    servers: HashMap<String, ServerDescriptor>,
    /// Maps file extension (e.g. "rs") → server name (e.g. "rust").
    extension_map: HashMap<String, String>,
}

impl ConfigRegistry {
    #[must_use]
    pub fn from_config(config: &LspConfig) -> Self {
        let servers: HashMap<String, ServerDescriptor> = config
            .effective_servers()
            .iter()
            .map(|(name, server)| {
                (
                    name.clone(),
                    ServerDescriptor::from_config(name, server, &config.root_markers),
                )
            })
            .collect();
        let extension_map = build_extension_map(&servers);
        Self {
            servers,
            extension_map,
        }
    }

    /// Descriptors sorted by server name.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&ServerDescriptor> {
        let mut all: Vec<_> = self.servers.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

impl ServerRegistry for ConfigRegistry {
    fn server_for(&self, path: &Path) -> Option<ServerDescriptor> {
        let ext = normalize_extension(path.extension()?.to_str()?);
        let name = self.extension_map.get(&ext)?;
        self.servers.get(name).cloned()
    }
}

/// Build extension → server name map. Overlaps resolve to the
/// lexicographically first server name.
fn build_extension_map(servers: &HashMap<String, ServerDescriptor>) -> HashMap<String, String> {
    let mut extension_map: HashMap<String, String> = HashMap::new();
    let mut server_names: Vec<&String> = servers.keys().collect();
    server_names.sort();
    for name in server_names {
        for ext in &servers[name].extensions {
            if let Some(existing) = extension_map.get(ext) {
                tracing::warn!(
                    "Multiple LSP servers configured for extension '{ext}': '{existing}' and '{name}'. Using '{existing}'."
                );
                continue;
            }
            extension_map.insert(ext.clone(), name.clone());
        }
    }
    extension_map
}
