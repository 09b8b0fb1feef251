//! Public configuration types.
//!
//! The host deserializes [`LspConfig`] (usually from TOML) and hands it to
//! the pool and the registry. Every field has a default so a missing or
//! empty config section is valid.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 100;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Configuration for the LSP client subsystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LspConfig {
    /// Default per-request timeout.
    pub request_timeout_ms: u64,
    /// Pause after `didOpen` before the first query against a document.
    pub settle_delay_ms: u64,
    /// Files or directories that mark a workspace root.
    pub root_markers: Vec<String>,
    pub pool: PoolConfig,
    /// Per-language server configurations, keyed by name (e.g. "rust").
    /// Empty means "use the built-in defaults".
    pub servers: HashMap<String, ServerConfig>,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            root_markers: default_root_markers(),
            pool: PoolConfig::default(),
            servers: HashMap::new(),
        }
    }
}

impl LspConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Configured servers, or the built-in set when none are configured.
    #[must_use]
    pub fn effective_servers(&self) -> HashMap<String, ServerConfig> {
        if self.servers.is_empty() {
            builtin_servers()
        } else {
            self.servers.clone()
        }
    }
}

/// Idle-eviction settings for the connection pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// A client unused for longer than this is eligible for eviction.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Configuration for a single language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// File extensions this server handles (e.g. `["rs"]`).
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// LSP language identifier. Derived from the file extension when unset.
    #[serde(default)]
    pub language_id: Option<String>,
    /// Overrides the global root markers for this server.
    #[serde(default)]
    pub root_markers: Vec<String>,
    /// Shown when the command is missing from `PATH`.
    #[serde(default)]
    pub install_hint: Option<String>,
    /// Forwarded verbatim as `initializationOptions`.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

impl ServerConfig {
    fn builtin(command: &str, args: &[&str], extensions: &[&str], hint: &str) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            file_extensions: extensions.iter().map(ToString::to_string).collect(),
            language_id: None,
            root_markers: Vec::new(),
            install_hint: Some(hint.to_string()),
            initialization_options: None,
        }
    }
}

#[must_use]
pub fn default_root_markers() -> Vec<String> {
    [
        ".git",
        "Cargo.toml",
        "package.json",
        "tsconfig.json",
        "go.mod",
        "pyproject.toml",
        "setup.py",
        "compile_commands.json",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Servers used when the configuration names none.
#[must_use]
pub fn builtin_servers() -> HashMap<String, ServerConfig> {
    HashMap::from([
        (
            String::from("rust"),
            ServerConfig::builtin(
                "rust-analyzer",
                &[],
                &["rs"],
                "install it with `rustup component add rust-analyzer`",
            ),
        ),
        (
            String::from("go"),
            ServerConfig::builtin(
                "gopls",
                &[],
                &["go"],
                "install it with `go install golang.org/x/tools/gopls@latest`",
            ),
        ),
        (
            String::from("typescript"),
            ServerConfig::builtin(
                "typescript-language-server",
                &["--stdio"],
                &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
                "install it with `npm install -g typescript-language-server typescript`",
            ),
        ),
        (
            String::from("python"),
            ServerConfig::builtin(
                "pyright-langserver",
                &["--stdio"],
                &["py", "pyi"],
                "install it with `npm install -g pyright`",
            ),
        ),
        (
            String::from("c"),
            ServerConfig::builtin(
                "clangd",
                &[],
                &["c", "h", "cc", "cpp", "cxx", "hpp", "hh"],
                "install clangd from your LLVM distribution",
            ),
        ),
    ])
}
