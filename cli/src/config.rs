//! Configuration file loading.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sextant_lsp::LspConfig;

const CONFIG_ENV: &str = "SEXTANT_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Where the configuration comes from, in priority order.
enum ConfigSource {
    /// Named on the command line or in the environment; must exist.
    Explicit(PathBuf),
    /// The per-user default; may be absent.
    Default(PathBuf),
    None,
}

fn config_source(flag: Option<&Path>) -> ConfigSource {
    if let Some(path) = flag {
        return ConfigSource::Explicit(path.to_path_buf());
    }
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return ConfigSource::Explicit(PathBuf::from(path));
    }
    match default_config_path() {
        Some(path) => ConfigSource::Default(path),
        None => ConfigSource::None,
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sextant").join("config.toml"))
}

/// Load the configuration. A missing default file means built-in defaults.
pub fn load(flag: Option<&Path>) -> Result<LspConfig, ConfigError> {
    let path = match config_source(flag) {
        ConfigSource::Explicit(path) => path,
        ConfigSource::Default(path) if path.exists() => path,
        ConfigSource::Default(_) | ConfigSource::None => return Ok(LspConfig::default()),
    };
    load_from(&path)
}

fn load_from(path: &Path) -> Result<LspConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| {
        tracing::warn!("Failed to read config at {}: {source}", path.display());
        ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let mut config: LspConfig = toml::from_str(&content).map_err(|source| {
        tracing::warn!("Failed to parse config at {}: {source}", path.display());
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    expand_server_env(&mut config);
    tracing::debug!(path = %path.display(), servers = config.servers.len(), "Loaded config");
    Ok(config)
}

fn expand_server_env(config: &mut LspConfig) {
    for server in config.servers.values_mut() {
        server.command = expand_env_vars(&server.command);
        for arg in &mut server.args {
            *arg = expand_env_vars(arg);
        }
        if let Some(hint) = &mut server.install_hint {
            *hint = expand_env_vars(hint);
        }
    }
}

/// Replace `${VAR}` with the variable's value (empty when unset). An
/// unclosed `${` is kept literally.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
