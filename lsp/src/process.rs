//! Analyzer process: spawns and owns one language server child process.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::LspError;
use crate::registry::ServerDescriptor;

/// How long a server gets to exit on its own after `exit` before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Environment variables never passed to a language server.
/// Patterns support a leading and/or trailing `*`.
const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_TOKEN",
    "*_SECRET",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
];

/// Minimal glob matcher for env var denylist patterns.
/// Both pattern and key are compared in uppercase.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.strip_prefix('*'), pat.strip_suffix('*')) {
        (Some(rest), Some(_)) => key_upper.contains(rest.trim_end_matches('*')),
        (Some(suffix), None) => key_upper.ends_with(suffix),
        (None, Some(prefix)) => key_upper.starts_with(prefix),
        (None, None) => key_upper == pat,
    }
}

fn is_secret_env(key: &str) -> bool {
    let upper = key.to_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pat| env_glob_matches(pat, &upper))
}

/// Pipes taken from a freshly spawned server.
pub(crate) struct ProcessIo {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

pub(crate) struct AnalyzerProcess {
    name: String,
    child: Child,
}

impl AnalyzerProcess {
    /// Spawn the server described by `descriptor` with `root` as its
    /// working directory. The command is resolved on `PATH` first so a
    /// missing binary fails with the install hint instead of a raw OS error.
    pub fn spawn(descriptor: &ServerDescriptor, root: &Path) -> Result<(Self, ProcessIo), LspError> {
        let resolved = descriptor.resolve_command()?;
        let mut cmd = Command::new(&resolved);
        cmd.args(&descriptor.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, _) in std::env::vars_os() {
            if let Some(name) = key.to_str()
                && is_secret_env(name)
            {
                cmd.env_remove(&key);
            }
        }

        let spawn_error = |source: io::Error| LspError::Spawn {
            command: descriptor.command.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("no stdin from child")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("no stdout from child")))?;
        let stderr = child.stderr.take();

        tracing::info!(
            server = %descriptor.name,
            command = %resolved.display(),
            pid = child.id(),
            root = %root.display(),
            "Spawned language server"
        );

        Ok((
            Self {
                name: descriptor.name.clone(),
                child,
            },
            ProcessIo {
                stdin,
                stdout,
                stderr,
            },
        ))
    }

    /// Wait briefly for a voluntary exit, then kill.
    pub async fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(status) => {
                tracing::debug!(server = %self.name, status = ?status.ok(), "Language server exited");
                Ok(())
            }
            Err(_) => {
                tracing::debug!(server = %self.name, "Language server didn't exit in time, killing");
                self.child.kill().await
            }
        }
    }
}

/// Forward server stderr to the log, line by line. Never parsed as protocol.
pub(crate) fn spawn_stderr_logger(stderr: ChildStderr, server: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let lower = line.to_ascii_lowercase();
                    if lower.contains("error") || lower.contains("panic") {
                        tracing::warn!(server = %server, "stderr: {line}");
                    } else {
                        tracing::debug!(server = %server, "stderr: {line}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "Stopped reading stderr");
                    break;
                }
            }
        }
    })
}
