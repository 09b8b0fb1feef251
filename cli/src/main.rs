//! Sextant CLI - runs one language server query and prints the result.
//!
//! ```text
//! main() -> config::load() -> LspPool::new() -> run_with_client_lease(op) -> disconnect_all()
//! ```
//!
//! Results go to stdout as JSON; logs go to stderr (`SEXTANT_LOG`, default
//! `warn`).

mod cli;
mod config;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sextant_lsp::lsp_types::{Diagnostic, Position, Range};
use sextant_lsp::{ConfigRegistry, LspClient, LspError, LspPool};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Command};

const LOG_ENV: &str = "SEXTANT_LOG";

const DIAGNOSTICS_POLL: Duration = Duration::from_millis(100);

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(timeout_ms) = cli.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    let registry = Arc::new(ConfigRegistry::from_config(&config));

    if let Command::Servers = cli.command {
        return print_json(&list_servers(&registry));
    }

    let pool = LspPool::new(&config, registry);
    pool.start_idle_sweep();

    let result = tokio::select! {
        result = run(&pool, &cli.command) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };
    pool.disconnect_all().await;

    match result? {
        Some(value) => print_json(&value),
        None => {
            if let Some(file) = cli.command.file() {
                eprintln!("no language server configured for {}", file.display());
            }
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run `op` on the pooled client for `file` and serialize its result.
/// `None` means no server handles the file.
async fn query<F, Fut, T>(pool: &LspPool, file: &Path, op: F) -> Result<Option<serde_json::Value>>
where
    F: FnOnce(Arc<LspClient>) -> Fut,
    Fut: Future<Output = Result<T, LspError>>,
    T: Serialize,
{
    pool.run_with_client_lease(file, |client| async move {
        let result = op(client).await?;
        Ok::<_, anyhow::Error>(serde_json::to_value(result)?)
    })
    .await
}

async fn run(pool: &LspPool, command: &Command) -> Result<Option<serde_json::Value>> {
    match command {
        Command::Hover(p) => {
            query(pool, &p.file, |client| async move { client.hover(&p.file, p.line, p.column).await }).await
        }
        Command::Definition(p) => {
            query(pool, &p.file, |client| async move {
                let response = client.definition(&p.file, p.line, p.column).await?;
                Ok::<_, LspError>(response.map(sextant_lsp::definition_locations).unwrap_or_default())
            })
            .await
        }
        Command::References {
            position: p,
            exclude_declaration,
        } => {
            query(pool, &p.file, |client| async move {
                client
                    .references(&p.file, p.line, p.column, !exclude_declaration)
                    .await
            })
            .await
        }
        Command::Symbols { file } => {
            query(pool, file, |client| async move { client.document_symbols(file).await }).await
        }
        Command::WorkspaceSymbols { file, query: text } => {
            query(pool, file, |client| async move { client.workspace_symbols(text).await }).await
        }
        Command::PrepareRename(p) => {
            query(pool, &p.file, |client| async move {
                client.prepare_rename(&p.file, p.line, p.column).await
            })
            .await
        }
        Command::Rename {
            position: p,
            new_name,
        } => {
            query(pool, &p.file, |client| async move {
                client.rename(&p.file, p.line, p.column, new_name).await
            })
            .await
        }
        Command::CodeActions {
            file,
            start_line,
            start_column,
            end_line,
            end_column,
        } => {
            let range = Range::new(
                Position::new(*start_line, *start_column),
                Position::new(*end_line, *end_column),
            );
            query(pool, file, |client| async move {
                client.open_document(file).await?;
                let diagnostics = overlapping(client.get_diagnostics(file), range);
                client.code_actions(file, range, &diagnostics).await
            })
            .await
        }
        Command::Diagnostics { file, wait_ms } => {
            let wait = Duration::from_millis(*wait_ms);
            query(pool, file, |client| async move {
                client.open_document(file).await?;
                Ok::<_, LspError>(wait_for_diagnostics(&client, file, wait).await)
            })
            .await
        }
        Command::Servers => Ok(None),
    }
}

/// Diagnostics whose lines intersect `range`.
fn overlapping(diagnostics: Vec<Diagnostic>, range: Range) -> Vec<Diagnostic> {
    diagnostics
        .into_iter()
        .filter(|d| d.range.start.line <= range.end.line && d.range.end.line >= range.start.line)
        .collect()
}

/// Poll the push-driven cache until something arrives or `wait` elapses.
async fn wait_for_diagnostics(client: &LspClient, file: &Path, wait: Duration) -> Vec<Diagnostic> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let diagnostics = client.get_diagnostics(file);
        if !diagnostics.is_empty() || tokio::time::Instant::now() >= deadline {
            return diagnostics;
        }
        tokio::time::sleep(DIAGNOSTICS_POLL).await;
    }
}

#[derive(Serialize)]
struct ServerListing<'a> {
    name: &'a str,
    command: &'a str,
    args: &'a [String],
    extensions: &'a [String],
    installed: bool,
    install_hint: &'a str,
}

fn list_servers(registry: &ConfigRegistry) -> Vec<ServerListing<'_>> {
    registry
        .descriptors()
        .into_iter()
        .map(|d| ServerListing {
            name: &d.name,
            command: &d.command,
            args: &d.args,
            extensions: &d.extensions,
            installed: d.resolve_command().is_ok(),
            install_hint: &d.install_hint,
        })
        .collect()
}
