use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sextant")]
#[command(version, about = "Ask language servers about your code")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (defaults to $SEXTANT_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,
}

/// A zero-based position in a file.
#[derive(Args, Debug)]
pub struct PositionArgs {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Hover information at a position
    Hover(PositionArgs),

    /// Where the symbol at a position is defined
    Definition(PositionArgs),

    /// Every reference to the symbol at a position
    References {
        #[command(flatten)]
        position: PositionArgs,

        /// Leave the declaration itself out of the results
        #[arg(long)]
        exclude_declaration: bool,
    },

    /// Symbols declared in a file
    Symbols { file: PathBuf },

    /// Search symbols across the workspace containing FILE
    WorkspaceSymbols { file: PathBuf, query: String },

    /// Check whether the symbol at a position can be renamed
    PrepareRename(PositionArgs),

    /// Compute the edits for renaming the symbol at a position
    Rename {
        #[command(flatten)]
        position: PositionArgs,
        new_name: String,
    },

    /// Code actions available for a range
    CodeActions {
        file: PathBuf,
        start_line: u32,
        start_column: u32,
        end_line: u32,
        end_column: u32,
    },

    /// Diagnostics the server publishes for a file
    Diagnostics {
        file: PathBuf,

        /// How long to wait for the first diagnostics push
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },

    /// List configured servers and whether they are installed
    Servers,
}

impl Command {
    /// The file that selects the server and workspace, if any.
    pub fn file(&self) -> Option<&PathBuf> {
        match self {
            Command::Hover(position)
            | Command::Definition(position)
            | Command::PrepareRename(position)
            | Command::References { position, .. }
            | Command::Rename { position, .. } => Some(&position.file),
            Command::Symbols { file }
            | Command::WorkspaceSymbols { file, .. }
            | Command::CodeActions { file, .. }
            | Command::Diagnostics { file, .. } => Some(file),
            Command::Servers => None,
        }
    }
}
