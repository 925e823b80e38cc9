//! CLI command definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

/// ConversationFile workflow tool
#[derive(Parser)]
#[command(
    name = "cf",
    about = "Validate, inspect and render ConversationFile workflows",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse and compile workflows, checking REQUIRE entries
    Validate {
        /// Workflow files
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Render a workflow to pipeline JSON
    Render {
        /// Workflow file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Paths and counts only, no file contents or resolved prompts
        #[arg(long)]
        plan: bool,

        /// Number of cycles to render (default: MAX-CYCLES)
        #[arg(long)]
        cycles: Option<u32>,

        /// Template variable, repeatable
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Working directory (default: current)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the compiled steps of a workflow
    Show {
        /// Workflow file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

/// Parse `KEY=VALUE`
pub fn parse_var(s: &str) -> Result<(String, String), String> {
    debug!(%s, "parse_var: called");
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("convofile")
        .join("logs")
        .join("cf.log")
}
