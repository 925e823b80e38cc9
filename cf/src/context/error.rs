//! Context resolution errors

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Mandatory context matched no files: {}", .patterns.join(", "))]
    MissingContextFiles { patterns: Vec<String> },

    #[error("File not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid line range in '{reference}': {reason}")]
    InvalidRange { reference: String, reason: String },

    #[error("IO error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ContextError {
    /// True for errors that lenient validation may downgrade to warnings
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingContextFiles { .. } | Self::FileNotFound { .. })
    }
}
