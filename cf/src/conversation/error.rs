//! Compile-time error types

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Where in a ConversationFile an error was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: Option<PathBuf>,
    pub line: usize,
}

impl Location {
    pub fn new(file: Option<PathBuf>, line: usize) -> Self {
        Self { file, line }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}", file.display(), self.line),
            None => write!(f, "line {}", self.line),
        }
    }
}

/// Structural or value errors in a ConversationFile
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("{location}: invalid value for {directive}: '{value}' ({reason})")]
    InvalidValue {
        location: Location,
        directive: String,
        value: String,
        reason: String,
    },

    #[error("{location}: {directive} requires a value")]
    MissingValue { location: Location, directive: String },

    #[error("{location}: {block} without preceding RUN (or VERIFY) step")]
    BlockWithoutRun { location: Location, block: String },

    #[error("{location}: nested block: {block} inside an open ON-FAILURE/ON-SUCCESS block")]
    NestedBlock { location: Location, block: String },

    #[error("{location}: unclosed block: {block} has no matching END")]
    UnclosedBlock { location: Location, block: String },

    #[error("{location}: END without an open ON-FAILURE/ON-SUCCESS block")]
    EndWithoutBlock { location: Location },

    #[error("{location}: {block} declared twice for the same step")]
    DuplicateBlock { location: Location, block: String },

    #[error("{location}: RUN-RETRY without preceding RUN")]
    RetryWithoutRun { location: Location },

    #[error("{location}: include cycle: {}", format_cycle(.cycle))]
    IncludeCycle { location: Location, cycle: Vec<PathBuf> },

    #[error("{location}: unknown help topic '{topic}'")]
    UnknownHelpTopic { location: Location, topic: String },

    #[error("unsupported schema version '{found}' (expected major version {expected})")]
    SchemaVersion { found: String, expected: u32 },
}

fn format_cycle(cycle: &[PathBuf]) -> String {
    cycle
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors returned by the step compiler
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("File not found: {}{}", .path.display(), .included_from.as_ref().map(|l| format!(" (included from {})", l)).unwrap_or_default())]
    FileNotFound {
        path: PathBuf,
        included_from: Option<Location>,
    },

    #[error("IO error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CompileError {
    pub fn as_parse(&self) -> Option<&ParseError> {
        match self {
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_without_run_message() {
        let err = ParseError::BlockWithoutRun {
            location: Location::new(Some(PathBuf::from("flow.conv")), 4),
            block: "ON-FAILURE".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ON-FAILURE"));
        assert!(msg.contains("RUN"));
        assert!(msg.contains("flow.conv:4"));
    }

    #[test]
    fn test_include_cycle_message_names_files() {
        let err = ParseError::IncludeCycle {
            location: Location::new(None, 2),
            cycle: vec![PathBuf::from("/w/a.conv"), PathBuf::from("/w/b.conv"), PathBuf::from("/w/a.conv")],
        };
        let msg = err.to_string();
        assert!(msg.contains("include cycle"));
        assert!(msg.contains("/w/a.conv -> /w/b.conv -> /w/a.conv"));
    }

    #[test]
    fn test_file_not_found_mentions_includer() {
        let err = CompileError::FileNotFound {
            path: PathBuf::from("missing.conv"),
            included_from: Some(Location::new(Some(PathBuf::from("main.conv")), 9)),
        };
        let msg = err.to_string();
        assert!(msg.contains("missing.conv"));
        assert!(msg.contains("main.conv:9"));
    }
}
