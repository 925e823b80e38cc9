//! Top-level error taxonomy and stable exit codes

use std::path::PathBuf;

use thiserror::Error;

use crate::adapter::AdapterError;
use crate::context::ContextError;
use crate::conversation::{CompileError, RequirementIssue};
use crate::cycle::CommandError;
use crate::detector::Verdict;

/// Stable process exit codes
pub mod exit_codes {
    pub const OK: i32 = 0;
    /// Anything without a more specific code
    pub const FAILURE: i32 = 1;
    pub const PARSE: i32 = 2;
    /// Mandatory context or a REQUIRE entry is missing
    pub const MISSING_CONTEXT: i32 = 3;
    pub const LOOP_DETECTED: i32 = 4;
    pub const AGENT_ABORTED: i32 = 5;
    pub const RUN_COMMAND_FAILED: i32 = 6;
    pub const IO: i32 = 7;
    pub const STOP_FILE_PRESENT: i32 = 8;
    pub const ADAPTER: i32 = 9;
}

/// Where in a run something happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepRef {
    /// 1-indexed cycle
    pub cycle: u32,
    /// Index into the merged step list
    pub step: usize,
}

impl std::fmt::Display for StepRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cycle {}, step {}", self.cycle, self.step + 1)
    }
}

#[derive(Debug, Error)]
pub enum ConvoError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Mandatory context matched no files: {}", .patterns.join(", "))]
    MissingContext { patterns: Vec<String> },

    #[error("Unmet requirements: {}", format_issues(.issues))]
    Requirements { issues: Vec<RequirementIssue> },

    #[error(transparent)]
    Context(ContextError),

    #[error("Loop detected on cycle {}: {} ({})", .verdict.cycle, .verdict.reason, .verdict.detail)]
    LoopDetected { verdict: Verdict },

    #[error("Agent aborted the turn at {at}: {message}")]
    AgentAborted { at: StepRef, message: String },

    #[error("RUN `{command}` {status} at {at}")]
    RunCommandFailed {
        at: StepRef,
        command: String,
        status: String,
        /// Captured output, possibly partial
        output: String,
    },

    #[error("{step} failed at {at}: {output}")]
    VerifyFailed { at: StepRef, step: String, output: String },

    #[error("Command error at {at}: {source}")]
    Command {
        at: StepRef,
        #[source]
        source: CommandError,
    },

    #[error("Stop file {} is present: {reason}", .path.display())]
    StopFilePresent { path: PathBuf, reason: String },

    #[error("Adapter error: {source}")]
    Adapter {
        at: Option<StepRef>,
        #[source]
        source: AdapterError,
    },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid rendered workflow: {0}")]
    Render(String),
}

fn format_issues(issues: &[RequirementIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{} ({})", i.requirement, i.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<ContextError> for ConvoError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::MissingContextFiles { patterns } => Self::MissingContext { patterns },
            other => Self::Context(other),
        }
    }
}

impl ConvoError {
    /// Map an adapter failure, separating provider aborts from other errors
    pub fn from_adapter(err: AdapterError, at: Option<StepRef>) -> Self {
        match err {
            AdapterError::Aborted(message) => Self::AgentAborted {
                at: at.unwrap_or_default(),
                message,
            },
            source => Self::Adapter { at, source },
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Compile(CompileError::Parse(_)) => exit_codes::PARSE,
            Self::Compile(_) => exit_codes::IO,
            Self::MissingContext { .. } | Self::Requirements { .. } => exit_codes::MISSING_CONTEXT,
            Self::Context(ContextError::InvalidPattern { .. } | ContextError::InvalidRange { .. }) => exit_codes::PARSE,
            Self::Context(_) => exit_codes::IO,
            Self::LoopDetected { .. } => exit_codes::LOOP_DETECTED,
            Self::AgentAborted { .. } => exit_codes::AGENT_ABORTED,
            Self::RunCommandFailed { .. } | Self::VerifyFailed { .. } | Self::Command { .. } => {
                exit_codes::RUN_COMMAND_FAILED
            }
            Self::StopFilePresent { .. } => exit_codes::STOP_FILE_PRESENT,
            Self::Adapter { .. } => exit_codes::ADAPTER,
            Self::Io { .. } => exit_codes::IO,
            Self::Render(_) => exit_codes::PARSE,
        }
    }

    /// Suggested next step for the user
    pub fn remediation(&self) -> String {
        match self {
            Self::Compile(CompileError::Parse(_)) => "Fix the directive at the reported line and re-run".to_string(),
            Self::Compile(_) => "Check that the workflow file and its INCLUDEs exist and are readable".to_string(),
            Self::MissingContext { .. } => {
                "Create the missing files, fix the CONTEXT patterns, or set VALIDATION-MODE lenient".to_string()
            }
            Self::Requirements { .. } => "Install the missing commands or create the required paths".to_string(),
            Self::Context(_) => "Check the CONTEXT and REFCAT paths and line ranges".to_string(),
            Self::LoopDetected { .. } => {
                "Review the responses so far; reword the prompts or lower MAX-CYCLES before re-running".to_string()
            }
            Self::AgentAborted { .. } => "The provider aborted the turn; retry the run".to_string(),
            Self::RunCommandFailed { .. } | Self::Command { .. } => {
                "Fix the command, add an ON-FAILURE block, or set RUN-ON-ERROR continue".to_string()
            }
            Self::VerifyFailed { .. } => "Fix the reported problems or set VERIFY-ON-ERROR continue".to_string(),
            Self::StopFilePresent { path, .. } => {
                format!("Remove the stop file {} and re-run", path.display())
            }
            Self::Adapter { source, .. } if source.is_retryable() => "Wait and retry the run".to_string(),
            Self::Adapter { .. } => "Check the adapter configuration and credentials".to_string(),
            Self::Io { .. } => "Check file permissions and free space".to_string(),
            Self::Render(_) => "Regenerate the rendered workflow with this version".to_string(),
        }
    }
}
