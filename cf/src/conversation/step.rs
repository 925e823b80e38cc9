//! Step model - the executable units compiled from directives

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Comparison operator used by VERIFY-COVERAGE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
}

impl CompareOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            "==" => Some(Self::Eq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "==",
        }
    }

    /// Evaluate `actual <op> threshold`
    pub fn holds(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Self::Ge => actual >= threshold,
            Self::Le => actual <= threshold,
            Self::Gt => actual > threshold,
            Self::Lt => actual < threshold,
            Self::Eq => (actual - threshold).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A shell command step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub command: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_prompt: Option<String>,
    #[serde(default)]
    pub on_failure: Vec<Step>,
    #[serde(default)]
    pub on_success: Vec<Step>,
}

impl RunStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            retry_count: 0,
            retry_prompt: None,
            on_failure: Vec::new(),
            on_success: Vec::new(),
        }
    }
}

/// A VERIFY step (refs, links, traceability, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyStep {
    pub kind: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub on_failure: Vec<Step>,
    #[serde(default)]
    pub on_success: Vec<Step>,
}

impl Default for VerifyStep {
    fn default() -> Self {
        Self {
            kind: "all".to_string(),
            options: BTreeMap::new(),
            on_failure: Vec::new(),
            on_success: Vec::new(),
        }
    }
}

/// VERIFY-COVERAGE parameters; all `None` means report-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageCheck {
    pub metric: Option<String>,
    pub op: Option<CompareOp>,
    /// Percentage points (80 means 80%)
    pub threshold: Option<f64>,
}

impl CoverageCheck {
    pub fn report_only() -> Self {
        Self {
            metric: None,
            op: None,
            threshold: None,
        }
    }

    pub fn is_report_only(&self) -> bool {
        self.op.is_none()
    }
}

/// Several steps folded into one agent turn by ELIDE
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedPrompt {
    /// Joined text with `{{KIND:i:payload}}` placeholders
    pub content: String,
    pub run_commands: Vec<String>,
    pub verify_commands: Vec<String>,
    pub refcat_commands: Vec<String>,
    pub lsp_commands: Vec<String>,
    pub help_commands: Vec<String>,
    pub consult_commands: Vec<String>,
    /// `(name, content)` pairs
    pub custom_directives: Vec<(String, String)>,
}

/// One executable unit of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Prompt {
        text: String,
    },
    Run(RunStep),
    Checkpoint {
        name: Option<String>,
    },
    Compact {
        preserve: Vec<String>,
    },
    NewConversation,
    Elide,
    Verify(VerifyStep),
    VerifyTrace {
        from: String,
        to: String,
        #[serde(default)]
        on_failure: Vec<Step>,
        #[serde(default)]
        on_success: Vec<Step>,
    },
    VerifyCoverage {
        check: CoverageCheck,
        #[serde(default)]
        on_failure: Vec<Step>,
        #[serde(default)]
        on_success: Vec<Step>,
    },
    Refcat {
        refs: Vec<String>,
    },
    Lsp {
        query: String,
        options: BTreeMap<String, String>,
    },
    HelpInline {
        topics: Vec<String>,
        merge_with_next: bool,
    },
    Custom {
        name: String,
        content: String,
    },
    /// Only emitted when a CONSULT is ELIDE-linked; otherwise it is a side table entry
    Consult {
        text: String,
    },
    /// Only emitted when a PAUSE is ELIDE-linked; otherwise it is a side table entry
    Pause {
        text: String,
    },
    MergedPrompt(MergedPrompt),
}

impl Step {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::Prompt { text: text.into() }
    }

    pub fn run(command: impl Into<String>) -> Self {
        Self::Run(RunStep::new(command))
    }

    /// Short type name used in logs and placeholders
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::Run(_) => "run",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Compact { .. } => "compact",
            Self::NewConversation => "new_conversation",
            Self::Elide => "elide",
            Self::Verify(_) => "verify",
            Self::VerifyTrace { .. } => "verify_trace",
            Self::VerifyCoverage { .. } => "verify_coverage",
            Self::Refcat { .. } => "refcat",
            Self::Lsp { .. } => "lsp",
            Self::HelpInline { .. } => "help_inline",
            Self::Custom { .. } => "custom",
            Self::Consult { .. } => "consult",
            Self::Pause { .. } => "pause",
            Self::MergedPrompt(_) => "merged_prompt",
        }
    }

    /// Steps that can fail and may therefore own ON-FAILURE / ON-SUCCESS blocks
    pub fn can_own_blocks(&self) -> bool {
        matches!(
            self,
            Self::Run(_) | Self::Verify(_) | Self::VerifyTrace { .. } | Self::VerifyCoverage { .. }
        )
    }

    /// Steps that manage the session and must never be folded into a merged turn
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Checkpoint { .. } | Self::Compact { .. } | Self::NewConversation | Self::Pause { .. }
        )
    }

    /// Steps that produce an agent turn when executed
    pub fn is_agent_turn(&self) -> bool {
        matches!(self, Self::Prompt { .. } | Self::MergedPrompt(_))
    }

    /// Mutable access to the `(on_failure, on_success)` blocks, if the step has them
    pub fn blocks_mut(&mut self) -> Option<(&mut Vec<Step>, &mut Vec<Step>)> {
        match self {
            Self::Run(run) => Some((&mut run.on_failure, &mut run.on_success)),
            Self::Verify(v) => Some((&mut v.on_failure, &mut v.on_success)),
            Self::VerifyTrace {
                on_failure, on_success, ..
            }
            | Self::VerifyCoverage {
                on_failure, on_success, ..
            } => Some((on_failure, on_success)),
            _ => None,
        }
    }

    /// The `(on_failure, on_success)` blocks, empty for steps that cannot own them
    pub fn blocks(&self) -> (&[Step], &[Step]) {
        match self {
            Self::Run(run) => (&run.on_failure, &run.on_success),
            Self::Verify(v) => (&v.on_failure, &v.on_success),
            Self::VerifyTrace {
                on_failure, on_success, ..
            }
            | Self::VerifyCoverage {
                on_failure, on_success, ..
            } => (on_failure, on_success),
            _ => (&[], &[]),
        }
    }
}
