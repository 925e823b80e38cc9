//! Run results

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detector::Verdict;
use crate::error::{ConvoError, exit_codes};

/// How a run ended when it did not fail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every cycle ran to the end
    Completed,
    /// The loop detector fired
    LoopDetected { verdict: Verdict },
    /// The agent (or a human) wrote the stop file; needs review
    StopRequested { verdict: Verdict },
    /// A PAUSE or CONSULT point was reached
    Paused {
        /// Merged step index the point follows; `None` before the first step
        after_step: Option<usize>,
        message: String,
        consult: bool,
    },
    /// ON-CONTEXT-LIMIT stop fired
    ContextLimit { usage_percent: f64 },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Exit code for the outcome; controlled stops other than loops exit 0
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LoopDetected { .. } => exit_codes::LOOP_DETECTED,
            _ => exit_codes::OK,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::LoopDetected { verdict } => format!(
                "loop detected on cycle {}: {} ({})",
                verdict.cycle, verdict.reason, verdict.detail
            ),
            Self::StopRequested { verdict } => {
                let reason = verdict
                    .stop_request
                    .as_ref()
                    .map(|r| r.reason.clone())
                    .unwrap_or_else(|| verdict.detail.clone());
                format!("stop requested on cycle {} (needs review): {}", verdict.cycle, reason)
            }
            Self::Paused { message, consult, .. } => {
                let kind = if *consult { "consult" } else { "paused" };
                format!("{}: {}", kind, message)
            }
            Self::ContextLimit { usage_percent } => {
                format!("stopped at context limit ({:.0}% used)", usage_percent * 100.0)
            }
        }
    }
}

/// One agent exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// 1-indexed cycle
    pub cycle: u32,
    pub step: usize,
    pub prompt: String,
    pub response: String,
}

/// What a run produced, complete or partial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub workflow: String,
    pub cycles_completed: u32,
    pub outcome: RunOutcome,
    /// Number of agent turns sent
    pub turns: usize,
    pub checkpoints: Vec<PathBuf>,
    pub responses: Vec<TurnRecord>,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            cycles_completed: 0,
            outcome: RunOutcome::Completed,
            turns: 0,
            checkpoints: Vec::new(),
            responses: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn last_response(&self) -> Option<&str> {
        self.responses.last().map(|r| r.response.as_str())
    }

    /// Markdown transcript of the run
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# {}\n\n**Outcome:** {}\n", self.workflow, self.outcome.summary());
        out.push_str(&format!(
            "**Cycles completed:** {}  \n**Turns:** {}\n",
            self.cycles_completed, self.turns
        ));
        for turn in &self.responses {
            out.push_str(&format!(
                "\n## Cycle {} - step {}\n\n{}\n",
                turn.cycle,
                turn.step + 1,
                turn.response.trim_end()
            ));
        }
        if !self.warnings.is_empty() {
            out.push_str("\n## Warnings\n\n");
            for w in &self.warnings {
                out.push_str(&format!("- {}\n", w));
            }
        }
        out
    }
}

/// A failed run: the error plus everything gathered before it
#[derive(Debug, Error)]
#[error("{}: {error}", .report.workflow)]
pub struct RunFailure {
    #[source]
    pub error: ConvoError,
    pub report: Box<RunReport>,
}

impl RunFailure {
    pub fn new(error: ConvoError, report: RunReport) -> Self {
        Self {
            error,
            report: Box::new(report),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }

    pub fn remediation(&self) -> String {
        self.error.remediation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{LoopReason, StopRequest};

    fn verdict(reason: LoopReason) -> Verdict {
        Verdict {
            reason,
            detail: "two identical responses".to_string(),
            cycle: 3,
            stop_request: None,
        }
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        let loop_outcome = RunOutcome::LoopDetected {
            verdict: verdict(LoopReason::IdenticalResponses),
        };
        assert_eq!(loop_outcome.exit_code(), exit_codes::LOOP_DETECTED);
        assert!(loop_outcome.summary().contains("IDENTICAL_RESPONSES"));
    }

    #[test]
    fn test_stop_requested_summary_uses_reason() {
        let mut v = verdict(LoopReason::StopFile);
        v.stop_request = Some(StopRequest::new("tests are green"));
        let outcome = RunOutcome::StopRequested { verdict: v };
        assert_eq!(outcome.summary(), "stop requested on cycle 3 (needs review): tests are green");
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn test_failure_display_names_workflow() {
        let failure = RunFailure::new(
            ConvoError::StopFilePresent {
                path: PathBuf::from("STOPAUTOMATION-x.json"),
                reason: "halt".into(),
            },
            RunReport::new("review"),
        );
        assert!(failure.to_string().starts_with("review: Stop file"));
        assert_eq!(failure.exit_code(), exit_codes::STOP_FILE_PRESENT);
    }

    #[test]
    fn test_markdown_transcript() {
        let mut report = RunReport::new("flow");
        report.responses.push(TurnRecord {
            cycle: 1,
            step: 0,
            prompt: "p".into(),
            response: "done\n".into(),
        });
        report.turns = 1;
        let md = report.to_markdown();
        assert!(md.starts_with("# flow"));
        assert!(md.contains("## Cycle 1 - step 1\n\ndone\n"));
    }
}
