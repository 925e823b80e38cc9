//! Cycle orchestration: RUN execution, template variables, checkpoints and the run loop

mod checkpoint;
mod command;
mod engine;
pub mod host;
mod prompt;
mod report;
mod shell;
mod template;

pub use checkpoint::Checkpoint;
pub use command::{CommandError, CommandOutput, CommandRunner, truncate_output};
pub use engine::{CycleOrchestrator, DEFAULT_CHECKPOINT_DIR, OrchestratorOptions};
pub use host::{NullHost, StepHost, StepOutcome};
pub use prompt::{PromptFrame, PromptPosition};
pub use report::{RunFailure, RunOutcome, RunReport, TurnRecord};
pub use shell::split_command;
pub use template::{CYCLE_NUMBER, CYCLE_TOTAL, TemplateVars};
