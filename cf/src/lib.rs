//! Convofile - ConversationFile workflow engine
//!
//! A ConversationFile is a line-oriented script of directives that drives a
//! multi-turn session with an AI coding agent: prompts, shell commands whose
//! outcome steers the conversation, verification steps, context loading and
//! session management, repeated for a number of cycles.
//!
//! # Modules
//!
//! - [`conversation`] - Directive lexer, step compiler and ELIDE merging
//! - [`context`] - `@file` resolution, REFCAT excerpts and token budget
//! - [`detector`] - Loop detection and the stop-file protocol
//! - [`adapter`] - Agent adapter trait
//! - [`cycle`] - Cycle orchestrator and RUN execution
//! - [`batch`] - Concurrent instance dispatch with a progress file
//! - [`render`] - Rendered-JSON pipeline format
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod adapter;
pub mod batch;
pub mod cli;
pub mod config;
pub mod context;
pub mod conversation;
pub mod cycle;
pub mod detector;
pub mod error;
pub mod render;

// Re-export commonly used types
pub use adapter::{Adapter, AdapterError, AgentResponse, Session, SessionConfig, SessionStats, StreamChunk};
pub use batch::{BatchDispatcher, BatchItem, BatchOptions, BatchSummary, ItemResult, ItemStatus, ProgressBoard};
pub use config::Config;
pub use context::{ContextError, ContextTracker};
pub use conversation::{CompileError, Conversation, DirectiveRegistry, ParseError, Step, WorkflowConfig};
pub use cycle::{CycleOrchestrator, OrchestratorOptions, RunFailure, RunOutcome, RunReport, TemplateVars};
pub use detector::{LoopDetector, LoopReason, Verdict};
pub use error::{ConvoError, exit_codes};
pub use render::{RenderMode, RenderedWorkflow};
