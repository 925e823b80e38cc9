//! Adapter request/response types

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::WorkflowConfig;

/// Options for a new agent session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: Option<String>,
    pub streaming: bool,
    pub event_log_path: Option<PathBuf>,
    pub infinite_sessions: Option<bool>,
    pub session_name: Option<String>,
    pub working_dir: Option<PathBuf>,
}

impl SessionConfig {
    pub fn from_workflow(config: &WorkflowConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            model: config.model.clone(),
            streaming: false,
            event_log_path: config.event_log.as_ref().map(PathBuf::from),
            infinite_sessions: config.infinite_sessions,
            session_name: config.session_name.clone(),
            working_dir: Some(working_dir.into()),
        }
    }
}

/// Handle to a live agent session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(model: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            model,
            created_at: Utc::now(),
        }
    }
}

/// Final text of one agent turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    /// Provider reasoning side-channel; only the loop detector reads it
    pub reasoning: Option<String>,
}

impl AgentResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Streaming chunk emitted while a turn is in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    Done,
}

/// Usage counters for a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Tool calls made during the most recent turn
    pub tool_calls: usize,
    /// Provider-reported context usage, when known
    pub context_tokens: Option<usize>,
    pub max_context_tokens: Option<usize>,
}
