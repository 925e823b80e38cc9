//! WorkflowConfig - the non-step state accumulated while compiling

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default near-limit fraction when CONTEXT-LIMIT is absent
pub const DEFAULT_CONTEXT_LIMIT: f64 = 0.8;

/// Default RUN timeout
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default prompt sent with a RUN-RETRY when none is given
pub const DEFAULT_RETRY_PROMPT: &str = "Fix the error above and try again.";

/// Session continuity policy across cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One session for all cycles; history grows
    #[default]
    Accumulate,
    /// One session, compacted between cycles
    Compact,
    /// New session and freshly loaded context every cycle
    Fresh,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accumulate => write!(f, "accumulate"),
            Self::Compact => write!(f, "compact"),
            Self::Fresh => write!(f, "fresh"),
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "accumulate" => Ok(Self::Accumulate),
            "compact" => Ok(Self::Compact),
            "fresh" => Ok(Self::Fresh),
            _ => Err("expected accumulate, compact or fresh".to_string()),
        }
    }
}

/// What to do when the context tracker reports the near-limit threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLimitPolicy {
    #[default]
    Compact,
    Stop,
}

impl fmt::Display for ContextLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compact => write!(f, "compact"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

impl FromStr for ContextLimitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "stop" => Ok(Self::Stop),
            _ => Err("expected compact or stop".to_string()),
        }
    }
}

/// How strictly mandatory context and requirements are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    Strict,
    Lenient,
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Lenient => write!(f, "lenient"),
        }
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" | "warn" => Ok(Self::Lenient),
            _ => Err("expected strict or lenient".to_string()),
        }
    }
}

/// Behaviour after a failed RUN or VERIFY with no ON-FAILURE block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

impl FromStr for OnError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stop" | "fail" => Ok(Self::Stop),
            "continue" | "warn" => Ok(Self::Continue),
            _ => Err("expected stop or continue".to_string()),
        }
    }
}

/// When command output is sent to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    Always,
    #[default]
    OnError,
    Never,
}

impl OutputPolicy {
    pub fn should_send(&self, failed: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnError => failed,
            Self::Never => false,
        }
    }
}

impl fmt::Display for OutputPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::OnError => write!(f, "on-error"),
            Self::Never => write!(f, "never"),
        }
    }
}

impl FromStr for OutputPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "on-error" | "on_error" => Ok(Self::OnError),
            "never" => Ok(Self::Never),
            _ => Err("expected always, on-error or never".to_string()),
        }
    }
}

/// RUN execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Run through `sh -c` instead of word-splitting
    pub allow_shell: bool,
    pub on_error: OnError,
    pub output: OutputPolicy,
    /// Maximum characters of output sent to the agent
    pub output_limit: Option<usize>,
    pub timeout: Duration,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            allow_shell: false,
            on_error: OnError::Stop,
            output: OutputPolicy::OnError,
            output_limit: None,
            timeout: DEFAULT_RUN_TIMEOUT,
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

/// VERIFY execution settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifySettings {
    pub on_error: OnError,
    pub output: OutputPolicy,
    pub limit: Option<usize>,
}

/// A PAUSE or CONSULT annotation: "after step N, stop here"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausePoint {
    /// Index of the step this follows; `None` when declared before any step
    pub after_step: Option<usize>,
    pub message: String,
}

/// Scalar and list state parsed from non-step directives
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub model: Option<String>,
    pub adapter: Option<String>,
    pub mode: Option<String>,
    pub session_mode: SessionMode,
    pub max_cycles: Option<u32>,
    pub cwd: Option<String>,

    pub context: Vec<String>,
    pub context_optional: Vec<String>,
    pub context_exclude: Vec<String>,
    pub context_limit: Option<f64>,
    pub on_context_limit: ContextLimitPolicy,
    pub on_context_limit_prompt: Option<String>,

    pub allow_files: Vec<String>,
    pub deny_files: Vec<String>,
    pub allow_dirs: Vec<String>,
    pub deny_dirs: Vec<String>,

    pub prologues: Vec<String>,
    pub epilogues: Vec<String>,
    pub headers: Vec<String>,
    pub footers: Vec<String>,
    pub help_topics: Vec<String>,

    pub compaction_min: Option<f64>,
    pub compaction_threshold: Option<f64>,
    pub compaction_max: Option<f64>,
    pub compact_preserve: Vec<String>,
    pub compact_summary: Option<String>,

    pub validation_mode: ValidationMode,
    pub requirements: Vec<String>,
    pub model_requirements: Vec<String>,
    pub model_preferences: Vec<String>,
    pub model_policy: Option<String>,

    pub pause_points: Vec<PausePoint>,
    pub consult_points: Vec<PausePoint>,
    pub consult_timeout: Option<Duration>,

    pub run: RunSettings,
    pub verify: VerifySettings,
    pub trace_links: Vec<(String, String)>,
    pub refcat_refs: Vec<String>,

    pub output_format: Option<String>,
    pub output_file: Option<String>,
    pub output_dir: Option<String>,

    pub continuation_prompt: Option<String>,
    pub session_name: Option<String>,
    pub event_log: Option<String>,
    pub infinite_sessions: Option<bool>,
}

impl WorkflowConfig {
    /// Effective near-limit fraction
    pub fn effective_context_limit(&self) -> f64 {
        self.compaction_threshold
            .or(self.context_limit)
            .unwrap_or(DEFAULT_CONTEXT_LIMIT)
    }

    /// Number of cycles to run (at least 1)
    pub fn cycles(&self) -> u32 {
        self.max_cycles.unwrap_or(1).max(1)
    }

    pub fn is_lenient(&self) -> bool {
        self.validation_mode == ValidationMode::Lenient
    }

    /// Re-key pause/consult points after the step list has been rewritten
    pub fn remap_points(&mut self, index_map: &[usize]) {
        for point in self.pause_points.iter_mut().chain(self.consult_points.iter_mut()) {
            if let Some(idx) = point.after_step {
                point.after_step = index_map.get(idx).copied();
            }
        }
    }

    /// Pause point following step `index`, if any
    pub fn pause_after(&self, index: usize) -> Option<&PausePoint> {
        self.pause_points.iter().find(|p| p.after_step == Some(index))
    }

    /// Consult point following step `index`, if any
    pub fn consult_after(&self, index: usize) -> Option<&PausePoint> {
        self.consult_points.iter().find(|p| p.after_step == Some(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_parsing() {
        assert_eq!("FRESH".parse::<SessionMode>().unwrap(), SessionMode::Fresh);
        assert!("sometimes".parse::<SessionMode>().is_err());
        assert_eq!("on-error".parse::<OutputPolicy>().unwrap(), OutputPolicy::OnError);
        assert_eq!("continue".parse::<OnError>().unwrap(), OnError::Continue);
        assert_eq!("stop".parse::<ContextLimitPolicy>().unwrap(), ContextLimitPolicy::Stop);
        assert_eq!("lenient".parse::<ValidationMode>().unwrap(), ValidationMode::Lenient);
    }

    #[test]
    fn test_defaults() {
        let config = WorkflowConfig::default();
        assert_eq!(config.session_mode, SessionMode::Accumulate);
        assert_eq!(config.cycles(), 1);
        assert_eq!(config.effective_context_limit(), DEFAULT_CONTEXT_LIMIT);
        assert_eq!(config.run.timeout, Duration::from_secs(60));
        assert!(!config.run.allow_shell);
    }

    #[test]
    fn test_threshold_overrides_limit() {
        let config = WorkflowConfig {
            context_limit: Some(0.9),
            compaction_threshold: Some(0.6),
            ..Default::default()
        };
        assert_eq!(config.effective_context_limit(), 0.6);
    }

    #[test]
    fn test_output_policy() {
        assert!(OutputPolicy::Always.should_send(false));
        assert!(OutputPolicy::OnError.should_send(true));
        assert!(!OutputPolicy::OnError.should_send(false));
        assert!(!OutputPolicy::Never.should_send(true));
    }

    #[test]
    fn test_remap_points() {
        let mut config = WorkflowConfig {
            pause_points: vec![PausePoint {
                after_step: Some(4),
                message: "check".into(),
            }],
            ..Default::default()
        };
        config.remap_points(&[0, 0, 0, 1, 2]);
        assert_eq!(config.pause_points[0].after_step, Some(2));
        assert!(config.pause_after(2).is_some());
    }
}
