//! ConversationFile parsing
//!
//! Raw text flows through the [`Lexer`] into the [`Compiler`], which returns
//! the workflow configuration plus the ordered step list. [`merge`] then
//! folds ELIDE chains. [`Conversation`] bundles the whole pipeline.

mod compiler;
mod directive;
mod elide;
mod error;
pub mod help;
mod registry;
mod serialize;
mod step;
mod values;
mod workflow;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub use compiler::{CompiledConversation, Compiler, IncludeGraph};
pub use directive::{Directive, DirectiveName, Keyword, Lexer};
pub use elide::{
    CONSULT_PAYLOAD_CHARS, KIND_CONSULT, KIND_CUSTOM, KIND_HELP, KIND_LSP, KIND_REFCAT, KIND_RUN, KIND_VERIFY, fill_placeholders, merge,
    merge_with_map, placeholder,
};
pub use error::{CompileError, Location, ParseError};
pub use registry::{CustomDirective, DirectiveRegistry, global};
pub use serialize::{step_directive, to_text};
pub use step::{CompareOp, CoverageCheck, MergedPrompt, RunStep, Step, VerifyStep};
pub use values::{format_duration, format_percent, parse_bool, parse_count, parse_duration, parse_fraction};
pub use workflow::{
    ContextLimitPolicy, DEFAULT_CONTEXT_LIMIT, DEFAULT_RETRY_PROMPT, DEFAULT_RUN_TIMEOUT, OnError, OutputPolicy,
    PausePoint, RunSettings, SessionMode, ValidationMode, VerifySettings, WorkflowConfig,
};

/// A compiled and merged conversation, ready for the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    /// Config with pause/consult points keyed to merged step indices
    pub config: WorkflowConfig,
    /// Steps after ELIDE merging
    pub steps: Vec<Step>,
    /// Compiler output before merging
    pub compiled: CompiledConversation,
}

impl Conversation {
    /// Compile and merge a ConversationFile on disk
    pub fn load(path: &Path, registry: &DirectiveRegistry) -> Result<Self, CompileError> {
        debug!(?path, "Conversation::load: called");
        let compiled = Compiler::new(registry).compile_file(path)?;
        Ok(Self::from_compiled(compiled))
    }

    /// Compile and merge in-memory text
    pub fn parse(text: &str, registry: &DirectiveRegistry) -> Result<Self, CompileError> {
        let compiled = Compiler::new(registry).compile_str(text)?;
        Ok(Self::from_compiled(compiled))
    }

    pub fn from_compiled(compiled: CompiledConversation) -> Self {
        let (steps, index_map) = merge_with_map(&compiled.steps);
        let mut config = compiled.config.clone();
        config.remap_points(&index_map);
        Self {
            config,
            steps,
            compiled,
        }
    }

    pub fn source(&self) -> Option<&Path> {
        self.compiled.source.as_deref()
    }

    /// Workflow name: the file stem, or `inline` for text input
    pub fn name(&self) -> String {
        self.source()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "inline".to_string())
    }

    /// Directory relative patterns fall back to
    pub fn base_dir(&self) -> PathBuf {
        self.source()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Number of steps that produce an agent turn
    pub fn prompt_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_agent_turn()).count()
    }

    /// Serialize back to ConversationFile text (ELIDE preserved)
    pub fn to_text(&self) -> String {
        to_text(&self.compiled.config, &self.compiled.steps)
    }
}

/// A REQUIRE entry that is not satisfied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementIssue {
    pub requirement: String,
    pub reason: String,
}

/// Check REQUIRE entries: `@path` must exist, `cmd:name` must be on PATH
pub fn validate_requirements(config: &WorkflowConfig, base_dir: &Path) -> Vec<RequirementIssue> {
    debug!(count = config.requirements.len(), "validate_requirements: called");
    let mut issues = Vec::new();

    for req in &config.requirements {
        let issue = if let Some(rel) = req.strip_prefix('@') {
            let candidates = [PathBuf::from(rel), base_dir.join(rel)];
            if candidates.iter().any(|p| p.exists()) {
                None
            } else {
                Some(format!("path '{}' does not exist", rel))
            }
        } else if let Some(cmd) = req.strip_prefix("cmd:") {
            match which::which(cmd) {
                Ok(_) => None,
                Err(_) => Some(format!("command '{}' not found on PATH", cmd)),
            }
        } else {
            Some("expected '@path' or 'cmd:name'".to_string())
        };

        if let Some(reason) = issue {
            warn!(requirement = %req, %reason, "Requirement not met");
            issues.push(RequirementIssue {
                requirement: req.clone(),
                reason,
            });
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_merges_and_remaps_points() {
        let registry = DirectiveRegistry::new();
        let conv = Conversation::parse(
            "PROMPT a\nELIDE\nPROMPT b\nRUN make\nPAUSE after make\n",
            &registry,
        )
        .unwrap();
        assert_eq!(conv.compiled.steps.len(), 4);
        assert_eq!(conv.steps.len(), 2);
        assert_eq!(conv.config.pause_points[0].after_step, Some(1));
        assert_eq!(conv.compiled.config.pause_points[0].after_step, Some(3));
        assert_eq!(conv.name(), "inline");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("review.conv");
        std::fs::write(&path, "MODEL gpt-4\nPROMPT hello\n").unwrap();
        let conv = Conversation::load(&path, &DirectiveRegistry::new()).unwrap();
        assert_eq!(conv.name(), "review");
        assert_eq!(conv.base_dir(), dir.path());
        assert_eq!(conv.prompt_count(), 1);
        assert!(conv.to_text().contains("PROMPT hello"));
    }

    #[test]
    fn test_validate_requirements() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "x").unwrap();
        let config = WorkflowConfig {
            requirements: vec![
                "@present.txt".into(),
                "@absent.txt".into(),
                "cmd:definitely-not-a-real-command-xyz".into(),
                "bogus".into(),
            ],
            ..Default::default()
        };
        let issues = validate_requirements(&config, dir.path());
        let failed: Vec<_> = issues.iter().map(|i| i.requirement.as_str()).collect();
        assert_eq!(
            failed,
            vec!["@absent.txt", "cmd:definitely-not-a-real-command-xyz", "bogus"]
        );
    }
}
