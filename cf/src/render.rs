//! Rendered-JSON pipeline format
//!
//! A workflow rendered ahead of execution: per-cycle variables, context files
//! and the assembled prompt text. `plan` mode keeps paths and counts only.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{ContextTracker, DEFAULT_MAX_TOKENS, render_all};
use crate::conversation::{CompileError, Conversation, ParseError, Step};
use crate::cycle::{PromptFrame, PromptPosition, TemplateVars};
use crate::error::ConvoError;

pub const SCHEMA_VERSION: &str = "1.0";
const SCHEMA_MAJOR: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    Plan,
    #[default]
    Full,
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Full => write!(f, "full"),
        }
    }
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plan" => Ok(Self::Plan),
            "full" => Ok(Self::Full),
            _ => Err("expected plan or full".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedContextFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub tokens_estimate: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPrompt {
    pub index: usize,
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prologues: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epilogues: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedCycle {
    /// 1-indexed
    pub number: u32,
    pub variables: BTreeMap<String, String>,
    pub context_files: Vec<RenderedContextFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refcat_content: Option<String>,
    pub prompts: Vec<RenderedPrompt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedWorkflow {
    pub schema_version: String,
    /// Source path, or `inline`
    pub workflow: String,
    pub workflow_name: String,
    pub mode: RenderMode,
    pub session_mode: String,
    pub adapter: Option<String>,
    pub model: Option<String>,
    pub max_cycles: u32,
    pub template_variables: BTreeMap<String, String>,
    pub cycles: Vec<RenderedCycle>,
}

impl RenderedWorkflow {
    /// Render `cycles` cycles (the workflow's MAX-CYCLES when `None`)
    ///
    /// Mandatory context is enforced as it would be at run time.
    pub fn render(
        conversation: &Conversation,
        cwd: &Path,
        vars: &TemplateVars,
        mode: RenderMode,
        cycles: Option<u32>,
    ) -> Result<Self, ConvoError> {
        let config = &conversation.config;
        let total = cycles.unwrap_or_else(|| config.cycles()).max(1);
        debug!(workflow = %conversation.name(), %mode, total, "RenderedWorkflow::render: called");

        let cwd = match &config.cwd {
            Some(dir) => cwd.join(dir),
            None => cwd.to_path_buf(),
        };
        let mut tracker = ContextTracker::for_workflow(config, &cwd, conversation.base_dir(), DEFAULT_MAX_TOKENS)?;
        tracker.load_workflow_context(config, config.is_lenient())?;

        let context_files: Vec<RenderedContextFile> = tracker
            .files()
            .iter()
            .map(|f| RenderedContextFile {
                path: f.path.strip_prefix(&cwd).unwrap_or(&f.path).display().to_string(),
                content: (mode == RenderMode::Full).then(|| f.content.clone()),
                tokens_estimate: f.estimated_tokens,
            })
            .collect();
        let context_block = tracker.render();

        let refcat_content = if mode == RenderMode::Full && !config.refcat_refs.is_empty() {
            Some(render_all(&config.refcat_refs, &cwd, &conversation.base_dir())?)
        } else {
            None
        };

        let turns: Vec<&Step> = conversation.steps.iter().filter(|s| s.is_agent_turn()).collect();
        let mut rendered_cycles = Vec::new();
        for cycle in 0..total {
            let mut cycle_vars = vars.clone();
            cycle_vars.set_cycle(cycle + 1, total);
            let frame = PromptFrame {
                config,
                vars: &cycle_vars,
                cycle,
                context: &context_block,
            };

            let prompts = turns
                .iter()
                .enumerate()
                .map(|(index, step)| {
                    let raw = match step {
                        Step::Prompt { text } => text.clone(),
                        Step::MergedPrompt(merged) => merged.content.clone(),
                        _ => String::new(),
                    };
                    let position = PromptPosition::top(index, turns.len());
                    let full = mode == RenderMode::Full;
                    RenderedPrompt {
                        index,
                        prologues: (full && position.is_first() && !config.prologues.is_empty())
                            .then(|| config.prologues.iter().map(|p| cycle_vars.substitute(p)).collect()),
                        epilogues: (full && position.is_last() && !config.epilogues.is_empty())
                            .then(|| config.epilogues.iter().map(|e| cycle_vars.substitute(e)).collect()),
                        resolved: full.then(|| frame.compose(Vec::new(), &raw, position)),
                        raw,
                    }
                })
                .collect();

            rendered_cycles.push(RenderedCycle {
                number: cycle + 1,
                variables: cycle_vars.as_map().clone(),
                context_files: context_files.clone(),
                refcat_content: refcat_content.clone(),
                prompts,
            });
        }

        Ok(Self {
            schema_version: SCHEMA_VERSION.to_string(),
            workflow: conversation
                .source()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "inline".to_string()),
            workflow_name: conversation.name(),
            mode,
            session_mode: config.session_mode.to_string(),
            adapter: config.adapter.clone(),
            model: config.model.clone(),
            max_cycles: total,
            template_variables: vars.as_map().clone(),
            cycles: rendered_cycles,
        })
    }

    pub fn to_json(&self) -> Result<String, ConvoError> {
        serde_json::to_string_pretty(self).map_err(|e| ConvoError::Render(e.to_string()))
    }

    /// Parse rendered JSON; a different schema major version is rejected
    pub fn from_json(text: &str) -> Result<Self, ConvoError> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| ConvoError::Render(e.to_string()))?;
        let found = value
            .get("schema_version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConvoError::Render("missing schema_version".to_string()))?;
        let major = found.split('.').next().and_then(|m| m.parse::<u32>().ok());
        if major != Some(SCHEMA_MAJOR) {
            return Err(ConvoError::Compile(CompileError::Parse(ParseError::SchemaVersion {
                found: found.to_string(),
                expected: SCHEMA_MAJOR,
            })));
        }
        serde_json::from_value(value).map_err(|e| ConvoError::Render(e.to_string()))
    }

    pub fn prompt_count(&self) -> usize {
        self.cycles.iter().map(|c| c.prompts.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::DirectiveRegistry;
    use crate::error::exit_codes;
    use std::fs;
    use tempfile::tempdir;

    fn conversation(text: &str) -> Conversation {
        Conversation::parse(text, &DirectiveRegistry::new()).unwrap()
    }

    const WORKFLOW: &str = "MODEL gpt-4\nMAX-CYCLES 2\nCONTEXT @notes.md\nPROLOGUE rules\nEPILOGUE bye\nPROMPT cycle {{CYCLE_NUMBER}}\nPROMPT second\n";

    #[test]
    fn test_full_render() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.md"), "some notes here\n").unwrap();
        let vars = TemplateVars::new().with("PROJECT", "cf");
        let rendered =
            RenderedWorkflow::render(&conversation(WORKFLOW), dir.path(), &vars, RenderMode::Full, None).unwrap();

        assert_eq!(rendered.schema_version, "1.0");
        assert_eq!(rendered.workflow_name, "inline");
        assert_eq!(rendered.model.as_deref(), Some("gpt-4"));
        assert_eq!(rendered.max_cycles, 2);
        assert_eq!(rendered.cycles.len(), 2);
        assert_eq!(rendered.prompt_count(), 4);

        let second = &rendered.cycles[1];
        assert_eq!(second.variables["CYCLE_NUMBER"], "2");
        assert_eq!(second.context_files[0].path, "notes.md");
        assert!(second.context_files[0].content.is_some());

        let first_prompt = &second.prompts[0];
        assert_eq!(first_prompt.raw, "cycle {{CYCLE_NUMBER}}");
        assert_eq!(first_prompt.prologues, Some(vec!["rules".to_string()]));
        assert!(first_prompt.epilogues.is_none());
        let resolved = first_prompt.resolved.as_deref().unwrap();
        assert!(resolved.contains("some notes here"));
        assert!(resolved.contains("cycle 2"));
        assert_eq!(second.prompts[1].epilogues, Some(vec!["bye".to_string()]));
    }

    #[test]
    fn test_plan_omits_content() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.md"), "some notes here\n").unwrap();
        let rendered = RenderedWorkflow::render(
            &conversation(WORKFLOW),
            dir.path(),
            &TemplateVars::new(),
            RenderMode::Plan,
            Some(1),
        )
        .unwrap();
        assert_eq!(rendered.cycles.len(), 1);
        let cycle = &rendered.cycles[0];
        assert!(cycle.context_files[0].content.is_none());
        assert!(cycle.prompts.iter().all(|p| p.resolved.is_none() && p.prologues.is_none()));

        let json = rendered.to_json().unwrap();
        assert!(!json.contains("some notes here"));
        assert!(json.contains("\"mode\": \"plan\""));
    }

    #[test]
    fn test_json_round_trip_and_version_check() {
        let dir = tempdir().unwrap();
        let rendered = RenderedWorkflow::render(
            &conversation("PROMPT hi\n"),
            dir.path(),
            &TemplateVars::new(),
            RenderMode::Full,
            None,
        )
        .unwrap();
        let json = rendered.to_json().unwrap();
        assert_eq!(RenderedWorkflow::from_json(&json).unwrap(), rendered);

        let future = json.replace("\"schema_version\": \"1.0\"", "\"schema_version\": \"2.0\"");
        let err = RenderedWorkflow::from_json(&future).unwrap_err();
        assert!(matches!(
            err,
            ConvoError::Compile(CompileError::Parse(ParseError::SchemaVersion { .. }))
        ));
        assert_eq!(err.exit_code(), exit_codes::PARSE);

        let minor = json.replace("\"schema_version\": \"1.0\"", "\"schema_version\": \"1.3\"");
        assert!(RenderedWorkflow::from_json(&minor).is_ok());
    }

    #[test]
    fn test_missing_context_is_an_error() {
        let dir = tempdir().unwrap();
        let err = RenderedWorkflow::render(
            &conversation("CONTEXT @absent.md\nPROMPT x\n"),
            dir.path(),
            &TemplateVars::new(),
            RenderMode::Plan,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConvoError::MissingContext { .. }));
    }
}
