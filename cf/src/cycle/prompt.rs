//! Prompt composition shared by the orchestrator and the renderer

use crate::conversation::{SessionMode, WorkflowConfig, help};

use super::TemplateVars;

/// Where a prompt sits among the agent turns of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptPosition {
    /// `None` for prompts inside ON-FAILURE / ON-SUCCESS blocks
    pub index: Option<usize>,
    pub total: usize,
}

impl PromptPosition {
    pub fn top(index: usize, total: usize) -> Self {
        Self {
            index: Some(index),
            total,
        }
    }

    pub fn inner() -> Self {
        Self { index: None, total: 0 }
    }

    pub fn is_first(&self) -> bool {
        self.index == Some(0)
    }

    pub fn is_last(&self) -> bool {
        self.index.is_some_and(|i| i + 1 == self.total)
    }
}

/// Everything a prompt is wrapped with
pub struct PromptFrame<'a> {
    pub config: &'a WorkflowConfig,
    pub vars: &'a TemplateVars,
    /// 0-based
    pub cycle: u32,
    /// Rendered context block, used on the first prompt only
    pub context: &'a str,
}

impl PromptFrame<'_> {
    /// Build the text of one agent turn
    ///
    /// The first prompt of a cycle carries the continuation prompt (accumulate
    /// mode, later cycles), the context block, prologues and HELP topics; the
    /// last prompt carries the epilogues. `prefix` holds pending HELP-INLINE text.
    pub fn compose(&self, prefix: Vec<String>, body: &str, position: PromptPosition) -> String {
        self.compose_resolved(prefix, self.vars.substitute(body), position)
    }

    /// Same as [`compose`](Self::compose) for a body whose variables are already substituted
    pub fn compose_resolved(&self, prefix: Vec<String>, body: String, position: PromptPosition) -> String {
        let config = self.config;
        let vars = self.vars;
        let mut parts: Vec<String> = Vec::new();

        if position.is_first() {
            if self.cycle > 0
                && config.session_mode == SessionMode::Accumulate
                && let Some(continuation) = &config.continuation_prompt
            {
                parts.push(vars.substitute(continuation));
            }
            if !self.context.is_empty() {
                parts.push(self.context.to_string());
            }
            parts.extend(config.prologues.iter().map(|p| vars.substitute(p)));
            let help_text = help::render(&config.help_topics);
            if !help_text.is_empty() {
                parts.push(help_text);
            }
        }

        parts.extend(prefix);
        parts.extend(config.headers.iter().map(|h| vars.substitute(h)));
        parts.push(body);
        parts.extend(config.footers.iter().map(|f| vars.substitute(f)));

        if position.is_last() {
            parts.extend(config.epilogues.iter().map(|e| vars.substitute(e)));
        }
        parts.join("\n\n")
    }
}
