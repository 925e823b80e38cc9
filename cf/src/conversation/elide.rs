//! Elision merger - folds ELIDE-linked steps into one agent turn
//!
//! A group starts at any non-ELIDE step and absorbs the next step whenever
//! the step before it was an ELIDE. Groups of one pass through unchanged;
//! larger groups become a single [`MergedPrompt`] whose content carries
//! `{{KIND:i:payload}}` placeholders that the orchestrator fills in just
//! before sending.

use tracing::{debug, warn};

use super::serialize::step_directive;
use super::step::{MergedPrompt, Step};

/// Maximum characters of a CONSULT question shown inside its placeholder
pub const CONSULT_PAYLOAD_CHARS: usize = 50;

pub const KIND_RUN: &str = "RUN";
pub const KIND_VERIFY: &str = "VERIFY";
pub const KIND_REFCAT: &str = "REFCAT";
pub const KIND_LSP: &str = "LSP";
pub const KIND_HELP: &str = "HELP";
pub const KIND_CUSTOM: &str = "CUSTOM";
pub const KIND_CONSULT: &str = "CONSULT";

/// Build the placeholder token for the `index`-th command of `kind`
pub fn placeholder(kind: &str, index: usize, payload: &str) -> String {
    let payload = payload.replace('\n', " ").replace("}}", "} }");
    format!("{{{{{}:{}:{}}}}}", kind, index, payload)
}

/// Replace placeholder tokens in one pass over `content`
///
/// Text coming from an output is never scanned again. Tokens without an
/// entry in `substitutions` are left as they are.
pub fn fill_placeholders(content: &str, substitutions: &[(String, String)]) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let hit = substitutions
            .iter()
            .filter(|(token, _)| !token.is_empty() && rest.starts_with(token.as_str()))
            .max_by_key(|(token, _)| token.len());
        match hit {
            Some((token, output)) => {
                out.push_str(output);
                rest = &rest[token.len()..];
            }
            None => {
                out.push('{');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Merge ELIDE chains, discarding the index map
pub fn merge(steps: &[Step]) -> Vec<Step> {
    merge_with_map(steps).0
}

/// Merge ELIDE chains and return `index_map[pre] = post` for every input index
///
/// ELIDE markers map to the group they joined (or the preceding output
/// step). Blocks owned by RUN/VERIFY steps are merged recursively.
pub fn merge_with_map(steps: &[Step]) -> (Vec<Step>, Vec<usize>) {
    debug!(count = steps.len(), "merge_with_map: called");
    let mut merger = Merger::default();

    for step in steps {
        merger.feed(step);
    }
    merger.flush();

    debug!(before = steps.len(), after = merger.out.len(), "merge_with_map: complete");
    (merger.out, merger.index_map)
}

#[derive(Default)]
struct Merger<'a> {
    out: Vec<Step>,
    index_map: Vec<usize>,
    group: Vec<&'a Step>,
    /// Input indices waiting for the current group's output position
    pending: Vec<usize>,
    linked: bool,
}

impl<'a> Merger<'a> {
    fn feed(&mut self, step: &'a Step) {
        let idx = self.index_map.len();
        self.index_map.push(0);

        if matches!(step, Step::Elide) {
            self.linked = true;
            if self.group.is_empty() {
                self.index_map[idx] = self.out.len().saturating_sub(1);
            } else {
                self.pending.push(idx);
            }
            return;
        }

        let isolate = step.is_control() || owns_blocks(step);
        if isolate {
            if self.linked && !self.group.is_empty() {
                warn!(
                    step_type = step.type_name(),
                    "ELIDE chain contains a step that cannot be merged; emitting it standalone"
                );
            }
            self.flush();
            self.index_map[idx] = self.out.len();
            self.out.push(merge_blocks(step));
            self.linked = false;
            return;
        }

        if !(self.linked && !self.group.is_empty()) {
            self.flush();
        }
        self.group.push(step);
        self.pending.push(idx);
        self.linked = false;
    }

    fn flush(&mut self) {
        if self.group.is_empty() {
            return;
        }
        let position = self.out.len();
        let merged = match self.group.as_slice() {
            [single] => merge_blocks(single),
            members => Step::MergedPrompt(build_merged(members)),
        };
        self.out.push(merged);
        for idx in self.pending.drain(..) {
            self.index_map[idx] = position;
        }
        self.group.clear();
    }
}

fn owns_blocks(step: &Step) -> bool {
    let (on_failure, on_success) = step.blocks();
    !on_failure.is_empty() || !on_success.is_empty()
}

fn merge_blocks(step: &Step) -> Step {
    let mut step = step.clone();
    if let Some((on_failure, on_success)) = step.blocks_mut() {
        *on_failure = merge(on_failure);
        *on_success = merge(on_success);
    }
    step
}

fn build_merged(members: &[&Step]) -> MergedPrompt {
    debug!(members = members.len(), "build_merged: called");
    let mut merged = MergedPrompt::default();
    let mut parts: Vec<String> = Vec::with_capacity(members.len());

    for step in members {
        let part = match step {
            Step::Prompt { text } => text.clone(),
            Step::Run(run) => {
                let i = merged.run_commands.len();
                merged.run_commands.push(run.command.clone());
                placeholder(KIND_RUN, i, &run.command)
            }
            Step::Verify(_) | Step::VerifyTrace { .. } | Step::VerifyCoverage { .. } => {
                let i = merged.verify_commands.len();
                let line = step_directive(step);
                let part = placeholder(KIND_VERIFY, i, &line);
                merged.verify_commands.push(line);
                part
            }
            Step::Refcat { refs } => {
                let i = merged.refcat_commands.len();
                let payload = refs.join(" ");
                let part = placeholder(KIND_REFCAT, i, &payload);
                merged.refcat_commands.push(payload);
                part
            }
            Step::Lsp { .. } => {
                let i = merged.lsp_commands.len();
                let payload = step_directive(step)
                    .trim_start_matches("LSP")
                    .trim()
                    .to_string();
                let part = placeholder(KIND_LSP, i, &payload);
                merged.lsp_commands.push(payload);
                part
            }
            Step::HelpInline { topics, .. } => {
                let i = merged.help_commands.len();
                let payload = topics.join(" ");
                let part = placeholder(KIND_HELP, i, &payload);
                merged.help_commands.push(payload);
                part
            }
            Step::Custom { name, content } => {
                let i = merged.custom_directives.len();
                merged.custom_directives.push((name.clone(), content.clone()));
                placeholder(KIND_CUSTOM, i, name)
            }
            Step::Consult { text } => {
                let i = merged.consult_commands.len();
                merged.consult_commands.push(text.clone());
                let short: String = text.chars().take(CONSULT_PAYLOAD_CHARS).collect();
                placeholder(KIND_CONSULT, i, &short)
            }
            other => {
                warn!(step_type = other.type_name(), "Unexpected step inside ELIDE group");
                let body = match other {
                    Step::MergedPrompt(inner) => inner.content.clone(),
                    _ => step_directive(other),
                };
                format!("[{}] {}", other.type_name().to_uppercase(), body)
            }
        };
        parts.push(part);
    }

    merged.content = parts.join("\n");
    merged
}
