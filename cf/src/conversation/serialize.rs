//! Serialize a compiled conversation back to ConversationFile text
//!
//! Works on the pre-merge step list so ELIDE markers survive. Includes are
//! already flattened, so the output is a single self-contained file.

use std::fmt::Write as _;

use super::step::Step;
use super::values::{format_duration, format_percent};
use super::workflow::{
    ContextLimitPolicy, OnError, OutputPolicy, PausePoint, SessionMode, ValidationMode, WorkflowConfig,
};

const INDENT: &str = "    ";

/// Render config and steps as ConversationFile text
pub fn to_text(config: &WorkflowConfig, steps: &[Step]) -> String {
    let mut out = String::new();
    write_config(&mut out, config);

    if !out.is_empty() && !steps.is_empty() {
        out.push('\n');
    }

    write_points(&mut out, config, None);
    for (idx, step) in steps.iter().enumerate() {
        write_step(&mut out, step);
        write_points(&mut out, config, Some(idx));
    }
    out
}

/// The directive text for one step, without its blocks
pub fn step_directive(step: &Step) -> String {
    match step {
        Step::Prompt { text } => text_directive("PROMPT", text),
        Step::Run(run) => format!("RUN {}", run.command),
        Step::Checkpoint { name } => match name {
            Some(n) => format!("CHECKPOINT {}", n),
            None => "CHECKPOINT".to_string(),
        },
        Step::Compact { preserve } if preserve.is_empty() => "COMPACT".to_string(),
        Step::Compact { preserve } => format!("COMPACT {}", preserve.join(", ")),
        Step::NewConversation => "NEW-CONVERSATION".to_string(),
        Step::Elide => "ELIDE".to_string(),
        Step::Verify(v) => {
            let mut line = format!("VERIFY {}", quote(&v.kind));
            for (k, val) in &v.options {
                let _ = write!(line, " --{}={}", k, quote(val));
            }
            line
        }
        Step::VerifyTrace { from, to, .. } => format!("VERIFY-TRACE {} -> {}", from, to),
        Step::VerifyCoverage { check, .. } => {
            let mut line = "VERIFY-COVERAGE".to_string();
            if let Some(metric) = &check.metric {
                let _ = write!(line, " {}", metric);
            }
            if let (Some(op), Some(threshold)) = (check.op, check.threshold) {
                let _ = write!(line, " {} {}", op, threshold);
            }
            line
        }
        Step::Refcat { refs } => format!("REFCAT {}", join_quoted(refs)),
        Step::Lsp { query, options } => {
            let mut line = format!("LSP {}", query);
            for (k, val) in options {
                let _ = write!(line, " --{}={}", k, quote(val));
            }
            line
        }
        Step::HelpInline { topics, .. } => format!("HELP-INLINE {}", topics.join(" ")),
        Step::Custom { name, content } => text_directive(name, content),
        Step::Consult { text } => text_directive("CONSULT", text),
        Step::Pause { text } => text_directive("PAUSE", text),
        Step::MergedPrompt(m) => text_directive("PROMPT", &m.content),
    }
}

fn write_step(out: &mut String, step: &Step) {
    out.push_str(&step_directive(step));
    out.push('\n');

    if let Step::Run(run) = step
        && (run.retry_count > 0 || run.retry_prompt.is_some())
    {
        let _ = write!(out, "RUN-RETRY {}", run.retry_count);
        if let Some(prompt) = &run.retry_prompt {
            let _ = write!(out, " {}", quote(prompt));
        }
        out.push('\n');
    }

    let (on_failure, on_success) = step.blocks();
    for (name, block) in [("ON-FAILURE", on_failure), ("ON-SUCCESS", on_success)] {
        if block.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{}", name);
        for inner in block {
            write_step(out, inner);
        }
        out.push_str("END\n");
    }
}

fn write_points(out: &mut String, config: &WorkflowConfig, after: Option<usize>) {
    let matching = |points: &[PausePoint]| -> Vec<String> {
        points
            .iter()
            .filter(|p| p.after_step == after)
            .map(|p| p.message.clone())
            .collect()
    };
    for message in matching(&config.pause_points) {
        out.push_str(&text_directive("PAUSE", &message));
        out.push('\n');
    }
    for message in matching(&config.consult_points) {
        out.push_str(&text_directive("CONSULT", &message));
        out.push('\n');
    }
}

fn write_config(out: &mut String, c: &WorkflowConfig) {
    let mut line = |name: &str, value: &str| {
        if value.is_empty() {
            let _ = writeln!(out, "{}", name);
        } else {
            let _ = writeln!(out, "{}", text_directive(name, value));
        }
    };

    if let Some(v) = &c.model {
        line("MODEL", v);
    }
    if let Some(v) = &c.adapter {
        line("ADAPTER", v);
    }
    if let Some(v) = &c.mode {
        line("MODE", v);
    }
    if c.session_mode != SessionMode::default() {
        line("SESSION-MODE", &c.session_mode.to_string());
    }
    if let Some(n) = c.max_cycles {
        line("MAX-CYCLES", &n.to_string());
    }
    if let Some(v) = &c.cwd {
        line("CWD", v);
    }

    for (name, list) in [
        ("CONTEXT", &c.context),
        ("CONTEXT-OPTIONAL", &c.context_optional),
        ("CONTEXT-EXCLUDE", &c.context_exclude),
        ("ALLOW-FILES", &c.allow_files),
        ("DENY-FILES", &c.deny_files),
        ("ALLOW-DIR", &c.allow_dirs),
        ("DENY-DIR", &c.deny_dirs),
        ("REQUIRE", &c.requirements),
        ("MODEL-REQUIRES", &c.model_requirements),
        ("MODEL-PREFERS", &c.model_preferences),
    ] {
        if !list.is_empty() {
            line(name, &join_quoted(list));
        }
    }

    if let Some(v) = c.context_limit {
        line("CONTEXT-LIMIT", &format_percent(v));
    }
    if c.on_context_limit != ContextLimitPolicy::default() {
        line("ON-CONTEXT-LIMIT", &c.on_context_limit.to_string());
    }
    if let Some(v) = &c.on_context_limit_prompt {
        line("ON-CONTEXT-LIMIT-PROMPT", v);
    }

    for (name, texts) in [
        ("PROLOGUE", &c.prologues),
        ("EPILOGUE", &c.epilogues),
        ("HEADER", &c.headers),
        ("FOOTER", &c.footers),
    ] {
        for text in texts {
            line(name, text);
        }
    }
    if !c.help_topics.is_empty() {
        line("HELP", &c.help_topics.join(" "));
    }

    for (name, value) in [
        ("COMPACTION-MIN", c.compaction_min),
        ("COMPACTION-THRESHOLD", c.compaction_threshold),
        ("COMPACTION-MAX", c.compaction_max),
    ] {
        if let Some(v) = value {
            line(name, &format_percent(v));
        }
    }
    if !c.compact_preserve.is_empty() {
        line("COMPACT-PRESERVE", &c.compact_preserve.join(", "));
    }
    if let Some(v) = &c.compact_summary {
        line("COMPACT-SUMMARY", v);
    }

    if c.validation_mode != ValidationMode::default() {
        line("VALIDATION-MODE", &c.validation_mode.to_string());
    }
    if let Some(v) = &c.model_policy {
        line("MODEL-POLICY", v);
    }
    if let Some(d) = c.consult_timeout {
        line("CONSULT-TIMEOUT", &format_duration(d));
    }

    let run = &c.run;
    if run.allow_shell {
        line("ALLOW-SHELL", "");
    }
    if run.on_error != OnError::default() {
        line("RUN-ON-ERROR", &run.on_error.to_string());
    }
    if run.output != OutputPolicy::default() {
        line("RUN-OUTPUT", &run.output.to_string());
    }
    if let Some(n) = run.output_limit {
        line("RUN-OUTPUT-LIMIT", &n.to_string());
    }
    if run.timeout != super::workflow::DEFAULT_RUN_TIMEOUT {
        line("RUN-TIMEOUT", &format_duration(run.timeout));
    }
    if let Some(v) = &run.cwd {
        line("RUN-CWD", v);
    }
    if !run.env.is_empty() {
        let pairs: Vec<String> = run.env.iter().map(|(k, v)| quote(&format!("{}={}", k, v))).collect();
        line("RUN-ENV", &pairs.join(" "));
    }

    let verify = &c.verify;
    if verify.on_error != OnError::default() {
        line("VERIFY-ON-ERROR", &verify.on_error.to_string());
    }
    if verify.output != OutputPolicy::default() {
        line("VERIFY-OUTPUT", &verify.output.to_string());
    }
    if let Some(n) = verify.limit {
        line("VERIFY-LIMIT", &n.to_string());
    }

    for (name, value) in [
        ("OUTPUT-FORMAT", &c.output_format),
        ("OUTPUT-FILE", &c.output_file),
        ("OUTPUT-DIR", &c.output_dir),
        ("CONTINUATION-PROMPT", &c.continuation_prompt),
        ("SESSION-NAME", &c.session_name),
        ("EVENT-LOG", &c.event_log),
    ] {
        if let Some(v) = value {
            line(name, v);
        }
    }
    if let Some(b) = c.infinite_sessions {
        line("INFINITE-SESSIONS", if b { "true" } else { "false" });
    }
}

/// `NAME first line` with continuation lines indented
fn text_directive(name: &str, text: &str) -> String {
    let mut lines = text.lines();
    let first = lines.next().unwrap_or("");
    let mut out = if first.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", name, first)
    };
    for line in lines {
        out.push('\n');
        if !line.trim().is_empty() {
            out.push_str(INDENT);
            out.push_str(line);
        }
    }
    out
}

fn quote(word: &str) -> String {
    if word.is_empty() {
        return "\"\"".to_string();
    }
    if !word.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        return word.to_string();
    }
    if word.contains('"') {
        format!("'{}'", word)
    } else {
        format!("\"{}\"", word)
    }
}

fn join_quoted(words: &[String]) -> String {
    words.iter().map(|w| quote(w)).collect::<Vec<_>>().join(" ")
}
