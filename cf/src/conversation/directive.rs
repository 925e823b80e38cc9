//! Directive lexer
//!
//! Turns ConversationFile text into an ordered stream of [`Directive`]s.
//! A directive is an upper-case keyword at the start of a line followed by
//! an optional value. Text-class directives (PROMPT, PROLOGUE, ...) absorb
//! the lines that follow them until the next recognised directive.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::registry::DirectiveRegistry;

static DIRECTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z][A-Z0-9-]*)(?:\s+(.*))?$").expect("directive regex is valid"));

/// Built-in directive keywords
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Model,
    Adapter,
    Mode,
    SessionMode,
    MaxCycles,
    Cwd,
    Context,
    ContextOptional,
    ContextExclude,
    ContextLimit,
    OnContextLimit,
    OnContextLimitPrompt,
    AllowFiles,
    DenyFiles,
    AllowDir,
    DenyDir,
    Prologue,
    Epilogue,
    Header,
    Footer,
    Help,
    HelpInline,
    Prompt,
    Run,
    RunRetry,
    RunOnError,
    RunOutput,
    RunOutputLimit,
    RunTimeout,
    RunCwd,
    RunEnv,
    AllowShell,
    OnFailure,
    OnSuccess,
    End,
    Checkpoint,
    Compact,
    CompactPreserve,
    CompactSummary,
    CompactionMin,
    CompactionThreshold,
    CompactionMax,
    NewConversation,
    Elide,
    Verify,
    VerifyTrace,
    VerifyCoverage,
    VerifyOnError,
    VerifyOutput,
    VerifyLimit,
    Refcat,
    Lsp,
    Include,
    Pause,
    Consult,
    ConsultTimeout,
    ValidationMode,
    Require,
    ModelRequires,
    ModelPrefers,
    ModelPolicy,
    OutputFormat,
    OutputFile,
    OutputDir,
    ContinuationPrompt,
    SessionName,
    EventLog,
    InfiniteSessions,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("MODEL", Keyword::Model),
    ("ADAPTER", Keyword::Adapter),
    ("MODE", Keyword::Mode),
    ("SESSION-MODE", Keyword::SessionMode),
    ("MAX-CYCLES", Keyword::MaxCycles),
    ("CWD", Keyword::Cwd),
    ("CONTEXT", Keyword::Context),
    ("CONTEXT-OPTIONAL", Keyword::ContextOptional),
    ("CONTEXT-EXCLUDE", Keyword::ContextExclude),
    ("CONTEXT-LIMIT", Keyword::ContextLimit),
    ("ON-CONTEXT-LIMIT", Keyword::OnContextLimit),
    ("ON-CONTEXT-LIMIT-PROMPT", Keyword::OnContextLimitPrompt),
    ("ALLOW-FILES", Keyword::AllowFiles),
    ("DENY-FILES", Keyword::DenyFiles),
    ("ALLOW-DIR", Keyword::AllowDir),
    ("DENY-DIR", Keyword::DenyDir),
    ("PROLOGUE", Keyword::Prologue),
    ("EPILOGUE", Keyword::Epilogue),
    ("HEADER", Keyword::Header),
    ("FOOTER", Keyword::Footer),
    ("HELP", Keyword::Help),
    ("HELP-INLINE", Keyword::HelpInline),
    ("PROMPT", Keyword::Prompt),
    ("RUN", Keyword::Run),
    ("RUN-RETRY", Keyword::RunRetry),
    ("RUN-ON-ERROR", Keyword::RunOnError),
    ("RUN-OUTPUT", Keyword::RunOutput),
    ("RUN-OUTPUT-LIMIT", Keyword::RunOutputLimit),
    ("RUN-TIMEOUT", Keyword::RunTimeout),
    ("RUN-CWD", Keyword::RunCwd),
    ("RUN-ENV", Keyword::RunEnv),
    ("ALLOW-SHELL", Keyword::AllowShell),
    ("ON-FAILURE", Keyword::OnFailure),
    ("ON-SUCCESS", Keyword::OnSuccess),
    ("END", Keyword::End),
    ("CHECKPOINT", Keyword::Checkpoint),
    ("COMPACT", Keyword::Compact),
    ("COMPACT-PRESERVE", Keyword::CompactPreserve),
    ("COMPACT-SUMMARY", Keyword::CompactSummary),
    ("COMPACTION-MIN", Keyword::CompactionMin),
    ("COMPACTION-THRESHOLD", Keyword::CompactionThreshold),
    ("COMPACTION-MAX", Keyword::CompactionMax),
    ("NEW-CONVERSATION", Keyword::NewConversation),
    ("ELIDE", Keyword::Elide),
    ("VERIFY", Keyword::Verify),
    ("VERIFY-TRACE", Keyword::VerifyTrace),
    ("VERIFY-COVERAGE", Keyword::VerifyCoverage),
    ("VERIFY-ON-ERROR", Keyword::VerifyOnError),
    ("VERIFY-OUTPUT", Keyword::VerifyOutput),
    ("VERIFY-LIMIT", Keyword::VerifyLimit),
    ("REFCAT", Keyword::Refcat),
    ("LSP", Keyword::Lsp),
    ("INCLUDE", Keyword::Include),
    ("PAUSE", Keyword::Pause),
    ("CONSULT", Keyword::Consult),
    ("CONSULT-TIMEOUT", Keyword::ConsultTimeout),
    ("VALIDATION-MODE", Keyword::ValidationMode),
    ("REQUIRE", Keyword::Require),
    ("MODEL-REQUIRES", Keyword::ModelRequires),
    ("MODEL-PREFERS", Keyword::ModelPrefers),
    ("MODEL-POLICY", Keyword::ModelPolicy),
    ("OUTPUT-FORMAT", Keyword::OutputFormat),
    ("OUTPUT-FILE", Keyword::OutputFile),
    ("OUTPUT-DIR", Keyword::OutputDir),
    ("CONTINUATION-PROMPT", Keyword::ContinuationPrompt),
    ("SESSION-NAME", Keyword::SessionName),
    ("EVENT-LOG", Keyword::EventLog),
    ("INFINITE-SESSIONS", Keyword::InfiniteSessions),
];

impl Keyword {
    /// Look up a built-in keyword by its exact upper-case spelling
    pub fn from_name(name: &str) -> Option<Self> {
        KEYWORDS.iter().find(|(k, _)| *k == name).map(|(_, kw)| *kw)
    }

    /// The keyword as written in a ConversationFile
    pub fn as_str(&self) -> &'static str {
        KEYWORDS
            .iter()
            .find(|(_, kw)| kw == self)
            .map(|(k, _)| *k)
            .unwrap_or("UNKNOWN")
    }

    /// Whether following non-directive lines are appended to the value
    pub fn is_text_class(&self) -> bool {
        matches!(
            self,
            Self::Prompt
                | Self::Prologue
                | Self::Epilogue
                | Self::Header
                | Self::Footer
                | Self::Consult
                | Self::Pause
                | Self::CompactSummary
                | Self::ContinuationPrompt
                | Self::OnContextLimitPrompt
        )
    }

    /// All built-in keywords, in table order
    pub fn all() -> impl Iterator<Item = Keyword> {
        KEYWORDS.iter().map(|(_, kw)| *kw)
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Name of a lexed directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveName {
    Builtin(Keyword),
    /// Registered at runtime; always upper-case
    Custom(String),
}

impl fmt::Display for DirectiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(kw) => write!(f, "{}", kw),
            Self::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// One recognised keyword + value line (plus any continuation lines)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: DirectiveName,
    pub value: String,
    /// 1-indexed source line of the keyword
    pub line: usize,
}

impl Directive {
    pub fn is_custom(&self) -> bool {
        matches!(self.name, DirectiveName::Custom(_))
    }

    pub fn keyword(&self) -> Option<Keyword> {
        match self.name {
            DirectiveName::Builtin(kw) => Some(kw),
            DirectiveName::Custom(_) => None,
        }
    }
}

/// Lexer over ConversationFile text
pub struct Lexer<'a> {
    registry: &'a DirectiveRegistry,
}

impl<'a> Lexer<'a> {
    pub fn new(registry: &'a DirectiveRegistry) -> Self {
        Self { registry }
    }

    /// Lex a single physical line
    ///
    /// Returns `None` for comments, blank lines, prose and unknown keywords.
    pub fn lex(&self, line: &str, line_number: usize) -> Option<Directive> {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }

        let caps = DIRECTIVE_RE.captures(trimmed.trim_end())?;
        let name = caps.get(1)?.as_str();
        let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("").to_string();

        if let Some(kw) = Keyword::from_name(name) {
            return Some(Directive {
                name: DirectiveName::Builtin(kw),
                value,
                line: line_number,
            });
        }

        if self.registry.contains(name) {
            debug!(%name, line_number, "Lexer::lex: custom directive");
            return Some(Directive {
                name: DirectiveName::Custom(name.to_string()),
                value,
                line: line_number,
            });
        }

        debug!(%name, line_number, "Lexer::lex: unknown directive skipped");
        None
    }

    /// Lex a whole document, folding continuation lines into text-class directives
    pub fn lex_document(&self, text: &str) -> Vec<Directive> {
        debug!(len = text.len(), "Lexer::lex_document: called");
        let mut directives: Vec<Directive> = Vec::new();
        let mut continuation: Option<Continuation> = None;

        for (idx, line) in text.lines().enumerate() {
            let line_number = idx + 1;

            if let Some(cont) = continuation.as_mut() {
                let at_column_zero = !line.starts_with(char::is_whitespace);
                if at_column_zero && line.starts_with('#') {
                    // Comment ends the text block
                    if let Some(done) = continuation.take() {
                        directives.push(done.finish());
                    }
                    continue;
                }
                if at_column_zero && !line.is_empty() {
                    if let Some(directive) = self.lex(line, line_number) {
                        if let Some(done) = continuation.take() {
                            directives.push(done.finish());
                        }
                        continuation = self.start(directive, &mut directives);
                        continue;
                    }
                }
                cont.lines.push(line.to_string());
                continue;
            }

            if let Some(directive) = self.lex(line, line_number) {
                continuation = self.start(directive, &mut directives);
            }
        }

        if let Some(done) = continuation.take() {
            directives.push(done.finish());
        }

        debug!(count = directives.len(), "Lexer::lex_document: complete");
        directives
    }

    fn start(&self, directive: Directive, out: &mut Vec<Directive>) -> Option<Continuation> {
        let text_class = match &directive.name {
            DirectiveName::Builtin(kw) => kw.is_text_class(),
            DirectiveName::Custom(name) => self.registry.get(name).map(|c| c.multiline).unwrap_or(false),
        };
        if text_class {
            Some(Continuation {
                directive,
                lines: Vec::new(),
            })
        } else {
            out.push(directive);
            None
        }
    }
}

struct Continuation {
    directive: Directive,
    lines: Vec<String>,
}

impl Continuation {
    fn finish(mut self) -> Directive {
        while self.lines.last().is_some_and(|l| l.trim().is_empty()) {
            self.lines.pop();
        }
        if self.lines.is_empty() {
            return self.directive;
        }

        let indent = self
            .lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| leading_whitespace(l))
            .reduce(common_prefix)
            .unwrap_or("");

        let body = self
            .lines
            .iter()
            .map(|l| if l.trim().is_empty() { "" } else { l.strip_prefix(indent).unwrap_or(l.as_str()) })
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n");

        if self.directive.value.is_empty() {
            self.directive.value = body;
        } else {
            self.directive.value = format!("{}\n{}", self.directive.value, body);
        }
        self.directive
    }
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Longest shared prefix of two strings, cut on a char boundary
fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let end = a
        .char_indices()
        .zip(b.chars())
        .find(|((_, x), y)| x != y)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()));
    &a[..end]
}
