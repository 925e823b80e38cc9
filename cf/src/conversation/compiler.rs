//! Step compiler - directives in, `(WorkflowConfig, Vec<Step>)` out
//!
//! A single-pass builder threads two pieces of parse state through the
//! directive stream: at most one open ON-FAILURE/ON-SUCCESS block, and the
//! include graph used for cycle detection. INCLUDE feeds the included file's
//! directives through the same builder so scalars keep "last wins" in
//! flattened source order and side-table indices stay correct.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::directive::{Directive, DirectiveName, Keyword, Lexer};
use super::error::{CompileError, Location, ParseError};
use super::help;
use super::registry::DirectiveRegistry;
use super::step::{CompareOp, CoverageCheck, RunStep, Step, VerifyStep};
use super::values::{parse_bool, parse_count, parse_duration, parse_fraction, split_words};
use super::workflow::{DEFAULT_RETRY_PROMPT, PausePoint, WorkflowConfig};

/// Canonical paths currently being compiled, outermost first
#[derive(Debug, Default)]
pub struct IncludeGraph {
    stack: Vec<PathBuf>,
}

impl IncludeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a canonical path; on a cycle returns the offending chain, ending with `path`
    pub fn push(&mut self, path: PathBuf) -> Result<(), Vec<PathBuf>> {
        if let Some(pos) = self.stack.iter().position(|p| *p == path) {
            let mut cycle: Vec<PathBuf> = self.stack[pos..].to_vec();
            cycle.push(path);
            return Err(cycle);
        }
        self.stack.push(path);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<PathBuf> {
        self.stack.pop()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.stack.iter().any(|p| p == path)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

/// Output of compilation before ELIDE merging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledConversation {
    pub config: WorkflowConfig,
    pub steps: Vec<Step>,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    OnFailure,
    OnSuccess,
}

impl BlockKind {
    fn name(&self) -> &'static str {
        match self {
            Self::OnFailure => "ON-FAILURE",
            Self::OnSuccess => "ON-SUCCESS",
        }
    }
}

struct OpenBlock {
    kind: BlockKind,
    owner: usize,
    steps: Vec<Step>,
    location: Location,
}

/// Compiles ConversationFile text into steps
pub struct Compiler<'a> {
    registry: &'a DirectiveRegistry,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a DirectiveRegistry) -> Self {
        Self { registry }
    }

    /// Compile a file from disk
    pub fn compile_file(&self, path: &Path) -> Result<CompiledConversation, CompileError> {
        debug!(?path, "Compiler::compile_file: called");
        if !path.exists() {
            return Err(CompileError::FileNotFound {
                path: path.to_path_buf(),
                included_from: None,
            });
        }
        let text = fs::read_to_string(path).map_err(|source| CompileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut graph = IncludeGraph::new();
        self.compile(&text, Some(path), &mut graph)
    }

    /// Compile in-memory text; includes resolve against the current directory
    pub fn compile_str(&self, text: &str) -> Result<CompiledConversation, CompileError> {
        let mut graph = IncludeGraph::new();
        self.compile(text, None, &mut graph)
    }

    /// Compile `text` read from `source`, threading the include graph
    pub fn compile(
        &self,
        text: &str,
        source: Option<&Path>,
        graph: &mut IncludeGraph,
    ) -> Result<CompiledConversation, CompileError> {
        debug!(?source, len = text.len(), "Compiler::compile: called");
        let mut builder = Builder::new(self.registry);

        let canonical = match source {
            Some(p) => Some(canonicalize(p)?),
            None => None,
        };
        if let Some(ref c) = canonical
            && let Err(cycle) = graph.push(c.clone())
        {
            return Err(ParseError::IncludeCycle {
                location: Location::new(source.map(Path::to_path_buf), 0),
                cycle,
            }
            .into());
        }

        let lexer = Lexer::new(self.registry);
        let directives = lexer.lex_document(text);
        builder.process_all(&directives, source, graph)?;

        if canonical.is_some() {
            graph.pop();
        }

        let compiled = builder.finish(source)?;
        info!(
            steps = compiled.steps.len(),
            source = ?source,
            "Compiled conversation"
        );
        Ok(compiled)
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf, CompileError> {
    fs::canonicalize(path).map_err(|source| CompileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

struct Builder<'a> {
    registry: &'a DirectiveRegistry,
    config: WorkflowConfig,
    steps: Vec<Step>,
    block: Option<OpenBlock>,
    depth: usize,
    included_prologues: usize,
    included_epilogues: usize,
}

impl<'a> Builder<'a> {
    fn new(registry: &'a DirectiveRegistry) -> Self {
        Self {
            registry,
            config: WorkflowConfig::default(),
            steps: Vec::new(),
            block: None,
            depth: 0,
            included_prologues: 0,
            included_epilogues: 0,
        }
    }

    fn finish(self, source: Option<&Path>) -> Result<CompiledConversation, CompileError> {
        if let Some(block) = self.block {
            return Err(ParseError::UnclosedBlock {
                location: block.location,
                block: block.kind.name().to_string(),
            }
            .into());
        }
        Ok(CompiledConversation {
            config: self.config,
            steps: self.steps,
            source: source.map(Path::to_path_buf),
        })
    }

    fn process_all(
        &mut self,
        directives: &[Directive],
        source: Option<&Path>,
        graph: &mut IncludeGraph,
    ) -> Result<(), CompileError> {
        for directive in directives {
            self.process(directive, source, graph)?;
        }
        Ok(())
    }

    fn process(&mut self, d: &Directive, source: Option<&Path>, graph: &mut IncludeGraph) -> Result<(), CompileError> {
        let loc = Location::new(source.map(Path::to_path_buf), d.line);
        let kw = match &d.name {
            DirectiveName::Builtin(kw) => *kw,
            DirectiveName::Custom(name) => {
                debug!(%name, line = d.line, "Builder::process: custom directive");
                self.push_step(Step::Custom {
                    name: name.clone(),
                    content: d.value.clone(),
                });
                return Ok(());
            }
        };
        let value = d.value.as_str();

        match kw {
            // Scalars - last occurrence wins
            Keyword::Model => self.config.model = Some(required(kw, value, &loc)?),
            Keyword::Adapter => self.config.adapter = Some(required(kw, value, &loc)?),
            Keyword::Mode => self.config.mode = Some(required(kw, value, &loc)?),
            Keyword::SessionMode => self.config.session_mode = parse_enum(kw, value, &loc)?,
            Keyword::MaxCycles => {
                let n = parse_count(value).map_err(|r| invalid(kw, value, r, &loc))?;
                if n == 0 {
                    return Err(invalid(kw, value, "must be at least 1".to_string(), &loc).into());
                }
                self.config.max_cycles = Some(n);
            }
            Keyword::Cwd => self.config.cwd = Some(required(kw, value, &loc)?),
            Keyword::ContextLimit => self.config.context_limit = Some(fraction(kw, value, &loc)?),
            Keyword::OnContextLimit => self.config.on_context_limit = parse_enum(kw, value, &loc)?,
            Keyword::OnContextLimitPrompt => self.config.on_context_limit_prompt = Some(required(kw, value, &loc)?),
            Keyword::CompactionMin => self.config.compaction_min = Some(fraction(kw, value, &loc)?),
            Keyword::CompactionThreshold => self.config.compaction_threshold = Some(fraction(kw, value, &loc)?),
            Keyword::CompactionMax => self.config.compaction_max = Some(fraction(kw, value, &loc)?),
            Keyword::CompactSummary => self.config.compact_summary = Some(required(kw, value, &loc)?),
            Keyword::ValidationMode => self.config.validation_mode = parse_enum(kw, value, &loc)?,
            Keyword::ModelPolicy => self.config.model_policy = Some(required(kw, value, &loc)?),
            Keyword::ConsultTimeout => {
                self.config.consult_timeout = Some(parse_duration(value).map_err(|r| invalid(kw, value, r, &loc))?)
            }
            Keyword::OutputFormat => self.config.output_format = Some(required(kw, value, &loc)?),
            Keyword::OutputFile => self.config.output_file = Some(required(kw, value, &loc)?),
            Keyword::OutputDir => self.config.output_dir = Some(required(kw, value, &loc)?),
            Keyword::ContinuationPrompt => self.config.continuation_prompt = Some(required(kw, value, &loc)?),
            Keyword::SessionName => self.config.session_name = Some(required(kw, value, &loc)?),
            Keyword::EventLog => self.config.event_log = Some(required(kw, value, &loc)?),
            Keyword::InfiniteSessions => {
                self.config.infinite_sessions = Some(parse_bool(value, true).map_err(|r| invalid(kw, value, r, &loc))?)
            }

            // RUN settings
            Keyword::AllowShell => {
                self.config.run.allow_shell = parse_bool(value, true).map_err(|r| invalid(kw, value, r, &loc))?
            }
            Keyword::RunOnError => self.config.run.on_error = parse_enum(kw, value, &loc)?,
            Keyword::RunOutput => self.config.run.output = parse_enum(kw, value, &loc)?,
            Keyword::RunOutputLimit => {
                self.config.run.output_limit = Some(parse_count(value).map_err(|r| invalid(kw, value, r, &loc))? as usize)
            }
            Keyword::RunTimeout => {
                self.config.run.timeout = parse_duration(value).map_err(|r| invalid(kw, value, r, &loc))?
            }
            Keyword::RunCwd => self.config.run.cwd = Some(required(kw, value, &loc)?),
            Keyword::RunEnv => {
                for (k, v) in parse_env(value).map_err(|r| invalid(kw, value, r, &loc))? {
                    self.config.run.env.insert(k, v);
                }
            }

            // VERIFY settings
            Keyword::VerifyOnError => self.config.verify.on_error = parse_enum(kw, value, &loc)?,
            Keyword::VerifyOutput => self.config.verify.output = parse_enum(kw, value, &loc)?,
            Keyword::VerifyLimit => {
                self.config.verify.limit = Some(parse_count(value).map_err(|r| invalid(kw, value, r, &loc))? as usize)
            }

            // Lists
            Keyword::Context => self.config.context.extend(patterns(kw, value, &loc)?),
            Keyword::ContextOptional => self.config.context_optional.extend(patterns(kw, value, &loc)?),
            Keyword::ContextExclude => self.config.context_exclude.extend(patterns(kw, value, &loc)?),
            Keyword::AllowFiles => self.config.allow_files.extend(patterns(kw, value, &loc)?),
            Keyword::DenyFiles => self.config.deny_files.extend(patterns(kw, value, &loc)?),
            Keyword::AllowDir => self.config.allow_dirs.extend(patterns(kw, value, &loc)?),
            Keyword::DenyDir => self.config.deny_dirs.extend(patterns(kw, value, &loc)?),
            Keyword::Header => self.config.headers.push(required(kw, value, &loc)?),
            Keyword::Footer => self.config.footers.push(required(kw, value, &loc)?),
            Keyword::CompactPreserve => self.config.compact_preserve.extend(tags(value)),
            Keyword::Require => self.config.requirements.extend(patterns(kw, value, &loc)?),
            Keyword::ModelRequires => self.config.model_requirements.extend(patterns(kw, value, &loc)?),
            Keyword::ModelPrefers => self.config.model_preferences.extend(patterns(kw, value, &loc)?),
            Keyword::Prologue => {
                let text = required(kw, value, &loc)?;
                if self.depth > 0 {
                    self.config.prologues.insert(self.included_prologues, text);
                    self.included_prologues += 1;
                } else {
                    self.config.prologues.push(text);
                }
            }
            Keyword::Epilogue => {
                let text = required(kw, value, &loc)?;
                if self.depth > 0 {
                    self.config.epilogues.insert(self.included_epilogues, text);
                    self.included_epilogues += 1;
                } else {
                    self.config.epilogues.push(text);
                }
            }
            Keyword::Help => {
                let topics = help_topics(kw, value, &loc)?;
                self.config.help_topics.extend(topics);
            }

            // Steps
            Keyword::Prompt => self.push_step(Step::Prompt {
                text: required(kw, value, &loc)?,
            }),
            Keyword::Run => self.push_step(Step::Run(RunStep::new(required(kw, value, &loc)?))),
            Keyword::RunRetry => self.apply_retry(value, &loc)?,
            Keyword::Checkpoint => self.push_step(Step::Checkpoint {
                name: non_empty(value),
            }),
            Keyword::Compact => self.push_step(Step::Compact { preserve: tags(value) }),
            Keyword::NewConversation => self.push_step(Step::NewConversation),
            Keyword::Elide => self.push_step(Step::Elide),
            Keyword::Verify => {
                let verify = parse_verify(value).map_err(|r| invalid(kw, value, r, &loc))?;
                self.push_step(Step::Verify(verify));
            }
            Keyword::VerifyTrace => {
                let (from, to) = parse_trace(value).map_err(|r| invalid(kw, value, r, &loc))?;
                self.config.trace_links.push((from.clone(), to.clone()));
                self.push_step(Step::VerifyTrace {
                    from,
                    to,
                    on_failure: Vec::new(),
                    on_success: Vec::new(),
                });
            }
            Keyword::VerifyCoverage => {
                let check = parse_coverage(value).map_err(|r| invalid(kw, value, r, &loc))?;
                self.push_step(Step::VerifyCoverage {
                    check,
                    on_failure: Vec::new(),
                    on_success: Vec::new(),
                });
            }
            Keyword::Refcat => {
                let refs = patterns(kw, value, &loc)?;
                self.config.refcat_refs.extend(refs.iter().cloned());
                self.push_step(Step::Refcat { refs });
            }
            Keyword::Lsp => {
                let (query, options) = parse_lsp(value).map_err(|r| invalid(kw, value, r, &loc))?;
                self.push_step(Step::Lsp { query, options });
            }
            Keyword::HelpInline => {
                let topics = help_topics(kw, value, &loc)?;
                self.push_step(Step::HelpInline {
                    topics,
                    merge_with_next: true,
                });
            }
            Keyword::Pause => self.annotate(value, &loc, false),
            Keyword::Consult => self.annotate(value, &loc, true),

            // Blocks
            Keyword::OnFailure => self.open_block(BlockKind::OnFailure, &loc)?,
            Keyword::OnSuccess => self.open_block(BlockKind::OnSuccess, &loc)?,
            Keyword::End => self.close_block(&loc)?,

            Keyword::Include => self.include(value, &loc, source, graph)?,
        }
        Ok(())
    }

    fn target(&mut self) -> &mut Vec<Step> {
        match self.block.as_mut() {
            Some(block) => &mut block.steps,
            None => &mut self.steps,
        }
    }

    fn push_step(&mut self, step: Step) {
        debug!(step_type = step.type_name(), in_block = self.block.is_some(), "Builder::push_step: called");
        self.target().push(step);
    }

    /// Record PAUSE/CONSULT; emitted as a step only when directly ELIDE-linked
    fn annotate(&mut self, value: &str, loc: &Location, consult: bool) {
        let text = value.to_string();
        if matches!(self.target().last(), Some(Step::Elide)) {
            debug!(line = loc.line, consult, "Builder::annotate: ELIDE-linked, emitting step");
            let step = if consult { Step::Consult { text } } else { Step::Pause { text } };
            self.push_step(step);
            return;
        }

        let after_step = match &self.block {
            Some(block) => Some(block.owner),
            None => self.steps.len().checked_sub(1),
        };
        let point = PausePoint {
            after_step,
            message: text,
        };
        if consult {
            self.config.consult_points.push(point);
        } else {
            self.config.pause_points.push(point);
        }
    }

    fn apply_retry(&mut self, value: &str, loc: &Location) -> Result<(), CompileError> {
        let kw = Keyword::RunRetry;
        let words = split_words(value).map_err(|r| invalid(kw, value, r, loc))?;
        let (count, prompt) = match words.split_first() {
            Some((first, rest)) => {
                let n = parse_count(first).map_err(|r| invalid(kw, value, r, loc))?;
                let prompt = if rest.is_empty() { None } else { Some(rest.join(" ")) };
                (n, prompt)
            }
            None => return Err(ParseError::MissingValue {
                location: loc.clone(),
                directive: kw.to_string(),
            }
            .into()),
        };

        match self.target().last_mut() {
            Some(Step::Run(run)) => {
                run.retry_count = count;
                run.retry_prompt = Some(prompt.unwrap_or_else(|| DEFAULT_RETRY_PROMPT.to_string()));
                Ok(())
            }
            _ => Err(ParseError::RetryWithoutRun { location: loc.clone() }.into()),
        }
    }

    fn open_block(&mut self, kind: BlockKind, loc: &Location) -> Result<(), CompileError> {
        debug!(block = kind.name(), line = loc.line, "Builder::open_block: called");
        if self.block.is_some() {
            return Err(ParseError::NestedBlock {
                location: loc.clone(),
                block: kind.name().to_string(),
            }
            .into());
        }

        let owner = match self.steps.last() {
            Some(step) if step.can_own_blocks() => self.steps.len() - 1,
            _ => {
                return Err(ParseError::BlockWithoutRun {
                    location: loc.clone(),
                    block: kind.name().to_string(),
                }
                .into());
            }
        };

        let (on_failure, on_success) = self.steps[owner].blocks();
        let existing = match kind {
            BlockKind::OnFailure => on_failure,
            BlockKind::OnSuccess => on_success,
        };
        if !existing.is_empty() {
            return Err(ParseError::DuplicateBlock {
                location: loc.clone(),
                block: kind.name().to_string(),
            }
            .into());
        }

        self.block = Some(OpenBlock {
            kind,
            owner,
            steps: Vec::new(),
            location: loc.clone(),
        });
        Ok(())
    }

    fn close_block(&mut self, loc: &Location) -> Result<(), CompileError> {
        let block = self
            .block
            .take()
            .ok_or_else(|| ParseError::EndWithoutBlock { location: loc.clone() })?;
        debug!(block = block.kind.name(), steps = block.steps.len(), "Builder::close_block: called");

        if let Some((on_failure, on_success)) = self.steps[block.owner].blocks_mut() {
            match block.kind {
                BlockKind::OnFailure => *on_failure = block.steps,
                BlockKind::OnSuccess => *on_success = block.steps,
            }
        }
        Ok(())
    }

    fn include(
        &mut self,
        value: &str,
        loc: &Location,
        source: Option<&Path>,
        graph: &mut IncludeGraph,
    ) -> Result<(), CompileError> {
        let rel = required(Keyword::Include, value, loc)?;
        let base = source
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let path = base.join(rel.trim_start_matches('@'));
        debug!(?path, line = loc.line, "Builder::include: called");

        if !path.exists() {
            return Err(CompileError::FileNotFound {
                path,
                included_from: Some(loc.clone()),
            });
        }

        let canonical = canonicalize(&path)?;
        graph.push(canonical.clone()).map_err(|cycle| ParseError::IncludeCycle {
            location: loc.clone(),
            cycle,
        })?;

        let text = fs::read_to_string(&path).map_err(|source| CompileError::Io {
            path: path.clone(),
            source,
        })?;
        let directives = Lexer::new(self.registry).lex_document(&text);

        let open_before = self.block.as_ref().map(|b| b.location.clone());
        self.depth += 1;
        self.process_all(&directives, Some(&path), graph)?;
        self.depth -= 1;

        if let Some(block) = &self.block
            && open_before.as_ref() != Some(&block.location)
        {
            return Err(ParseError::UnclosedBlock {
                location: block.location.clone(),
                block: block.kind.name().to_string(),
            }
            .into());
        }

        graph.pop();
        info!(included = %path.display(), "Included conversation file");
        Ok(())
    }
}

fn invalid(kw: Keyword, value: &str, reason: String, loc: &Location) -> ParseError {
    ParseError::InvalidValue {
        location: loc.clone(),
        directive: kw.to_string(),
        value: value.to_string(),
        reason,
    }
}

fn required(kw: Keyword, value: &str, loc: &Location) -> Result<String, ParseError> {
    if value.trim().is_empty() {
        return Err(ParseError::MissingValue {
            location: loc.clone(),
            directive: kw.to_string(),
        });
    }
    Ok(value.to_string())
}

fn non_empty(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() { None } else { Some(v.to_string()) }
}

fn fraction(kw: Keyword, value: &str, loc: &Location) -> Result<f64, ParseError> {
    parse_fraction(value).map_err(|r| invalid(kw, value, r, loc))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(kw: Keyword, value: &str, loc: &Location) -> Result<T, ParseError> {
    value.parse::<T>().map_err(|r| invalid(kw, value, r, loc))
}

fn patterns(kw: Keyword, value: &str, loc: &Location) -> Result<Vec<String>, ParseError> {
    let words = split_words(value).map_err(|r| invalid(kw, value, r, loc))?;
    if words.is_empty() {
        return Err(ParseError::MissingValue {
            location: loc.clone(),
            directive: kw.to_string(),
        });
    }
    Ok(words)
}

fn tags(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn help_topics(kw: Keyword, value: &str, loc: &Location) -> Result<Vec<String>, ParseError> {
    let topics = tags(value);
    if topics.is_empty() {
        return Err(ParseError::MissingValue {
            location: loc.clone(),
            directive: kw.to_string(),
        });
    }
    for topic in &topics {
        if help::topic(topic).is_none() {
            return Err(ParseError::UnknownHelpTopic {
                location: loc.clone(),
                topic: topic.clone(),
            });
        }
    }
    Ok(topics)
}

fn parse_env(value: &str) -> Result<Vec<(String, String)>, String> {
    let words = split_words(value)?;
    if words.is_empty() {
        return Err("expected KEY=VALUE".to_string());
    }
    words
        .into_iter()
        .map(|w| match w.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(format!("'{}' is not KEY=VALUE", w)),
        })
        .collect()
}

/// `--key=value` and `--flag` tokens become options; remaining words are positional
fn split_options(value: &str) -> Result<(Vec<String>, BTreeMap<String, String>), String> {
    let mut positional = Vec::new();
    let mut options = BTreeMap::new();
    for word in split_words(value)? {
        if let Some(opt) = word.strip_prefix("--") {
            match opt.split_once('=') {
                Some((k, v)) => options.insert(k.to_string(), v.to_string()),
                None => options.insert(opt.to_string(), "true".to_string()),
            };
        } else if let Some((k, v)) = word.split_once('=') {
            options.insert(k.to_string(), v.to_string());
        } else {
            positional.push(word);
        }
    }
    Ok((positional, options))
}

fn parse_verify(value: &str) -> Result<VerifyStep, String> {
    let (positional, options) = split_options(value)?;
    let kind = positional.first().cloned().unwrap_or_else(|| "all".to_string());
    if positional.len() > 1 {
        warn!(%kind, ignored = ?&positional[1..], "VERIFY: extra arguments after the kind are ignored");
    }
    Ok(VerifyStep {
        kind,
        options,
        on_failure: Vec::new(),
        on_success: Vec::new(),
    })
}

fn parse_trace(value: &str) -> Result<(String, String), String> {
    let (from, to) = value
        .split_once("->")
        .or_else(|| value.split_once('\u{2192}'))
        .ok_or_else(|| "expected 'FROM -> TO'".to_string())?;
    let (from, to) = (from.trim(), to.trim());
    if from.is_empty() || to.is_empty() {
        return Err("both sides of the arrow are required".to_string());
    }
    Ok((from.to_string(), to.to_string()))
}

fn parse_coverage(value: &str) -> Result<CoverageCheck, String> {
    let words: Vec<&str> = value.split_whitespace().collect();
    let (metric, op, threshold) = match words.as_slice() {
        [] => return Ok(CoverageCheck::report_only()),
        [metric] => {
            return Ok(CoverageCheck {
                metric: Some(metric.to_string()),
                op: None,
                threshold: None,
            });
        }
        [op, threshold] => ("overall", *op, *threshold),
        [metric, op, threshold] => (*metric, *op, *threshold),
        _ => return Err("expected 'METRIC OP THRESHOLD'".to_string()),
    };

    let op = CompareOp::parse(op).ok_or_else(|| format!("unknown operator '{}' (use >=, <=, >, <, ==)", op))?;
    let threshold: f64 = threshold
        .trim_end_matches('%')
        .parse()
        .map_err(|_| format!("threshold '{}' is not a number", threshold))?;

    Ok(CoverageCheck {
        metric: Some(metric.to_string()),
        op: Some(op),
        threshold: Some(threshold),
    })
}

fn parse_lsp(value: &str) -> Result<(String, BTreeMap<String, String>), String> {
    let (positional, options) = split_options(value)?;
    if positional.is_empty() {
        return Err("expected a query".to_string());
    }
    Ok((positional.join(" "), options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::workflow::{OnError, OutputPolicy, SessionMode};
    use std::time::Duration;
    use tempfile::tempdir;

    fn compile(text: &str) -> Result<CompiledConversation, CompileError> {
        let registry = DirectiveRegistry::new();
        Compiler::new(&registry).compile_str(text)
    }

    #[test]
    fn test_config_directives_produce_no_steps() {
        let c = compile("MODEL gpt-4\nADAPTER mock\nMAX-CYCLES 3\nSESSION-MODE fresh\nCONTEXT @src/*.rs @README.md\n")
            .unwrap();
        assert!(c.steps.is_empty());
        assert_eq!(c.config.model.as_deref(), Some("gpt-4"));
        assert_eq!(c.config.adapter.as_deref(), Some("mock"));
        assert_eq!(c.config.max_cycles, Some(3));
        assert_eq!(c.config.session_mode, SessionMode::Fresh);
        assert_eq!(c.config.context, vec!["@src/*.rs", "@README.md"]);
    }

    #[test]
    fn test_duplicate_scalar_last_wins() {
        let c = compile("MODEL a\nMODEL b\n").unwrap();
        assert_eq!(c.config.model.as_deref(), Some("b"));
    }

    #[test]
    fn test_steps_in_source_order() {
        let c = compile("PROMPT one\nRUN echo hi\nCHECKPOINT mid\nCOMPACT errors, decisions\nNEW-CONVERSATION\nPROMPT two\n")
            .unwrap();
        let types: Vec<_> = c.steps.iter().map(Step::type_name).collect();
        assert_eq!(types, vec!["prompt", "run", "checkpoint", "compact", "new_conversation", "prompt"]);
        assert_eq!(
            c.steps[3],
            Step::Compact {
                preserve: vec!["errors".into(), "decisions".into()]
            }
        );
    }

    #[test]
    fn test_compaction_threshold_percent() {
        let c = compile("COMPACTION-THRESHOLD 75%\n").unwrap();
        assert_eq!(c.config.compaction_threshold, Some(0.75));
        let c = compile("COMPACTION-THRESHOLD 75\n").unwrap();
        assert_eq!(c.config.compaction_threshold, Some(0.75));
        let err = compile("COMPACTION-THRESHOLD abc\n").unwrap_err();
        assert!(matches!(err.as_parse(), Some(ParseError::InvalidValue { .. })));
    }

    #[test]
    fn test_on_failure_without_run() {
        let err = compile("PROMPT X\nON-FAILURE\nPROMPT fix\nEND\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ON-FAILURE"), "{}", msg);
        assert!(msg.contains("RUN"), "{}", msg);
    }

    #[test]
    fn test_on_failure_and_on_success_blocks() {
        let c = compile("RUN cargo test\nON-FAILURE\nPROMPT fix the tests\nRUN cargo test\nEND\nON-SUCCESS\nPROMPT great\nEND\nPROMPT next\n")
            .unwrap();
        assert_eq!(c.steps.len(), 2);
        match &c.steps[0] {
            Step::Run(run) => {
                assert_eq!(run.on_failure.len(), 2);
                assert_eq!(run.on_success, vec![Step::prompt("great")]);
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_can_own_block() {
        let c = compile("VERIFY refs\nON-FAILURE\nPROMPT fix refs\nEND\n").unwrap();
        assert_eq!(c.steps[0].blocks().0.len(), 1);
    }

    #[test]
    fn test_verify_extra_words_ignored() {
        let c = compile("VERIFY refs stray words strict=true\n").unwrap();
        match &c.steps[0] {
            Step::Verify(v) => {
                assert_eq!(v.kind, "refs");
                assert_eq!(v.options.get("strict").map(String::as_str), Some("true"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nested_block_rejected() {
        let err = compile("RUN a\nON-FAILURE\nRUN b\nON-FAILURE\nEND\nEND\n").unwrap_err();
        assert!(matches!(err.as_parse(), Some(ParseError::NestedBlock { .. })));
        assert!(err.to_string().contains("nested block"));
    }

    #[test]
    fn test_unclosed_block_rejected() {
        let err = compile("RUN a\nON-FAILURE\nPROMPT fix\n").unwrap_err();
        assert!(matches!(err.as_parse(), Some(ParseError::UnclosedBlock { .. })));
        assert!(err.to_string().contains("unclosed block"));
    }

    #[test]
    fn test_end_without_block() {
        let err = compile("END\n").unwrap_err();
        assert!(matches!(err.as_parse(), Some(ParseError::EndWithoutBlock { .. })));
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let err = compile("RUN a\nON-FAILURE\nPROMPT x\nEND\nON-FAILURE\nPROMPT y\nEND\n").unwrap_err();
        assert!(matches!(err.as_parse(), Some(ParseError::DuplicateBlock { .. })));
    }

    #[test]
    fn test_pause_and_consult_side_tables() {
        let c = compile("PAUSE before anything\nPROMPT a\nPAUSE check the diff\nRUN make\nCONSULT ask a human\n").unwrap();
        assert_eq!(c.steps.len(), 2);
        assert_eq!(c.config.pause_points.len(), 2);
        assert_eq!(c.config.pause_points[0].after_step, None);
        assert_eq!(c.config.pause_points[1].after_step, Some(0));
        assert_eq!(c.config.consult_points[0].after_step, Some(1));
        assert_eq!(c.config.consult_points[0].message, "ask a human");
    }

    #[test]
    fn test_elide_linked_consult_becomes_step() {
        let c = compile("PROMPT a\nELIDE\nCONSULT which option?\n").unwrap();
        assert_eq!(c.steps.len(), 3);
        assert!(matches!(c.steps[2], Step::Consult { .. }));
        assert!(c.config.consult_points.is_empty());
    }

    #[test]
    fn test_run_settings() {
        let c = compile(
            "ALLOW-SHELL\nRUN-ON-ERROR continue\nRUN-OUTPUT always\nRUN-TIMEOUT 2m\nRUN-ENV RUST_LOG=debug 'MSG=a b'\nRUN-OUTPUT-LIMIT 500\n",
        )
        .unwrap();
        assert!(c.config.run.allow_shell);
        assert_eq!(c.config.run.on_error, OnError::Continue);
        assert_eq!(c.config.run.output, OutputPolicy::Always);
        assert_eq!(c.config.run.timeout, Duration::from_secs(120));
        assert_eq!(c.config.run.env.get("MSG").map(String::as_str), Some("a b"));
        assert_eq!(c.config.run.output_limit, Some(500));
    }

    #[test]
    fn test_allow_shell_values() {
        assert!(!compile("ALLOW-SHELL false\n").unwrap().config.run.allow_shell);
        assert!(!compile("ALLOW-SHELL no\n").unwrap().config.run.allow_shell);
        assert!(compile("ALLOW-SHELL Yes\n").unwrap().config.run.allow_shell);
        assert!(!compile("PROMPT x\n").unwrap().config.run.allow_shell);
    }

    #[test]
    fn test_run_retry() {
        let c = compile("RUN cargo test\nRUN-RETRY 3 \"fix the failing tests\"\n").unwrap();
        match &c.steps[0] {
            Step::Run(run) => {
                assert_eq!(run.retry_count, 3);
                assert_eq!(run.retry_prompt.as_deref(), Some("fix the failing tests"));
            }
            other => panic!("expected run, got {:?}", other),
        }
        assert!(matches!(
            compile("PROMPT x\nRUN-RETRY 2\n").unwrap_err().as_parse(),
            Some(ParseError::RetryWithoutRun { .. })
        ));
    }

    #[test]
    fn test_verify_trace_arrows() {
        let c = compile("VERIFY-TRACE REQ-001 -> SPEC-002\nVERIFY-TRACE SPEC-002 \u{2192} TEST-003\n").unwrap();
        assert_eq!(
            c.config.trace_links,
            vec![
                ("REQ-001".to_string(), "SPEC-002".to_string()),
                ("SPEC-002".to_string(), "TEST-003".to_string())
            ]
        );
        assert_eq!(c.steps.len(), 2);
        assert!(compile("VERIFY-TRACE nothing\n").is_err());
    }

    #[test]
    fn test_verify_coverage_forms() {
        let c = compile("VERIFY-COVERAGE\nVERIFY-COVERAGE requirements >= 80%\nVERIFY-COVERAGE < 50\n").unwrap();
        match &c.steps[0] {
            Step::VerifyCoverage { check, .. } => assert!(check.is_report_only()),
            other => panic!("unexpected {:?}", other),
        }
        match &c.steps[1] {
            Step::VerifyCoverage { check, .. } => {
                assert_eq!(check.metric.as_deref(), Some("requirements"));
                assert_eq!(check.op, Some(CompareOp::Ge));
                assert_eq!(check.threshold, Some(80.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &c.steps[2] {
            Step::VerifyCoverage { check, .. } => {
                assert_eq!(check.metric.as_deref(), Some("overall"));
                assert_eq!(check.op, Some(CompareOp::Lt));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(compile("VERIFY-COVERAGE reqs => 80\n").is_err());
    }

    #[test]
    fn test_verify_and_lsp_options() {
        let c = compile("VERIFY links --strict depth=2\nLSP type Config --lang=rust\n").unwrap();
        match &c.steps[0] {
            Step::Verify(v) => {
                assert_eq!(v.kind, "links");
                assert_eq!(v.options.get("strict").map(String::as_str), Some("true"));
                assert_eq!(v.options.get("depth").map(String::as_str), Some("2"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &c.steps[1] {
            Step::Lsp { query, options } => {
                assert_eq!(query, "type Config");
                assert_eq!(options.get("lang").map(String::as_str), Some("rust"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_help_topics_validated() {
        let c = compile("HELP workflow\nHELP-INLINE elide\n").unwrap();
        assert_eq!(c.config.help_topics, vec!["workflow"]);
        assert!(matches!(c.steps[0], Step::HelpInline { merge_with_next: true, .. }));
        assert!(matches!(
            compile("HELP nonsense\n").unwrap_err().as_parse(),
            Some(ParseError::UnknownHelpTopic { .. })
        ));
    }

    #[test]
    fn test_custom_directive_step() {
        let mut registry = DirectiveRegistry::new();
        registry.register(crate::conversation::CustomDirective::new("deploy"));
        let c = Compiler::new(&registry).compile_str("DEPLOY to staging\n").unwrap();
        assert_eq!(
            c.steps[0],
            Step::Custom {
                name: "DEPLOY".into(),
                content: "to staging".into()
            }
        );
    }

    #[test]
    fn test_include_splices_steps_in_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("c.conv"), "PROMPT from c\n").unwrap();
        fs::write(dir.path().join("b.conv"), "INCLUDE c.conv\nPROMPT from b\n").unwrap();
        fs::write(dir.path().join("a.conv"), "INCLUDE b.conv\nPROMPT from a\n").unwrap();

        let registry = DirectiveRegistry::new();
        let c = Compiler::new(&registry).compile_file(&dir.path().join("a.conv")).unwrap();
        assert_eq!(
            c.steps,
            vec![Step::prompt("from c"), Step::prompt("from b"), Step::prompt("from a")]
        );
    }

    #[test]
    fn test_include_cycle_names_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.conv"), "PROMPT a\nINCLUDE b.conv\n").unwrap();
        fs::write(dir.path().join("b.conv"), "INCLUDE a.conv\n").unwrap();

        let registry = DirectiveRegistry::new();
        let err = Compiler::new(&registry)
            .compile_file(&dir.path().join("a.conv"))
            .unwrap_err();
        match err.as_parse() {
            Some(ParseError::IncludeCycle { cycle, .. }) => {
                assert!(cycle.first().unwrap().ends_with("a.conv"));
                assert!(cycle.last().unwrap().ends_with("a.conv"));
            }
            other => panic!("expected include cycle, got {:?}", other),
        }
        assert!(err.to_string().contains("a.conv"));
    }

    #[test]
    fn test_include_missing_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.conv"), "INCLUDE nope.conv\n").unwrap();
        let registry = DirectiveRegistry::new();
        let err = Compiler::new(&registry)
            .compile_file(&dir.path().join("a.conv"))
            .unwrap_err();
        assert!(matches!(err, CompileError::FileNotFound { .. }));
    }

    #[test]
    fn test_include_merges_lists_with_included_prologues_first() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("common.conv"),
            "PROLOGUE shared rules\nEPILOGUE shared footer\nCONTEXT @lib.rs\nREQUIRE cmd:git\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("main.conv"),
            "PROLOGUE main rules\nCONTEXT @main.rs\nINCLUDE common.conv\nEPILOGUE main footer\nPROMPT go\n",
        )
        .unwrap();

        let registry = DirectiveRegistry::new();
        let c = Compiler::new(&registry)
            .compile_file(&dir.path().join("main.conv"))
            .unwrap();
        assert_eq!(c.config.prologues, vec!["shared rules", "main rules"]);
        assert_eq!(c.config.epilogues, vec!["shared footer", "main footer"]);
        assert_eq!(c.config.context, vec!["@main.rs", "@lib.rs"]);
        assert_eq!(c.config.requirements, vec!["cmd:git"]);
    }

    #[test]
    fn test_unknown_directives_are_skipped() {
        let c = compile("FUTURE-THING 42\nPROMPT hi\n").unwrap();
        assert_eq!(c.steps, vec![Step::prompt("hi")]);
    }
}
