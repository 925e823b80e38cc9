//! CycleOrchestrator - runs a compiled conversation against an adapter
//!
//! One cycle is one pass over the merged step list. Between cycles the
//! session is kept (accumulate), compacted (compact) or replaced together
//! with a fresh context load (fresh). Every response goes through the loop
//! detector; a verdict ends the run as a controlled stop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::prompt::{PromptFrame, PromptPosition};
use super::{
    Checkpoint, CommandError, CommandOutput, CommandRunner, NullHost, RunFailure, RunOutcome, RunReport, StepHost,
    StepOutcome, TemplateVars, TurnRecord, truncate_output,
};
use crate::adapter::{Adapter, Session, SessionConfig, SessionStats, StreamChunk};
use crate::context::{ContextTracker, DEFAULT_MAX_TOKENS, render_all};
use crate::conversation::{
    CONSULT_PAYLOAD_CHARS, ContextLimitPolicy, Compiler, Conversation, DEFAULT_RETRY_PROMPT, DEFAULT_RUN_TIMEOUT,
    DirectiveRegistry, KIND_CONSULT, KIND_CUSTOM, KIND_HELP, KIND_LSP, KIND_REFCAT, KIND_RUN, KIND_VERIFY,
    MergedPrompt, OnError, OutputPolicy, RunStep, SessionMode, Step, fill_placeholders, help, placeholder,
    validate_requirements,
};
use crate::detector::{DetectorConfig, LoopDetector, read_stop_file};
use crate::error::{ConvoError, StepRef};

/// Checkpoint directory used when none is configured, relative to the working directory
pub const DEFAULT_CHECKPOINT_DIR: &str = ".convofile/checkpoints";

/// Per-run settings supplied by the caller
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Working directory: context base, RUN directory and stop-file location
    pub cwd: PathBuf,
    /// Stop-file nonce; generated when `None`
    pub nonce: Option<String>,
    /// Context window used for the token budget
    pub max_tokens: usize,
    pub detector: DetectorConfig,
    /// Extra template variables (batch component variables)
    pub variables: BTreeMap<String, String>,
    /// Expose WORKFLOW_NAME / WORKFLOW_PATH to templates
    pub expose_workflow_vars: bool,
    pub checkpoint_dir: Option<PathBuf>,
    /// RUN timeout used when the workflow does not set RUN-TIMEOUT
    pub run_timeout: Option<Duration>,
    /// Receives streamed chunks of every agent turn
    pub stream: Option<mpsc::Sender<StreamChunk>>,
}

impl OrchestratorOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            nonce: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            detector: DetectorConfig::default(),
            variables: BTreeMap::new(),
            expose_workflow_vars: false,
            checkpoint_dir: None,
            run_timeout: None,
            stream: None,
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }
}

/// Whether execution goes on after a step
#[derive(Debug)]
enum Flow {
    Continue,
    Stop(RunOutcome),
}

/// Drives one workflow instance
pub struct CycleOrchestrator {
    conversation: Conversation,
    adapter: Arc<dyn Adapter>,
    host: Arc<dyn StepHost>,
    options: OrchestratorOptions,
    cwd: PathBuf,
    workflow_dir: PathBuf,
    runner: CommandRunner,
    tracker: ContextTracker,
    detector: LoopDetector,
    vars: TemplateVars,
    session: Option<Session>,
    started: bool,
    /// The current session has not yet been told about the stop file
    instruction_pending: bool,
    /// HELP-INLINE text waiting for the next prompt
    pending_prefix: Vec<String>,
    /// 0-based
    cycle: u32,
    report: RunReport,
}

impl CycleOrchestrator {
    pub fn new(
        conversation: Conversation,
        adapter: Arc<dyn Adapter>,
        options: OrchestratorOptions,
    ) -> Result<Self, ConvoError> {
        let workflow_dir = conversation.base_dir();
        let cwd = match &conversation.config.cwd {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => options.cwd.join(dir),
            None => options.cwd.clone(),
        };
        debug!(workflow = %conversation.name(), ?cwd, ?workflow_dir, "CycleOrchestrator::new: called");

        let mut run_settings = conversation.config.run.clone();
        if let Some(timeout) = options.run_timeout
            && run_settings.timeout == DEFAULT_RUN_TIMEOUT
        {
            run_settings.timeout = timeout;
        }
        let runner = CommandRunner::new(run_settings, cwd.clone());
        let tracker = ContextTracker::for_workflow(&conversation.config, cwd.clone(), workflow_dir.clone(), options.max_tokens)?;
        let detector = LoopDetector::new(cwd.clone(), options.nonce.clone()).with_config(options.detector.clone());
        let report = RunReport::new(conversation.name());

        Ok(Self {
            conversation,
            adapter,
            host: Arc::new(NullHost),
            options,
            cwd,
            workflow_dir,
            runner,
            tracker,
            detector,
            vars: TemplateVars::new(),
            session: None,
            started: false,
            instruction_pending: false,
            pending_prefix: Vec::new(),
            cycle: 0,
            report,
        })
    }

    /// Use `host` for VERIFY*, LSP and custom directives
    pub fn with_host(mut self, host: Arc<dyn StepHost>) -> Self {
        self.host = host;
        self
    }

    pub fn nonce(&self) -> &str {
        self.detector.nonce()
    }

    pub fn tracker(&self) -> &ContextTracker {
        &self.tracker
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Run every cycle; a failure still carries the partial report
    pub async fn run(mut self) -> Result<RunReport, RunFailure> {
        info!(
            "Starting workflow {} ({} cycles, session mode {})",
            self.report.workflow,
            self.conversation.config.cycles(),
            self.conversation.config.session_mode
        );
        let result = self.execute().await;
        self.shutdown().await;
        match result {
            Ok(outcome) => {
                info!(workflow = %self.report.workflow, outcome = %outcome.summary(), "Workflow finished");
                self.report.outcome = outcome;
                Ok(self.report)
            }
            Err(e) => {
                error!(workflow = %self.report.workflow, error = %e, "Workflow failed");
                Err(RunFailure::new(e, self.report))
            }
        }
    }

    async fn execute(&mut self) -> Result<RunOutcome, ConvoError> {
        debug!(workflow = %self.report.workflow, "execute: called");
        self.check_preconditions()?;
        self.init_vars().await;

        self.adapter
            .start()
            .await
            .map_err(|e| ConvoError::from_adapter(e, None))?;
        self.started = true;

        if let Some(point) = self.conversation.config.pause_points.iter().find(|p| p.after_step.is_none()) {
            return Ok(RunOutcome::Paused {
                after_step: None,
                message: point.message.clone(),
                consult: false,
            });
        }

        let total = self.conversation.config.cycles();
        let steps = self.conversation.steps.clone();
        let prompt_total = steps.iter().filter(|s| s.is_agent_turn()).count();

        for cycle in 0..total {
            self.cycle = cycle;
            self.vars.set_cycle(cycle + 1, total);
            info!("Workflow {} cycle {}/{}", self.report.workflow, cycle + 1, total);
            self.begin_cycle().await?;

            if let Flow::Stop(outcome) = self.run_cycle(&steps, prompt_total).await? {
                debug!(cycle, "execute: stopped early");
                return Ok(outcome);
            }
            self.report.cycles_completed += 1;
        }
        Ok(RunOutcome::Completed)
    }

    /// Stop file, REQUIRE entries and mandatory context, all before any adapter call
    fn check_preconditions(&mut self) -> Result<(), ConvoError> {
        debug!(cwd = ?self.cwd, "check_preconditions: called");
        if let Some(request) = read_stop_file(&self.cwd, self.detector.nonce()) {
            warn!(reason = %request.reason, "Stop file present before start");
            return Err(ConvoError::StopFilePresent {
                path: self.detector.stop_file_path(),
                reason: request.reason,
            });
        }

        let lenient = self.conversation.config.is_lenient();
        let issues = validate_requirements(&self.conversation.config, &self.workflow_dir);
        if !issues.is_empty() {
            if !lenient {
                return Err(ConvoError::Requirements { issues });
            }
            for issue in issues {
                warn!(requirement = %issue.requirement, reason = %issue.reason, "Requirement not met (lenient mode)");
                self.report
                    .warnings
                    .push(format!("Requirement not met: {} ({})", issue.requirement, issue.reason));
            }
        }

        let missing = self.tracker.load_workflow_context(&self.conversation.config, lenient)?;
        for pattern in missing {
            self.report
                .warnings
                .push(format!("Mandatory context matched no files: {}", pattern));
        }
        Ok(())
    }

    async fn init_vars(&mut self) {
        let mut vars = TemplateVars::standard(&self.cwd).await;
        if self.options.expose_workflow_vars {
            vars.set_workflow(&self.conversation.name(), self.conversation.source());
        }
        vars.extend(self.options.variables.clone());
        self.vars = vars;
    }

    /// Apply the session policy before the cycle's first step
    async fn begin_cycle(&mut self) -> Result<(), ConvoError> {
        let mode = self.conversation.config.session_mode;
        debug!(cycle = self.cycle, %mode, "begin_cycle: called");
        match mode {
            SessionMode::Fresh => {
                self.end_session().await?;
                if self.cycle > 0 {
                    self.tracker.clear_files();
                    let lenient = self.conversation.config.is_lenient();
                    let missing = self.tracker.load_workflow_context(&self.conversation.config, lenient)?;
                    if !missing.is_empty() {
                        warn!(patterns = ?missing, cycle = self.cycle, "Context missing on reload");
                    }
                }
                self.new_session().await?;
            }
            SessionMode::Compact if self.cycle > 0 => {
                let at = StepRef {
                    cycle: self.cycle + 1,
                    step: 0,
                };
                if let Some(session) = self.session.clone() {
                    info!(cycle = self.cycle, "Compacting session between cycles");
                    self.adapter
                        .compact(&session)
                        .await
                        .map_err(|e| ConvoError::from_adapter(e, Some(at)))?;
                    self.sync_after_compaction(&session).await;
                }
            }
            SessionMode::Accumulate | SessionMode::Compact => {}
        }
        self.ensure_session().await?;
        Ok(())
    }

    async fn run_cycle(&mut self, steps: &[Step], prompt_total: usize) -> Result<Flow, ConvoError> {
        let mut prompt_index = 0;
        for (idx, step) in steps.iter().enumerate() {
            let at = StepRef {
                cycle: self.cycle + 1,
                step: idx,
            };
            let position = if step.is_agent_turn() {
                prompt_index += 1;
                PromptPosition::top(prompt_index - 1, prompt_total)
            } else {
                PromptPosition::inner()
            };
            debug!(%at, step_type = step.type_name(), "run_cycle: executing step");

            if let Flow::Stop(outcome) = self.execute_step(step, at, position).await? {
                return Ok(Flow::Stop(outcome));
            }

            let config = &self.conversation.config;
            if let Some(point) = config.pause_after(idx) {
                info!(%at, message = %point.message, "Pause point reached");
                return Ok(Flow::Stop(RunOutcome::Paused {
                    after_step: Some(idx),
                    message: point.message.clone(),
                    consult: false,
                }));
            }
            if let Some(point) = config.consult_after(idx) {
                info!(%at, message = %point.message, "Consult point reached");
                return Ok(Flow::Stop(RunOutcome::Paused {
                    after_step: Some(idx),
                    message: point.message.clone(),
                    consult: true,
                }));
            }
        }

        if !self.pending_prefix.is_empty() {
            warn!(cycle = self.cycle, "HELP-INLINE at the end of the workflow has no prompt to join");
            self.pending_prefix.clear();
        }
        Ok(Flow::Continue)
    }

    async fn execute_step(&mut self, step: &Step, at: StepRef, position: PromptPosition) -> Result<Flow, ConvoError> {
        match step {
            Step::Prompt { text } => {
                let prompt = self.assemble_prompt(text, position, &[]);
                self.send_turn(prompt, at).await
            }
            Step::MergedPrompt(merged) => {
                let substitutions = self.resolve_merged(merged, at).await?;
                let prompt = self.assemble_prompt(&merged.content, position, &substitutions);
                self.send_turn(prompt, at).await
            }
            Step::Run(run) => self.execute_run(run, at).await,
            Step::Checkpoint { name } => {
                self.write_checkpoint(name.clone(), at)?;
                Ok(Flow::Continue)
            }
            Step::Compact { preserve } => self.compact_step(preserve, at).await,
            Step::NewConversation => {
                info!(%at, "Starting a new conversation");
                self.end_session().await?;
                self.new_session().await?;
                Ok(Flow::Continue)
            }
            Step::Elide => Ok(Flow::Continue),
            Step::Verify(_) | Step::VerifyTrace { .. } | Step::VerifyCoverage { .. } => {
                let outcome = self.host_step(step, at).await?;
                let (on_failure, on_success) = step.blocks();
                let label = step_label(step);
                self.handle_check(&label, outcome, on_failure, on_success, at, false)
                    .await
            }
            Step::Lsp { .. } => {
                let outcome = self.host_step(step, at).await?;
                self.handle_check("LSP", outcome, &[], &[], at, true).await
            }
            Step::Custom { name, content } => {
                let content = self.vars.substitute(content);
                let outcome = self
                    .host
                    .custom(name, &content, &self.cwd)
                    .await
                    .map_err(|source| ConvoError::Command { at, source })?;
                self.handle_check(name, outcome, &[], &[], at, true).await
            }
            Step::Refcat { refs } => {
                let excerpts = render_all(refs, &self.cwd, &self.workflow_dir)?;
                self.send_turn(format!("Referenced code:\n\n{}", excerpts), at).await
            }
            Step::HelpInline { topics, merge_with_next } => {
                let text = help::render(topics);
                if *merge_with_next {
                    self.pending_prefix.push(text);
                    Ok(Flow::Continue)
                } else {
                    self.send_turn(text, at).await
                }
            }
            Step::Consult { text } => Ok(Flow::Stop(RunOutcome::Paused {
                after_step: Some(at.step),
                message: text.clone(),
                consult: true,
            })),
            Step::Pause { text } => Ok(Flow::Stop(RunOutcome::Paused {
                after_step: Some(at.step),
                message: text.clone(),
                consult: false,
            })),
        }
    }

    /// Execute the steps of an ON-FAILURE / ON-SUCCESS block
    fn run_block<'a>(&'a mut self, steps: &'a [Step], at: StepRef) -> BoxFuture<'a, Result<Flow, ConvoError>> {
        async move {
            debug!(%at, count = steps.len(), "run_block: called");
            for step in steps {
                if let Flow::Stop(outcome) = self.execute_step(step, at, PromptPosition::inner()).await? {
                    return Ok(Flow::Stop(outcome));
                }
            }
            Ok(Flow::Continue)
        }
        .boxed()
    }

    /// Compose an agent turn and fill in merged placeholders
    fn assemble_prompt(&mut self, body: &str, position: PromptPosition, substitutions: &[(String, String)]) -> String {
        let context = if position.is_first() {
            self.tracker.render()
        } else {
            String::new()
        };
        let frame = PromptFrame {
            config: &self.conversation.config,
            vars: &self.vars,
            cycle: self.cycle,
            context: &context,
        };
        let body = fill_placeholders(&self.vars.substitute(body), substitutions);
        frame.compose_resolved(std::mem::take(&mut self.pending_prefix), body, position)
    }

    /// Execute the commands folded into a merged turn and pair each placeholder with its output
    async fn resolve_merged(&mut self, merged: &MergedPrompt, at: StepRef) -> Result<Vec<(String, String)>, ConvoError> {
        debug!(%at, runs = merged.run_commands.len(), verifies = merged.verify_commands.len(), "resolve_merged: called");
        let mut subs = Vec::new();

        let output_limit = self.runner.settings().output_limit;
        for (i, command) in merged.run_commands.iter().enumerate() {
            let output = self.run_command(command, at).await?;
            if !output.passed() {
                warn!(%at, %command, status = %output.status_line(), "RUN inside merged turn failed; output goes to the agent");
                self.report
                    .warnings
                    .push(format!("{}: RUN `{}` {}", at, command, output.status_line()));
            }
            subs.push((placeholder(KIND_RUN, i, command), output.render(output_limit)));
        }

        let verify_limit = self.conversation.config.verify.limit;
        for (i, line) in merged.verify_commands.iter().enumerate() {
            let outcome = self.host_line(line, at).await?;
            subs.push((placeholder(KIND_VERIFY, i, line), truncate_output(&outcome.output, verify_limit)));
        }

        for (i, refs) in merged.refcat_commands.iter().enumerate() {
            let list: Vec<String> = refs.split_whitespace().map(String::from).collect();
            let excerpts = render_all(&list, &self.cwd, &self.workflow_dir)?;
            subs.push((placeholder(KIND_REFCAT, i, refs), excerpts));
        }

        for (i, payload) in merged.lsp_commands.iter().enumerate() {
            let outcome = self.host_line(&format!("LSP {}", payload), at).await?;
            subs.push((placeholder(KIND_LSP, i, payload), truncate_output(&outcome.output, verify_limit)));
        }

        for (i, topics) in merged.help_commands.iter().enumerate() {
            let names: Vec<String> = topics.split_whitespace().map(String::from).collect();
            subs.push((placeholder(KIND_HELP, i, topics), help::render(&names)));
        }

        for (i, (name, content)) in merged.custom_directives.iter().enumerate() {
            let content = self.vars.substitute(content);
            let outcome = self
                .host
                .custom(name, &content, &self.cwd)
                .await
                .map_err(|source| ConvoError::Command { at, source })?;
            subs.push((placeholder(KIND_CUSTOM, i, name), outcome.output));
        }

        for (i, text) in merged.consult_commands.iter().enumerate() {
            let short: String = text.chars().take(CONSULT_PAYLOAD_CHARS).collect();
            subs.push((placeholder(KIND_CONSULT, i, &short), text.clone()));
        }

        Ok(subs)
    }

    /// Run a command; a binary that cannot be started counts as a failed run
    async fn run_command(&self, command: &str, at: StepRef) -> Result<CommandOutput, ConvoError> {
        match self.runner.run(command).await {
            Ok(output) => Ok(output),
            Err(CommandError::Spawn { command, source }) => {
                warn!(%at, %command, error = %source, "RUN could not start");
                Ok(CommandOutput::spawn_failure(
                    command,
                    source.to_string(),
                    self.runner.settings().timeout,
                ))
            }
            Err(source) => Err(ConvoError::Command { at, source }),
        }
    }

    /// RUN with ON-FAILURE > RUN-RETRY > RUN-ON-ERROR precedence
    async fn execute_run(&mut self, run: &RunStep, at: StepRef) -> Result<Flow, ConvoError> {
        let settings = self.runner.settings().clone();
        let mut attempt = 0;
        loop {
            let output = self.run_command(&run.command, at).await?;
            let rendered = output.render(settings.output_limit);

            if output.passed() {
                debug!(%at, command = %run.command, "execute_run: passed");
                if settings.output.should_send(false)
                    && let Flow::Stop(outcome) = self.send_turn(rendered, at).await?
                {
                    return Ok(Flow::Stop(outcome));
                }
                return self.run_block(&run.on_success, at).await;
            }

            warn!(%at, command = %run.command, status = %output.status_line(), attempt, "RUN failed");

            if !run.on_failure.is_empty() {
                if settings.output.should_send(true)
                    && let Flow::Stop(outcome) = self.send_turn(rendered, at).await?
                {
                    return Ok(Flow::Stop(outcome));
                }
                return self.run_block(&run.on_failure, at).await;
            }

            if attempt < run.retry_count {
                attempt += 1;
                let retry_prompt = run.retry_prompt.as_deref().unwrap_or(DEFAULT_RETRY_PROMPT);
                info!(%at, attempt, max = run.retry_count, "Retrying RUN after agent fix");
                let prompt = format!("{}\n\n{}", rendered, self.vars.substitute(retry_prompt));
                if let Flow::Stop(outcome) = self.send_turn(prompt, at).await? {
                    return Ok(Flow::Stop(outcome));
                }
                continue;
            }

            if settings.output.should_send(true)
                && let Flow::Stop(outcome) = self.send_turn(rendered.clone(), at).await?
            {
                return Ok(Flow::Stop(outcome));
            }

            return match settings.on_error {
                OnError::Stop => Err(ConvoError::RunCommandFailed {
                    at,
                    command: run.command.clone(),
                    status: output.status_line(),
                    output: rendered,
                }),
                OnError::Continue => {
                    self.report
                        .warnings
                        .push(format!("{}: RUN `{}` {}", at, run.command, output.status_line()));
                    Ok(Flow::Continue)
                }
            };
        }
    }

    /// Send host output and pick the follow-up: ON-SUCCESS, ON-FAILURE or VERIFY-ON-ERROR
    ///
    /// Informational steps (LSP, custom directives) send their output on
    /// success unless VERIFY-OUTPUT is `never`.
    async fn handle_check(
        &mut self,
        label: &str,
        outcome: StepOutcome,
        on_failure: &[Step],
        on_success: &[Step],
        at: StepRef,
        informational: bool,
    ) -> Result<Flow, ConvoError> {
        let settings = self.conversation.config.verify.clone();
        let send = match (outcome.passed, informational) {
            (true, true) => settings.output != OutputPolicy::Never,
            (passed, _) => settings.output.should_send(!passed),
        };
        if send
            && !outcome.output.trim().is_empty()
            && let Flow::Stop(stop) = self.send_turn(truncate_output(&outcome.output, settings.limit), at).await?
        {
            return Ok(Flow::Stop(stop));
        }

        if outcome.passed {
            return self.run_block(on_success, at).await;
        }
        warn!(%at, %label, "Check failed");
        if !on_failure.is_empty() {
            return self.run_block(on_failure, at).await;
        }
        match settings.on_error {
            OnError::Stop => Err(ConvoError::VerifyFailed {
                at,
                step: label.to_string(),
                output: outcome.output,
            }),
            OnError::Continue => {
                self.report.warnings.push(format!("{}: {} failed", at, label));
                Ok(Flow::Continue)
            }
        }
    }

    async fn host_step(&self, step: &Step, at: StepRef) -> Result<StepOutcome, ConvoError> {
        let result = match step {
            Step::Verify(verify) => self.host.verify(verify, &self.cwd).await,
            Step::VerifyTrace { from, to, .. } => self.host.verify_trace(from, to, &self.cwd).await,
            Step::VerifyCoverage { check, .. } => self.host.verify_coverage(check, &self.cwd).await,
            Step::Lsp { query, options } => self.host.lsp(query, options, &self.cwd).await,
            other => Ok(StepOutcome::failed(format!(
                "{} steps are not executed by the step host",
                other.type_name()
            ))),
        };
        result.map_err(|source| ConvoError::Command { at, source })
    }

    /// Re-compile a directive line kept by the merger and run it on the host
    async fn host_line(&self, line: &str, at: StepRef) -> Result<StepOutcome, ConvoError> {
        let registry = DirectiveRegistry::new();
        let compiled = Compiler::new(&registry).compile_str(line)?;
        match compiled.steps.first() {
            Some(step) => self.host_step(step, at).await,
            None => Ok(StepOutcome::failed(format!("cannot execute `{}`", line))),
        }
    }

    async fn compact_step(&mut self, preserve: &[String], at: StepRef) -> Result<Flow, ConvoError> {
        if self.session.is_none() {
            return Ok(Flow::Continue);
        }
        let usage = self.tracker.status().usage_percent;
        let min = self.conversation.config.compaction_min.unwrap_or(0.0);
        if usage < min {
            debug!(%at, usage, min, "compact_step: below COMPACTION-MIN, skipped");
            return Ok(Flow::Continue);
        }
        debug!(%at, ?preserve, usage, "compact_step: compacting");
        let summary = self.conversation.config.compact_summary.clone();
        self.compact_session(summary, at).await
    }

    /// Optionally send a preamble, then ask the adapter to compact
    async fn compact_session(&mut self, preamble: Option<String>, at: StepRef) -> Result<Flow, ConvoError> {
        if let Some(text) = preamble {
            let text = self.vars.substitute(&text);
            if let Flow::Stop(outcome) = self.exchange(text, at).await? {
                return Ok(Flow::Stop(outcome));
            }
        }
        let session = self.ensure_session().await?.clone();
        info!(%at, session = %session.id, "Compacting session");
        self.adapter
            .compact(&session)
            .await
            .map_err(|e| ConvoError::from_adapter(e, Some(at)))?;
        self.sync_after_compaction(&session).await;
        Ok(Flow::Continue)
    }

    async fn sync_after_compaction(&mut self, session: &Session) {
        match self.adapter.session_stats(session).await {
            Ok(SessionStats {
                context_tokens: Some(tokens),
                ..
            }) => {
                let files = self.tracker.status().file_tokens;
                self.tracker.set_conversation_tokens(tokens.saturating_sub(files));
            }
            _ => self.tracker.reset_conversation(),
        }
    }

    /// ON-CONTEXT-LIMIT handling before an agent turn (accumulate mode)
    async fn check_context_limit(&mut self, at: StepRef) -> Result<Option<Flow>, ConvoError> {
        if self.conversation.config.session_mode != SessionMode::Accumulate {
            return Ok(None);
        }
        let status = self.tracker.status();
        if !status.near_limit || status.conversation_tokens == 0 {
            return Ok(None);
        }
        warn!(%at, usage = status.usage_percent, "Context near limit");
        match self.conversation.config.on_context_limit {
            ContextLimitPolicy::Stop => Ok(Some(Flow::Stop(RunOutcome::ContextLimit {
                usage_percent: status.usage_percent,
            }))),
            ContextLimitPolicy::Compact => {
                let prompt = self.conversation.config.on_context_limit_prompt.clone();
                match self.compact_session(prompt, at).await? {
                    Flow::Stop(outcome) => Ok(Some(Flow::Stop(outcome))),
                    Flow::Continue => Ok(None),
                }
            }
        }
    }

    /// One agent turn, after the context-limit policy has had its say
    async fn send_turn(&mut self, prompt: String, at: StepRef) -> Result<Flow, ConvoError> {
        if let Some(flow) = self.check_context_limit(at).await? {
            return Ok(flow);
        }
        self.exchange(prompt, at).await
    }

    /// Send, account and loop-check one prompt
    async fn exchange(&mut self, prompt: String, at: StepRef) -> Result<Flow, ConvoError> {
        let session = self.ensure_session().await?.clone();
        let prompt = if self.instruction_pending {
            self.instruction_pending = false;
            format!("{}\n\n{}", prompt, self.detector.stop_file_instruction())
        } else {
            prompt
        };
        debug!(%at, session = %session.id, prompt_len = prompt.len(), "exchange: sending");

        let response = self
            .adapter
            .send(&session, &prompt, self.options.stream.clone())
            .await
            .map_err(|e| ConvoError::from_adapter(e, Some(at)))?;
        self.report.turns += 1;
        self.tracker.add_conversation_turn(&prompt, &response.text);

        let stats = match self.adapter.session_stats(&session).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(%at, error = %e, "Failed to read session stats");
                SessionStats::default()
            }
        };
        if let Some(tokens) = stats.context_tokens {
            let files = self.tracker.status().file_tokens;
            self.tracker.set_conversation_tokens(tokens.saturating_sub(files));
        }

        let verdict = self
            .detector
            .check(response.reasoning.as_deref(), &response.text, self.cycle, stats.tool_calls);
        self.report.responses.push(TurnRecord {
            cycle: at.cycle,
            step: at.step,
            prompt,
            response: response.text,
        });

        match verdict {
            Some(verdict) if verdict.is_stop_file() => {
                info!(%at, detail = %verdict.detail, "Agent requested a stop; needs review");
                Ok(Flow::Stop(RunOutcome::StopRequested { verdict }))
            }
            Some(verdict) => {
                warn!(%at, reason = %verdict.reason, detail = %verdict.detail, "Loop detected");
                Ok(Flow::Stop(RunOutcome::LoopDetected { verdict }))
            }
            None => Ok(Flow::Continue),
        }
    }

    async fn ensure_session(&mut self) -> Result<&Session, ConvoError> {
        if self.session.is_none() {
            self.new_session().await?;
        }
        self.session
            .as_ref()
            .ok_or_else(|| ConvoError::from_adapter(crate::adapter::AdapterError::NotStarted, None))
    }

    async fn new_session(&mut self) -> Result<(), ConvoError> {
        let mut config = SessionConfig::from_workflow(&self.conversation.config, self.cwd.clone());
        config.streaming = self.options.stream.is_some();
        let session = self
            .adapter
            .create_session(&config)
            .await
            .map_err(|e| ConvoError::from_adapter(e, None))?;
        debug!(session = %session.id, "new_session: created");
        self.session = Some(session);
        self.instruction_pending = true;
        self.tracker.reset_conversation();
        Ok(())
    }

    async fn end_session(&mut self) -> Result<(), ConvoError> {
        if let Some(session) = self.session.take() {
            debug!(session = %session.id, "end_session: destroying");
            self.adapter
                .destroy_session(&session)
                .await
                .map_err(|e| ConvoError::from_adapter(e, None))?;
        }
        Ok(())
    }

    fn write_checkpoint(&mut self, name: Option<String>, at: StepRef) -> Result<(), ConvoError> {
        let mut checkpoint = Checkpoint::new(self.report.workflow.clone(), name, at.cycle, at.step);
        checkpoint.session_id = self.session.as_ref().map(|s| s.id.clone());
        checkpoint.turns = self.report.turns;
        checkpoint.used_tokens = self.tracker.used_tokens();
        checkpoint.last_response = self.report.last_response().map(String::from);

        let dir = self
            .options
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.cwd.join(DEFAULT_CHECKPOINT_DIR));
        let path = checkpoint.write(&dir)?;
        self.report.checkpoints.push(path);
        Ok(())
    }

    /// Close the session and stop the adapter; failures here are only logged
    async fn shutdown(&mut self) {
        if let Some(session) = self.session.take()
            && let Err(e) = self.adapter.close_session(&session).await
        {
            warn!(session = %session.id, error = %e, "Failed to close session");
        }
        if self.started
            && let Err(e) = self.adapter.stop().await
        {
            warn!(error = %e, "Adapter stop failed");
        }
    }
}

fn step_label(step: &Step) -> String {
    match step {
        Step::Verify(v) => format!("VERIFY {}", v.kind),
        Step::VerifyTrace { from, to, .. } => format!("VERIFY-TRACE {} -> {}", from, to),
        Step::VerifyCoverage { .. } => "VERIFY-COVERAGE".to_string(),
        other => other.type_name().to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::client::mock::MockAdapter;
    use crate::adapter::{AdapterError, AgentResponse};
    use crate::cycle::host::mock::ScriptedHost;
    use crate::detector::LoopReason;
    use crate::error::exit_codes;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const NONCE: &str = "testnonce";

    fn conversation(text: &str) -> Conversation {
        Conversation::parse(text, &DirectiveRegistry::new()).unwrap()
    }

    fn options(dir: &TempDir) -> OrchestratorOptions {
        OrchestratorOptions::new(dir.path()).with_nonce(NONCE)
    }

    async fn run(text: &str, adapter: Arc<MockAdapter>, options: OrchestratorOptions) -> Result<RunReport, RunFailure> {
        CycleOrchestrator::new(conversation(text), adapter, options)
            .unwrap()
            .run()
            .await
    }

    fn stop_file_name() -> String {
        format!("STOPAUTOMATION-{}.json", NONCE)
    }

    #[tokio::test]
    async fn test_stop_file_present_before_start() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(stop_file_name()), r#"{"reason": "needs review"}"#).unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));

        let failure = run("PROMPT go\n", adapter.clone(), options(&dir)).await.unwrap_err();
        match &failure.error {
            ConvoError::StopFilePresent { reason, .. } => assert_eq!(reason, "needs review"),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(failure.exit_code(), exit_codes::STOP_FILE_PRESENT);
        assert_eq!(adapter.call_count(), 0);
        assert_eq!(adapter.sessions_created(), 0);
    }

    #[tokio::test]
    async fn test_missing_context_fails_before_any_send() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));
        let failure = run("CONTEXT @missing.md\nPROMPT go\n", adapter.clone(), options(&dir))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ConvoError::MissingContext { .. }));
        assert_eq!(failure.exit_code(), exit_codes::MISSING_CONTEXT);
        assert_eq!(adapter.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_context_lenient_warns() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));
        let report = run(
            "VALIDATION-MODE lenient\nCONTEXT @missing.md\nPROMPT go\n",
            adapter.clone(),
            options(&dir),
        )
        .await
        .unwrap();
        assert!(report.outcome.is_completed());
        assert!(report.warnings.iter().any(|w| w.contains("@missing.md")));
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_prompt_assembly_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.md"), "remember this\n").unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2));
        let report = run(
            "CONTEXT @notes.md\nPROLOGUE be careful\nEPILOGUE summarize\nPROMPT first\nPROMPT second\n",
            adapter.clone(),
            options(&dir),
        )
        .await
        .unwrap();
        assert_eq!(report.turns, 2);

        let prompts = adapter.prompts();
        let first = &prompts[0];
        assert!(first.contains("# Context Files"));
        assert!(first.contains("remember this"));
        assert!(first.find("be careful").unwrap() < first.find("first").unwrap());
        assert!(!first.contains("summarize"));
        assert!(first.contains(&stop_file_name()));

        let second = &prompts[1];
        assert!(second.contains("second"));
        assert!(second.contains("summarize"));
        assert!(!second.contains("be careful"));
        assert!(!second.contains(&stop_file_name()));
    }

    #[tokio::test]
    async fn test_fresh_mode_new_session_every_cycle() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(3));
        let report = run("MAX-CYCLES 3\nSESSION-MODE fresh\nPROMPT go\n", adapter.clone(), options(&dir))
            .await
            .unwrap();
        assert_eq!(report.cycles_completed, 3);
        assert_eq!(adapter.sessions_created(), 3);
        assert_eq!(adapter.sessions_destroyed(), 3);
        assert!(adapter.prompts().iter().all(|p| p.contains(&stop_file_name())));
    }

    #[tokio::test]
    async fn test_accumulate_mode_reuses_session_with_continuation() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(3));
        let report = run(
            "MAX-CYCLES 3\nCONTINUATION-PROMPT keep going\nPROMPT go\n",
            adapter.clone(),
            options(&dir),
        )
        .await
        .unwrap();
        assert_eq!(report.cycles_completed, 3);
        assert_eq!(adapter.sessions_created(), 1);

        let prompts = adapter.prompts();
        assert!(!prompts[0].contains("keep going"));
        assert!(prompts[1].starts_with("keep going"));
        assert!(!prompts[1].contains(&stop_file_name()));
    }

    #[tokio::test]
    async fn test_compact_mode_compacts_between_cycles() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2));
        run("MAX-CYCLES 2\nSESSION-MODE compact\nPROMPT go\n", adapter.clone(), options(&dir))
            .await
            .unwrap();
        assert_eq!(adapter.compact_count(), 1);
        assert_eq!(adapter.sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_cycle_variables() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2));
        run(
            "MAX-CYCLES 2\nPROMPT cycle {{CYCLE_NUMBER}} of {{CYCLE_TOTAL}}\n",
            adapter.clone(),
            options(&dir),
        )
        .await
        .unwrap();
        let prompts = adapter.prompts();
        assert!(prompts[0].contains("cycle 1 of 2"));
        assert!(prompts[1].contains("cycle 2 of 2"));
    }

    #[tokio::test]
    async fn test_identical_responses_stop_as_loop() {
        let dir = tempdir().unwrap();
        let same = "I have reviewed everything and there is nothing left to change in this codebase at all. ".repeat(2);
        let adapter = Arc::new(MockAdapter::with_texts(vec![same.clone(), same.clone(), same]));
        let report = run("MAX-CYCLES 3\nPROMPT go\n", adapter.clone(), options(&dir))
            .await
            .unwrap();
        match &report.outcome {
            RunOutcome::LoopDetected { verdict } => {
                assert_eq!(verdict.reason, LoopReason::IdenticalResponses);
                assert_eq!(verdict.cycle, 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(report.outcome.exit_code(), exit_codes::LOOP_DETECTED);
        assert_eq!(report.cycles_completed, 1);
        assert_eq!(adapter.call_count(), 2);
    }

    /// Writes the stop file during its first turn
    struct StoppingAdapter {
        dir: PathBuf,
    }

    #[async_trait]
    impl Adapter for StoppingAdapter {
        fn name(&self) -> &str {
            "stopping"
        }

        async fn create_session(&self, config: &SessionConfig) -> Result<Session, AdapterError> {
            Ok(Session::new(config.model.clone()))
        }

        async fn send(
            &self,
            _session: &Session,
            _prompt: &str,
            _stream: Option<mpsc::Sender<StreamChunk>>,
        ) -> Result<AgentResponse, AdapterError> {
            fs::write(
                self.dir.join(stop_file_name()),
                r#"{"reason": "task complete", "needs_review": true}"#,
            )
            .map_err(|e| AdapterError::InvalidResponse(e.to_string()))?;
            Ok(AgentResponse::text("Done. ".repeat(30)))
        }

        async fn compact(&self, _session: &Session) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn destroy_session(&self, _session: &Session) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_file_written_by_agent_ends_run() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(StoppingAdapter {
            dir: dir.path().to_path_buf(),
        });
        let orchestrator =
            CycleOrchestrator::new(conversation("MAX-CYCLES 5\nPROMPT go\n"), adapter, options(&dir)).unwrap();
        let report = orchestrator.run().await.unwrap();
        match &report.outcome {
            RunOutcome::StopRequested { verdict } => {
                let request = verdict.stop_request.as_ref().unwrap();
                assert_eq!(request.reason, "task complete");
                assert!(request.needs_review);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(report.outcome.exit_code(), exit_codes::OK);
        assert_eq!(report.turns, 1);
    }

    #[tokio::test]
    async fn test_failed_run_stops_workflow() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2));
        let failure = run("RUN false\nPROMPT never sent\n", adapter.clone(), options(&dir))
            .await
            .unwrap_err();
        match &failure.error {
            ConvoError::RunCommandFailed { at, command, .. } => {
                assert_eq!(command, "false");
                assert_eq!(*at, StepRef { cycle: 1, step: 0 });
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(failure.exit_code(), exit_codes::RUN_COMMAND_FAILED);
        // Only the failure output was sent
        assert_eq!(adapter.call_count(), 1);
        assert!(adapter.prompts()[0].contains("Command `false` failed with exit code 1"));
    }

    #[tokio::test]
    async fn test_run_retry_prompts_agent() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(3));
        let failure = run("RUN false\nRUN-RETRY 2 \"try harder\"\n", adapter.clone(), options(&dir))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ConvoError::RunCommandFailed { .. }));
        let prompts = adapter.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].contains("try harder"));
        assert!(prompts[1].contains("try harder"));
        assert!(!prompts[2].contains("try harder"));
    }

    #[tokio::test]
    async fn test_on_failure_block_replaces_stop() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(3));
        let report = run(
            "RUN false\nON-FAILURE\nPROMPT fix it\nEND\nPROMPT next\n",
            adapter.clone(),
            options(&dir),
        )
        .await
        .unwrap();
        assert!(report.outcome.is_completed());
        let prompts = adapter.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[1].contains("fix it"));
        assert!(prompts[2].contains("next"));
    }

    #[tokio::test]
    async fn test_on_success_block_runs() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));
        run("RUN true\nON-SUCCESS\nPROMPT great\nEND\n", adapter.clone(), options(&dir))
            .await
            .unwrap();
        let prompts = adapter.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("great"));
    }

    #[tokio::test]
    async fn test_run_on_error_continue() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2));
        let report = run(
            "RUN-ON-ERROR continue\nRUN false\nPROMPT after\n",
            adapter.clone(),
            options(&dir),
        )
        .await
        .unwrap();
        assert!(report.outcome.is_completed());
        assert_eq!(adapter.call_count(), 2);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_elided_run_and_prompt_is_one_turn() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));
        let report = run("RUN echo merged\nELIDE\nPROMPT review the output\n", adapter.clone(), options(&dir))
            .await
            .unwrap();
        assert_eq!(report.turns, 1);
        let prompt = &adapter.prompts()[0];
        assert!(prompt.contains("```\nmerged\n```"));
        assert!(prompt.contains("review the output"));
        assert!(!prompt.contains("{{RUN:"));
    }

    #[tokio::test]
    async fn test_merged_outputs_are_not_substituted_again() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));
        let text = "PROLOGUE keep {{RUN:1:echo b}} literal\n\
                    RUN echo '{{RUN:1:echo b}}'\nELIDE\nRUN echo b\nELIDE\nPROMPT review\n";
        run(text, adapter.clone(), options(&dir)).await.unwrap();

        let prompt = &adapter.prompts()[0];
        assert!(prompt.contains("keep {{RUN:1:echo b}} literal"));
        assert!(prompt.contains("```\n{{RUN:1:echo b}}\n```"));
        assert!(prompt.contains("```\nb\n```"));
    }

    #[tokio::test]
    async fn test_pause_point_stops_after_step() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2));
        let report = run("PROMPT a\nPAUSE check the diff\nPROMPT b\n", adapter.clone(), options(&dir))
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            RunOutcome::Paused {
                after_step: Some(0),
                message: "check the diff".to_string(),
                consult: false,
            }
        );
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_verify_failure_stops_without_handler() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));
        let host = Arc::new(ScriptedHost::with_verify_results(vec![StepOutcome::failed("broken ref")]));
        let failure = CycleOrchestrator::new(conversation("VERIFY refs\n"), adapter.clone(), options(&dir))
            .unwrap()
            .with_host(host.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ConvoError::VerifyFailed { .. }));
        assert_eq!(host.calls(), vec!["verify refs".to_string()]);
        assert!(adapter.prompts()[0].contains("broken ref"));
    }

    #[tokio::test]
    async fn test_verify_failure_runs_on_failure_block() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2));
        let host = Arc::new(ScriptedHost::with_verify_results(vec![StepOutcome::failed("broken ref")]));
        let report = CycleOrchestrator::new(
            conversation("VERIFY refs\nON-FAILURE\nPROMPT fix refs\nEND\n"),
            adapter.clone(),
            options(&dir),
        )
        .unwrap()
        .with_host(host)
        .run()
        .await
        .unwrap();
        assert!(report.outcome.is_completed());
        assert!(adapter.prompts()[1].contains("fix refs"));
    }

    #[tokio::test]
    async fn test_lsp_output_sent_to_agent() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));
        let host = Arc::new(ScriptedHost::default());
        CycleOrchestrator::new(conversation("LSP definition Config\n"), adapter.clone(), options(&dir))
            .unwrap()
            .with_host(host.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(host.calls().len(), 1);
        assert!(adapter.prompts()[0].contains("definition of"));
    }

    #[tokio::test]
    async fn test_provider_abort_is_agent_aborted() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2).abort_at(0));
        let failure = run("PROMPT a\n", adapter.clone(), options(&dir)).await.unwrap_err();
        assert!(matches!(failure.error, ConvoError::AgentAborted { .. }));
        assert_eq!(failure.exit_code(), exit_codes::AGENT_ABORTED);
        assert_eq!(failure.report.turns, 0);
    }

    #[tokio::test]
    async fn test_context_limit_stop() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2).with_context_tokens(900));
        let report = run(
            "ON-CONTEXT-LIMIT stop\nPROMPT a\nPROMPT b\n",
            adapter.clone(),
            options(&dir).with_max_tokens(1000),
        )
        .await
        .unwrap();
        assert!(matches!(report.outcome, RunOutcome::ContextLimit { .. }));
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_context_limit_compacts() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2).with_context_tokens(900));
        let report = run("PROMPT a\nPROMPT b\n", adapter.clone(), options(&dir).with_max_tokens(1000))
            .await
            .unwrap();
        assert!(report.outcome.is_completed());
        assert_eq!(adapter.compact_count(), 1);
        assert_eq!(adapter.call_count(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_written() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));
        let mut opts = options(&dir);
        opts.checkpoint_dir = Some(dir.path().join("cps"));
        let report = run("PROMPT a\nCHECKPOINT mid\n", adapter, opts).await.unwrap();
        assert_eq!(report.checkpoints.len(), 1);
        let checkpoint = Checkpoint::load(&report.checkpoints[0]).unwrap();
        assert_eq!(checkpoint.name.as_deref(), Some("mid"));
        assert_eq!(checkpoint.turns, 1);
        assert!(checkpoint.session_id.is_some());
    }
}
