//! Context tracker - loads `@file` context and keeps the token budget

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{ContextError, PathFilter};
use crate::conversation::{DEFAULT_CONTEXT_LIMIT, WorkflowConfig};

/// Default model context window, in tokens
pub const DEFAULT_MAX_TOKENS: usize = 128_000;

/// Approximate token count: four characters per token
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// A loaded context file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub path: PathBuf,
    pub content: String,
    pub estimated_tokens: usize,
}

/// Budget snapshot returned by [`ContextTracker::status`]
#[derive(Debug, Clone, PartialEq)]
pub struct ContextStatus {
    pub files_loaded: usize,
    pub file_tokens: usize,
    pub conversation_tokens: usize,
    pub total_tokens: usize,
    /// Fraction of the window in use (0.0 - 1.0+)
    pub usage_percent: f64,
    pub near_limit: bool,
    pub available_tokens: usize,
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Tracks loaded files and conversation tokens against a context window
#[derive(Debug, Clone)]
pub struct ContextTracker {
    cwd: PathBuf,
    workflow_dir: Option<PathBuf>,
    max_tokens: usize,
    limit_threshold: f64,
    filter: Option<PathFilter>,
    files: Vec<ContextFile>,
    file_tokens: usize,
    conversation_tokens: usize,
}

impl ContextTracker {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            workflow_dir: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            limit_threshold: DEFAULT_CONTEXT_LIMIT,
            filter: None,
            files: Vec::new(),
            file_tokens: 0,
            conversation_tokens: 0,
        }
    }

    /// Build a tracker for a workflow: filter and near-limit fraction come from its config
    pub fn for_workflow(
        config: &WorkflowConfig,
        cwd: impl Into<PathBuf>,
        workflow_dir: impl Into<PathBuf>,
        max_tokens: usize,
    ) -> Result<Self, ContextError> {
        let cwd = cwd.into();
        let filter = PathFilter::from_config(config, cwd.clone())?;
        Ok(Self::new(cwd)
            .with_workflow_dir(workflow_dir)
            .with_max_tokens(max_tokens)
            .with_limit(config.effective_context_limit())
            .with_filter(filter))
    }

    pub fn with_workflow_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workflow_dir = Some(dir.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_limit(mut self, threshold: f64) -> Self {
        self.limit_threshold = threshold;
        self
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = if filter.is_empty() { None } else { Some(filter) };
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn files(&self) -> &[ContextFile] {
        &self.files
    }

    /// Resolve an `@pattern` to existing files
    ///
    /// Relative patterns are tried against the working directory first and
    /// then against the workflow file's directory. A directory resolves to
    /// every file below it.
    pub fn resolve_pattern(&self, pattern: &str) -> Result<Vec<PathBuf>, ContextError> {
        debug!(%pattern, "ContextTracker::resolve_pattern: called");
        let raw = pattern.trim().trim_start_matches('@');
        if raw.is_empty() {
            return Err(ContextError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        let candidate = Path::new(raw);
        if candidate.is_absolute() {
            return expand(candidate);
        }

        let mut bases = vec![self.cwd.as_path()];
        if let Some(dir) = &self.workflow_dir
            && dir != &self.cwd
        {
            bases.push(dir.as_path());
        }

        for base in bases {
            let found = expand(&base.join(raw))?;
            if !found.is_empty() {
                debug!(%pattern, base = %base.display(), count = found.len(), "ContextTracker::resolve_pattern: matched");
                return Ok(found);
            }
        }
        Ok(Vec::new())
    }

    /// Load one file; `None` when it is filtered out or already loaded
    pub fn add_file(&mut self, path: &Path) -> Result<Option<ContextFile>, ContextError> {
        debug!(?path, "ContextTracker::add_file: called");
        if let Some(filter) = &self.filter
            && !filter.allows(path)
        {
            debug!(?path, "ContextTracker::add_file: filtered out");
            return Ok(None);
        }
        if self.files.iter().any(|f| f.path == path) {
            return Ok(None);
        }
        if !path.is_file() {
            return Err(ContextError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = match fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(source) => {
                return Err(ContextError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let file = ContextFile {
            path: path.to_path_buf(),
            estimated_tokens: estimate_tokens(&content),
            content,
        };
        self.file_tokens += file.estimated_tokens;
        self.files.push(file.clone());
        Ok(Some(file))
    }

    /// Resolve a pattern and load every match
    pub fn add_pattern(&mut self, pattern: &str) -> Result<Vec<ContextFile>, ContextError> {
        let mut added = Vec::new();
        for path in self.resolve_pattern(pattern)? {
            if let Some(file) = self.add_file(&path)? {
                added.push(file);
            }
        }
        debug!(%pattern, added = added.len(), "ContextTracker::add_pattern: complete");
        Ok(added)
    }

    /// Load CONTEXT and CONTEXT-OPTIONAL patterns
    ///
    /// Mandatory patterns that match nothing are an error unless `lenient`,
    /// in which case they are returned for the caller to warn about.
    pub fn load_workflow_context(&mut self, config: &WorkflowConfig, lenient: bool) -> Result<Vec<String>, ContextError> {
        let mut missing = Vec::new();
        for pattern in &config.context {
            if self.resolve_pattern(pattern)?.is_empty() {
                missing.push(pattern.clone());
                continue;
            }
            self.add_pattern(pattern)?;
        }
        for pattern in &config.context_optional {
            self.add_pattern(pattern)?;
        }

        if !missing.is_empty() {
            if !lenient {
                return Err(ContextError::MissingContextFiles { patterns: missing });
            }
            warn!(patterns = ?missing, "Mandatory context missing (lenient mode)");
        }
        info!(files = self.files.len(), tokens = self.file_tokens, "Loaded workflow context");
        Ok(missing)
    }

    /// Count one prompt/response exchange toward the budget
    pub fn add_conversation_turn(&mut self, prompt: &str, response: &str) {
        self.conversation_tokens += estimate_tokens(prompt) + estimate_tokens(response);
    }

    /// Replace the conversation estimate with an adapter-reported figure
    pub fn set_conversation_tokens(&mut self, tokens: usize) {
        self.conversation_tokens = tokens;
    }

    pub fn reset_conversation(&mut self) {
        self.conversation_tokens = 0;
    }

    /// Evict every loaded file
    pub fn clear_files(&mut self) {
        debug!(files = self.files.len(), "ContextTracker::clear_files: called");
        self.file_tokens -= self.files.iter().map(|f| f.estimated_tokens).sum::<usize>();
        self.files.clear();
    }

    pub fn used_tokens(&self) -> usize {
        self.file_tokens + self.conversation_tokens
    }

    pub fn status(&self) -> ContextStatus {
        let used = self.used_tokens();
        let usage_percent = if self.max_tokens == 0 {
            0.0
        } else {
            used as f64 / self.max_tokens as f64
        };
        let budget = (self.max_tokens as f64 * self.limit_threshold).floor() as usize;
        ContextStatus {
            files_loaded: self.files.len(),
            file_tokens: self.file_tokens,
            conversation_tokens: self.conversation_tokens,
            total_tokens: used,
            usage_percent,
            near_limit: usage_percent >= self.limit_threshold,
            available_tokens: budget.saturating_sub(used),
        }
    }

    /// Rendered context block, one fenced section per file
    pub fn render(&self) -> String {
        if self.files.is_empty() {
            return String::new();
        }
        let mut out = String::from("# Context Files\n");
        for file in &self.files {
            let shown = file.path.strip_prefix(&self.cwd).unwrap_or(&file.path);
            let lang = file.path.extension().and_then(|e| e.to_str()).unwrap_or("");
            out.push_str(&format!(
                "\n## {}\n\n```{}\n{}\n```\n",
                shown.display(),
                lang,
                file.content.trim_end_matches('\n')
            ));
        }
        out
    }
}

/// Check that every mandatory CONTEXT pattern resolves, without loading anything
///
/// Returns the unmatched patterns in lenient mode; strict mode turns them
/// into [`ContextError::MissingContextFiles`].
pub fn validate_context(config: &WorkflowConfig, cwd: &Path, workflow_dir: &Path) -> Result<Vec<String>, ContextError> {
    debug!(patterns = config.context.len(), "validate_context: called");
    let tracker = ContextTracker::new(cwd).with_workflow_dir(workflow_dir);
    let mut missing = Vec::new();
    for pattern in &config.context {
        if tracker.resolve_pattern(pattern)?.is_empty() {
            missing.push(pattern.clone());
        }
    }
    if !missing.is_empty() && !config.is_lenient() {
        return Err(ContextError::MissingContextFiles { patterns: missing });
    }
    Ok(missing)
}

/// Expand a joined path: glob, directory walk, or literal file
fn expand(path: &Path) -> Result<Vec<PathBuf>, ContextError> {
    let text = path.to_string_lossy();
    if is_glob(&text) {
        let paths = glob::glob(&text).map_err(|e| ContextError::InvalidPattern {
            pattern: text.to_string(),
            reason: e.to_string(),
        })?;
        let mut found: Vec<PathBuf> = paths.filter_map(Result::ok).filter(|p| p.is_file()).collect();
        found.sort();
        return Ok(found);
    }

    if path.is_dir() {
        let mut found: Vec<PathBuf> = WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        found.sort();
        return Ok(found);
    }

    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    Ok(Vec::new())
}
