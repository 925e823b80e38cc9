//! Template variables: `{{CYCLE_NUMBER}}`, `{{DATE}}`, `{{GIT_BRANCH}}`, ...
//!
//! Substitution is one pass of plain text replacement. Unknown placeholders
//! stay as they are and substituted values are never expanded again.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Local;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

static VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("variable regex is valid"));

pub const CYCLE_NUMBER: &str = "CYCLE_NUMBER";
pub const CYCLE_TOTAL: &str = "CYCLE_TOTAL";

/// Named values substituted into prompt text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    vars: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// DATE, DATETIME, CWD and, inside a git checkout, GIT_BRANCH and GIT_COMMIT
    pub async fn standard(cwd: &Path) -> Self {
        debug!(?cwd, "TemplateVars::standard: called");
        let now = Local::now();
        let mut vars = Self::new()
            .with("DATE", now.format("%Y-%m-%d").to_string())
            .with("DATETIME", now.format("%Y-%m-%d %H:%M:%S").to_string())
            .with("CWD", cwd.display().to_string());

        if let Some(branch) = git_value(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
            vars.set("GIT_BRANCH", branch);
        }
        if let Some(commit) = git_value(cwd, &["rev-parse", "--short", "HEAD"]).await {
            vars.set("GIT_COMMIT", commit);
        }
        vars
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// WORKFLOW_NAME and WORKFLOW_PATH; only added when the caller opts in
    pub fn set_workflow(&mut self, name: &str, path: Option<&Path>) {
        self.set("WORKFLOW_NAME", name);
        if let Some(path) = path {
            self.set("WORKFLOW_PATH", path.display().to_string());
        }
    }

    pub fn set_cycle(&mut self, cycle: u32, total: u32) {
        self.set(CYCLE_NUMBER, cycle.to_string());
        self.set(CYCLE_TOTAL, total.to_string());
    }

    pub fn extend<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.set(k, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn substitute(&self, text: &str) -> String {
        if self.vars.is_empty() {
            return text.to_string();
        }
        VAR_RE
            .replace_all(text, |caps: &Captures| match self.vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

async fn git_value(cwd: &Path, args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}
