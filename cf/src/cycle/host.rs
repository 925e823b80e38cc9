//! Step host - executes VERIFY, VERIFY-TRACE, VERIFY-COVERAGE, LSP and custom directives
//!
//! These steps depend on tooling outside the orchestrator (link checkers,
//! coverage reports, language servers, plugins). The orchestrator hands them
//! to an injected [`StepHost`] and only deals with the resulting outcome.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::CommandError;
use crate::conversation::{CoverageCheck, VerifyStep};

/// Result of a host-executed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub passed: bool,
    /// Text shown to the agent
    pub output: String,
}

impl StepOutcome {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

/// Executes the steps the orchestrator does not run itself
///
/// Every method has a default that reports the step as skipped and passing,
/// so a host only implements what it supports.
#[async_trait]
pub trait StepHost: Send + Sync {
    async fn verify(&self, step: &VerifyStep, cwd: &Path) -> Result<StepOutcome, CommandError> {
        debug!(kind = %step.kind, ?cwd, "StepHost::verify: no verifier");
        Ok(StepOutcome::passed(format!("VERIFY {}: no verifier configured, skipped", step.kind)))
    }

    async fn verify_trace(&self, from: &str, to: &str, cwd: &Path) -> Result<StepOutcome, CommandError> {
        debug!(%from, %to, ?cwd, "StepHost::verify_trace: no verifier");
        Ok(StepOutcome::passed(format!(
            "VERIFY-TRACE {} -> {}: no verifier configured, skipped",
            from, to
        )))
    }

    async fn verify_coverage(&self, check: &CoverageCheck, cwd: &Path) -> Result<StepOutcome, CommandError> {
        debug!(?check, ?cwd, "StepHost::verify_coverage: no verifier");
        Ok(StepOutcome::passed("VERIFY-COVERAGE: no coverage provider configured, skipped"))
    }

    async fn lsp(
        &self,
        query: &str,
        _options: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> Result<StepOutcome, CommandError> {
        debug!(%query, ?cwd, "StepHost::lsp: no language server");
        Ok(StepOutcome::passed(format!("LSP {}: no language server configured", query)))
    }

    /// Custom directives pass their content through unless a host handles them
    async fn custom(&self, name: &str, content: &str, cwd: &Path) -> Result<StepOutcome, CommandError> {
        debug!(%name, ?cwd, "StepHost::custom: passthrough");
        Ok(StepOutcome::passed(content))
    }
}

/// Host with no integrations
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHost;

#[async_trait]
impl StepHost for NullHost {}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Host returning scripted verify outcomes and recording every call
    #[derive(Default)]
    pub struct ScriptedHost {
        verify_results: Mutex<Vec<StepOutcome>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedHost {
        /// Outcomes handed out in order by `verify`; passing once exhausted
        pub fn with_verify_results(results: Vec<StepOutcome>) -> Self {
            Self {
                verify_results: Mutex::new(results.into_iter().rev().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn record(&self, call: String) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    #[async_trait]
    impl StepHost for ScriptedHost {
        async fn verify(&self, step: &VerifyStep, _cwd: &Path) -> Result<StepOutcome, CommandError> {
            self.record(format!("verify {}", step.kind));
            let next = self.verify_results.lock().ok().and_then(|mut r| r.pop());
            Ok(next.unwrap_or_else(|| StepOutcome::passed(format!("{} ok", step.kind))))
        }

        async fn lsp(
            &self,
            query: &str,
            _options: &BTreeMap<String, String>,
            _cwd: &Path,
        ) -> Result<StepOutcome, CommandError> {
            self.record(format!("lsp {}", query));
            Ok(StepOutcome::passed(format!("definition of {}", query)))
        }

        async fn custom(&self, name: &str, content: &str, _cwd: &Path) -> Result<StepOutcome, CommandError> {
            self.record(format!("custom {}", name));
            Ok(StepOutcome::passed(format!("[{}] {}", name, content)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_host_skips_verify() {
        let step = VerifyStep {
            kind: "links".to_string(),
            ..Default::default()
        };
        let outcome = NullHost.verify(&step, Path::new(".")).await.unwrap();
        assert!(outcome.passed);
        assert!(outcome.output.contains("VERIFY links"));
    }

    #[tokio::test]
    async fn test_null_host_custom_passthrough() {
        let outcome = NullHost.custom("REVIEW", "check the diff", Path::new(".")).await.unwrap();
        assert_eq!(outcome, StepOutcome::passed("check the diff"));
    }
}
