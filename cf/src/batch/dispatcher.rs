//! BatchDispatcher - runs many workflow instances under a concurrency limit

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::progress::{ItemStatus, ProgressBoard};
use crate::adapter::Adapter;
use crate::conversation::Conversation;
use crate::cycle::{
    CycleOrchestrator, NullHost, OrchestratorOptions, RunFailure, RunOutcome, RunReport, StepHost, TemplateVars,
};
use crate::detector::{generate_nonce, read_stop_file, stop_file_path};
use crate::error::{ConvoError, exit_codes};

/// One workflow instance
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Shown in the progress file (component path or workflow file)
    pub label: String,
    pub conversation: Conversation,
    /// Added to the instance's template variables
    pub variables: BTreeMap<String, String>,
    /// Working directory; the dispatcher's when `None`
    pub cwd: Option<PathBuf>,
}

impl BatchItem {
    pub fn new(label: impl Into<String>, conversation: Conversation) -> Self {
        Self {
            label: label.into(),
            conversation,
            variables: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum instances running at once (at least 1)
    pub concurrency: usize,
    /// Keep scheduling after an instance fails
    pub continue_on_error: bool,
    /// Markdown progress file; relative paths are joined to the working directory
    pub progress_file: Option<PathBuf>,
    /// Shared stop-file nonce; generated when `None`
    pub nonce: Option<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            continue_on_error: false,
            progress_file: None,
            nonce: None,
        }
    }
}

/// Final state of one instance
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub label: String,
    pub status: ItemStatus,
    pub outcome: Option<RunOutcome>,
    pub error: Option<String>,
    pub remediation: Option<String>,
    pub exit_code: i32,
    pub output: Option<PathBuf>,
    pub duration: Option<Duration>,
}

impl ItemResult {
    fn pending(label: &str) -> Self {
        Self {
            label: label.to_string(),
            status: ItemStatus::Pending,
            outcome: None,
            error: None,
            remediation: None,
            exit_code: exit_codes::OK,
            output: None,
            duration: None,
        }
    }
}

/// Aggregate of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub nonce: String,
    pub results: Vec<ItemResult>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn all_done(&self) -> bool {
        self.results.iter().all(|r| r.status == ItemStatus::Done)
    }

    /// First failure's code, then loop detection, then success
    pub fn exit_code(&self) -> i32 {
        if let Some(failed) = self.results.iter().find(|r| r.status == ItemStatus::Failed) {
            return failed.exit_code;
        }
        self.results
            .iter()
            .map(|r| r.exit_code)
            .find(|c| *c != exit_codes::OK)
            .unwrap_or(exit_codes::OK)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} total, {} done, {} failed, {} pending",
            self.total(),
            self.count(ItemStatus::Done),
            self.count(ItemStatus::Failed),
            self.count(ItemStatus::Pending)
        )
    }
}

/// Fans the cycle orchestrator out across instances
pub struct BatchDispatcher {
    adapter: Arc<dyn Adapter>,
    host: Arc<dyn StepHost>,
    base: OrchestratorOptions,
    options: BatchOptions,
    nonce: String,
}

impl BatchDispatcher {
    /// `base` supplies the working directory and defaults every instance starts from
    pub fn new(adapter: Arc<dyn Adapter>, base: OrchestratorOptions, options: BatchOptions) -> Self {
        let nonce = options
            .nonce
            .clone()
            .or_else(|| base.nonce.clone())
            .unwrap_or_else(generate_nonce);
        debug!(%nonce, concurrency = options.concurrency, "BatchDispatcher::new: called");
        Self {
            adapter,
            host: Arc::new(NullHost),
            base,
            options,
            nonce,
        }
    }

    pub fn with_host(mut self, host: Arc<dyn StepHost>) -> Self {
        self.host = host;
        self
    }

    /// Nonce shared by every instance of this batch
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    fn progress_path(&self) -> Option<PathBuf> {
        self.options.progress_file.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.base.cwd.join(p)
            }
        })
    }

    /// Run every item; instance failures are recorded in the summary
    ///
    /// Only a stop file present before the first instance starts is an error. One that
    /// appears later stops scheduling and leaves the remaining items pending.
    pub async fn run(&self, items: Vec<BatchItem>) -> Result<BatchSummary, ConvoError> {
        info!(count = items.len(), concurrency = self.options.concurrency, "Starting batch");
        if let Some(request) = read_stop_file(&self.base.cwd, &self.nonce) {
            return Err(ConvoError::StopFilePresent {
                path: stop_file_path(&self.base.cwd, &self.nonce),
                reason: request.reason,
            });
        }

        let results: Arc<Mutex<Vec<ItemResult>>> =
            Arc::new(Mutex::new(items.iter().map(|i| ItemResult::pending(&i.label)).collect()));
        // Held across the file write so flushes land in update order
        let board = Arc::new(AsyncMutex::new(ProgressBoard::new(
            items.iter().map(|i| i.label.clone()),
            self.progress_path(),
        )));
        board.lock().await.flush_async().await;

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if halted.load(Ordering::SeqCst) {
                info!(label = %item.label, "Batch halted; leaving remaining items pending");
                break;
            }
            if let Some(request) = read_stop_file(&self.base.cwd, &self.nonce) {
                warn!(label = %item.label, reason = %request.reason, "Stop file appeared; leaving remaining items pending");
                halted.store(true, Ordering::SeqCst);
                break;
            }

            let adapter = self.adapter.clone();
            let host = self.host.clone();
            let options = self.instance_options(&item);
            let continue_on_error = self.options.continue_on_error;
            let results = results.clone();
            let board = board.clone();
            let halted = halted.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let label = item.label.clone();
                update_board(&board, index, ItemStatus::Running, None, None).await;
                info!(%label, "Instance started");

                let result = run_instance(item, adapter, host, options).await;
                if result.status == ItemStatus::Failed && !continue_on_error {
                    halted.store(true, Ordering::SeqCst);
                }
                update_board(&board, index, result.status, result.output.clone(), result.duration).await;
                if let Ok(mut results) = results.lock()
                    && let Some(slot) = results.get_mut(index)
                {
                    *slot = result;
                }
                debug!(%label, "Instance task complete");
            }));
        }

        for (index, outcome) in futures::future::join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = outcome {
                error!(index, error = %e, "Instance task panicked");
            }
        }

        let results = results.lock().map(|r| r.clone()).unwrap_or_default();
        let summary = BatchSummary {
            nonce: self.nonce.clone(),
            results,
        };
        info!(summary = %summary.summary_line(), "Batch finished");
        Ok(summary)
    }

    fn instance_options(&self, item: &BatchItem) -> OrchestratorOptions {
        let mut options = self.base.clone();
        options.nonce = Some(self.nonce.clone());
        if let Some(cwd) = &item.cwd {
            options.cwd = cwd.clone();
        }
        options.variables.extend(item.variables.clone());
        options
    }
}

async fn update_board(
    board: &AsyncMutex<ProgressBoard>,
    index: usize,
    status: ItemStatus,
    output: Option<PathBuf>,
    duration: Option<Duration>,
) {
    let mut board = board.lock().await;
    board.update(index, status, output, duration);
    board.flush_async().await;
}

/// Run one instance and write its OUTPUT-FILE, even when it failed
async fn run_instance(
    item: BatchItem,
    adapter: Arc<dyn Adapter>,
    host: Arc<dyn StepHost>,
    options: OrchestratorOptions,
) -> ItemResult {
    let start = Instant::now();
    let mut result = ItemResult::pending(&item.label);
    let output_path = output_path(&item, &options);
    let json = item.conversation.config.output_format.as_deref() == Some("json");

    let orchestrator = match CycleOrchestrator::new(item.conversation, adapter, options) {
        Ok(orchestrator) => orchestrator.with_host(host),
        Err(e) => {
            error!(label = %item.label, error = %e, "Instance could not start");
            result.status = ItemStatus::Failed;
            result.exit_code = e.exit_code();
            result.remediation = Some(e.remediation());
            result.error = Some(e.to_string());
            result.duration = Some(start.elapsed());
            return result;
        }
    };

    let report = match orchestrator.run().await {
        Ok(report) => {
            info!(label = %item.label, outcome = %report.outcome.summary(), "Instance finished");
            result.status = ItemStatus::Done;
            result.exit_code = report.outcome.exit_code();
            result.outcome = Some(report.outcome.clone());
            report
        }
        Err(RunFailure { error, report }) => {
            error!(label = %item.label, error = %error, "Instance failed");
            result.status = ItemStatus::Failed;
            result.exit_code = error.exit_code();
            result.remediation = Some(error.remediation());
            result.error = Some(error.to_string());
            *report
        }
    };

    if let Some(path) = output_path {
        match write_output(&path, &report, json) {
            Ok(()) => result.output = Some(path),
            Err(e) => warn!(label = %item.label, path = %path.display(), error = %e, "Failed to write output file"),
        }
    }
    result.duration = Some(start.elapsed());
    result
}

/// OUTPUT-FILE with variables substituted, under OUTPUT-DIR or the working directory
fn output_path(item: &BatchItem, options: &OrchestratorOptions) -> Option<PathBuf> {
    let config = &item.conversation.config;
    let file = config.output_file.as_ref()?;
    let mut vars = TemplateVars::new()
        .with("WORKFLOW_NAME", item.conversation.name())
        .with("NONCE", options.nonce.clone().unwrap_or_default());
    vars.extend(options.variables.clone());

    let file = PathBuf::from(vars.substitute(file));
    if file.is_absolute() {
        return Some(file);
    }
    let base = match &config.output_dir {
        Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(vars.substitute(dir)),
        Some(dir) => options.cwd.join(vars.substitute(dir)),
        None => options.cwd.clone(),
    };
    Some(base.join(file))
}

fn write_output(path: &Path, report: &RunReport, json: bool) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = if json {
        serde_json::to_string_pretty(report).map_err(std::io::Error::other)?
    } else {
        report.to_markdown()
    };
    fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::client::mock::MockAdapter;
    use crate::conversation::DirectiveRegistry;
    use tempfile::{TempDir, tempdir};

    fn item(label: &str, text: &str) -> BatchItem {
        BatchItem::new(label, Conversation::parse(text, &DirectiveRegistry::new()).unwrap())
    }

    fn dispatcher(dir: &TempDir, adapter: Arc<MockAdapter>, options: BatchOptions) -> BatchDispatcher {
        BatchDispatcher::new(adapter, OrchestratorOptions::new(dir.path()), options)
    }

    #[tokio::test]
    async fn test_runs_all_items_and_writes_progress() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(3));
        let options = BatchOptions {
            concurrency: 2,
            progress_file: Some(PathBuf::from("progress.md")),
            nonce: Some("batchnonce".into()),
            ..Default::default()
        };
        let summary = dispatcher(&dir, adapter.clone(), options)
            .run(vec![item("a", "PROMPT a\n"), item("b", "PROMPT b\n"), item("c", "PROMPT c\n")])
            .await
            .unwrap();

        assert!(summary.all_done());
        assert_eq!(summary.exit_code(), exit_codes::OK);
        assert_eq!(summary.nonce, "batchnonce");
        assert_eq!(adapter.call_count(), 3);

        let progress = fs::read_to_string(dir.path().join("progress.md")).unwrap();
        assert!(progress.contains("**Summary:** 3 total, 3 done, 0 failed, 0 running, 0 pending"));
    }

    #[tokio::test]
    async fn test_first_failure_stops_scheduling() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(4));
        let summary = dispatcher(&dir, adapter.clone(), BatchOptions::default())
            .run(vec![
                item("ok", "PROMPT fine\n"),
                item("broken", "RUN false\n"),
                item("later", "PROMPT never\n"),
            ])
            .await
            .unwrap();

        let statuses: Vec<_> = summary.results.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![ItemStatus::Done, ItemStatus::Failed, ItemStatus::Pending]);
        assert_eq!(summary.exit_code(), exit_codes::RUN_COMMAND_FAILED);
        assert!(summary.results[1].remediation.is_some());
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_everything() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(4));
        let options = BatchOptions {
            continue_on_error: true,
            ..Default::default()
        };
        let summary = dispatcher(&dir, adapter, options)
            .run(vec![item("broken", "RUN false\n"), item("later", "PROMPT still runs\n")])
            .await
            .unwrap();
        assert_eq!(summary.count(ItemStatus::Failed), 1);
        assert_eq!(summary.count(ItemStatus::Done), 1);
    }

    #[tokio::test]
    async fn test_stop_file_blocks_batch() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("STOPAUTOMATION-shared.json"), "halt everything").unwrap();
        let adapter = Arc::new(MockAdapter::chatty(1));
        let options = BatchOptions {
            nonce: Some("shared".into()),
            ..Default::default()
        };
        let err = dispatcher(&dir, adapter.clone(), options)
            .run(vec![item("a", "PROMPT a\n")])
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoError::StopFilePresent { ref reason, .. } if reason == "halt everything"));
        assert_eq!(adapter.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_file_mid_batch_leaves_rest_pending() {
        let dir = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(3));
        let options = BatchOptions {
            continue_on_error: true,
            nonce: Some("mid".into()),
            ..Default::default()
        };
        let items = vec![
            item("first", "ALLOW-SHELL\nRUN echo halt > STOPAUTOMATION-mid.json\n"),
            item("second", "PROMPT b\n").with_cwd(elsewhere.path()),
            item("third", "PROMPT c\n"),
        ];
        let summary = dispatcher(&dir, adapter.clone(), options).run(items).await.unwrap();

        let statuses: Vec<_> = summary.results.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![ItemStatus::Done, ItemStatus::Pending, ItemStatus::Pending]);
        assert_eq!(adapter.call_count(), 0);
    }

    #[tokio::test]
    async fn test_output_file_per_item() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2));
        let text = "OUTPUT-DIR reports\nOUTPUT-FILE {{COMPONENT_NAME}}.json\nOUTPUT-FORMAT json\nPROMPT review\n";
        let items = vec![
            item("src/a.rs", text).with_variables(BTreeMap::from([("COMPONENT_NAME".into(), "a".into())])),
            item("src/b.rs", text).with_variables(BTreeMap::from([("COMPONENT_NAME".into(), "b".into())])),
        ];
        let summary = dispatcher(&dir, adapter, BatchOptions::default()).run(items).await.unwrap();

        let a = dir.path().join("reports/a.json");
        assert_eq!(summary.results[0].output.as_deref(), Some(a.as_path()));
        let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&a).unwrap()).unwrap();
        assert_eq!(report["outcome"]["kind"], "completed");
        assert!(dir.path().join("reports/b.json").exists());
    }

    #[tokio::test]
    async fn test_failed_instance_still_writes_output() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::chatty(2));
        let summary = dispatcher(&dir, adapter, BatchOptions::default())
            .run(vec![item("x", "OUTPUT-FILE out.md\nPROMPT first\nRUN false\n")])
            .await
            .unwrap();
        assert_eq!(summary.results[0].status, ItemStatus::Failed);
        let md = fs::read_to_string(dir.path().join("out.md")).unwrap();
        assert!(md.contains("## Cycle 1 - step 1"));
    }
}
