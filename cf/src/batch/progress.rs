//! Markdown progress file for batch runs

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conversation::format_duration;

/// Default progress file name, relative to the batch working directory
pub const DEFAULT_PROGRESS_FILE: &str = "convofile-progress.md";

/// Lifecycle of one batch instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One row of the progress table
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRow {
    pub label: String,
    pub status: ItemStatus,
    pub output: Option<PathBuf>,
    pub duration: Option<Duration>,
}

/// Per-instance status, rendered to markdown on every change
#[derive(Debug, Clone, Default)]
pub struct ProgressBoard {
    rows: Vec<ProgressRow>,
    path: Option<PathBuf>,
}

impl ProgressBoard {
    pub fn new<I, S>(labels: I, path: Option<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rows = labels
            .into_iter()
            .map(|label| ProgressRow {
                label: label.into(),
                status: ItemStatus::Pending,
                output: None,
                duration: None,
            })
            .collect();
        Self { rows, path }
    }

    pub fn rows(&self) -> &[ProgressRow] {
        &self.rows
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }

    /// Update row `index`; the file is rewritten by the next flush
    pub fn update(&mut self, index: usize, status: ItemStatus, output: Option<PathBuf>, duration: Option<Duration>) {
        debug!(index, %status, "ProgressBoard::update: called");
        if let Some(row) = self.rows.get_mut(index) {
            row.status = status;
            if output.is_some() {
                row.output = output;
            }
            if duration.is_some() {
                row.duration = duration;
            }
        }
    }

    /// Write the progress file; failures are logged, never fatal
    pub fn flush(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_file(path, &self.render()) {
            warn!(path = %path.display(), error = %e, "Failed to write progress file");
        }
    }

    /// [`flush`](Self::flush) on the blocking pool, for callers on the async runtime
    pub async fn flush_async(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let content = self.render();
        let written = tokio::task::spawn_blocking(move || {
            let result = write_file(&path, &content);
            (path, result)
        })
        .await;
        match written {
            Ok((_, Ok(()))) => {}
            Ok((path, Err(e))) => warn!(path = %path.display(), error = %e, "Failed to write progress file"),
            Err(e) => warn!(error = %e, "Progress file writer task failed"),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# Batch Progress\n\n| Component | Status | Output | Duration |\n|---|---|---|---|\n");
        for row in &self.rows {
            let output = row
                .output
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string());
            let duration = row.duration.map(format_duration).unwrap_or_else(|| "-".to_string());
            out.push_str(&format!("| {} | {} | {} | {} |\n", row.label, row.status, output, duration));
        }
        out.push_str(&format!(
            "\n**Summary:** {} total, {} done, {} failed, {} running, {} pending\n",
            self.rows.len(),
            self.count(ItemStatus::Done),
            self.count(ItemStatus::Failed),
            self.count(ItemStatus::Running),
            self.count(ItemStatus::Pending)
        ));
        out
    }
}

fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_render_table_and_summary() {
        let mut board = ProgressBoard::new(["src/a.rs", "src/b.rs", "src/c.rs"], None);
        board.update(0, ItemStatus::Done, Some(PathBuf::from("out/a.md")), Some(Duration::from_secs(2)));
        board.update(1, ItemStatus::Running, None, None);

        let md = board.render();
        assert!(md.contains("| Component | Status | Output | Duration |"));
        assert!(md.contains("| src/a.rs | done | out/a.md | 2s |"));
        assert!(md.contains("| src/b.rs | running | - | - |"));
        assert!(md.contains("**Summary:** 3 total, 1 done, 0 failed, 1 running, 1 pending"));
    }

    #[test]
    fn test_update_rewrites_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports").join("progress.md");
        let mut board = ProgressBoard::new(["one"], Some(path.clone()));
        board.update(0, ItemStatus::Failed, None, None);
        assert!(!path.exists());

        board.flush();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("| one | failed |"));
        assert!(written.contains("1 failed"));
    }

    #[tokio::test]
    async fn test_flush_async_writes_latest_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.md");
        let mut board = ProgressBoard::new(["one", "two"], Some(path.clone()));
        board.update(0, ItemStatus::Done, None, None);
        board.update(1, ItemStatus::Running, None, None);
        board.flush_async().await;

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("| one | done |"));
        assert!(written.contains("2 total, 1 done, 0 failed, 1 running, 0 pending"));
    }
}
