//! CHECKPOINT records

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ConvoError;

/// Snapshot of a run at a CHECKPOINT step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub name: Option<String>,
    pub workflow: String,
    /// 1-indexed cycle
    pub cycle: u32,
    pub step: usize,
    pub session_id: Option<String>,
    pub turns: usize,
    pub used_tokens: usize,
    pub last_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(workflow: impl Into<String>, name: Option<String>, cycle: u32, step: usize) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name,
            workflow: workflow.into(),
            cycle,
            step,
            session_id: None,
            turns: 0,
            used_tokens: 0,
            last_response: None,
            created_at: Utc::now(),
        }
    }

    fn file_name(&self) -> String {
        let label = self
            .name
            .as_deref()
            .map(slug)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("cycle{}-step{}", self.cycle, self.step + 1));
        format!("{}-{}-{}.json", slug(&self.workflow), label, self.id)
    }

    /// Write as pretty JSON into `dir`, creating it if needed
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ConvoError> {
        debug!(?dir, id = %self.id, "Checkpoint::write: called");
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| ConvoError::Io { path, source }
        };
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let path = dir.join(self.file_name());
        let json = serde_json::to_string_pretty(self).map_err(|e| ConvoError::Io {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        fs::write(&path, json).map_err(io_err(&path))?;
        info!(path = %path.display(), "Wrote checkpoint");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, ConvoError> {
        let raw = fs::read_to_string(path).map_err(|source| ConvoError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|e| ConvoError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }
}

fn slug(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
