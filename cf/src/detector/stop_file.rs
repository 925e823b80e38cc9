//! Stop-file protocol: `STOPAUTOMATION-<nonce>.json`

use std::fs;
use std::path::{Path, PathBuf};

use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const NONCE_LEN: usize = 8;

/// Random lower-case alphanumeric nonce, generated once per top-level run
pub fn generate_nonce() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn stop_file_name(nonce: &str) -> String {
    format!("STOPAUTOMATION-{}.json", nonce)
}

pub fn stop_file_path(dir: &Path, nonce: &str) -> PathBuf {
    dir.join(stop_file_name(nonce))
}

/// Body of a stop file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRequest {
    pub reason: String,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StopRequest {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            needs_review: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Parse a stop file body; anything that is not a JSON object with a reason becomes the reason text
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<StopRequest>(raw) {
            Ok(req) => req,
            Err(e) => {
                debug!(%e, "StopRequest::parse: not structured JSON, using raw text");
                Self::new(raw.trim())
            }
        }
    }
}

/// Read the stop file in `dir` for `nonce`, if present
pub fn read_stop_file(dir: &Path, nonce: &str) -> Option<StopRequest> {
    let path = stop_file_path(dir, nonce);
    if !path.exists() {
        return None;
    }
    match fs::read_to_string(&path) {
        Ok(raw) => Some(StopRequest::parse(&raw)),
        Err(e) => {
            warn!(path = %path.display(), %e, "Stop file exists but could not be read");
            Some(StopRequest::new(format!("unreadable stop file: {}", e)))
        }
    }
}

/// Prompt text telling the agent how to request a stop
pub fn stop_file_instruction(dir: &Path, nonce: &str) -> String {
    format!(
        "## Stopping the automation\n\n\
If you determine that this automated workflow should stop (the task is complete, \
you are blocked, or a human needs to review something), create the file \
`{}` with a JSON body such as:\n\n\
```json\n{{\"reason\": \"why you are stopping\", \"needs_review\": true}}\n```\n\n\
Do not create this file for any other purpose.",
        stop_file_path(dir, nonce).display()
    )
}
