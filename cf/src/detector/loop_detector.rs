//! Multi-signal loop detector
//!
//! Each response is checked, in order, against reasoning patterns, a run of
//! identical responses, a too-short response and the stop file. The first
//! trigger wins.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::stop_file::{StopRequest, generate_nonce, read_stop_file, stop_file_instruction, stop_file_path};

pub const DEFAULT_IDENTICAL_THRESHOLD: usize = 2;
pub const DEFAULT_MIN_RESPONSE_LENGTH: usize = 100;

/// Characters of the normalised response fed into the hash
const HASH_PREFIX_CHARS: usize = 200;

static REASONING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bin a loop\b",
        r"(?i)\bsame (?:workflow )?prompt (?:being )?repeated\b",
        r"(?i)\balready (?:confirmed|answered|responded).*(?:multiple|several) times\b",
        r"(?i)\bkeep(?:ing)? (?:my )?response minimal\b",
        r"(?i)\brepetitive (?:cycle|loop|pattern)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("reasoning pattern is valid"))
    .collect()
});

/// Which trigger fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopReason {
    ReasoningPattern,
    IdenticalResponses,
    MinimalResponse,
    StopFile,
}

impl fmt::Display for LoopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReasoningPattern => "REASONING_PATTERN",
            Self::IdenticalResponses => "IDENTICAL_RESPONSES",
            Self::MinimalResponse => "MINIMAL_RESPONSE",
            Self::StopFile => "STOP_FILE",
        };
        write!(f, "{}", s)
    }
}

/// Result of a positive check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub reason: LoopReason,
    pub detail: String,
    /// 1-indexed cycle on which the trigger fired
    pub cycle: u32,
    /// Parsed stop file body for [`LoopReason::StopFile`]
    pub stop_request: Option<StopRequest>,
}

impl Verdict {
    pub fn is_stop_file(&self) -> bool {
        self.reason == LoopReason::StopFile
    }
}

/// Detector thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DetectorConfig {
    pub identical_threshold: usize,
    pub min_response_length: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            identical_threshold: DEFAULT_IDENTICAL_THRESHOLD,
            min_response_length: DEFAULT_MIN_RESPONSE_LENGTH,
        }
    }
}

/// Per-run accumulator of response fingerprints
#[derive(Debug, Clone)]
pub struct LoopDetector {
    config: DetectorConfig,
    stop_dir: PathBuf,
    nonce: String,
    hashes: VecDeque<String>,
    lengths: Vec<usize>,
    last_reasoning: Option<String>,
}

impl LoopDetector {
    /// Create a detector watching `stop_dir`; a nonce is generated when none is supplied
    pub fn new(stop_dir: impl Into<PathBuf>, nonce: Option<String>) -> Self {
        let nonce = nonce.unwrap_or_else(generate_nonce);
        debug!(%nonce, "LoopDetector::new: called");
        Self {
            config: DetectorConfig::default(),
            stop_dir: stop_dir.into(),
            nonce,
            hashes: VecDeque::new(),
            lengths: Vec::new(),
            last_reasoning: None,
        }
    }

    pub fn with_config(mut self, config: DetectorConfig) -> Self {
        self.config = DetectorConfig {
            identical_threshold: config.identical_threshold.max(1),
            ..config
        };
        self
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn stop_file_path(&self) -> PathBuf {
        stop_file_path(&self.stop_dir, &self.nonce)
    }

    pub fn stop_file_instruction(&self) -> String {
        stop_file_instruction(&self.stop_dir, &self.nonce)
    }

    /// The stop file body, if one exists now
    pub fn stop_request(&self) -> Option<StopRequest> {
        read_stop_file(&self.stop_dir, &self.nonce)
    }

    pub fn stop_dir(&self) -> &Path {
        &self.stop_dir
    }

    pub fn response_lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn last_reasoning(&self) -> Option<&str> {
        self.last_reasoning.as_deref()
    }

    /// Record a response and classify it
    ///
    /// `cycle` is 0-indexed; the returned verdict reports it 1-indexed.
    pub fn check(&mut self, reasoning: Option<&str>, response: &str, cycle: u32, tools_called: usize) -> Option<Verdict> {
        debug!(cycle, len = response.len(), tools_called, "LoopDetector::check: called");

        self.hashes.push_back(fingerprint(response));
        while self.hashes.len() > self.config.identical_threshold {
            self.hashes.pop_front();
        }
        self.lengths.push(response.chars().count());
        self.last_reasoning = reasoning.filter(|r| !r.trim().is_empty()).map(str::to_string);

        let verdict = |reason, detail: String| Verdict {
            reason,
            detail,
            cycle: cycle + 1,
            stop_request: None,
        };

        if let Some(text) = &self.last_reasoning
            && let Some(re) = REASONING_PATTERNS.iter().find(|re| re.is_match(text))
        {
            info!(cycle = cycle + 1, pattern = re.as_str(), "Loop detected: reasoning pattern");
            return Some(verdict(
                LoopReason::ReasoningPattern,
                format!("agent reasoning matched loop pattern '{}'", re.as_str()),
            ));
        }

        let threshold = self.config.identical_threshold;
        if threshold > 1 && self.hashes.len() >= threshold && self.hashes.iter().all(|h| *h == self.hashes[0]) {
            info!(cycle = cycle + 1, threshold, "Loop detected: identical responses");
            return Some(verdict(
                LoopReason::IdenticalResponses,
                format!("{} consecutive identical responses", threshold),
            ));
        }

        let trimmed_len = response.trim().chars().count();
        if cycle > 0 && tools_called == 0 && trimmed_len < self.config.min_response_length {
            info!(cycle = cycle + 1, trimmed_len, "Loop detected: minimal response");
            return Some(verdict(
                LoopReason::MinimalResponse,
                format!(
                    "response of {} characters is below the minimum of {} with no tool calls",
                    trimmed_len, self.config.min_response_length
                ),
            ));
        }

        if let Some(request) = self.stop_request() {
            info!(cycle = cycle + 1, reason = %request.reason, "Stop file found");
            let mut v = verdict(LoopReason::StopFile, request.reason.clone());
            v.stop_request = Some(request);
            return Some(v);
        }

        None
    }

    /// Clear all accumulated state (nonce and thresholds are kept)
    pub fn reset(&mut self) {
        debug!("LoopDetector::reset: called");
        self.hashes.clear();
        self.lengths.clear();
        self.last_reasoning = None;
    }
}

/// SHA-256 over the normalised 200-character prefix plus the full length
fn fingerprint(response: &str) -> String {
    let normalized: String = response
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(HASH_PREFIX_CHARS)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(response.len().to_le_bytes());
    format!("{:x}", hasher.finalize())
}
