//! Convofile configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchOptions, DEFAULT_PROGRESS_FILE};
use crate::context::DEFAULT_MAX_TOKENS;
use crate::cycle::OrchestratorOptions;
use crate::detector::DetectorConfig;

/// Main convofile configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Token budget defaults
    pub context: ContextConfig,

    /// Loop detector thresholds
    pub detector: DetectorConfig,

    /// RUN defaults
    pub run: RunConfig,

    /// Batch dispatcher defaults
    pub batch: BatchConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .convofile.yml
        let local_config = PathBuf::from(".convofile.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/convofile/convofile.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("convofile").join("convofile.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Orchestrator settings for a run in `cwd`
    pub fn orchestrator_options(&self, cwd: impl Into<PathBuf>) -> OrchestratorOptions {
        let mut options = OrchestratorOptions::new(cwd).with_max_tokens(self.context.max_tokens);
        options.detector = self.detector.clone();
        options.run_timeout = self.run.timeout_ms.map(Duration::from_millis);
        options
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            concurrency: self.batch.concurrency.max(1),
            continue_on_error: self.batch.continue_on_error,
            progress_file: Some(PathBuf::from(&self.batch.progress_file)),
            nonce: None,
        }
    }
}

/// Token budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Context window size in tokens
    #[serde(rename = "max-tokens")]
    pub max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// RUN defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Timeout used when a workflow leaves RUN-TIMEOUT unset
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: Option<u64>,
}

/// Batch dispatcher defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Instances run at the same time
    pub concurrency: usize,

    #[serde(rename = "continue-on-error")]
    pub continue_on_error: bool,

    /// Markdown progress file name
    #[serde(rename = "progress-file")]
    pub progress_file: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            continue_on_error: false,
            progress_file: DEFAULT_PROGRESS_FILE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DEFAULT_IDENTICAL_THRESHOLD, DEFAULT_MIN_RESPONSE_LENGTH};

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.log_level.is_none());
        assert_eq!(config.context.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.detector.identical_threshold, DEFAULT_IDENTICAL_THRESHOLD);
        assert_eq!(config.batch.concurrency, 1);
        assert!(!config.batch.continue_on_error);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: debug

context:
  max-tokens: 64000

detector:
  identical-threshold: 3
  min-response-length: 40

run:
  timeout-ms: 120000

batch:
  concurrency: 4
  continue-on-error: true
  progress-file: status.md
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.context.max_tokens, 64000);
        assert_eq!(config.detector.identical_threshold, 3);
        assert_eq!(config.detector.min_response_length, 40);
        assert_eq!(config.run.timeout_ms, Some(120000));
        assert_eq!(config.batch.concurrency, 4);
        assert!(config.batch.continue_on_error);
        assert_eq!(config.batch.progress_file, "status.md");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
detector:
  identical-threshold: 4
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.detector.identical_threshold, 4);
        assert_eq!(config.detector.min_response_length, DEFAULT_MIN_RESPONSE_LENGTH);
        assert_eq!(config.context.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.batch.progress_file, DEFAULT_PROGRESS_FILE);
    }

    #[test]
    fn test_options_from_config() {
        let config = Config {
            run: RunConfig {
                timeout_ms: Some(5000),
            },
            batch: BatchConfig {
                concurrency: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        let options = config.orchestrator_options("/tmp/work");
        assert_eq!(options.cwd, PathBuf::from("/tmp/work"));
        assert_eq!(options.run_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.batch_options().concurrency, 1);
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cf.yml");
        fs::write(&path, "log-level: warn\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("warn"));

        let missing = dir.path().join("nope.yml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
