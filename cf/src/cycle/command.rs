//! RUN execution
//!
//! Commands are word-split and spawned directly unless ALLOW-SHELL is set, in
//! which case they go through `sh -c`. Output is collected while the child
//! runs so that a timeout still yields whatever was printed before the kill.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::shell::split_command;
use crate::conversation::{RunSettings, format_duration};

/// How long pipe readers may keep draining after the child is gone
const READER_GRACE: Duration = Duration::from_secs(1);

/// Errors starting or supervising a command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Cannot parse command '{command}': {reason}")]
    Tokenize { command: String, reason: String },

    #[error("Empty command")]
    Empty,

    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{step} failed: {message}")]
    Host { step: String, message: String },
}

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutput {
    pub command: String,
    /// `None` when the process was killed or ended by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub timeout: Duration,
}

impl CommandOutput {
    /// Result for a command that could not be started, reported like a shell would (exit 127)
    pub fn spawn_failure(command: impl Into<String>, message: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            exit_code: Some(127),
            stdout: String::new(),
            stderr: message.into(),
            duration: Duration::ZERO,
            timed_out: false,
            timeout,
        }
    }

    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// One-line description of how the command ended
    pub fn status_line(&self) -> String {
        if self.timed_out {
            return format!("timed out after {}", format_duration(self.timeout));
        }
        match self.exit_code {
            Some(0) => "succeeded".to_string(),
            Some(code) => format!("failed with exit code {}", code),
            None => "was terminated by a signal".to_string(),
        }
    }

    /// Text sent to the agent, cut to `limit` characters of output
    pub fn render(&self, limit: Option<usize>) -> String {
        let mut body = String::new();
        if !self.stdout.trim().is_empty() {
            body.push_str(self.stdout.trim_end());
        }
        if !self.stderr.trim().is_empty() {
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str("[stderr]\n");
            body.push_str(self.stderr.trim_end());
        }
        if body.is_empty() {
            body.push_str("(no output)");
        }
        format!(
            "Command `{}` {}:\n\n```\n{}\n```",
            self.command,
            self.status_line(),
            truncate_output(&body, limit)
        )
    }
}

/// Keep the first `limit` characters and note how many were dropped
pub fn truncate_output(text: &str, limit: Option<usize>) -> String {
    let Some(limit) = limit else {
        return text.to_string();
    };
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit).collect();
    format!("{}\n[output truncated: {} more characters]", kept, total - limit)
}

/// Runs RUN commands with the workflow's RUN settings
#[derive(Debug, Clone)]
pub struct CommandRunner {
    settings: RunSettings,
    cwd: PathBuf,
}

impl CommandRunner {
    /// `workflow_cwd` is used unless RUN-CWD is set; a relative RUN-CWD is joined onto it
    pub fn new(settings: RunSettings, workflow_cwd: impl Into<PathBuf>) -> Self {
        let workflow_cwd = workflow_cwd.into();
        let cwd = match &settings.cwd {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => workflow_cwd.join(dir),
            None => workflow_cwd,
        };
        Self { settings, cwd }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    fn build(&self, command: &str) -> Result<Command, CommandError> {
        let mut cmd = if self.settings.allow_shell {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        } else {
            let words = split_command(command).map_err(|reason| CommandError::Tokenize {
                command: command.to_string(),
                reason,
            })?;
            let (program, args) = words.split_first().ok_or(CommandError::Empty)?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        };
        cmd.current_dir(&self.cwd)
            .envs(&self.settings.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Run one command to completion or timeout
    ///
    /// A non-zero exit or a timeout is not an error: it is reported in the
    /// returned [`CommandOutput`]. Errors mean the command never ran.
    pub async fn run(&self, command: &str) -> Result<CommandOutput, CommandError> {
        let timeout = self.settings.timeout;
        debug!(%command, cwd = ?self.cwd, timeout_ms = timeout.as_millis() as u64, "CommandRunner::run: called");
        let mut cmd = self.build(command)?;
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child.stdout.take().map(|s| spawn_reader(s, stdout_buf.clone()));
        let stderr_task = child.stderr.take().map(|s| spawn_reader(s, stderr_buf.clone()));

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(source)) => {
                return Err(CommandError::Wait {
                    command: command.to_string(),
                    source,
                });
            }
            Err(_) => {
                warn!(%command, timeout_ms = timeout.as_millis() as u64, "Command timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!(%command, error = %e, "Failed to kill timed out command");
                }
                (None, true)
            }
        };

        finish_reader(stdout_task).await;
        finish_reader(stderr_task).await;

        let output = CommandOutput {
            command: command.to_string(),
            exit_code,
            stdout: take_lossy(&stdout_buf),
            stderr: take_lossy(&stderr_buf),
            duration: start.elapsed(),
            timed_out,
            timeout,
        };
        debug!(%command, exit_code = ?output.exit_code, timed_out, duration_ms = output.duration.as_millis() as u64, "CommandRunner::run: complete");
        Ok(output)
    }
}

fn spawn_reader<R>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut b) = buf.lock() {
                        b.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

/// Let a reader drain what is left; abandon it if a grandchild still holds the pipe
async fn finish_reader(handle: Option<JoinHandle<()>>) {
    if let Some(mut handle) = handle
        && tokio::time::timeout(READER_GRACE, &mut handle).await.is_err()
    {
        debug!("finish_reader: pipe still open, abandoning reader");
        handle.abort();
    }
}

fn take_lossy(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    buf.lock()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}
