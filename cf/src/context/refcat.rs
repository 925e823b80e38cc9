//! REFCAT references: `@path`, `@path#L10`, `@path#L10-L20`, `@path#L10-`

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::ContextError;

static RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^L(\d+)(?:-(?:L?(\d+))?)?$").expect("range regex is valid"));

/// A parsed REFCAT reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefcatRef {
    pub raw: String,
    pub path: String,
    /// 1-based first line
    pub start: Option<usize>,
    /// 1-based last line, inclusive; `None` with a start means "to end of file"
    pub end: Option<usize>,
}

impl RefcatRef {
    pub fn parse(reference: &str) -> Result<Self, ContextError> {
        let raw = reference.trim();
        let body = raw.trim_start_matches('@');
        let (path, range) = match body.split_once('#') {
            Some((p, r)) => (p, Some(r)),
            None => (body, None),
        };
        if path.is_empty() {
            return Err(ContextError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "missing path".to_string(),
            });
        }

        let mut parsed = Self {
            raw: raw.to_string(),
            path: path.to_string(),
            start: None,
            end: None,
        };

        if let Some(range) = range {
            let invalid = |reason: &str| ContextError::InvalidRange {
                reference: raw.to_string(),
                reason: reason.to_string(),
            };
            let caps = RANGE_RE.captures(range).ok_or_else(|| invalid("expected L<n>, L<n>-L<m> or L<n>-"))?;
            let start: usize = caps[1].parse().map_err(|_| invalid("line number too large"))?;
            if start == 0 {
                return Err(invalid("lines are numbered from 1"));
            }
            parsed.start = Some(start);
            match caps.get(2) {
                Some(m) => {
                    let end: usize = m.as_str().parse().map_err(|_| invalid("line number too large"))?;
                    if end < start {
                        return Err(invalid("end line before start line"));
                    }
                    parsed.end = Some(end);
                }
                None if range.ends_with('-') => {}
                None => parsed.end = Some(start),
            }
        }
        Ok(parsed)
    }

    /// Locate the file: working directory first, then the workflow directory
    pub fn locate(&self, cwd: &Path, workflow_dir: &Path) -> Result<PathBuf, ContextError> {
        let rel = Path::new(&self.path);
        if rel.is_absolute() {
            return if rel.is_file() {
                Ok(rel.to_path_buf())
            } else {
                Err(ContextError::FileNotFound { path: rel.to_path_buf() })
            };
        }
        [cwd.join(rel), workflow_dir.join(rel)]
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| ContextError::FileNotFound { path: cwd.join(rel) })
    }
}

/// Render the excerpt for one reference as a numbered code block
pub fn render_excerpt(reference: &str, cwd: &Path, workflow_dir: &Path) -> Result<String, ContextError> {
    debug!(%reference, "render_excerpt: called");
    let parsed = RefcatRef::parse(reference)?;
    let path = parsed.locate(cwd, workflow_dir)?;
    let content = fs::read_to_string(&path).map_err(|source| ContextError::Io {
        path: path.clone(),
        source,
    })?;
    let lines: Vec<&str> = content.lines().collect();

    let start = parsed.start.unwrap_or(1);
    if !lines.is_empty() && start > lines.len() {
        return Err(ContextError::InvalidRange {
            reference: parsed.raw.clone(),
            reason: format!("file has only {} lines", lines.len()),
        });
    }
    let end = parsed.end.map_or(lines.len(), |e| e.min(lines.len()));

    let width = end.max(1).to_string().len();
    let body: Vec<String> = lines
        .iter()
        .enumerate()
        .skip(start.saturating_sub(1))
        .take(end.saturating_sub(start.saturating_sub(1)))
        .map(|(i, line)| format!("{:>width$} | {}", i + 1, line, width = width))
        .collect();

    let header = match parsed.start {
        Some(_) => format!("### {} (lines {}-{})", parsed.path, start, end),
        None => format!("### {}", parsed.path),
    };
    Ok(format!("{}\n```\n{}\n```", header, body.join("\n")))
}

/// Render several references, separated by blank lines
pub fn render_all(references: &[String], cwd: &Path, workflow_dir: &Path) -> Result<String, ContextError> {
    references
        .iter()
        .map(|r| render_excerpt(r, cwd, workflow_dir))
        .collect::<Result<Vec<_>, _>>()
        .map(|parts| parts.join("\n\n"))
}
