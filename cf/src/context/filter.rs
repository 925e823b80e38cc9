//! Path filter built from ALLOW-FILES / DENY-FILES / ALLOW-DIR / DENY-DIR

use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::debug;

use super::ContextError;
use crate::conversation::WorkflowConfig;

/// Allow/deny predicate over file paths
///
/// Deny always wins. When any allow list is non-empty a path must match at
/// least one allow entry. File patterns are matched against the path
/// relative to `base` and against the bare file name; dir patterns match any
/// ancestor directory of the relative path.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    base: PathBuf,
    allow_files: Vec<Pattern>,
    deny_files: Vec<Pattern>,
    allow_dirs: Vec<Pattern>,
    deny_dirs: Vec<Pattern>,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, ContextError> {
    patterns
        .iter()
        .map(|p| {
            let p = p.trim_start_matches('@').trim_end_matches('/');
            Pattern::new(p).map_err(|e| ContextError::InvalidPattern {
                pattern: p.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl PathFilter {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            ..Default::default()
        }
    }

    /// Build from the workflow config; CONTEXT-EXCLUDE entries join the deny-files list
    pub fn from_config(config: &WorkflowConfig, base: impl Into<PathBuf>) -> Result<Self, ContextError> {
        let mut deny_files = config.deny_files.clone();
        deny_files.extend(config.context_exclude.iter().cloned());

        Ok(Self {
            base: base.into(),
            allow_files: compile(&config.allow_files)?,
            deny_files: compile(&deny_files)?,
            allow_dirs: compile(&config.allow_dirs)?,
            deny_dirs: compile(&config.deny_dirs)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.allow_files.is_empty() && self.deny_files.is_empty() && self.allow_dirs.is_empty() && self.deny_dirs.is_empty()
    }

    /// Whether `path` may be loaded
    pub fn allows(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.base).unwrap_or(path);
        let file_hit = |patterns: &[Pattern]| {
            patterns.iter().any(|p| {
                p.matches_path(rel) || p.matches_path(path) || rel.file_name().is_some_and(|n| p.matches(&n.to_string_lossy()))
            })
        };
        let dir_hit = |patterns: &[Pattern]| {
            rel.ancestors()
                .skip(1)
                .filter(|a| !a.as_os_str().is_empty())
                .any(|a| {
                    patterns.iter().any(|p| {
                        p.matches_path(a) || a.file_name().is_some_and(|n| p.matches(&n.to_string_lossy()))
                    })
                })
        };

        if file_hit(&self.deny_files) || dir_hit(&self.deny_dirs) {
            debug!(?path, "PathFilter::allows: denied");
            return false;
        }

        if self.allow_files.is_empty() && self.allow_dirs.is_empty() {
            return true;
        }
        let allowed = file_hit(&self.allow_files) || dir_hit(&self.allow_dirs);
        if !allowed {
            debug!(?path, "PathFilter::allows: not in allow list");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(allow_files: &[&str], deny_files: &[&str], allow_dirs: &[&str], deny_dirs: &[&str]) -> PathFilter {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let config = WorkflowConfig {
            allow_files: owned(allow_files),
            deny_files: owned(deny_files),
            allow_dirs: owned(allow_dirs),
            deny_dirs: owned(deny_dirs),
            ..Default::default()
        };
        PathFilter::from_config(&config, "/repo").unwrap()
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let f = PathFilter::new("/repo");
        assert!(f.is_empty());
        assert!(f.allows(Path::new("/repo/src/main.rs")));
    }

    #[test]
    fn test_deny_files_by_name() {
        let f = filter(&[], &["*.lock"], &[], &[]);
        assert!(!f.allows(Path::new("/repo/Cargo.lock")));
        assert!(f.allows(Path::new("/repo/Cargo.toml")));
    }

    #[test]
    fn test_deny_dir() {
        let f = filter(&[], &[], &[], &["target"]);
        assert!(!f.allows(Path::new("/repo/target/debug/out.rs")));
        assert!(f.allows(Path::new("/repo/src/target.rs")));
    }

    #[test]
    fn test_allow_list_restricts() {
        let f = filter(&["*.rs"], &[], &["docs"], &[]);
        assert!(f.allows(Path::new("/repo/src/lib.rs")));
        assert!(f.allows(Path::new("/repo/docs/guide.md")));
        assert!(!f.allows(Path::new("/repo/README.md")));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let f = filter(&["*.rs"], &["generated.rs"], &[], &[]);
        assert!(!f.allows(Path::new("/repo/src/generated.rs")));
    }

    #[test]
    fn test_context_exclude_joins_deny() {
        let config = WorkflowConfig {
            context_exclude: vec!["@*.snap".into()],
            ..Default::default()
        };
        let f = PathFilter::from_config(&config, "/repo").unwrap();
        assert!(!f.allows(Path::new("/repo/tests/a.snap")));
    }

    #[test]
    fn test_invalid_pattern() {
        let config = WorkflowConfig {
            deny_files: vec!["[".into()],
            ..Default::default()
        };
        assert!(PathFilter::from_config(&config, "/repo").is_err());
    }
}
