//! Building batch items from globs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::BatchItem;
use crate::context::ContextError;
use crate::conversation::{Conversation, DirectiveRegistry};
use crate::error::ConvoError;

pub const COMPONENT_PATH: &str = "COMPONENT_PATH";
pub const COMPONENT_NAME: &str = "COMPONENT_NAME";
pub const COMPONENT_DIR: &str = "COMPONENT_DIR";
/// `file` or `dir`
pub const COMPONENT_TYPE: &str = "COMPONENT_TYPE";

/// Matches of `pattern` (relative to `cwd` unless absolute), sorted
fn glob_paths(pattern: &str, cwd: &Path) -> Result<Vec<PathBuf>, ContextError> {
    let full = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        cwd.join(pattern)
    };
    let text = full.to_string_lossy().to_string();
    let paths = glob::glob(&text).map_err(|e| ContextError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    let mut found: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
    found.sort();
    Ok(found)
}

/// Template variables describing one component
pub fn component_variables(path: &Path, cwd: &Path) -> BTreeMap<String, String> {
    let shown = path.strip_prefix(cwd).unwrap_or(path);
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let dir = shown
        .parent()
        .map(|p| p.display().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());
    let kind = if path.is_dir() { "dir" } else { "file" };

    BTreeMap::from([
        (COMPONENT_PATH.to_string(), shown.display().to_string()),
        (COMPONENT_NAME.to_string(), name),
        (COMPONENT_DIR.to_string(), dir),
        (COMPONENT_TYPE.to_string(), kind.to_string()),
    ])
}

/// One instance of `conversation` per file or directory matching `pattern`
pub fn discover_components(conversation: &Conversation, pattern: &str, cwd: &Path) -> Result<Vec<BatchItem>, ConvoError> {
    debug!(%pattern, ?cwd, "discover_components: called");
    let items: Vec<BatchItem> = glob_paths(pattern, cwd)?
        .into_iter()
        .map(|path| {
            let variables = component_variables(&path, cwd);
            let label = variables[COMPONENT_PATH].clone();
            BatchItem::new(label, conversation.clone()).with_variables(variables)
        })
        .collect();
    info!(%pattern, count = items.len(), "Discovered components");
    Ok(items)
}

/// One instance per workflow file matching `pattern`
pub fn expand_workflow_glob(
    pattern: &str,
    cwd: &Path,
    registry: &DirectiveRegistry,
) -> Result<Vec<BatchItem>, ConvoError> {
    debug!(%pattern, ?cwd, "expand_workflow_glob: called");
    let mut items = Vec::new();
    for path in glob_paths(pattern, cwd)?.into_iter().filter(|p| p.is_file()) {
        let conversation = Conversation::load(&path, registry)?;
        let label = path.strip_prefix(cwd).unwrap_or(&path).display().to_string();
        items.push(BatchItem::new(label, conversation));
    }
    info!(%pattern, count = items.len(), "Expanded workflow glob");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_discover_components_sets_variables() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("services/auth")).unwrap();
        fs::write(dir.path().join("services/auth/handler.rs"), "fn main() {}\n").unwrap();
        fs::write(dir.path().join("services/billing.rs"), "fn main() {}\n").unwrap();

        let conv = Conversation::parse("PROMPT review {{COMPONENT_PATH}}\n", &DirectiveRegistry::new()).unwrap();
        let items = discover_components(&conv, "services/**/*.rs", dir.path()).unwrap();
        assert_eq!(items.len(), 2);

        let auth = &items[0];
        assert_eq!(auth.label, "services/auth/handler.rs");
        assert_eq!(auth.variables[COMPONENT_NAME], "handler");
        assert_eq!(auth.variables[COMPONENT_DIR], "services/auth");
        assert_eq!(auth.variables[COMPONENT_TYPE], "file");
        assert_eq!(items[1].label, "services/billing.rs");
    }

    #[test]
    fn test_directory_components() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("crates/core")).unwrap();
        let vars = component_variables(&dir.path().join("crates/core"), dir.path());
        assert_eq!(vars[COMPONENT_TYPE], "dir");
        assert_eq!(vars[COMPONENT_DIR], "crates");
    }

    #[test]
    fn test_expand_workflow_glob() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.conv"), "PROMPT a\n").unwrap();
        fs::write(dir.path().join("b.conv"), "PROMPT b\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let items = expand_workflow_glob("*.conv", dir.path(), &DirectiveRegistry::new()).unwrap();
        let labels: Vec<_> = items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["a.conv", "b.conv"]);
        assert_eq!(items[1].conversation.name(), "b");
    }

    #[test]
    fn test_invalid_glob() {
        let dir = tempdir().unwrap();
        let err = expand_workflow_glob("[", dir.path(), &DirectiveRegistry::new()).unwrap_err();
        assert!(matches!(err, ConvoError::Context(ContextError::InvalidPattern { .. })));
    }
}
