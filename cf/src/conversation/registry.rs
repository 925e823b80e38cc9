//! Custom directive registry
//!
//! Plugins register extra directive names at runtime. The lexer takes a
//! registry by reference so tests and embedders can inject their own; a
//! process-wide instance is available through [`global`] for callers that
//! want one shared table.

use std::collections::BTreeMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use tracing::debug;

/// Metadata for one registered directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomDirective {
    /// Canonical upper-case name
    pub name: String,
    pub description: String,
    /// Absorb continuation lines like PROMPT does
    pub multiline: bool,
}

impl CustomDirective {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_uppercase(),
            description: String::new(),
            multiline: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn single_line(mut self) -> Self {
        self.multiline = false;
        self
    }
}

/// Name → metadata table of custom directives
#[derive(Debug, Clone, Default)]
pub struct DirectiveRegistry {
    entries: BTreeMap<String, CustomDirective>,
}

impl DirectiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a directive; names are matched case-insensitively
    ///
    /// Returns the previous registration with the same name, if any.
    pub fn register(&mut self, directive: CustomDirective) -> Option<CustomDirective> {
        debug!(name = %directive.name, "DirectiveRegistry::register: called");
        self.entries.insert(directive.name.clone(), directive)
    }

    pub fn unregister(&mut self, name: &str) -> Option<CustomDirective> {
        debug!(%name, "DirectiveRegistry::unregister: called");
        self.entries.remove(&name.to_uppercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_uppercase())
    }

    pub fn get(&self, name: &str) -> Option<&CustomDirective> {
        self.entries.get(&name.to_uppercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

static GLOBAL: Lazy<RwLock<DirectiveRegistry>> = Lazy::new(|| RwLock::new(DirectiveRegistry::new()));

/// Process-wide registry operations
pub mod global {
    use super::*;

    /// Register into the shared table
    pub fn register(directive: CustomDirective) {
        match GLOBAL.write() {
            Ok(mut reg) => {
                reg.register(directive);
            }
            Err(poisoned) => {
                poisoned.into_inner().register(directive);
            }
        }
    }

    /// Copy of the shared table, suitable for handing to a [`super::super::Lexer`]
    pub fn snapshot() -> DirectiveRegistry {
        match GLOBAL.read() {
            Ok(reg) => reg.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Drop every registration (test teardown)
    pub fn reset() {
        debug!("global::reset: called");
        match GLOBAL.write() {
            Ok(mut reg) => reg.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}
