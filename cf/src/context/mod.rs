//! Context tracking: `@file` resolution, path filtering, REFCAT excerpts and the token budget

mod error;
mod filter;
pub mod refcat;
mod tracker;

pub use error::ContextError;
pub use filter::PathFilter;
pub use refcat::{RefcatRef, render_all, render_excerpt};
pub use tracker::{ContextFile, ContextStatus, ContextTracker, DEFAULT_MAX_TOKENS, estimate_tokens, validate_context};
