//! Batch dispatch: component discovery, bounded fan-out and the progress file

mod discover;
mod dispatcher;
mod progress;

pub use discover::{
    COMPONENT_DIR, COMPONENT_NAME, COMPONENT_PATH, COMPONENT_TYPE, component_variables, discover_components,
    expand_workflow_glob,
};
pub use dispatcher::{BatchDispatcher, BatchItem, BatchOptions, BatchSummary, ItemResult};
pub use progress::{DEFAULT_PROGRESS_FILE, ItemStatus, ProgressBoard, ProgressRow};
