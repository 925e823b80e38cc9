//! Agent adapter contract
//!
//! Vendor integrations implement [`Adapter`]; the orchestrator and batch
//! dispatcher only ever see the trait object.

pub mod client;
mod error;
mod types;

pub use client::Adapter;
pub use error::AdapterError;
pub use types::{AgentResponse, Session, SessionConfig, SessionStats, StreamChunk};
