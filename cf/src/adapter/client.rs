//! Adapter trait definition

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{AdapterError, AgentResponse, Session, SessionConfig, SessionStats, StreamChunk};

/// Integration point to an AI coding agent
///
/// Implementations own the vendor SDK. The orchestrator only needs to
/// create sessions, send prompts, ask for compaction and read usage.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short adapter name for logs
    fn name(&self) -> &str;

    /// Process-wide startup hook
    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Process-wide shutdown hook
    async fn stop(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn create_session(&self, config: &SessionConfig) -> Result<Session, AdapterError>;

    /// Send one prompt and wait for the full response
    ///
    /// When `stream` is given, partial chunks are sent to it as they arrive.
    async fn send(
        &self,
        session: &Session,
        prompt: &str,
        stream: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<AgentResponse, AdapterError>;

    /// Ask the provider to summarise its own history
    async fn compact(&self, session: &Session) -> Result<(), AdapterError>;

    async fn destroy_session(&self, session: &Session) -> Result<(), AdapterError>;

    async fn close_session(&self, session: &Session) -> Result<(), AdapterError> {
        self.destroy_session(session).await
    }

    async fn session_stats(&self, _session: &Session) -> Result<SessionStats, AdapterError> {
        Ok(SessionStats::default())
    }
}
