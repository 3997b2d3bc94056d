use crate::error::Result;
use crate::types::AssistantTurn;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A persistent conversational thread on the assistant side.
#[async_trait]
pub trait AssistantThread: Send + Sync {
    /// Resumable identifier; `None` until the backend has assigned one.
    fn id(&self) -> Option<String>;

    /// Send one user turn and wait for the final reply.
    ///
    /// Implementations must stop promptly once `cancel` fires.
    async fn run(&self, input: &str, cancel: CancellationToken) -> Result<AssistantTurn>;
}

pub trait AssistantBackend: Send + Sync {
    fn start_thread(&self) -> Arc<dyn AssistantThread>;

    fn resume_thread(&self, thread_id: &str) -> Result<Arc<dyn AssistantThread>>;
}
