use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    #[error("rejected by policy: {0}")]
    PolicyRejected(String),

    #[error("task failed: {0}")]
    TaskFailure(String),

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl CoreError {
    /// Duplicates and policy rejections are expected drops, not failures.
    pub fn is_silent_drop(&self) -> bool {
        matches!(self, Self::DuplicateEvent(_) | Self::PolicyRejected(_))
    }
}
