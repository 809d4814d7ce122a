// Error taxonomy and shared result/status types

/// Pipeline-wide error type. The `is_retriable` split drives job routing:
/// retriable failures go back to the queue with backoff, non-retriable ones
/// go straight to the dead letter store.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("snapshot decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry can plausibly succeed. A malformed snapshot will not
    /// become valid on redelivery, so decode and payload deserialization
    /// failures bypass the retry budget entirely.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::Storage(_)
                | AppError::Queue(_)
                | AppError::Unavailable(_)
                | AppError::Internal(_)
        )
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;

/// Client-facing save status for a document, driven only by authoritative
/// events. A timer never advances this machine; only an observed local write,
/// an acknowledged enqueue, or a received save confirmation do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    /// A local edit happened that the pipeline has not picked up yet.
    Saving,
    /// The persistence job was enqueued and acknowledged; peers can see the
    /// change but it is not durable yet.
    Synced,
    /// A save confirmation arrived: the snapshot is durably persisted.
    Saved,
}

impl SaveStatus {
    /// Any local write regresses the status, including from `Saved`.
    pub fn on_local_write(self) -> SaveStatus {
        SaveStatus::Saving
    }

    /// Enqueue acknowledged by the queue backend.
    pub fn on_enqueue_acknowledged(self) -> SaveStatus {
        match self {
            SaveStatus::Saving => SaveStatus::Synced,
            other => other,
        }
    }

    /// A `SaveConfirmation` arrived for the latest enqueued snapshot. A
    /// confirmation received while already back in `Saving` refers to an
    /// older snapshot and must not mask the newer pending edit.
    pub fn on_confirmation(self) -> SaveStatus {
        match self {
            SaveStatus::Synced | SaveStatus::Saved => SaveStatus::Saved,
            SaveStatus::Saving => SaveStatus::Saving,
        }
    }
}

impl std::fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveStatus::Saving => write!(f, "saving"),
            SaveStatus::Synced => write!(f, "synced"),
            SaveStatus::Saved => write!(f, "saved"),
        }
    }
}
