use thiserror::Error;

/// Project-wide error taxonomy, split along the failure classes a WebSocket +
/// Redis backed fabric actually produces.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("backing store error: {0}")]
    BackingStore(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),
}

pub type FabricResult<T> = Result<T, FabricError>;

impl FabricError {
    /// Whether this failure is safe to retry (reconnect, resend) or terminal for
    /// the connection it occurred on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FabricError::Transport(_) | FabricError::Timeout(_))
    }
}
