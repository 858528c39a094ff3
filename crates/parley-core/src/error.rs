use thiserror::Error;

/// A convenience `Result` alias using [`ParleyError`].
pub type ParleyResult<T> = Result<T, ParleyError>;

/// Top-level error type for the Parley gateway.
///
/// Each variant corresponds to a subsystem or failure class that callers
/// need to tell apart.
#[derive(Error, Debug)]
pub enum ParleyError {
    /// The messaging network rejected the pairing; the connection must be
    /// paired again before it can be used.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// The transport failed in a way that may succeed on retry.
    #[error("Transport error: {0}")]
    Transport(String),

    /// There is no live session for the connection, or its handle is stale.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Reading, writing or deleting a credential blob failed.
    #[error("Credential error: {0}")]
    Credential(String),

    /// The durable document store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// The LLM collaborator failed.
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Config error: {0}")]
    Config(String),

    /// Caller supplied an invalid identifier or payload.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParleyError {
    /// Returns `true` when the error means "no active session", so the
    /// caller may restore the connection and retry once.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected(_))
    }

    /// Returns `true` for failures that a later attempt may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}
