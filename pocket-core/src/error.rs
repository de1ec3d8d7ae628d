//! Error types for Pocket operations

/// Result type for Pocket operations
pub type Result<T> = std::result::Result<T, PocketError>;

/// Error types for the Pocket runtime
#[derive(Debug, thiserror::Error)]
pub enum PocketError {
    /// `authenticate` entered from a state that has no resolvable flow
    #[error("Invalid auth state for authenticate: {0}")]
    AuthState(String),

    /// No user interaction arrived within the authentication window
    #[error("Authentication timed out; session removed, call prepare again")]
    AuthTimeout,

    /// Token refresh failed; the session has been deleted
    #[error("Failed to refresh the token, please re-authenticate: {0}")]
    RefreshFailure(String),

    /// Tool package sync (git or local copy) failed
    #[error("Sync failed for {source_id}: {reason}")]
    SyncFailure { source_id: String, reason: String },

    /// Tool execution exceeded its budget
    #[error("Tool invocation timed out")]
    InvocationTimeout,

    /// A postprocessor raised
    #[error("Error in postprocessing `{name}`: {reason}")]
    Postprocess { name: String, reason: String },

    /// Callback server failed to start
    #[error("Server initialization error: {0}")]
    ServerInit(String),

    /// No auth handler matched the requested name/provider
    #[error("No auth handler found: {0}")]
    HandlerNotFound(String),

    /// Unknown auth provider name
    #[error("Invalid auth provider name: {0}")]
    UnknownProvider(String),

    /// Tool is not registered
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// A session that must exist at this point is missing
    #[error("Session not found for {0}")]
    SessionNotFound(String),

    /// A one-shot future was resolved twice or is missing
    #[error("Future error: {0}")]
    Future(String),

    /// Tool package manifest is missing or malformed
    #[error("Tool manifest error: {0}")]
    Manifest(String),

    /// Runtime (subprocess/container) error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Session storage backend error
    #[error("Session storage error: {0}")]
    Storage(#[from] redis::RedisError),

    /// HTTP error during token exchange
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for PocketError {
    fn from(s: String) -> Self {
        PocketError::Other(s)
    }
}

impl From<&str> for PocketError {
    fn from(s: &str) -> Self {
        PocketError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for PocketError {
    fn from(err: anyhow::Error) -> Self {
        PocketError::Other(err.to_string())
    }
}
