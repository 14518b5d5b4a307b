use thiserror::Error;

#[derive(Error, Debug)]
pub enum HtracedError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Bad span: {0}")]
    BadSpan(String),

    #[error("Bad query: {0}")]
    BadQuery(String),

    #[error("Shard queue is full")]
    QueueFull,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Load mismatch: {0}")]
    LoadMismatch(String),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Timeout error: operation took longer than {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Channel receive error")]
    ChannelReceive,

    #[error("Daemon is shutting down")]
    Shutdown,
}

/// Result type alias for htraced operations
pub type Result<T> = std::result::Result<T, HtracedError>;

impl HtracedError {
    /// Creates a new bad-request error
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Creates a new bad-span error
    pub fn bad_span<S: Into<String>>(msg: S) -> Self {
        Self::BadSpan(msg.into())
    }

    /// Creates a new bad-query error
    pub fn bad_query<S: Into<String>>(msg: S) -> Self {
        Self::BadQuery(msg.into())
    }

    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new load-mismatch error
    pub fn load_mismatch<S: Into<String>>(msg: S) -> Self {
        Self::LoadMismatch(msg.into())
    }

    /// Creates a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Returns true if the error indicates invalid caller input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::BadRequest(_) | Self::BadSpan(_) | Self::BadQuery(_)
        )
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::BadSpan(_) => "bad_span",
            Self::BadQuery(_) => "bad_query",
            Self::QueueFull => "queue_full",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::LoadMismatch(_) => "load_mismatch",
            Self::LockConflict(_) => "lock_conflict",
            Self::Timeout { .. } => "timeout",
            Self::Network(_) => "network",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::ChannelSend | Self::ChannelReceive => "channel",
            Self::Shutdown => "shutdown",
        }
    }
}
