use thiserror::Error;

/// Core error types shared by the cache and change-feed crates
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid change notification: {0}")]
    InvalidNotification(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new InvalidNotification error
    pub fn invalid_notification(message: impl Into<String>) -> Self {
        Self::InvalidNotification(message.into())
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidNotification(_) => ErrorCategory::ChangeFeed,
            Self::JsonError(_) => ErrorCategory::Serialization,
        }
    }
}

/// Error categories for monitoring and classification.
///
/// These mirror how failures are handled: configuration errors stop startup,
/// change-feed errors go to the reconnect supervisor, serialization errors
/// make a response uncacheable and invalidation errors are logged and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    ChangeFeed,
    Serialization,
    Invalidation,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::ChangeFeed => write!(f, "change_feed"),
            Self::Serialization => write!(f, "serialization"),
            Self::Invalidation => write!(f, "invalidation"),
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
