use std::time::Duration;

use hirebridge_core::ErrorCategory;

/// Errors that can occur while following the change feed.
///
/// All of them are handled by the connection supervisor; none reach request
/// handlers.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::Error),

    #[error("Subscription attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Change stream closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ListenerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Database(_) | Self::Timeout(_) | Self::Closed => ErrorCategory::ChangeFeed,
        }
    }
}
