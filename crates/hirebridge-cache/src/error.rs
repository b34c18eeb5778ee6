use hirebridge_core::ErrorCategory;
use thiserror::Error;

/// Errors raised by the response cache.
///
/// None of these ever reach a request handler as a failure: configuration
/// errors stop startup, and serialization errors make a single response
/// uncacheable.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to encode cache key parameters: {0}")]
    KeyEncoding(#[from] serde_json::Error),

    #[error("Failed to encode cached payload: {0}")]
    PayloadEncoding(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode cached payload: {0}")]
    PayloadDecoding(#[from] rmp_serde::decode::Error),

    #[error("Invalid cache key component: {0}")]
    InvalidKey(String),

    #[error("Invalidation rules error: {0}")]
    Rules(String),
}

impl CacheError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn rules(message: impl Into<String>) -> Self {
        Self::Rules(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::KeyEncoding(_)
            | Self::InvalidKey(_)
            | Self::PayloadEncoding(_)
            | Self::PayloadDecoding(_) => {
                ErrorCategory::Serialization
            }
            Self::Rules(_) => ErrorCategory::Invalidation,
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
