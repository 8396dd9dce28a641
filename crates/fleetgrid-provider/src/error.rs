use std::time::Duration;

/// A failure reported by (or while talking to) the fleet provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Service error carrying the provider's error code.
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn api(code: &str, message: impl Into<String>) -> Self {
        ProviderError::Api {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// The provider's error code, if this is a service error.
    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}
