use thiserror::Error;

/// Failure to resolve one external value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Method id is empty")]
    EmptyMethodId,

    #[error("Unknown backend method '{0}'")]
    UnknownMethod(String),

    #[error("Backend call to '{method_id}' failed: {message}")]
    Backend { method_id: String, message: String },

    #[error("Backend call to '{method_id}' timed out after {timeout_ms}ms")]
    Timeout { method_id: String, timeout_ms: u64 },

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("Invalid external source '{name}': {message}")]
    InvalidSource { name: String, message: String },

    #[error("Source '{name}' depends on '{dependency}', which could not be resolved")]
    DependencyFailed { name: String, dependency: String },
}

impl FetchError {
    pub fn backend(method_id: impl Into<String>, message: impl Into<String>) -> Self {
        FetchError::Backend {
            method_id: method_id.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
