use thiserror::Error;

/// Configuration mistakes made by the composition root.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("a backend has already been configured for this dispatcher")]
    BackendAlreadyConfigured,
}

/// Why a vendor message could not be normalized.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("vendor message has no integer `{field}` classifier")]
    MissingDataType { field: String },
    #[error("vendor message is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    Vendor(#[from] anyhow::Error),
}

/// Failure reported by a backend when resolving a pending callback.
///
/// ```
/// use imb_core::RemoteError;
///
/// let err = RemoteError::new(6014, "not logged in");
/// assert_eq!(err.to_string(), "remote error 6014: not logged in");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
