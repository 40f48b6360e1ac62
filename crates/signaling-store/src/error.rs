//! Error types for signaling store operations

/// Result type alias using [`StoreError`]
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by a [`crate::SignalingStore`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Target document does not exist
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Create-if-absent lost against an existing document
    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    /// Malformed collection or document path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Backend unreachable or the write was rejected
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Fields could not be converted to or from a typed value
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Transient failures worth a retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
