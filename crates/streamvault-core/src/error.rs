//! Error types shared by every streamvault crate

use thiserror::Error;

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Payload could not be encoded or decoded
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request parameters form an unsupported combination
    #[error("invalid resend request '{request_id}': {reason}")]
    InvalidRequest { request_id: String, reason: String },
}

impl CoreError {
    pub fn invalid_request(request_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            request_id: request_id.into(),
            reason: reason.into(),
        }
    }
}
