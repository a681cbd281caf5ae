//! Error types for the storage crate

use streamvault_core::{CoreError, StreamPartKey};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// E001: Backing store rejected or failed an operation
    E001BackendFailure,
    /// E002: Request parameters form an unsupported combination
    E002InvalidRequest,
    /// E003: Batch exhausted its insert retries
    E003BatchDropped,
    /// E004: No bucket could be resolved within the retry cap
    E004BucketUnavailable,
    /// E005: Store was closed before the operation finished
    E005Closed,
    /// E006: Message could not be serialized
    E006Encoding,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E001BackendFailure => "E001",
            Self::E002InvalidRequest => "E002",
            Self::E003BatchDropped => "E003",
            Self::E004BucketUnavailable => "E004",
            Self::E005Closed => "E005",
            Self::E006Encoding => "E006",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("[{code}] backing store failure: {source}")]
    Backend {
        code: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("[{code}] {source}")]
    InvalidRequest {
        code: &'static str,
        #[source]
        source: CoreError,
    },

    #[error("[{code}] batch {batch_id} dropped after {attempts} failed inserts")]
    BatchDropped {
        code: &'static str,
        batch_id: Uuid,
        attempts: u32,
    },

    #[error("[{code}] no bucket for {stream_part} at {timestamp} after {attempts} attempts")]
    BucketUnavailable {
        code: &'static str,
        stream_part: StreamPartKey,
        timestamp: i64,
        attempts: u32,
    },

    #[error("[{code}] store is closed")]
    Closed { code: &'static str },

    #[error("[{code}] message encoding failed: {source}")]
    Encoding {
        code: &'static str,
        #[source]
        source: CoreError,
    },
}

impl StoreError {
    pub fn backend(source: BackendError) -> Self {
        Self::Backend {
            code: ErrorCode::E001BackendFailure.as_str(),
            source,
        }
    }

    pub fn invalid_request(source: CoreError) -> Self {
        Self::InvalidRequest {
            code: ErrorCode::E002InvalidRequest.as_str(),
            source,
        }
    }

    pub fn batch_dropped(batch_id: Uuid, attempts: u32) -> Self {
        Self::BatchDropped {
            code: ErrorCode::E003BatchDropped.as_str(),
            batch_id,
            attempts,
        }
    }

    pub fn bucket_unavailable(stream_part: StreamPartKey, timestamp: i64, attempts: u32) -> Self {
        Self::BucketUnavailable {
            code: ErrorCode::E004BucketUnavailable.as_str(),
            stream_part,
            timestamp,
            attempts,
        }
    }

    pub fn closed() -> Self {
        Self::Closed {
            code: ErrorCode::E005Closed.as_str(),
        }
    }

    pub fn encoding(source: CoreError) -> Self {
        Self::Encoding {
            code: ErrorCode::E006Encoding.as_str(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Backend { code, .. }
            | Self::InvalidRequest { code, .. }
            | Self::BatchDropped { code, .. }
            | Self::BucketUnavailable { code, .. }
            | Self::Closed { code }
            | Self::Encoding { code, .. } => code,
        }
    }
}

impl From<BackendError> for StoreError {
    fn from(source: BackendError) -> Self {
        Self::backend(source)
    }
}
