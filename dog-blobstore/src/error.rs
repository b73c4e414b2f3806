use thiserror::Error;

use crate::types::StoreState;

/// Result type for blob store operations
pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during blob store operations
#[derive(Error, Debug)]
pub enum BlobStoreError {
    /// The backing bucket or metadata store cannot be used for this store.
    /// Fatal to initialization, never retried.
    #[error("Provisioning failed: {message}")]
    Provisioning {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("Operation {operation} not permitted while store is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: StoreState,
    },

    #[error("Missing header: {0}")]
    MissingHeader(String),

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Blob not found: {blob_id}")]
    NotFound { blob_id: String },

    #[error("Operation not supported by this store: {0}")]
    Unsupported(&'static str),

    #[error("Error uploading blob to {destination}: {source}")]
    Upload {
        destination: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Storage error for blob {blob_id}: {source}")]
    Storage {
        blob_id: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: BoxedSource,
    },

    #[error("Compaction cancelled after {processed} blobs")]
    Cancelled { processed: u64 },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl BlobStoreError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create a backend error from a plain message
    pub fn backend_message<S: Into<String>>(message: S) -> Self {
        let message: String = message.into();
        Self::Backend {
            source: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(blob_id: S) -> Self {
        Self::NotFound {
            blob_id: blob_id.into(),
        }
    }

    /// Create a provisioning error without an underlying cause
    pub fn provisioning<S: Into<String>>(message: S) -> Self {
        Self::Provisioning {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a collaborator failure as a provisioning error
    pub fn provisioning_caused_by<S: Into<String>>(message: S, cause: BlobStoreError) -> Self {
        Self::Provisioning {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Wrap any failure raised while uploading to `destination`
    pub fn upload<S, E>(destination: S, cause: E) -> Self
    where
        S: Into<String>,
        E: Into<BoxedSource>,
    {
        Self::Upload {
            destination: destination.into(),
            source: cause.into(),
        }
    }

    /// Attach the offending blob id to a failure. Errors that already name a blob
    /// or describe caller mistakes pass through untouched.
    pub fn for_blob<S: Into<String>>(self, blob_id: S) -> Self {
        match self {
            err @ (Self::Storage { .. }
            | Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::MissingHeader(_)
            | Self::Invalid { .. }
            | Self::Unsupported(_)
            | Self::Cancelled { .. }) => err,
            other => Self::Storage {
                blob_id: blob_id.into(),
                source: Box::new(other),
            },
        }
    }

    /// Check whether this error is a lifecycle guard violation
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}
