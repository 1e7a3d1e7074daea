//! Error types for the ingestion pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ingestion pipeline errors
///
/// The worker loop branches on [`Error::is_transient`]: transient failures
/// are retried with backoff, everything else fails the job immediately.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upload exceeds the configured size limit
    #[error("Upload of {size_bytes} bytes exceeds limit of {max_bytes} bytes")]
    SizeExceeded { size_bytes: u64, max_bytes: u64 },

    /// Content type is not in the staging allow-list
    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    /// Record or blob not found (expired, deleted, or never created)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document is corrupt or yields no usable text
    #[error("Unreadable document: {0}")]
    CorruptDocument(String),

    /// Extractor failure that is worth retrying (I/O, timeout, 5xx)
    #[error("Extraction failed: {0}")]
    Extractor(String),

    /// Embedding generation failed
    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    /// Vector store failure
    #[error("Vector store error: {0}")]
    VectorStore(String),

    /// Blob storage failure
    #[error("Blob storage error: {0}")]
    BlobStorage(String),

    /// Job record store failure
    #[error("Database error: {0}")]
    Database(String),

    /// Cooperative cancellation was requested
    #[error("cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a corrupt-document error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptDocument(message.into())
    }

    /// Create a transient extractor error
    pub fn extractor(message: impl Into<String>) -> Self {
        Self::Extractor(message.into())
    }

    /// Create an embedding error
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create a vector store error
    pub fn vector_store(message: impl Into<String>) -> Self {
        Self::VectorStore(message.into())
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether a retry with backoff has a chance of succeeding.
    ///
    /// Corrupt input, unsupported types, missing blobs, and cancellation are
    /// terminal no matter how often they are retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Extractor(_)
                | Error::Embedding(_)
                | Error::VectorStore(_)
                | Error::BlobStorage(_)
                | Error::Database(_)
                | Error::Io(_)
                | Error::Http(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}
