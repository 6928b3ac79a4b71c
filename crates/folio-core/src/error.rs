//! Error taxonomy for the parsing and retrieval pipeline.
//!
//! Stage-local problems (one corrupt page, a failed embedding sub-batch, an
//! untrainable classifier) are absorbed where they happen and reported as
//! degradations on the result. The variants here are the conditions that
//! reach the caller.

use thiserror::Error;

/// Reason an index could not be loaded or mutated
#[derive(Debug, Error)]
pub enum IndexErrorKind {
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("metadata count {metadata} does not match vector count {vectors}")]
    LengthMismatch { vectors: usize, metadata: usize },

    #[error("position {0} is not present in the index")]
    UnknownPosition(u64),

    #[error("corrupt index state: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the public pipeline operations
#[derive(Debug, Error)]
pub enum FolioError {
    /// Both the structured extractor and the plain-text fallback failed
    #[error("layout extraction failed: {0}")]
    Extraction(String),

    /// The document parsed but no text could be recovered from it
    #[error("no extractable text content in document")]
    EmptyContent,

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector index error: {0}")]
    Index(#[from] IndexErrorKind),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("chunk store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for FolioError {
    fn from(err: rusqlite::Error) -> Self {
        FolioError::Store(err.to_string())
    }
}

impl From<bincode::Error> for FolioError {
    fn from(err: bincode::Error) -> Self {
        FolioError::Index(IndexErrorKind::Corrupt(err.to_string()))
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, FolioError>;
