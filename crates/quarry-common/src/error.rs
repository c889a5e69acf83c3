//! Error types for Quarry.

use thiserror::Error;

/// Result type alias using QuarryError.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Errors that can occur in Quarry storage operations.
#[derive(Debug, Error)]
pub enum QuarryError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Disk manager errors
    #[error("Page {page_id} has not been allocated")]
    PageNotAllocated { page_id: i32 },

    // Buffer pool errors
    #[error("Invalid page id: {page_id}")]
    InvalidPageId { page_id: i32 },

    #[error("Buffer pool full, all frames are pinned")]
    BufferPoolFull,

    // Header page errors
    #[error("Header page full, cannot register index {0}")]
    HeaderPageFull(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    // B+Tree errors
    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
