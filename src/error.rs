//! Error types for the index.
//!
//! The taxonomy distinguishes failures the facade must surface to its host
//! (model missing, store unusable) from per-item failures the pipeline logs
//! and skips (parse, embed). The facade itself never propagates errors to a
//! caller; everything becomes a structured response or a readiness event.

use thiserror::Error;

/// Failure taxonomy for index operations.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Required model files are missing after the provider ran.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    /// The native store binary is incompatible with the host. Not recovered
    /// automatically; the message is user-actionable.
    #[error("store ABI mismatch: {0}")]
    StoreAbiMismatch(String),

    /// The store file could not be opened even after one recovery attempt.
    #[error("store corrupted beyond recovery: {0}")]
    StoreCorruption(String),

    /// XML parsing failed for one file. Logged and skipped.
    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },

    /// Inference failed for one chunk. Logged and skipped.
    #[error("embedding failed: {0}")]
    Embed(String),

    /// The FTS MATCH expression was malformed. Treated as an empty sparse set.
    #[error("full-text query syntax error: {0}")]
    FtsSyntax(String),

    /// Search was called before the service reached the ready state.
    #[error("index not ready")]
    IndexNotReady,

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate's typed layer.
pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    /// Whether a store-open failure should be surfaced without recovery.
    ///
    /// ABI-class failures mean the store binary does not match the host;
    /// deleting the database file would not help.
    pub fn is_abi_mismatch(message: &str) -> bool {
        let lower = message.to_ascii_lowercase();
        lower.contains("abi") || lower.contains("not compatible")
    }
}
