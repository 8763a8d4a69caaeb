//! Error types for hepstack

use thiserror::Error;

/// hepstack error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (missing files, missing cross-sections, malformed lines)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error (piece-set mismatch, misaligned tables, bad schemas)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error (arithmetic degeneracies, representation misuse)
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
