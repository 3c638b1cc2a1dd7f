//! Shared error types for the Mnemon memory engine.

use thiserror::Error;

/// Top-level error type for the Mnemon system.
#[derive(Error, Debug)]
pub enum MnemonError {
    /// Engine configuration is missing a required field or holds an invalid value.
    #[error("Configuration error: {field}: {reason}")]
    Config {
        /// The offending configuration field (dotted path, e.g. `embeddings.dimensions`).
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The embedding provider failed or returned malformed vectors.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The requested memory was not found.
    #[error("Memory not found: {0}")]
    NotFound(String),

    /// The durable record store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// An internal invariant was violated.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The engine is closing or closed.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MnemonError {
    /// Build a configuration error for `field`.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Alias for Result with MnemonError.
pub type MnemonResult<T> = Result<T, MnemonError>;
