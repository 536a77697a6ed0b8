//! Error types for day2day simulations.

use thiserror::Error;

/// Errors that can occur while building or running a simulation.
///
/// Every simulation call is all-or-nothing: the first error aborts the call
/// and no partial table is returned.
#[derive(Debug, Error)]
pub enum SimError {
    /// Covariance (or non-spatial variance) matrix is not positive-definite
    #[error("Numeric error: {0}")]
    Numeric(String),

    /// A name in an expression could not be resolved against the working table
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// A function or response generator was called with bad arguments
    #[error("Invocation error: {0}")]
    Invocation(String),

    /// Lengths or dimensions do not line up
    #[error("Reshape error: {0}")]
    Reshape(String),

    /// Formula text could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// A scalar argument is outside its valid range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    /// Creates a numeric error.
    pub fn numeric(msg: impl Into<String>) -> Self {
        Self::Numeric(msg.into())
    }

    /// Creates a resolution error.
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Creates an invocation error.
    pub fn invocation(msg: impl Into<String>) -> Self {
        Self::Invocation(msg.into())
    }

    /// Creates a reshape error.
    pub fn reshape(msg: impl Into<String>) -> Self {
        Self::Reshape(msg.into())
    }

    /// Creates an invalid-argument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SimError>;
