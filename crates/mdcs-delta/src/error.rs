//! Error types for deltas and filtering.

use thiserror::Error;

/// Errors raised by the data filter.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Invalid filter pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

/// Errors raised while encoding or decoding a delta.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Delta codec error: {0}")]
    Json(#[from] serde_json::Error),
}
