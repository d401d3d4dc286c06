//! Error types shared by every custodia crate

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CustodiaError>;

/// Main error type for the shared primitives
#[derive(Error, Debug)]
pub enum CustodiaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A value looked like the expected shape but could not be coerced
    #[error("Parse error: cannot interpret '{value}' as {expected}")]
    Parse { value: String, expected: &'static str },

    /// A file name does not follow the `<type>-<date>` grammar
    #[error("Invalid name: {0}")]
    InvalidName(String),
}

impl CustodiaError {
    /// Create a parse error for `value` that should have been an `expected`
    pub fn parse(value: impl Into<String>, expected: &'static str) -> Self {
        Self::Parse {
            value: value.into(),
            expected,
        }
    }

    /// Create an invalid name error
    pub fn invalid_name(msg: impl Into<String>) -> Self {
        Self::InvalidName(msg.into())
    }
}
