use std::io;

/// Errors raised while encoding or parsing shared data types.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed test case: {0}")]
    MalformedTestCase(String),

    #[error("XML error: {0}")]
    Xml(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, TypesError>;
