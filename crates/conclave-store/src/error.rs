use std::io;
use std::path::PathBuf;

use conclave_types::TypesError;

/// Crate-local error type for `conclave-store` operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Types(#[from] TypesError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;
