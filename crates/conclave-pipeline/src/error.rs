use std::io;
use std::path::PathBuf;

use conclave_store::StoreError;
use conclave_types::{TestCase, TypesError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error("failed to launch {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{what} exited with {status}: {log}")]
    WorkerExited { what: String, status: String, log: String },

    #[error("worker died: {0}")]
    WorkerDied(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("trace preparation failed: {0}")]
    Translation(String),

    #[error("concolic replay failed: {0}")]
    Concolic(String),

    /// Symbolic execution failed, but may still have produced useful tests.
    #[error("symbolic execution failed: {log} ({} tests salvaged)", .salvaged.len())]
    Symbolic { log: String, salvaged: Vec<TestCase> },

    #[error("background task panicked: {0}")]
    Panicked(String),

    #[error("a background task is already in flight")]
    TaskBusy,

    #[error("invalid state transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("request not supported by this node: {0}")]
    Unsupported(&'static str),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
