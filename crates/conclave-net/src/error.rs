use std::io;

use crate::packet::PacketKind;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("unknown packet kind: {0}")]
    UnknownKind(u32),

    #[error("packet too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("packet id mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: u64, actual: u64 },

    #[error("unexpected packet: expected {expected:?}, got {actual:?}")]
    UnexpectedKind { expected: PacketKind, actual: PacketKind },

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl NetError {
    /// Faults that mean the peer is speaking a different protocol. These are
    /// never recovered from locally.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            Self::UnknownKind(_) | Self::TooLarge { .. } | Self::IdMismatch { .. } | Self::UnexpectedKind { .. }
        )
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, NetError>;
