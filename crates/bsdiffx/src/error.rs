//! Error types for delta encoding and merging

use thiserror::Error;

/// Errors produced while encoding, decoding or merging binary deltas
#[derive(Debug, Error)]
pub enum DeltaError {
    /// A length header or control triple is malformed
    #[error("malformed delta stream: {0}")]
    Format(String),

    /// The compression mode byte is not one we know
    #[error("invalid compression mode: {0}")]
    InvalidCompressionMode(u8),

    /// A control triple writes past the declared new length
    #[error("delta writes past declared length: pos={pos} len={len} new_len={new_len}")]
    Bounds { pos: u64, len: u64, new_len: u64 },

    /// Fewer bytes were available than a length field demanded
    #[error("truncated delta stream: expected {expected} bytes, got {actual}")]
    TruncatedStream { expected: u64, actual: u64 },

    /// Upper delta addresses bytes that the lower delta cannot account for
    #[error("overlapped offset: upper old_pos={old_pos} new_pos={new_pos} exceeds lower size {lower_size}")]
    Overlap {
        old_pos: i64,
        new_pos: u64,
        lower_size: u64,
    },

    /// No lower block covers the requested offset
    #[error("invalid lower blocks: no block covers offset {0}")]
    InvalidLowerBlocks(i64),

    /// Blocks are not in strictly increasing new_pos order
    #[error("blocks not sorted by new_pos at index {index}: {prev} >= {next}")]
    UnsortedBlocks { index: usize, prev: u64, next: u64 },

    /// A merged block failed byte-level verification
    #[error("merged block verification failed at old_pos={old_pos} new_pos={new_pos} len={len}: {reason}")]
    Verification {
        old_pos: i64,
        new_pos: u64,
        len: u64,
        reason: String,
    },

    /// Underlying I/O failure (compression envelope, writers)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeltaError {
    /// Map a short read into a truncated-stream error, passing other I/O errors through
    pub(crate) fn from_read(err: std::io::Error, expected: u64, actual: u64) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            DeltaError::TruncatedStream { expected, actual }
        } else {
            DeltaError::Io(err)
        }
    }
}
