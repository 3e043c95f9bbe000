//! Error types for image containers, trees and pipelines

use bsdiffx::DeltaError;
use thiserror::Error;

/// Errors produced while reading, writing, diffing or merging images
#[derive(Debug, Error)]
pub enum ImageError {
    /// A container header or entry is malformed
    #[error("malformed image: {0}")]
    Format(String),

    /// A path does not exist in a tree
    #[error("not found: {0}")]
    NotFound(String),

    /// Two trees being merged do not complement each other
    #[error("inconsistent trees at {path}: {reason}")]
    InconsistentTree { path: String, reason: String },

    /// A base image holds entries that need a base
    #[error("invalid base image: {path} is {kind} but the image has no parent")]
    InvalidBaseImage { path: String, kind: String },

    /// A recorded digest does not match the content
    #[error("digest mismatch for {what}: expected {expected}, got {actual}")]
    DigestMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// A recorded size does not match the content
    #[error("size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },

    #[error("delta error: {0}")]
    Delta(#[from] DeltaError),

    /// A file body failed to diff, patch or merge
    #[error("delta error at {path}: {source}")]
    FileDelta {
        path: String,
        #[source]
        source: DeltaError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The pipeline was stopped because another stage failed
    #[error("operation cancelled")]
    Cancelled,
}

impl ImageError {
    pub(crate) fn inconsistent(path: &str, reason: impl Into<String>) -> Self {
        ImageError::InconsistentTree {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Attach a file path to a delta failure
    pub(crate) fn delta_at(path: &str, source: DeltaError) -> Self {
        ImageError::FileDelta {
            path: path.to_string(),
            source,
        }
    }
}
